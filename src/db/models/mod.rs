//! Database models, one file per table.
//! Re-exported at `crate::db::models` so callers can `use crate::db::models::*;`.

pub mod dead_letter;
pub mod delivery_attempt;
pub mod fingerprint;
pub mod notification_rule;
pub mod scheduled_notification;
pub mod user;
pub mod user_preferences;

pub use self::dead_letter::*;
pub use self::delivery_attempt::*;
pub use self::fingerprint::*;
pub use self::notification_rule::*;
pub use self::scheduled_notification::*;
pub use self::user::*;
pub use self::user_preferences::*;
