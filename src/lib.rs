//! Notification scheduling, deduplication and reliable delivery.
//!
//! Trigger sources call [`services::scheduler::NotificationScheduler`] to turn
//! events into pending notifications; the delivery worker
//! ([`services::retry::RetryManager`]) hands due notifications to a
//! [`services::delivery::DeliveryChannel`], retrying with backoff and
//! dead-lettering what cannot be delivered.

pub mod config;
pub mod db;
pub mod error;
pub mod services;

pub use config::Config;
pub use error::{AppError, AppResult};
