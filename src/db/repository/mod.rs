pub mod dead_letter_repository;
pub mod delivery_attempt_repository;
pub mod fingerprint_repository;
pub mod notification_rule;
pub mod scheduled_notification_repository;
pub mod user;
pub mod user_preferences;

pub use dead_letter_repository::DeadLetterRepository;
pub use delivery_attempt_repository::DeliveryAttemptRepository;
pub use fingerprint_repository::FingerprintRepository;
pub use notification_rule::NotificationRuleRepository;
pub use scheduled_notification_repository::ScheduledNotificationRepository;
pub use user::UserRepository;
pub use user_preferences::UserPreferencesRepository;
