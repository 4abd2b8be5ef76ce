pub mod cache;
pub mod dead_letter;
pub mod dedup;
pub mod delivery;
pub mod init;
pub mod quiet_hours;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod stores;
