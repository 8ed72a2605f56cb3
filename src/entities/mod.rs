pub mod prelude;

pub mod audit_logs;
pub mod config_entries;
pub mod download_logs;
pub mod files;
pub mod security_events;
pub mod shares;
pub mod users;
