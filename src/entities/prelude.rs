pub use super::audit_logs::Entity as AuditLogs;
pub use super::config_entries::Entity as ConfigEntries;
pub use super::download_logs::Entity as DownloadLogs;
pub use super::files::Entity as Files;
pub use super::security_events::Entity as SecurityEvents;
pub use super::shares::Entity as Shares;
pub use super::users::Entity as Users;
