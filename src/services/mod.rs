pub mod file_service;
pub mod forensic;
pub mod notify;
pub mod quota;
pub mod share_service;
pub mod storage;
pub mod sweeper;
