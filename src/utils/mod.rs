pub mod auth;
pub mod hash;
pub mod user_agent;
pub mod validation;
