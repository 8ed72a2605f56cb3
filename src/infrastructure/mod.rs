pub mod database;
pub mod seed;
