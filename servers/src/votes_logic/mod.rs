pub mod backend;
pub mod config;
pub mod logger;
pub mod sink;
