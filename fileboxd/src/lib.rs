pub mod config;
pub mod monitor;
pub mod runtime;
pub mod transfer;
