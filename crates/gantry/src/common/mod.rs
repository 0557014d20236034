pub mod cli;
pub mod config;
pub mod error;
pub mod manager;
pub mod setup;
pub mod utils;
