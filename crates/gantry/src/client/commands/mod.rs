pub mod config;
pub mod launcher;
pub mod processing;
pub mod queue_service;
