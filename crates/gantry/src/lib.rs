//! Gantry executes workflow jobs inside batch allocations of an HPC site.
//!
//! A *launcher* runs inside one allocation, it claims runnable jobs from the upstream store,
//! packs them onto the cores and GPUs of its nodes and reports their state changes back.
//! The *processing service* runs the hooks of jobs before and after their runs and decides
//! whether failed runs are restarted.
//! The *queue service* runs on a login node and decides how many allocations the site should
//! hold, submitting and cancelling them through the batch scheduler.
pub mod autoalloc;
pub mod client;
pub mod common;
pub mod feed;
pub mod job;
pub mod launcher;
pub mod processing;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::GantryError;
pub type Result<T> = std::result::Result<T, Error>;

pub use gantry_exec::{Map, Set};

pub const GANTRY_VERSION: &str = env!("CARGO_PKG_VERSION");
