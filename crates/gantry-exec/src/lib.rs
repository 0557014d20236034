//! Execution substrate of Gantry.
//!
//! This crate knows nothing about jobs or upstream stores. It accounts the compute units
//! (cores and GPUs) of the nodes of a single allocation and supervises external processes.
#[macro_use]
mod common;

pub mod process;
pub mod program;
pub mod resources;

pub use crate::common::{Map, Set};

pub type Error = common::error::ExecError;
pub type Result<T> = std::result::Result<T, Error>;
