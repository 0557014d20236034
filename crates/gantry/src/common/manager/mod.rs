//! Parsers for the output of batch scheduler commands.
pub mod lsf;
pub mod slurm;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ManagerType {
    Slurm,
    Lsf,
    /// Allocations are plain background processes on the current machine.
    #[default]
    Local,
}

impl Display for ManagerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerType::Slurm => f.write_str("SLURM"),
            ManagerType::Lsf => f.write_str("LSF"),
            ManagerType::Local => f.write_str("local"),
        }
    }
}
