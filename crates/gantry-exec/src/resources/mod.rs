mod node;
mod registry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use node::NodeResources;
pub use registry::{Reservation, ResourceRegistry, Slot};

define_id_type!(NodeId, u32);
define_id_type!(ReservationId, u64);

pub type GpuId = u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Expected steady-state condition under load, not a failure of the registry.
    #[error("Insufficient resources for {0}")]
    InsufficientResources(Footprint),
    #[error("Invalid resource request {0}: {1}")]
    InvalidFootprint(Footprint, String),
    /// The occupancy bookkeeping is broken. Any further placement decision would be
    /// based on corrupted data.
    #[error("Resource accounting violation: {0}")]
    AccountingViolation(String),
}

impl ResourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResourceError::AccountingViolation(_))
    }
}

/// Static description of a compute node of an allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub hostname: String,
    pub cores: u32,
    #[serde(default)]
    pub gpus: u32,
}

impl NodeDescriptor {
    pub fn new(hostname: impl Into<String>, cores: u32, gpus: u32) -> Self {
        Self {
            hostname: hostname.into(),
            cores,
            gpus,
        }
    }
}

/// Resources requested by a single job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Footprint {
    pub ranks: u32,
    pub cores_per_rank: u32,
    #[serde(default)]
    pub gpus_per_rank: u32,
}

impl Footprint {
    pub fn new(ranks: u32, cores_per_rank: u32, gpus_per_rank: u32) -> Self {
        Self {
            ranks,
            cores_per_rank,
            gpus_per_rank,
        }
    }

    /// Single rank with the given number of cores.
    pub fn cores(cores: u32) -> Self {
        Self::new(1, cores, 0)
    }

    pub fn total_cores(&self) -> u32 {
        self.ranks * self.cores_per_rank
    }

    pub fn total_gpus(&self) -> u32 {
        self.ranks * self.gpus_per_rank
    }

    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.ranks == 0 {
            return Err(ResourceError::InvalidFootprint(
                *self,
                "at least one rank is required".to_string(),
            ));
        }
        if self.cores_per_rank == 0 {
            return Err(ResourceError::InvalidFootprint(
                *self,
                "every rank needs at least one core".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for Footprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rank(s) x {} core(s)",
            self.ranks, self.cores_per_rank
        )?;
        if self.gpus_per_rank > 0 {
            write!(f, " x {} GPU(s)", self.gpus_per_rank)?;
        }
        Ok(())
    }
}

/// Free capacity of a single node at the time of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdleNode {
    pub id: NodeId,
    pub hostname: String,
    pub free_cores: u32,
    pub free_gpus: u32,
}

impl IdleNode {
    fn ranks_that_fit(&self, footprint: &Footprint) -> u32 {
        ranks_that_fit(self.free_cores, self.free_gpus, footprint)
    }
}

/// Snapshot of idle capacity of an allocation.
///
/// It is used as a filter when fetching new jobs, so that only jobs that can actually be
/// started are claimed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdleResources {
    pub nodes: Vec<IdleNode>,
}

impl IdleResources {
    pub fn total_free_cores(&self) -> u32 {
        self.nodes.iter().map(|n| n.free_cores).sum()
    }

    pub fn total_free_gpus(&self) -> u32 {
        self.nodes.iter().map(|n| n.free_gpus).sum()
    }

    /// Returns true if not even a single one-core rank could be placed.
    pub fn is_trivial(&self) -> bool {
        self.total_free_cores() == 0
    }

    pub fn fits(&self, footprint: &Footprint) -> bool {
        if footprint.validate().is_err() {
            return false;
        }
        let placeable: u64 = self
            .nodes
            .iter()
            .map(|n| n.ranks_that_fit(footprint) as u64)
            .sum();
        placeable >= footprint.ranks as u64
    }

    /// Subtracts the footprint from the snapshot, using the same packing order as
    /// [`ResourceRegistry::reserve`]. Returns false (and leaves the snapshot untouched)
    /// if the footprint does not fit.
    pub fn consume(&mut self, footprint: &Footprint) -> bool {
        if !self.fits(footprint) {
            return false;
        }
        let mut order: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].ranks_that_fit(footprint) > 0)
            .collect();
        // The snapshot does not know the totals, so the node with the least free cores
        // is considered to be the most occupied one.
        order.sort_by_key(|&i| (self.nodes[i].free_cores, self.nodes[i].free_gpus, i));

        let mut remaining = footprint.ranks;
        for index in order {
            let node = &mut self.nodes[index];
            let ranks = node.ranks_that_fit(footprint).min(remaining);
            node.free_cores -= ranks * footprint.cores_per_rank;
            node.free_gpus -= ranks * footprint.gpus_per_rank;
            remaining -= ranks;
            if remaining == 0 {
                break;
            }
        }
        true
    }
}

pub(crate) fn ranks_that_fit(free_cores: u32, free_gpus: u32, footprint: &Footprint) -> u32 {
    if footprint.cores_per_rank == 0 {
        return 0;
    }
    let by_cores = free_cores / footprint.cores_per_rank;
    let by_gpus = match footprint.gpus_per_rank {
        0 => u32::MAX,
        gpus => free_gpus / gpus,
    };
    by_cores.min(by_gpus)
}
