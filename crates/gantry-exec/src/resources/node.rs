use serde::Serialize;
use smallvec::SmallVec;

use super::{Footprint, GpuId, IdleNode, NodeDescriptor, NodeId, ResourceError, ranks_that_fit};

/// Total and occupied compute units of one node.
///
/// GPUs are tracked individually so that the placement can be exported to the launched
/// process (e.g. through `CUDA_VISIBLE_DEVICES`).
#[derive(Debug, Clone, Serialize)]
pub struct NodeResources {
    id: NodeId,
    hostname: String,
    total_cores: u32,
    occupied_cores: u32,
    gpu_busy: Vec<bool>,
}

impl NodeResources {
    pub(crate) fn new(id: NodeId, descriptor: &NodeDescriptor) -> Self {
        Self {
            id,
            hostname: descriptor.hostname.clone(),
            total_cores: descriptor.cores,
            occupied_cores: 0,
            gpu_busy: vec![false; descriptor.gpus as usize],
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn total_cores(&self) -> u32 {
        self.total_cores
    }

    pub fn occupied_cores(&self) -> u32 {
        self.occupied_cores
    }

    pub fn free_cores(&self) -> u32 {
        self.total_cores - self.occupied_cores
    }

    pub fn total_gpus(&self) -> u32 {
        self.gpu_busy.len() as u32
    }

    pub fn occupied_gpus(&self) -> u32 {
        self.gpu_busy.iter().filter(|busy| **busy).count() as u32
    }

    pub fn free_gpus(&self) -> u32 {
        self.total_gpus() - self.occupied_gpus()
    }

    pub fn is_idle(&self) -> bool {
        self.occupied_cores == 0 && self.occupied_gpus() == 0
    }

    pub(crate) fn ranks_that_fit(&self, footprint: &Footprint) -> u32 {
        ranks_that_fit(self.free_cores(), self.free_gpus(), footprint)
    }

    pub(crate) fn to_idle(&self) -> IdleNode {
        IdleNode {
            id: self.id,
            hostname: self.hostname.clone(),
            free_cores: self.free_cores(),
            free_gpus: self.free_gpus(),
        }
    }

    /// Marks `cores` cores and `gpus` GPUs as occupied and returns the indices of the
    /// taken GPUs.
    pub(crate) fn take(
        &mut self,
        cores: u32,
        gpus: u32,
    ) -> Result<SmallVec<[GpuId; 4]>, ResourceError> {
        if cores > self.free_cores() || gpus > self.free_gpus() {
            return Err(ResourceError::AccountingViolation(format!(
                "node {} cannot provide {cores} core(s) and {gpus} GPU(s), free: {} core(s), {} GPU(s)",
                self.hostname,
                self.free_cores(),
                self.free_gpus()
            )));
        }
        let mut taken = SmallVec::new();
        for (index, busy) in self.gpu_busy.iter_mut().enumerate() {
            if taken.len() == gpus as usize {
                break;
            }
            if !*busy {
                *busy = true;
                taken.push(index as GpuId);
            }
        }
        self.occupied_cores += cores;
        Ok(taken)
    }

    /// Returns previously taken compute units back to the node.
    ///
    /// Releasing more than is occupied is never clamped, it is reported as an accounting
    /// violation and the node is left untouched.
    pub(crate) fn give_back(&mut self, cores: u32, gpus: &[GpuId]) -> Result<(), ResourceError> {
        if cores > self.occupied_cores {
            return Err(ResourceError::AccountingViolation(format!(
                "node {} releases {cores} core(s), but only {} are occupied",
                self.hostname, self.occupied_cores
            )));
        }
        for gpu in gpus {
            match self.gpu_busy.get(*gpu as usize) {
                Some(true) => {}
                Some(false) => {
                    return Err(ResourceError::AccountingViolation(format!(
                        "node {} releases GPU {gpu} that is not occupied",
                        self.hostname
                    )));
                }
                None => {
                    return Err(ResourceError::AccountingViolation(format!(
                        "node {} has no GPU {gpu}",
                        self.hostname
                    )));
                }
            }
        }
        for gpu in gpus {
            self.gpu_busy[*gpu as usize] = false;
        }
        self.occupied_cores -= cores;
        Ok(())
    }

    pub(crate) fn check(&self) -> Result<(), ResourceError> {
        if self.occupied_cores > self.total_cores {
            return Err(ResourceError::AccountingViolation(format!(
                "node {} has {} occupied cores out of {}",
                self.hostname, self.occupied_cores, self.total_cores
            )));
        }
        Ok(())
    }
}
