use std::cmp::Reverse;
use std::sync::{Mutex, MutexGuard};

use smallvec::SmallVec;

use super::{
    Footprint, GpuId, IdleResources, NodeDescriptor, NodeId, NodeResources, ReservationId,
    ResourceError,
};
use crate::Map;

/// Part of a reservation that lives on a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub node: NodeId,
    pub ranks: u32,
    pub cores: u32,
    pub gpus: SmallVec<[GpuId; 4]>,
}

/// Compute units held by a single job.
///
/// It is intentionally not `Clone`: a reservation is consumed by
/// [`ResourceRegistry::release`], so it cannot be released twice by accident.
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    id: ReservationId,
    footprint: Footprint,
    slots: SmallVec<[Slot; 1]>,
}

impl Reservation {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.iter().map(|slot| slot.node)
    }

    pub fn is_single_node(&self) -> bool {
        self.slots.len() == 1
    }

    pub fn total_cores(&self) -> u32 {
        self.slots.iter().map(|slot| slot.cores).sum()
    }
}

struct RegistryInner {
    nodes: Vec<NodeResources>,
    /// What each live reservation holds, used to validate releases.
    live: Map<ReservationId, SmallVec<[Slot; 1]>>,
    reservation_counter: u64,
}

/// Tracks compute units of all nodes of an allocation.
///
/// All mutation happens under a single registry-wide lock, the critical section is linear
/// in the number of nodes.
pub struct ResourceRegistry {
    inner: Mutex<RegistryInner>,
}

impl ResourceRegistry {
    pub fn new(nodes: &[NodeDescriptor]) -> Self {
        let nodes = nodes
            .iter()
            .enumerate()
            .map(|(index, descriptor)| NodeResources::new(NodeId::new(index as u32), descriptor))
            .collect();
        Self {
            inner: Mutex::new(RegistryInner {
                nodes,
                live: Default::default(),
                reservation_counter: 0,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryInner>, ResourceError> {
        self.inner.lock().map_err(|_| {
            ResourceError::AccountingViolation("resource registry lock is poisoned".to_string())
        })
    }

    /// Places the footprint onto the nodes.
    ///
    /// Candidate nodes are ordered by occupied cores (descending), then occupied GPUs
    /// (descending) and finally by node index. Ranks are packed greedily in this order, so
    /// partially used nodes are filled first and whole nodes stay free for large requests.
    /// Either all ranks are placed or nothing is reserved.
    pub fn reserve(&self, footprint: &Footprint) -> Result<Reservation, ResourceError> {
        footprint.validate()?;
        let mut inner = self.lock()?;

        let mut order: Vec<usize> = (0..inner.nodes.len())
            .filter(|&index| inner.nodes[index].ranks_that_fit(footprint) > 0)
            .collect();
        order.sort_by_key(|&index| {
            let node = &inner.nodes[index];
            (
                Reverse(node.occupied_cores()),
                Reverse(node.occupied_gpus()),
                index,
            )
        });

        let mut remaining = footprint.ranks;
        let mut plan: SmallVec<[(usize, u32); 4]> = SmallVec::new();
        for index in order {
            let ranks = inner.nodes[index].ranks_that_fit(footprint).min(remaining);
            plan.push((index, ranks));
            remaining -= ranks;
            if remaining == 0 {
                break;
            }
        }
        if remaining > 0 {
            return Err(ResourceError::InsufficientResources(*footprint));
        }

        let mut slots: SmallVec<[Slot; 1]> = SmallVec::new();
        for (index, ranks) in plan {
            let cores = ranks * footprint.cores_per_rank;
            let node = &mut inner.nodes[index];
            let gpus = node.take(cores, ranks * footprint.gpus_per_rank)?;
            slots.push(Slot {
                node: node.id(),
                ranks,
                cores,
                gpus,
            });
        }

        inner.reservation_counter += 1;
        let id = ReservationId::new(inner.reservation_counter);
        inner.live.insert(id, slots.clone());
        log::trace!("Reserved {footprint} as {id}: {slots:?}");

        Ok(Reservation {
            id,
            footprint: *footprint,
            slots,
        })
    }

    /// Returns the compute units of a reservation back to their nodes.
    pub fn release(&self, reservation: Reservation) -> Result<(), ResourceError> {
        let mut inner = self.lock()?;
        let recorded = inner.live.remove(&reservation.id).ok_or_else(|| {
            ResourceError::AccountingViolation(format!(
                "reservation {} is not live (released twice?)",
                reservation.id
            ))
        })?;
        if recorded != reservation.slots {
            return Err(ResourceError::AccountingViolation(format!(
                "reservation {} does not match its record: {:?} vs {:?}",
                reservation.id, reservation.slots, recorded
            )));
        }
        for slot in &recorded {
            let node = inner
                .nodes
                .get_mut(slot.node.as_num() as usize)
                .ok_or_else(|| {
                    ResourceError::AccountingViolation(format!("unknown node {}", slot.node))
                })?;
            node.give_back(slot.cores, &slot.gpus)?;
        }
        log::trace!("Released reservation {}", reservation.id);
        Ok(())
    }

    pub fn idle(&self) -> Result<IdleResources, ResourceError> {
        let inner = self.lock()?;
        Ok(IdleResources {
            nodes: inner.nodes.iter().map(|node| node.to_idle()).collect(),
        })
    }

    pub fn nodes(&self) -> Result<Vec<NodeResources>, ResourceError> {
        Ok(self.lock()?.nodes.clone())
    }

    pub fn hostname(&self, node: NodeId) -> Option<String> {
        let inner = self.lock().ok()?;
        inner
            .nodes
            .get(node.as_num() as usize)
            .map(|node| node.hostname().to_string())
    }

    pub fn live_reservations(&self) -> Result<usize, ResourceError> {
        Ok(self.lock()?.live.len())
    }

    /// Verifies that the occupancy of every node matches the sum of live reservations.
    pub fn check_consistency(&self) -> Result<(), ResourceError> {
        let inner = self.lock()?;
        let mut cores = vec![0u32; inner.nodes.len()];
        let mut gpus = vec![0u32; inner.nodes.len()];
        for slots in inner.live.values() {
            for slot in slots {
                let index = slot.node.as_num() as usize;
                if index >= cores.len() {
                    return Err(ResourceError::AccountingViolation(format!(
                        "reservation refers to unknown node {}",
                        slot.node
                    )));
                }
                cores[index] += slot.cores;
                gpus[index] += slot.gpus.len() as u32;
            }
        }
        for (index, node) in inner.nodes.iter().enumerate() {
            node.check()?;
            if node.occupied_cores() != cores[index] || node.occupied_gpus() != gpus[index] {
                return Err(ResourceError::AccountingViolation(format!(
                    "node {} occupancy ({} cores, {} GPUs) does not match live reservations ({} cores, {} GPUs)",
                    node.hostname(),
                    node.occupied_cores(),
                    node.occupied_gpus(),
                    cores[index],
                    gpus[index]
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(nodes: &[(u32, u32)]) -> ResourceRegistry {
        let nodes: Vec<NodeDescriptor> = nodes
            .iter()
            .enumerate()
            .map(|(i, (cores, gpus))| NodeDescriptor::new(format!("node{i}"), *cores, *gpus))
            .collect();
        ResourceRegistry::new(&nodes)
    }

    fn occupied(registry: &ResourceRegistry) -> Vec<(u32, u32)> {
        registry
            .nodes()
            .unwrap()
            .iter()
            .map(|n| (n.occupied_cores(), n.occupied_gpus()))
            .collect()
    }

    fn assert_invariants(registry: &ResourceRegistry) {
        for node in registry.nodes().unwrap() {
            assert!(node.occupied_cores() <= node.total_cores());
            assert!(node.occupied_gpus() <= node.total_gpus());
        }
        registry.check_consistency().unwrap();
    }

    #[test]
    fn reserve_single_node() {
        let registry = registry(&[(4, 0)]);
        let r1 = registry.reserve(&Footprint::cores(2)).unwrap();
        let r2 = registry.reserve(&Footprint::cores(2)).unwrap();
        assert_eq!(
            registry.reserve(&Footprint::cores(2)),
            Err(ResourceError::InsufficientResources(Footprint::cores(2)))
        );
        assert_eq!(occupied(&registry), vec![(4, 0)]);
        registry.release(r1).unwrap();
        assert!(registry.reserve(&Footprint::cores(2)).is_ok());
        registry.release(r2).unwrap();
    }

    #[test]
    fn reserve_prefers_most_occupied_node() {
        let registry = registry(&[(8, 0), (8, 0)]);
        let _big = registry.reserve(&Footprint::cores(4)).unwrap();
        assert_eq!(occupied(&registry), vec![(4, 0), (0, 0)]);
        // Node 0 is more occupied and still fits, node 1 must stay whole.
        let small = registry.reserve(&Footprint::cores(2)).unwrap();
        assert_eq!(small.slots()[0].node, NodeId::new(0));
        assert_eq!(occupied(&registry), vec![(6, 0), (0, 0)]);
        // Does not fit on node 0 anymore.
        let next = registry.reserve(&Footprint::cores(3)).unwrap();
        assert_eq!(next.slots()[0].node, NodeId::new(1));
    }

    #[test]
    fn reserve_ties_are_broken_by_node_index() {
        let registry = registry(&[(4, 0), (4, 0), (4, 0)]);
        let r = registry.reserve(&Footprint::cores(1)).unwrap();
        assert_eq!(r.slots()[0].node, NodeId::new(0));
    }

    #[test]
    fn reserve_gpu_is_considered_after_cores() {
        let registry = registry(&[(4, 0), (4, 2)]);
        let r = registry.reserve(&Footprint::new(1, 1, 1)).unwrap();
        assert_eq!(r.slots()[0].node, NodeId::new(1));
        assert_eq!(r.slots()[0].gpus.as_slice(), &[0]);
        let r2 = registry.reserve(&Footprint::new(1, 1, 1)).unwrap();
        assert_eq!(r2.slots()[0].gpus.as_slice(), &[1]);
        assert!(matches!(
            registry.reserve(&Footprint::new(1, 1, 1)),
            Err(ResourceError::InsufficientResources(_))
        ));
    }

    #[test]
    fn multi_rank_spans_nodes() {
        let registry = registry(&[(4, 0), (4, 0)]);
        let r = registry.reserve(&Footprint::new(3, 2, 0)).unwrap();
        assert_eq!(r.slots().len(), 2);
        assert_eq!(r.slots()[0].ranks, 2);
        assert_eq!(r.slots()[1].ranks, 1);
        assert_eq!(r.total_cores(), 6);
        assert_invariants(&registry);
    }

    #[test]
    fn failed_reservation_does_not_change_occupancy() {
        let registry = registry(&[(4, 0), (4, 0)]);
        let _r = registry.reserve(&Footprint::cores(3)).unwrap();
        let before = occupied(&registry);
        assert!(registry.reserve(&Footprint::new(3, 2, 0)).is_err());
        assert_eq!(occupied(&registry), before);
        assert_invariants(&registry);
    }

    #[test]
    fn invalid_footprint() {
        let registry = registry(&[(4, 0)]);
        assert!(matches!(
            registry.reserve(&Footprint::new(0, 1, 0)),
            Err(ResourceError::InvalidFootprint(..))
        ));
    }

    #[test]
    fn foreign_reservation_is_detected() {
        let first = registry(&[(4, 0)]);
        let second = registry(&[(4, 0)]);
        let r = first.reserve(&Footprint::cores(2)).unwrap();
        let err = second.release(r).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(occupied(&second), vec![(0, 0)]);
    }

    #[test]
    fn matched_reserve_release_restores_occupancy() {
        let registry = registry(&[(8, 2), (4, 0), (16, 4)]);
        let initial = occupied(&registry);
        let footprints = [
            Footprint::cores(1),
            Footprint::new(2, 2, 0),
            Footprint::new(1, 4, 2),
            Footprint::new(4, 1, 1),
            Footprint::cores(8),
            Footprint::new(3, 3, 0),
            Footprint::cores(16),
        ];

        let mut live = Vec::new();
        for round in 0..50usize {
            let footprint = footprints[round % footprints.len()];
            match registry.reserve(&footprint) {
                Ok(reservation) => live.push(reservation),
                Err(ResourceError::InsufficientResources(_)) => {
                    // Release the oldest reservation to make progress.
                    if !live.is_empty() {
                        registry.release(live.remove(0)).unwrap();
                    }
                }
                Err(error) => panic!("Unexpected error {error:?}"),
            }
            assert_invariants(&registry);
        }
        for reservation in live {
            registry.release(reservation).unwrap();
            assert_invariants(&registry);
        }
        assert_eq!(occupied(&registry), initial);
        assert_eq!(registry.live_reservations().unwrap(), 0);
    }

    #[test]
    fn idle_snapshot() {
        let registry = registry(&[(4, 1), (2, 0)]);
        let _r = registry.reserve(&Footprint::new(1, 1, 1)).unwrap();
        let idle = registry.idle().unwrap();
        assert_eq!(idle.total_free_cores(), 5);
        assert_eq!(idle.total_free_gpus(), 0);
        assert!(!idle.is_trivial());
    }
}
