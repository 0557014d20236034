//! Pure scaling decisions of the queue service.
use std::time::Duration;

use crate::common::config::{ElasticConfig, MaintainerConfig};
use crate::job::BacklogSummary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElasticDecision {
    /// Submit one allocation with the given number of nodes.
    Submit { nodes: u32 },
    /// Cancel allocations that are still waiting in the batch queue.
    ScaleDown,
    /// Nothing to do, with a reason for the debug log.
    Wait(&'static str),
}

/// Decides what the elastic policy should do in the current period.
///
/// `pending_cores` are the cores of allocations that were submitted but are not running yet,
/// `queued` is their count. `since_last_change` is the time since the policy last submitted
/// or cancelled an allocation.
pub fn elastic_decision(
    config: &ElasticConfig,
    backlog: &BacklogSummary,
    pending_cores: u64,
    queued: u32,
    since_last_change: Option<Duration>,
) -> ElasticDecision {
    let settled = since_last_change.is_none_or(|elapsed| elapsed >= config.submit_interval);

    if backlog.runnable_jobs == 0 {
        if queued > 0 && settled {
            return ElasticDecision::ScaleDown;
        }
        return ElasticDecision::Wait("backlog is empty");
    }

    let shortfall = backlog.runnable_cores as i64 - backlog.idle_cores as i64 - pending_cores as i64;
    if shortfall <= 0 {
        return ElasticDecision::Wait("backlog is covered by idle and pending capacity");
    }
    let cores_per_node = config.cores_per_node.max(1) as u64;
    let band = config.min_nodes as u64 * cores_per_node;
    let has_capacity = backlog.idle_cores > 0 || pending_cores > 0;
    if has_capacity && (shortfall as u64) < band {
        return ElasticDecision::Wait("shortfall is below the smallest useful allocation");
    }
    if queued >= config.max_queued {
        return ElasticDecision::Wait("too many allocations are queued");
    }
    if !settled {
        return ElasticDecision::Wait("last change is too recent");
    }

    let by_shortfall = (shortfall as u64).div_ceil(cores_per_node);
    let by_largest_job = (backlog.largest_job_cores as u64).div_ceil(cores_per_node);
    let nodes = by_shortfall
        .max(by_largest_job)
        .clamp(config.min_nodes as u64, config.max_nodes as u64);
    ElasticDecision::Submit {
        nodes: nodes as u32,
    }
}

/// How many allocations have to be submitted to keep the configured number of them.
pub fn maintainer_deficit(config: &MaintainerConfig, active: u32) -> u32 {
    config.num_allocations.saturating_sub(active)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elastic() -> ElasticConfig {
        ElasticConfig {
            cores_per_node: 64,
            min_nodes: 1,
            max_nodes: 8,
            max_queued: 2,
            submit_interval: Duration::from_secs(60),
        }
    }

    fn backlog(runnable_cores: u64, idle_cores: u64) -> BacklogSummary {
        BacklogSummary {
            runnable_jobs: if runnable_cores > 0 { 10 } else { 0 },
            runnable_cores,
            largest_job_cores: 10,
            idle_cores,
        }
    }

    #[test]
    fn empty_backlog_submits_nothing() {
        assert!(matches!(
            elastic_decision(&elastic(), &backlog(0, 0), 0, 0, None),
            ElasticDecision::Wait(_)
        ));
    }

    #[test]
    fn shortfall_is_sized_in_nodes() {
        assert_eq!(
            elastic_decision(&elastic(), &backlog(100, 0), 0, 0, None),
            ElasticDecision::Submit { nodes: 2 }
        );
        assert_eq!(
            elastic_decision(&elastic(), &backlog(10_000, 0), 0, 0, None),
            ElasticDecision::Submit { nodes: 8 }
        );
    }

    #[test]
    fn small_backlog_without_capacity_gets_min_nodes() {
        assert_eq!(
            elastic_decision(&elastic(), &backlog(4, 0), 0, 0, None),
            ElasticDecision::Submit { nodes: 1 }
        );
    }

    #[test]
    fn pending_and_idle_capacity_covers_backlog() {
        assert!(matches!(
            elastic_decision(&elastic(), &backlog(100, 0), 128, 1, None),
            ElasticDecision::Wait(_)
        ));
        assert!(matches!(
            elastic_decision(&elastic(), &backlog(100, 40), 0, 0, None),
            ElasticDecision::Wait(_)
        ));
        // The remaining shortfall (30 cores) is below one node.
        assert!(matches!(
            elastic_decision(&elastic(), &backlog(100, 6), 64, 1, None),
            ElasticDecision::Wait(_)
        ));
    }

    #[test]
    fn hysteresis_interval() {
        let config = elastic();
        assert!(matches!(
            elastic_decision(
                &config,
                &backlog(1000, 0),
                0,
                0,
                Some(Duration::from_secs(30))
            ),
            ElasticDecision::Wait(_)
        ));
        assert!(matches!(
            elastic_decision(
                &config,
                &backlog(1000, 0),
                0,
                0,
                Some(Duration::from_secs(60))
            ),
            ElasticDecision::Submit { .. }
        ));
    }

    #[test]
    fn max_queued_limit() {
        assert!(matches!(
            elastic_decision(&elastic(), &backlog(1000, 0), 128, 2, None),
            ElasticDecision::Wait(_)
        ));
    }

    #[test]
    fn largest_job_raises_node_count() {
        let summary = BacklogSummary {
            runnable_jobs: 1,
            runnable_cores: 200,
            largest_job_cores: 200,
            idle_cores: 0,
        };
        let summary_with_idle = BacklogSummary {
            idle_cores: 150,
            runnable_cores: 260,
            runnable_jobs: 2,
            ..summary.clone()
        };
        assert_eq!(
            elastic_decision(&elastic(), &summary, 0, 0, None),
            ElasticDecision::Submit { nodes: 4 }
        );
        assert_eq!(
            elastic_decision(&elastic(), &summary_with_idle, 0, 0, None),
            ElasticDecision::Submit { nodes: 4 }
        );
    }

    #[test]
    fn scale_down_queued_allocations() {
        let config = elastic();
        assert_eq!(
            elastic_decision(&config, &backlog(0, 0), 64, 1, Some(Duration::from_secs(61))),
            ElasticDecision::ScaleDown
        );
        assert!(matches!(
            elastic_decision(&config, &backlog(0, 0), 64, 1, Some(Duration::from_secs(10))),
            ElasticDecision::Wait(_)
        ));
    }

    #[test]
    fn maintainer() {
        let config = MaintainerConfig {
            num_allocations: 3,
            nodes: 2,
        };
        assert_eq!(maintainer_deficit(&config, 1), 2);
        assert_eq!(maintainer_deficit(&config, 4), 0);
    }
}
