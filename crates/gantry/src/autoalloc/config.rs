use std::time::Duration;

/// Delay levels between submissions. See [`super::state::RateLimiter`].
pub const SUBMISSION_DELAYS: [Duration; 5] = [
    Duration::ZERO,
    Duration::from_secs(60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(60 * 60),
];

/// How many submission scripts of finished allocations are kept in the submit directory.
pub const MAX_KEPT_SCRIPTS: usize = 50;

/// Name of the submission script of an allocation.
pub fn script_name(allocation: super::AllocationId) -> String {
    format!("gantry-{allocation:06}.sh")
}
