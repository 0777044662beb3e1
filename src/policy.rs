//! Load-shape policies: target concurrency as a function of elapsed time.
//!
//! [`target_concurrency`] is pure. The engine calls it once per tick and
//! spawns or stops virtual users to match. All arithmetic is integer so the
//! floors are exact.

use crate::config::{TestConfig, TestType};

/// Half-width of the full-load window of a spike, in seconds.
const SPIKE_HALF_WIDTH_SECS: u64 = 5;

/// Number of equal steps of a stress run.
const STRESS_STEPS: u64 = 4;

/// Returns the number of virtual users that should be live after
/// `elapsed_secs` seconds, always within `0..=virtual_users`.
///
/// - `fixed`: `virtual_users` while `elapsed < duration`, then 0.
/// - `ramp-up`: `floor(elapsed / ramp_up_time * virtual_users)` until
///   `ramp_up_time`, then `virtual_users`. A zero ramp behaves as `fixed`.
/// - `spike`: 30% baseline, full load within 5s of `duration / 2`.
/// - `stress`: 25%, 50%, 75% and 100% over four equal quarters.
pub fn target_concurrency(elapsed_secs: u64, config: &TestConfig) -> u32 {
    let vus = u64::from(config.virtual_users);
    let target = match config.test_type {
        TestType::Fixed => fixed(elapsed_secs, vus, config.duration),
        TestType::RampUp => {
            if config.ramp_up_time == 0 {
                fixed(elapsed_secs, vus, config.duration)
            } else if elapsed_secs <= config.ramp_up_time {
                elapsed_secs.saturating_mul(vus) / config.ramp_up_time
            } else {
                vus
            }
        },
        TestType::Spike => {
            if in_spike_window(elapsed_secs, config.duration) {
                vus
            } else {
                vus * 3 / 10
            }
        },
        TestType::Stress => {
            // k = floor(elapsed / (duration / 4)) = floor(4 * elapsed / duration)
            let step = if config.duration == 0 {
                STRESS_STEPS - 1
            } else {
                (elapsed_secs.saturating_mul(STRESS_STEPS) / config.duration).min(STRESS_STEPS - 1)
            };
            vus * (step + 1) / STRESS_STEPS
        },
    };
    target.min(vus) as u32
}

/// Concurrency reported on the last tick, when `elapsed == duration`.
///
/// The last second still belongs to the run, so the `fixed` end-of-run
/// cutoff to 0 does not apply; every other shape is evaluated as usual.
pub fn closing_concurrency(config: &TestConfig) -> u32 {
    match config.test_type {
        TestType::Fixed => config.virtual_users,
        TestType::RampUp if config.ramp_up_time == 0 => config.virtual_users,
        _ => target_concurrency(config.duration, config),
    }
}

fn fixed(elapsed_secs: u64, vus: u64, duration: u64) -> u64 {
    if elapsed_secs < duration {
        vus
    } else {
        0
    }
}

/// `|elapsed - duration / 2| <= 5`, evaluated in doubled units so odd
/// durations keep their half-second midpoint.
fn in_spike_window(elapsed_secs: u64, duration: u64) -> bool {
    let doubled_elapsed = elapsed_secs.saturating_mul(2);
    doubled_elapsed.abs_diff(duration) <= SPIKE_HALF_WIDTH_SECS * 2
}
