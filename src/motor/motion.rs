// Blocking "wait until position reached" loop

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::WaitPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reached {
    pub position: i32,
    pub polls: u64,
}

/// Deadline expired before the target was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub last_position: i32,
    pub polls: u64,
    pub elapsed: Duration,
}

/// Poll `read_position` until it lands within `threshold` of `target`.
///
/// With the default policy this never gives up: a stalled or disconnected
/// motor keeps the caller blocked. Set `deadline_ms` to bound it.
pub fn wait_until_reached<F>(
    mut read_position: F,
    target: i32,
    threshold: i32,
    policy: &WaitPolicy,
) -> Result<Reached, Timeout>
where
    F: FnMut() -> i32,
{
    let started = Instant::now();
    let tolerance = threshold.unsigned_abs();
    let mut polls = 0;

    loop {
        let position = read_position();
        polls += 1;

        if target.abs_diff(position) <= tolerance {
            debug!("Reached {} after {} polls (at {})", target, polls, position);
            return Ok(Reached { position, polls });
        }

        if let Some(deadline) = policy.deadline() {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(Timeout {
                    last_position: position,
                    polls,
                    elapsed,
                });
            }
        }

        if let Some(interval) = policy.poll_interval() {
            thread::sleep(interval);
        }
    }
}
