use std::{
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use super::manager::ManagerError;

/// Bounded wait used after a write before the object is expected to be readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationStrategy {
    /// Sleep once, then read once.
    FixedDelay(Duration),
    /// Read until visible or until `timeout` has elapsed, sleeping `interval` between reads.
    Poll { timeout: Duration, interval: Duration },
}

impl ConfirmationStrategy {
    pub fn budget(&self) -> Duration {
        match self {
            ConfirmationStrategy::FixedDelay(delay) => *delay,
            ConfirmationStrategy::Poll { timeout, .. } => *timeout,
        }
    }

    /// Runs `probe` under this strategy. `Ok(None)` means the budget ran out without a sighting.
    /// A probe error ends the phase immediately.
    pub fn confirm<T>(
        &self,
        mut probe: impl FnMut() -> Result<Option<T>, ManagerError>,
    ) -> Result<Option<T>, ManagerError> {
        match self {
            ConfirmationStrategy::FixedDelay(delay) => {
                if !delay.is_zero() {
                    thread::sleep(*delay);
                }
                probe()
            }
            ConfirmationStrategy::Poll { timeout, interval } => {
                let started = Instant::now();
                loop {
                    if let Some(found) = probe()? {
                        return Ok(Some(found));
                    }
                    let elapsed = started.elapsed();
                    if elapsed >= *timeout {
                        return Ok(None);
                    }
                    thread::sleep((*interval).min(*timeout - elapsed));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_reads_exactly_once() {
        let mut reads = 0;
        let found: Option<u32> = ConfirmationStrategy::FixedDelay(Duration::from_millis(5))
            .confirm(|| {
                reads += 1;
                Ok(None)
            })
            .unwrap();
        assert_eq!(found, None);
        assert_eq!(reads, 1);
    }

    #[test]
    fn poll_stops_at_first_sighting() {
        let mut reads = 0;
        let strategy = ConfirmationStrategy::Poll {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(1),
        };
        let found = strategy
            .confirm(|| {
                reads += 1;
                Ok((reads == 3).then_some("visible"))
            })
            .unwrap();
        assert_eq!(found, Some("visible"));
        assert_eq!(reads, 3);
    }

    #[test]
    fn poll_gives_up_after_timeout() {
        let strategy = ConfirmationStrategy::Poll {
            timeout: Duration::from_millis(20),
            interval: Duration::from_millis(5),
        };
        let started = Instant::now();
        let found: Option<()> = strategy.confirm(|| Ok(None)).unwrap();
        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn probe_errors_are_not_retried() {
        let mut reads = 0;
        let strategy = ConfirmationStrategy::Poll {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(1),
        };
        let result: Result<Option<()>, _> = strategy.confirm(|| {
            reads += 1;
            Err(ManagerError::Connection("refused".to_string()))
        });
        assert!(matches!(result, Err(ManagerError::Connection(_))));
        assert_eq!(reads, 1);
    }
}
