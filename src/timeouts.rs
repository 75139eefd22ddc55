use std::time::Duration;

const SAFETY_MARGIN: f64 = 1.05;
const MIN_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Bounded wait applied to every IOPub read of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainWait {
    pub per_event: Duration,
    /// Seconds quoted in the timeout message.
    pub reported_secs: u64,
}

impl DrainWait {
    /// With an armed timer the wait sits slightly past it so the in-kernel alarm reports first.
    pub fn for_timeout(timeout_secs: Option<u64>, fallback: Duration) -> Self {
        match timeout_secs {
            Some(secs) => Self {
                per_event: apply_safety_margin(Duration::from_secs(secs)),
                reported_secs: secs,
            },
            None => Self {
                per_event: fallback,
                reported_secs: fallback.as_secs(),
            },
        }
    }
}

pub fn apply_safety_margin(duration: Duration) -> Duration {
    let scaled = Duration::from_secs_f64(duration.as_secs_f64() * SAFETY_MARGIN);
    let min = duration.saturating_add(MIN_DRAIN_GRACE);
    if scaled < min { min } else { scaled }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_timeouts_get_at_least_one_second_of_grace() {
        assert_eq!(
            apply_safety_margin(Duration::from_secs(3)),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn long_timeouts_scale_by_margin() {
        let wait = apply_safety_margin(Duration::from_secs(100));
        assert!(wait >= Duration::from_millis(104_999), "got {wait:?}");
        assert!(wait <= Duration::from_millis(105_001), "got {wait:?}");
    }

    #[test]
    fn drain_wait_reports_requested_timeout() {
        let wait = DrainWait::for_timeout(Some(30), Duration::from_secs(600));
        assert_eq!(wait.reported_secs, 30);
        assert!(wait.per_event > Duration::from_secs(30));

        let wait = DrainWait::for_timeout(None, Duration::from_secs(600));
        assert_eq!(wait.per_event, Duration::from_secs(600));
        assert_eq!(wait.reported_secs, 600);
    }
}
