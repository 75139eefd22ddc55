use std::time::{Duration, Instant};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILTER_ENV: &str = "CODE_INTERPRETER_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

/// Human-readable logs go to stderr; stdout belongs to the MCP transport.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

pub fn elapsed_ms(started: Instant) -> u128 {
    elapsed_duration_ms(started.elapsed())
}

fn elapsed_duration_ms(duration: Duration) -> u128 {
    duration.as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn elapsed_is_whole_milliseconds() {
        assert_eq!(elapsed_duration_ms(Duration::from_micros(2_999)), 2);
    }
}
