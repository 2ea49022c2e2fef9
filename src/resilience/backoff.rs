//! Exponential backoff with jitter for managed reconnects.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Delay before dial attempt `attempt` of a re-establishment.
///
/// Attempt 0 dials immediately. Later attempts back off exponentially
/// from the configured base, capped at the configured maximum, with up
/// to 10% jitter on top.
pub fn reconnect_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = config.base_delay_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(config.max_delay_ms);

    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, max_ms: u64) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: 5,
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
        }
    }

    #[test]
    fn first_attempt_is_immediate() {
        assert_eq!(reconnect_delay(0, &config(100, 2000)), Duration::ZERO);
    }

    #[test]
    fn delay_grows_and_caps() {
        let cfg = config(100, 2000);
        let b1 = reconnect_delay(1, &cfg);
        assert!(b1.as_millis() >= 100);

        let b2 = reconnect_delay(2, &cfg);
        assert!(b2.as_millis() >= 200);

        let capped = reconnect_delay(10, &cfg);
        assert!(capped.as_millis() >= 2000);
        // Cap plus at most 10% jitter.
        assert!(capped.as_millis() <= 2200);
    }
}
