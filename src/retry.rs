use rand::Rng;
use std::time::Duration;

/// Random delay within `[min_ms, max_ms]`.
pub fn random_delay(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let delay_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(delay_ms)
}

/// `base` stretched by up to half again, so workers that failed together
/// do not retry in lockstep.
pub fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    random_delay(base_ms, base_ms + base_ms / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_millis(1000));
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn zero_base_is_zero() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
