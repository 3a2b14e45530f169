use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Sleep between test rounds: a fixed base plus uniform jitter in `[0, jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub base: Duration,
    pub jitter: Duration,
}

impl Pacing {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    /// Draw the next delay.
    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }

        let extra = rng.gen_range(Duration::ZERO..self.jitter);
        self.base + extra
    }

    /// Sleep for one freshly drawn delay.
    pub async fn sleep(&self) {
        let delay = self.next_delay(&mut rand::thread_rng());
        debug!(seconds = delay.as_secs_f64(), "time between tests");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zero_jitter_is_base() {
        let pacing = Pacing::new(Duration::from_secs(5), Duration::ZERO);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pacing.next_delay(&mut rng), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_within_bounds() {
        let pacing = Pacing::new(Duration::from_secs(5), Duration::from_secs(5));
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..1000 {
            let delay = pacing.next_delay(&mut rng);
            assert!(delay >= Duration::from_secs(5));
            assert!(delay < Duration::from_secs(10));
        }
    }
}
