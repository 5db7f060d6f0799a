use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Exponential backoff with jitter. Never sleeps: callers ask whether the
/// next attempt is due and skip the network call otherwise.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
            next_attempt_at: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    pub fn ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    /// Record a failure and schedule the next attempt.
    pub fn failure(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.failures = self.failures.saturating_add(1);
        let at = now + self.delay();
        self.next_attempt_at = Some(at);
        at
    }

    pub fn success(&mut self) {
        self.failures = 0;
        self.next_attempt_at = None;
    }

    /// Upper bound of the current delay, before jitter.
    pub fn ceiling(&self) -> Duration {
        let shift = self.failures.saturating_sub(1).min(30);
        let millis = self.base.num_milliseconds().saturating_mul(1i64 << shift);
        Duration::milliseconds(millis).min(self.max)
    }

    // Equal jitter: half fixed, half random.
    fn delay(&self) -> Duration {
        let ceiling = self.ceiling().num_milliseconds().max(1);
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=ceiling - half);
        Duration::milliseconds(half + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::seconds(1), Duration::seconds(10));
        let now = Utc::now();
        let mut previous_ceiling = Duration::zero();
        for _ in 0..8 {
            let at = backoff.failure(now);
            let ceiling = backoff.ceiling();
            assert!(ceiling >= previous_ceiling);
            assert!(ceiling <= Duration::seconds(10));
            assert!(at - now <= ceiling);
            assert!(at - now >= ceiling / 2);
            previous_ceiling = ceiling;
        }
        assert_eq!(backoff.ceiling(), Duration::seconds(10));
    }

    #[test]
    fn success_clears_the_schedule() {
        let mut backoff = Backoff::new(Duration::seconds(5), Duration::minutes(5));
        let now = Utc::now();
        backoff.failure(now);
        assert!(!backoff.ready(now));
        backoff.success();
        assert!(backoff.ready(now));
        assert_eq!(backoff.failures(), 0);
    }
}
