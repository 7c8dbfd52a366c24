//! Resolution budget - token bucket for `max_resolutions_per_second`

use std::time::Duration;

use anchorage_core::AnchorId;

/// Token bucket handing out anchor resolutions round-robin
#[derive(Clone, Debug)]
pub struct ResolutionBudget {
    /// Resolutions per second; `None` is unbounded
    rate: Option<f32>,
    credit: f32,
    cursor: usize,
}

impl ResolutionBudget {
    pub fn new(rate: Option<f32>) -> Self {
        ResolutionBudget {
            rate,
            credit: 0.0,
            cursor: 0,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Burst ceiling: one second's worth of credit, at least one
    fn capacity(rate: f32) -> f32 {
        rate.max(1.0)
    }

    /// Accrue credit for `elapsed` and return how many resolutions are allowed now
    pub fn accrue(&mut self, elapsed: Duration) -> usize {
        let Some(rate) = self.rate else {
            return usize::MAX;
        };
        self.credit = (self.credit + rate * elapsed.as_secs_f32()).min(Self::capacity(rate));
        self.credit.floor() as usize
    }

    /// Pick the anchors to resolve this round, spending credit
    pub fn take(&mut self, candidates: &[AnchorId], elapsed: Duration) -> Vec<AnchorId> {
        let allowed = self.accrue(elapsed);
        if candidates.is_empty() || allowed == 0 {
            return Vec::new();
        }

        let n = allowed.min(candidates.len());
        let start = self.cursor % candidates.len();
        let chosen: Vec<AnchorId> = candidates
            .iter()
            .cycle()
            .skip(start)
            .take(n)
            .copied()
            .collect();

        self.cursor = (start + n) % candidates.len();
        if self.rate.is_some() {
            self.credit -= n as f32;
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(n: u128) -> Vec<AnchorId> {
        (1..=n).map(AnchorId::new).collect()
    }

    #[test]
    fn test_unbounded_takes_everything() {
        let mut budget = ResolutionBudget::unbounded();
        assert_eq!(budget.take(&ids(50), Duration::from_millis(1)).len(), 50);
    }

    #[test]
    fn test_rate_limits_per_second() {
        let mut budget = ResolutionBudget::new(Some(4.0));
        let candidates = ids(10);

        // 4/s over quarter-second rounds: exactly one resolution per round
        for _ in 0..8 {
            assert_eq!(budget.take(&candidates, Duration::from_millis(250)).len(), 1);
        }
    }

    #[test]
    fn test_round_robin_covers_all_candidates() {
        let mut budget = ResolutionBudget::new(Some(2.0));
        let candidates = ids(3);

        let first = budget.take(&candidates, Duration::from_secs(1));
        let second = budget.take(&candidates, Duration::from_secs(1));
        assert_eq!(first, vec![AnchorId::new(1), AnchorId::new(2)]);
        assert_eq!(second, vec![AnchorId::new(3), AnchorId::new(1)]);
    }

    #[test]
    fn test_credit_does_not_accumulate_unbounded() {
        let mut budget = ResolutionBudget::new(Some(2.0));
        assert_eq!(budget.accrue(Duration::from_secs(60)), 2);
    }

    #[test]
    fn test_slow_rate_still_progresses() {
        let mut budget = ResolutionBudget::new(Some(0.5));
        let candidates = ids(1);
        assert!(budget.take(&candidates, Duration::from_secs(1)).is_empty());
        assert_eq!(budget.take(&candidates, Duration::from_secs(1)).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_rate(
            rate in 0.1f32..50.0,
            rounds in proptest::collection::vec(1u64..2000, 1..64),
            candidates in 1u128..20,
        ) {
            let mut budget = ResolutionBudget::new(Some(rate));
            let candidates = ids(candidates);
            let mut taken = 0usize;
            let mut elapsed_ms = 0u64;
            for ms in rounds {
                elapsed_ms += ms;
                let chosen = budget.take(&candidates, Duration::from_millis(ms));
                prop_assert!(chosen.len() <= candidates.len());
                taken += chosen.len();
            }
            let ceiling = rate as f64 * elapsed_ms as f64 / 1000.0 + 1.0;
            prop_assert!(taken as f64 <= ceiling);
        }
    }
}
