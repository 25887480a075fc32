//! Deterministic fixed-ratio sampling.

/// Emits `true` on a fixed ratio of `pulse` calls, evenly spread.
///
/// Deterministic by construction so that constraint-search sampling does
/// not depend on a random seed: after `n` pulses, exactly
/// `ceil(ratio * n)` have returned `true`.
#[derive(Clone, Debug)]
pub struct FixedRatioSampler {
    ratio: f64,
    num_pulses: u64,
    num_samples: u64,
}

impl FixedRatioSampler {
    /// `ratio` must be in [0, 1].
    pub fn new(ratio: f64) -> Self {
        assert!((0.0..=1.0).contains(&ratio), "sampling ratio {ratio} out of range");
        Self {
            ratio,
            num_pulses: 0,
            num_samples: 0,
        }
    }

    /// Register one event; returns whether it is sampled.
    pub fn pulse(&mut self) -> bool {
        self.num_pulses += 1;
        if (self.num_samples as f64) < self.ratio * self.num_pulses as f64 {
            self.num_samples += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_and_never() {
        let mut all = FixedRatioSampler::new(1.0);
        let mut none = FixedRatioSampler::new(0.0);
        for _ in 0..10 {
            assert!(all.pulse());
            assert!(!none.pulse());
        }
    }

    #[test]
    fn test_half_ratio_alternates() {
        let mut sampler = FixedRatioSampler::new(0.5);
        let fired: Vec<bool> = (0..8).map(|_| sampler.pulse()).collect();
        assert_eq!(fired.iter().filter(|&&b| b).count(), 4);
        // First pulse always fires: 0 < 0.5 * 1.
        assert!(fired[0]);
    }
}
