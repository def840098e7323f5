/// Exponentially weighted moving average of a link score.
///
/// Seeded with the first sample, then `v = α·x + (1 − α)·v`. A larger
/// `alpha` follows the instant score closely, a smaller one remembers
/// longer.
#[derive(Debug, Clone)]
pub struct Ewma {
    value: f64,
    alpha: f64,
    seeded: bool,
}

impl Ewma {
    /// Creates an unseeded average with smoothing factor `0.0 < alpha ≤ 1.0`.
    pub fn new(alpha: f64) -> Self {
        Self {
            value: 0.0,
            alpha,
            seeded: false,
        }
    }

    /// Feeds one sample and returns the updated average.
    ///
    /// Non-finite samples are ignored so one bad reading cannot poison the
    /// average.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !sample.is_finite() {
            return self.value;
        }
        if self.seeded {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        } else {
            self.value = sample;
            self.seeded = true;
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.seeded.then_some(self.value)
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_on_first_sample() {
        let mut e = Ewma::new(0.2);
        assert_eq!(e.value(), None);
        assert_eq!(e.update(80.0), 80.0);
        assert_eq!(e.value(), Some(80.0));
    }

    #[test]
    fn blends_with_alpha() {
        let mut e = Ewma::new(0.5);
        e.update(10.0);
        assert!((e.update(20.0) - 15.0).abs() < f64::EPSILON);
        assert!((e.update(30.0) - 22.5).abs() < f64::EPSILON);
    }

    #[test]
    fn converges_to_constant_input() {
        // (1 - 0.2)^n * 100 < 0.01 once n >= 42
        let mut e = Ewma::new(0.2);
        e.update(0.0);
        for _ in 0..42 {
            e.update(100.0);
        }
        assert!((e.value().unwrap() - 100.0).abs() < 0.01);
    }

    #[test]
    fn ignores_nan() {
        let mut e = Ewma::new(0.2);
        e.update(50.0);
        e.update(f64::NAN);
        e.update(f64::INFINITY);
        assert_eq!(e.value(), Some(50.0));
    }
}
