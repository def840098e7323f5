//! Two-state Kalman filter for leading indicators.
//!
//! Tracks `[level, rate]` of a noisy radio or sky measurement (satellite
//! obstruction, cellular SINR) so the trend detector can read a smoothed
//! rate of change per sample instead of differencing raw readings.

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    // ─── State ───
    level: f64,
    /// Change per sample.
    rate: f64,

    // ─── Covariance P (2×2 symmetric) ───
    p00: f64,
    p01: f64,
    p11: f64,

    cfg: KalmanConfig,
    samples: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct KalmanConfig {
    /// Process noise for the level. Higher reacts faster.
    pub q_level: f64,
    /// Process noise for the rate.
    pub q_rate: f64,
    /// Measurement noise variance. Higher smooths more.
    pub r: f64,
}

impl KalmanConfig {
    /// Obstruction percentage (0–100).
    pub fn for_obstruction() -> Self {
        Self {
            q_level: 0.05,
            q_rate: 0.01,
            r: 0.5,
        }
    }

    /// Signal-to-interference-plus-noise ratio in dB.
    pub fn for_sinr() -> Self {
        Self {
            q_level: 1.0,
            q_rate: 0.2,
            r: 4.0,
        }
    }
}

const INITIAL_VARIANCE: f64 = 1000.0;

impl KalmanFilter {
    pub fn new(cfg: KalmanConfig) -> Self {
        Self {
            level: 0.0,
            rate: 0.0,
            p00: INITIAL_VARIANCE,
            p01: 0.0,
            p11: INITIAL_VARIANCE,
            cfg,
            samples: 0,
        }
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Measurements absorbed so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn uncertainty(&self) -> f64 {
        self.p00.sqrt()
    }

    /// Level expected `steps` samples from now.
    pub fn project(&self, steps: u32) -> f64 {
        self.level + self.rate * f64::from(steps)
    }

    /// Absorb one measurement. Non-finite readings are skipped.
    pub fn update(&mut self, z: f64) {
        if !z.is_finite() {
            return;
        }
        self.samples += 1;
        if self.samples == 1 {
            self.level = z;
            self.rate = 0.0;
            return;
        }

        // Predict with F = [[1, 1], [0, 1]].
        self.level += self.rate;
        let p00 = self.p00 + 2.0 * self.p01 + self.p11 + self.cfg.q_level;
        let p01 = self.p01 + self.p11 + self.cfg.q_rate;
        let p11 = self.p11 + self.cfg.q_rate;

        // Correct with H = [1, 0].
        let innovation = z - self.level;
        let s = p00 + self.cfg.r;
        let k0 = p00 / s;
        let k1 = p01 / s;
        self.level += k0 * innovation;
        self.rate += k1 * innovation;

        self.p00 = p00 - k0 * p00;
        self.p01 = p01 - k0 * p01;
        self.p11 = p11 - k1 * p01;
    }
}
