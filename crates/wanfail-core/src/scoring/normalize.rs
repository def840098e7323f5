use serde::Serialize;

/// Two-point linear clamp from "ok" to "bad".
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Band {
    pub ok: f64,
    pub bad: f64,
}

impl Band {
    pub const fn new(ok: f64, bad: f64) -> Self {
        Self { ok, bad }
    }

    /// Badness of `x` in `[0, 1]`: 0 at or below `ok`, 1 at or above `bad`.
    ///
    /// NaN and infinities count as fully bad; the scorer never sees them
    /// as an error.
    pub fn badness(&self, x: f64) -> f64 {
        if !x.is_finite() {
            return 1.0;
        }
        if x <= self.ok {
            0.0
        } else if x >= self.bad {
            1.0
        } else {
            (x - self.ok) / (self.bad - self.ok)
        }
    }
}
