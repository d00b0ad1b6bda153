//! Time-indexed traffic intensity: periodic phasers plus noise
//!
//! A scaler evaluates a sum of weekly and daily cosine phasers on top of a
//! constant base, applies multiplicative Gaussian noise, and clamps at zero.
//! Time is measured from a fixed anchor (the first Sunday of 2010, local
//! time) so the same absolute timestamps always land on the same phase.

use std::f64::consts::TAU;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

const SECS_PER_WEEK: f64 = 7.0 * 24.0 * 3600.0;
const SECS_PER_DAY: f64 = 24.0 * 3600.0;

fn anchor() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2010, 1, 3)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid anchor date")
}

/// One cosine component: amplitude and phase offset in radians.
#[derive(Debug, Clone, Copy)]
pub struct Phaser {
    pub amplitude: f64,
    pub phase: f64,
}

/// A non-negative, time-indexed multiplier with periodic structure.
#[derive(Debug, Clone, Default)]
pub struct Scaler {
    weekly: Vec<Phaser>,
    daily: Vec<Phaser>,
    constant: f64,
    noise_factor: f64,
}

impl Scaler {
    pub fn new(weekly: Vec<Phaser>, daily: Vec<Phaser>, constant: f64, noise_factor: f64) -> Self {
        Self {
            weekly,
            daily,
            constant,
            noise_factor,
        }
    }

    /// A scaler that always evaluates to `constant` (no phasers, no noise).
    pub fn constant(constant: f64) -> Self {
        Self {
            constant,
            ..Self::default()
        }
    }

    /// Evaluate the intensity at `t`. The i-th phaser of each family runs at
    /// the (i+1)-th harmonic of its base period.
    pub fn scale(&self, t: DateTime<Local>, rng: &mut StdRng) -> f64 {
        let tsec = (t.naive_local() - anchor()).num_seconds() as f64;

        let mut s = self.constant;
        for (i, p) in self.weekly.iter().enumerate() {
            let arg = TAU * (i + 1) as f64 * tsec / SECS_PER_WEEK + p.phase;
            s += p.amplitude * (1.0 - arg.cos()) / 2.0;
        }
        for (j, p) in self.daily.iter().enumerate() {
            let arg = TAU * (j + 1) as f64 * tsec / SECS_PER_DAY + p.phase;
            s += p.amplitude * (1.0 - arg.cos()) / 2.0;
        }

        if self.noise_factor != 0.0 {
            let n: f64 = rng.sample(StandardNormal);
            s += self.noise_factor * s * n;
        }

        s.max(0.0)
    }
}
