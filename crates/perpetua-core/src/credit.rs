// Credit accounting primitives.
//
// Credits are fixed-point with six decimal places, stored as i64 micro-credits.
// All arithmetic saturates; a daily budget can never go negative.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const MICROS_PER_CREDIT: i64 = 1_000_000;

/// Fixed-point credit amount (6 decimal places)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credits(i64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    /// Construct from whole credits
    pub fn from_whole(credits: i64) -> Self {
        Credits(credits.saturating_mul(MICROS_PER_CREDIT))
    }

    /// Construct from raw micro-credits
    pub fn from_micros(micros: i64) -> Self {
        Credits(micros)
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    /// Approximate conversion for display and burn-rate projections
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / MICROS_PER_CREDIT as f64
    }

    /// Construct from a float cost (e.g. USD-derived LLM cost times a multiplier)
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Credits::ZERO;
        }
        Credits((value * MICROS_PER_CREDIT as f64).round() as i64)
    }

    pub fn saturating_add(self, other: Credits) -> Credits {
        Credits(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Credits) -> Credits {
        Credits(self.0.saturating_sub(other.0).max(0))
    }

    /// Multiply by a non-negative factor (tier / plan credit multipliers)
    pub fn scale(self, factor: f64) -> Credits {
        Credits::from_f64(self.as_f64() * factor)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_CREDIT;
        let frac = (self.0 % MICROS_PER_CREDIT).abs();
        if frac == 0 {
            write!(f, "{}", whole)
        } else {
            let s = format!("{:06}", frac);
            write!(f, "{}.{}", whole, s.trim_end_matches('0'))
        }
    }
}

impl FromStr for Credits {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (sign, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (-1i64, rest),
            None => (1i64, trimmed),
        };
        let (whole_str, frac_str) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        let whole: i64 = whole_str
            .parse()
            .map_err(|_| format!("invalid credit amount: {s}"))?;
        let mut frac_padded = frac_str.to_string();
        if frac_padded.len() > 6 {
            frac_padded.truncate(6);
        }
        while frac_padded.len() < 6 {
            frac_padded.push('0');
        }
        let frac: i64 = if frac_padded.is_empty() {
            0
        } else {
            frac_padded
                .parse()
                .map_err(|_| format!("invalid credit amount: {s}"))?
        };
        Ok(Credits(sign * (whole * MICROS_PER_CREDIT + frac)))
    }
}

// ============================================================================
// Per-plan daily credit settings
// ============================================================================

/// Per-plan daily credit configuration (slider bounds for the operator UI,
/// burn-rate alerting, and the hard-limit multiplier applied to the soft target).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCreditSettings {
    pub slider_min: Credits,
    pub slider_max: Credits,
    pub slider_step: Credits,
    pub burn_rate_threshold_per_hour: Credits,
    pub burn_rate_window_minutes: u32,
    pub hard_limit_multiplier: f64,
    /// Multiplier applied to every LLM credit cost on this plan
    pub plan_credit_multiplier: f64,
}

impl Default for DailyCreditSettings {
    fn default() -> Self {
        Self {
            slider_min: Credits::from_whole(0),
            slider_max: Credits::from_whole(50),
            slider_step: Credits::from_whole(1),
            burn_rate_threshold_per_hour: Credits::from_whole(3),
            burn_rate_window_minutes: 60,
            hard_limit_multiplier: 2.0,
            plan_credit_multiplier: 1.0,
        }
    }
}

impl DailyCreditSettings {
    /// Hard daily limit derived from a soft target. `None` means unlimited.
    pub fn hard_limit(&self, soft_target: Option<Credits>) -> Option<Credits> {
        soft_target.map(|soft| soft.scale(self.hard_limit_multiplier))
    }
}
