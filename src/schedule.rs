use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScheduleError {
    #[error("schedule start value must be > 0, got {0}")]
    NonPositiveStart(f64),

    #[error("schedule endpoints must be finite (start {initial}, end {final_value})")]
    NonFinite { initial: f64, final_value: f64 },

    #[error("invalid schedule value {input:?}: {source}")]
    Parse {
        input: String,
        source: std::num::ParseFloatError,
    },
}

/// Linear interpolation between a start and an end value, driven by the
/// fraction of training that remains (1.0 at the first update, 0.0 at the
/// last one).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearSchedule {
    initial: f64,
    final_value: f64,
}

impl LinearSchedule {
    pub fn new(initial: f64, final_value: f64) -> Result<Self, ScheduleError> {
        if !initial.is_finite() || !final_value.is_finite() {
            return Err(ScheduleError::NonFinite {
                initial,
                final_value,
            });
        }
        if initial <= 0.0 {
            return Err(ScheduleError::NonPositiveStart(initial));
        }
        Ok(Self {
            initial,
            final_value,
        })
    }

    pub fn decay_to_zero(initial: f64) -> Result<Self, ScheduleError> {
        Self::new(initial, 0.0)
    }

    /// Builds a schedule from numeric strings, e.g. values read from a saved
    /// config.
    pub fn parse(initial: &str, final_value: &str) -> Result<Self, ScheduleError> {
        Self::new(parse_value(initial)?, parse_value(final_value)?)
    }

    pub fn initial(&self) -> f64 {
        self.initial
    }

    pub fn final_value(&self) -> f64 {
        self.final_value
    }

    pub fn value(&self, progress_remaining: f64) -> f64 {
        self.final_value + progress_remaining * (self.initial - self.final_value)
    }
}

fn parse_value(input: &str) -> Result<f64, ScheduleError> {
    input
        .trim()
        .parse::<f64>()
        .map_err(|source| ScheduleError::Parse {
            input: input.to_string(),
            source,
        })
}

/// `"2.5e-4"` decays to zero, `"2.5e-4:2.5e-6"` decays to the second value.
impl FromStr for LinearSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((initial, final_value)) => Self::parse(initial, final_value),
            None => Self::decay_to_zero(parse_value(s)?),
        }
    }
}

impl fmt::Display for LinearSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.initial, self.final_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn endpoints_match_start_and_end() {
        let s = LinearSchedule::new(2.5e-4, 2.5e-6).unwrap();
        assert_eq!(s.value(1.0), 2.5e-4);
        assert_eq!(s.value(0.0), 2.5e-6);
    }

    #[test]
    fn interpolates_linearly_over_progress() {
        let s = LinearSchedule::new(0.15, 0.025).unwrap();
        for i in 0..=20 {
            let p = i as f64 / 20.0;
            assert!(approx(s.value(p), 0.025 + p * (0.15 - 0.025)));
        }
        assert!(approx(s.value(0.5), 0.0875));
    }

    #[test]
    fn default_end_is_zero() {
        let s = LinearSchedule::decay_to_zero(0.3).unwrap();
        assert_eq!(s.value(0.0), 0.0);
        assert!(approx(s.value(0.25), 0.075));
    }

    #[test]
    fn rejects_non_positive_start() {
        assert_eq!(
            LinearSchedule::new(0.0, 0.0),
            Err(ScheduleError::NonPositiveStart(0.0))
        );
        assert_eq!(
            LinearSchedule::new(-1e-4, 0.0),
            Err(ScheduleError::NonPositiveStart(-1e-4))
        );
        assert!(LinearSchedule::parse("0", "0.1").is_err());
        assert!(LinearSchedule::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn parses_numeric_strings() {
        let s = LinearSchedule::parse("5.0e-5", " 2.5e-6 ").unwrap();
        assert_eq!(s.initial(), 5.0e-5);
        assert_eq!(s.final_value(), 2.5e-6);
        assert!(matches!(
            LinearSchedule::parse("fast", "0"),
            Err(ScheduleError::Parse { .. })
        ));
    }

    #[test]
    fn from_str_accepts_single_value_or_pair() {
        let pair: LinearSchedule = "0.075:0.025".parse().unwrap();
        assert_eq!(pair, LinearSchedule::new(0.075, 0.025).unwrap());
        let single: LinearSchedule = "0.1".parse().unwrap();
        assert_eq!(single.final_value(), 0.0);
        assert_eq!(pair.to_string().parse::<LinearSchedule>().unwrap(), pair);
    }
}
