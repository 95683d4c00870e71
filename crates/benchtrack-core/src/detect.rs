//! Noise-aware regression test over a trailing window of one series.
//!
//! The baseline is the window median; the spread is the larger of the window's
//! sample standard deviation and the candidate's own reported uncertainty, so a
//! measurement is never flagged for moving less than its stated noise.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::{HistoryStore, SeriesEntry};
use crate::{BenchError, Polarity, SeriesKey};

pub const DEFAULT_WINDOW_SIZE: usize = 10;
pub const DEFAULT_THRESHOLD: f64 = 3.0;
pub const DEFAULT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    /// Prior entries considered, `W`.
    pub window_size: usize,
    /// Deviation, in spread units, beyond which a change is significant.
    pub threshold: f64,
    pub polarity: Polarity,
    /// Floor for the spread divisor.
    pub epsilon: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            threshold: DEFAULT_THRESHOLD,
            polarity: Polarity::HigherIsWorse,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

impl DetectorConfig {
    /// Prior entries needed before a verdict is attempted:
    /// `max(ceil(W / 2), 2)`.
    #[must_use]
    pub fn min_history(&self) -> usize {
        self.window_size.div_ceil(2).max(2)
    }

    /// # Errors
    /// Returns [`BenchError::Configuration`] when the window is shorter than
    /// two entries or the threshold or epsilon is not a positive finite number.
    pub fn validate(&self, label: &str) -> Result<(), BenchError> {
        if self.window_size < 2 {
            return Err(BenchError::Configuration(format!(
                "{label}.window_size MUST be >= 2, got {}",
                self.window_size
            )));
        }
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(BenchError::Configuration(format!(
                "{label}.threshold MUST be a finite number > 0, got {}",
                self.threshold
            )));
        }
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(BenchError::Configuration(format!(
                "{label}.epsilon MUST be a finite number > 0, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}

/// Per-series adjustments layered over [`DetectorPolicy::default`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DetectorOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polarity: Option<Polarity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
}

/// Process-wide detector configuration, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DetectorPolicy {
    #[serde(default)]
    pub default: DetectorConfig,
    /// Keyed by `tool:name`.
    #[serde(default)]
    pub series: BTreeMap<String, DetectorOverride>,
}

impl DetectorPolicy {
    /// Parses and validates a JSON policy document.
    ///
    /// # Errors
    /// Returns [`BenchError::Configuration`] when the document is not a valid
    /// policy.
    pub fn from_json(raw: &str) -> Result<Self, BenchError> {
        let policy: Self = serde_json::from_str(raw)
            .map_err(|err| BenchError::Configuration(format!("invalid detector policy: {err}")))?;
        policy.validate()?;
        Ok(policy)
    }

    /// # Errors
    /// Returns [`BenchError::Configuration`] naming the first invalid series
    /// key or setting.
    pub fn validate(&self) -> Result<(), BenchError> {
        self.default.validate("default")?;
        for raw_key in self.series.keys() {
            let key = SeriesKey::parse(raw_key).map_err(|err| {
                BenchError::Configuration(format!("series[{raw_key:?}]: {err}"))
            })?;
            self.resolve(&key, None)
                .validate(&format!("series[{raw_key:?}]"))?;
        }
        Ok(())
    }

    /// Effective configuration for one series. Polarity comes from the series
    /// override, then `hint`, then the default.
    #[must_use]
    pub fn resolve(&self, key: &SeriesKey, hint: Option<Polarity>) -> DetectorConfig {
        let base = self.default;
        let Some(adjust) = self.series.get(&key.to_string()) else {
            return DetectorConfig {
                polarity: hint.unwrap_or(base.polarity),
                ..base
            };
        };
        DetectorConfig {
            window_size: adjust.window_size.unwrap_or(base.window_size),
            threshold: adjust.threshold.unwrap_or(base.threshold),
            polarity: adjust.polarity.or(hint).unwrap_or(base.polarity),
            epsilon: adjust.epsilon.unwrap_or(base.epsilon),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Regression,
    Improvement,
    Stable,
    InsufficientHistory { available: usize, required: usize },
}

impl Verdict {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Improvement => "improvement",
            Self::Stable => "stable",
            Self::InsufficientHistory { .. } => "insufficient_history",
        }
    }

    #[must_use]
    pub fn is_regression(self) -> bool {
        matches!(self, Self::Regression)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Baseline {
    /// Median of the window, `B`.
    pub center: f64,
    /// Effective spread, `S`.
    pub spread: f64,
    pub window_len: usize,
    pub window_stddev: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Baseline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
    pub threshold: f64,
    pub polarity: Polarity,
}

#[derive(Debug, Clone, Default)]
pub struct RegressionDetector {
    policy: DetectorPolicy,
}

impl RegressionDetector {
    #[must_use]
    pub fn new(policy: DetectorPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &DetectorPolicy {
        &self.policy
    }

    /// Judges a committed entry against the entries preceding it.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the window cannot be read.
    pub fn evaluate(
        &self,
        store: &dyn HistoryStore,
        key: &SeriesKey,
        candidate: &SeriesEntry,
    ) -> Result<Evaluation, BenchError> {
        let hint = store.series_info(key)?.and_then(|info| info.polarity_hint);
        let config = self.policy.resolve(key, hint);
        let window = store.read_tail(key, Some(candidate.position), config.window_size)?;
        let values: Vec<f64> = window.iter().map(|entry| entry.value).collect();
        Ok(evaluate_window(
            &config,
            candidate.value,
            candidate.uncertainty,
            &values,
        ))
    }

    /// Re-judges the newest entry of a series without writing anything.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the series cannot be read.
    pub fn evaluate_latest(
        &self,
        store: &dyn HistoryStore,
        key: &SeriesKey,
    ) -> Result<Option<(SeriesEntry, Evaluation)>, BenchError> {
        let Some(latest) = store.read_tail(key, None, 1)?.pop() else {
            return Ok(None);
        };
        let evaluation = self.evaluate(store, key, &latest)?;
        Ok(Some((latest, evaluation)))
    }
}

/// Pure verdict for `candidate` against `window` (oldest first).
#[must_use]
pub fn evaluate_window(
    config: &DetectorConfig,
    candidate: f64,
    candidate_uncertainty: f64,
    window: &[f64],
) -> Evaluation {
    let window = if window.len() > config.window_size {
        &window[window.len() - config.window_size..]
    } else {
        window
    };
    let required = config.min_history();
    if window.len() < required {
        return Evaluation {
            verdict: Verdict::InsufficientHistory {
                available: window.len(),
                required,
            },
            baseline: None,
            deviation: None,
            threshold: config.threshold,
            polarity: config.polarity,
        };
    }

    let center = median(window);
    let window_stddev = sample_stddev(window);
    let spread = window_stddev.max(candidate_uncertainty);
    let difference = candidate - center;
    let deviation = if spread.is_finite() {
        (difference / spread.max(config.epsilon)).clamp(f64::MIN, f64::MAX)
    } else {
        0.0
    };

    // A window with no spread and no stated uncertainty has no noise to
    // scale against: any move away from the center counts.
    let significant = if spread > 0.0 {
        deviation.abs() > config.threshold
    } else {
        difference.abs() > 0.0
    };
    let verdict = if significant {
        let worse = match config.polarity {
            Polarity::HigherIsWorse => difference > 0.0,
            Polarity::LowerIsWorse => difference < 0.0,
        };
        if worse {
            Verdict::Regression
        } else {
            Verdict::Improvement
        }
    } else {
        Verdict::Stable
    };

    Evaluation {
        verdict,
        baseline: Some(Baseline {
            center,
            spread,
            window_len: window.len(),
            window_stddev,
        }),
        deviation: Some(deviation),
        threshold: config.threshold,
        polarity: config.polarity,
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        sorted[mid - 1] / 2.0 + sorted[mid] / 2.0
    } else {
        sorted[mid]
    }
}

/// Sample standard deviation (n - 1) via Welford's update over values scaled
/// into `[-1, 1]`, so magnitudes near `f64::MAX` never overflow the squares.
#[allow(clippy::cast_precision_loss)]
fn sample_stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let scale = values.iter().fold(0.0_f64, |acc, value| acc.max(value.abs()));
    if scale <= 0.0 || !scale.is_finite() {
        return 0.0;
    }
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for (index, value) in values.iter().enumerate() {
        let scaled = value / scale;
        let delta = scaled - mean;
        mean += delta / (index + 1) as f64;
        m2 += delta * (scaled - mean);
    }
    (m2 / (values.len() - 1) as f64).sqrt() * scale
}
