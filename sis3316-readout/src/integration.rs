//! Per-event baseline/signal integration (§4.I).
//!
//! Ranges are half-open intervals on an event's raw sample buffer.
//! `signal_range` defaults to "everything after the baseline range" when
//! not given explicitly.

use std::fmt;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IntegrationError {
    /// A range falls outside the raw sample buffer, or has `start > end`.
    InvalidArgument,
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrationError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl std::error::Error for IntegrationError {}

/// A half-open `[start, end)` interval over a raw sample buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SampleRange {
    pub start: usize,
    pub end: usize,
}

impl SampleRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    fn validate(&self, buf_len: usize) -> Result<(), IntegrationError> {
        if self.start > self.end || self.end > buf_len {
            Err(IntegrationError::InvalidArgument)
        } else {
            Ok(())
        }
    }
}

/// How `baseline` is estimated from the baseline-range samples. The mean is
/// the default; implementations that need noise robustness may prefer the
/// max — this is a policy knob, not a correctness requirement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BaselineEstimator {
    Mean,
    Max,
}

impl Default for BaselineEstimator {
    fn default() -> Self {
        BaselineEstimator::Mean
    }
}

#[derive(Copy, Clone, Debug)]
pub struct IntegrationConfig {
    pub baseline_range: SampleRange,
    /// `None` means "everything after `baseline_range`".
    pub signal_range: Option<SampleRange>,
    pub baseline_estimator: BaselineEstimator,
}

impl IntegrationConfig {
    pub fn new(baseline_range: SampleRange) -> Self {
        Self {
            baseline_range,
            signal_range: None,
            baseline_estimator: BaselineEstimator::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct IntegrationResult {
    pub baseline: f64,
    pub baseline_std: f64,
    pub sum: f64,
    pub max: i16,
    pub max_index: usize,
    pub width: usize,
}

/// Integrate one event's raw samples per `config`.
pub fn integrate(raw: &[i16], config: &IntegrationConfig) -> Result<IntegrationResult, IntegrationError> {
    config.baseline_range.validate(raw.len())?;
    let signal_range = config
        .signal_range
        .unwrap_or(SampleRange::new(config.baseline_range.end, raw.len()));
    signal_range.validate(raw.len())?;

    let baseline_samples = &raw[config.baseline_range.start..config.baseline_range.end];
    let baseline = match config.baseline_estimator {
        BaselineEstimator::Mean => mean(baseline_samples),
        BaselineEstimator::Max => baseline_samples
            .iter()
            .map(|&v| v as f64)
            .fold(f64::NEG_INFINITY, f64::max),
    };
    let baseline_std = population_std(baseline_samples, baseline);

    let signal_samples = &raw[signal_range.start..signal_range.end];
    let sum: f64 =
        signal_samples.iter().map(|&v| v as f64).sum::<f64>() - baseline * signal_range.len() as f64;

    let (max_index, &max) = raw
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            let da = (**a as f64 - baseline).abs();
            let db = (**b as f64 - baseline).abs();
            da.partial_cmp(&db).unwrap()
        })
        .unwrap_or((0, &0));
    let width = if raw.is_empty() {
        0
    } else {
        width_around(raw, baseline, max_index)
    };

    Ok(IntegrationResult {
        baseline,
        baseline_std,
        sum,
        max,
        max_index,
        width,
    })
}

fn mean(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&v| v as f64).sum::<f64>() / samples.len() as f64
}

fn population_std(samples: &[i16], mean: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let variance = samples
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / samples.len() as f64;
    variance.sqrt()
}

/// Length of the contiguous run of samples, bracketing `idx`, that sit on
/// the same side of `baseline` as `raw[idx]` does.
fn width_around(raw: &[i16], baseline: f64, idx: usize) -> usize {
    let side = |v: i16| v as f64 > baseline;
    let above = side(raw[idx]);
    let mut lo = idx;
    while lo > 0 && side(raw[lo - 1]) == above {
        lo -= 1;
    }
    let mut hi = idx;
    while hi + 1 < raw.len() && side(raw[hi + 1]) == above {
        hi += 1;
    }
    hi - lo + 1
}
