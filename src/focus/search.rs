//! Coarse-to-fine 1-D maximum search.
//!
//! The search only decides *where* to sample. Moving the axis, settling and
//! measuring belong to the [`FocusProbe`] implementation.
//!
//! 1. Coarse: uniform grid over `[axis_min, axis_max]` at `coarse_step` (the upper
//!    bound is always sampled). Ties go to the lowest position. If every coarse score
//!    is equal the peak defaults to the axis midpoint.
//! 2. Fine: uniform grid over `[peak - fine_radius, peak + fine_radius]`, clamped to
//!    the axis, at `fine_step`. The best fine sample is the result.
//!
//! Samples are always taken in ascending order, coarse phase first.

use async_trait::async_trait;
use std::convert::Infallible;
use thiserror::Error;

/// Relative tolerance used when laying out the sampling grid.
const GRID_EPS: f64 = 1e-9;

/// Which pass a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    /// Wide, low-resolution sweep
    Coarse,
    /// Narrow, high-resolution refinement
    Fine,
}

/// Something that can be scored at an axial position.
#[async_trait]
pub trait FocusProbe: Send {
    /// Error that aborts the search.
    type Error: Send;

    /// Move to `position` (however that is done) and score it.
    async fn score_at(&mut self, position: f64) -> Result<f64, Self::Error>;

    /// Called once before the first sample of each phase.
    fn on_phase(&mut self, _phase: SearchPhase) {}
}

/// Adapts a plain scoring closure into a [`FocusProbe`].
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F> FocusProbe for FnProbe<F>
where
    F: FnMut(f64) -> f64 + Send,
{
    type Error = Infallible;

    async fn score_at(&mut self, position: f64) -> Result<f64, Infallible> {
        Ok((self.0)(position))
    }
}

/// Search bounds and resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    /// Lower axis bound
    pub axis_min: f64,
    /// Upper axis bound
    pub axis_max: f64,
    /// Coarse grid spacing
    pub coarse_step: f64,
    /// Fine grid spacing
    pub fine_step: f64,
    /// Fine window half-width
    pub fine_radius: f64,
    /// Refuse to start if the worst case exceeds this many samples
    pub max_samples: usize,
}

/// One measured `(position, score)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusSample {
    /// Axial position
    pub position: f64,
    /// Score at that position
    pub score: f64,
    /// Phase the sample was taken in
    pub phase: SearchPhase,
}

/// Outcome of one search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    /// Position of the best fine sample
    pub best_position: f64,
    /// Score of the best fine sample
    pub best_score: f64,
    /// Peak chosen by the coarse phase
    pub coarse_peak: f64,
    /// Every coarse score was equal; `coarse_peak` is the axis midpoint
    pub flat: bool,
    /// All samples, in the order they were taken
    pub samples: Vec<FocusSample>,
}

/// Search failures.
#[derive(Debug, Error)]
pub enum SearchError<E> {
    /// Non-finite bounds or non-positive steps
    #[error("invalid search parameters: {0}")]
    InvalidParams(String),
    /// Worst-case sample count exceeds the cap
    #[error("search needs up to {needed} samples, cap is {cap}")]
    TooManySamples {
        /// Worst-case samples
        needed: usize,
        /// Configured cap
        cap: usize,
    },
    /// The probe failed
    #[error("probe failed")]
    Probe(E),
}

impl SearchParams {
    fn validate<E>(&self) -> Result<(), SearchError<E>> {
        if !self.axis_min.is_finite() || !self.axis_max.is_finite() {
            return Err(SearchError::InvalidParams("axis bounds must be finite".into()));
        }
        if !(self.coarse_step.is_finite() && self.coarse_step > 0.0)
            || !(self.fine_step.is_finite() && self.fine_step > 0.0)
        {
            return Err(SearchError::InvalidParams("steps must be positive".into()));
        }
        if !self.fine_radius.is_finite() || self.fine_radius < 0.0 {
            return Err(SearchError::InvalidParams(
                "fine_radius must be non-negative".into(),
            ));
        }
        let needed = self.worst_case_count();
        if needed > self.max_samples as f64 {
            return Err(SearchError::TooManySamples {
                needed: saturate(needed),
                cap: self.max_samples,
            });
        }
        Ok(())
    }

    /// Upper bound on samples one search can take.
    pub fn worst_case_samples(&self) -> usize {
        saturate(self.worst_case_count())
    }

    fn worst_case_count(&self) -> f64 {
        if self.axis_max <= self.axis_min {
            return 1.0;
        }
        grid_len(self.axis_min, self.axis_max, self.coarse_step)
            + grid_len(0.0, 2.0 * self.fine_radius, self.fine_step)
    }
}

fn saturate(count: f64) -> usize {
    if count.is_finite() && count < usize::MAX as f64 {
        count as usize
    } else {
        usize::MAX
    }
}

/// Points [`grid`] would lay out, computed without allocating.
fn grid_len(lo: f64, hi: f64, step: f64) -> f64 {
    if hi <= lo {
        return 1.0;
    }
    let n = ((hi - lo) / step + GRID_EPS).floor();
    let last = lo + n * step;
    if hi - last > GRID_EPS * step.max(1.0) {
        n + 2.0
    } else {
        n + 1.0
    }
}

/// Uniform ascending grid over `[lo, hi]`, always including `hi`.
fn grid(lo: f64, hi: f64, step: f64) -> Vec<f64> {
    if hi <= lo {
        return vec![lo];
    }
    let span = hi - lo;
    let n = ((span / step) + GRID_EPS).floor() as usize;
    let mut points: Vec<f64> = (0..=n).map(|k| lo + k as f64 * step).collect();
    let last = lo + n as f64 * step;
    if hi - last > GRID_EPS * step.max(1.0) {
        points.push(hi);
    } else if let Some(end) = points.last_mut() {
        // Snap accumulated error onto the bound
        *end = hi;
    }
    points
}

/// Comparison key: NaN never wins.
fn key(score: f64) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}

/// Index of the maximum, lowest index on ties.
fn argmax(samples: &[FocusSample]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, s) in samples.iter().enumerate() {
        match best {
            Some(b) if key(s.score) <= key(samples[b].score) => {}
            _ => best = Some(i),
        }
    }
    best
}

async fn sweep<P: FocusProbe>(
    probe: &mut P,
    positions: &[f64],
    phase: SearchPhase,
    samples: &mut Vec<FocusSample>,
) -> Result<(), SearchError<P::Error>> {
    probe.on_phase(phase);
    for &position in positions {
        let score = probe
            .score_at(position)
            .await
            .map_err(SearchError::Probe)?;
        samples.push(FocusSample {
            position,
            score,
            phase,
        });
    }
    Ok(())
}

/// Run a coarse-to-fine search with `probe`.
pub async fn search<P: FocusProbe>(
    probe: &mut P,
    params: &SearchParams,
) -> Result<SearchOutcome, SearchError<P::Error>> {
    params.validate()?;

    let mut samples = Vec::with_capacity(params.worst_case_samples());

    if params.axis_max <= params.axis_min {
        sweep(probe, &[params.axis_min], SearchPhase::Coarse, &mut samples).await?;
        let only = samples[0];
        return Ok(SearchOutcome {
            best_position: only.position,
            best_score: only.score,
            coarse_peak: only.position,
            flat: true,
            samples,
        });
    }

    let coarse = grid(params.axis_min, params.axis_max, params.coarse_step);
    sweep(probe, &coarse, SearchPhase::Coarse, &mut samples).await?;

    let first = key(samples[0].score);
    let flat = samples.iter().all(|s| key(s.score) == first);
    let coarse_peak = if flat {
        (params.axis_min + params.axis_max) / 2.0
    } else {
        argmax(&samples).map_or(params.axis_min, |i| samples[i].position)
    };

    let lo = (coarse_peak - params.fine_radius).max(params.axis_min);
    let hi = (coarse_peak + params.fine_radius).min(params.axis_max);
    let fine = grid(lo, hi, params.fine_step);
    let fine_start = samples.len();
    sweep(probe, &fine, SearchPhase::Fine, &mut samples).await?;

    let best = argmax(&samples[fine_start..]).map_or(fine_start, |i| fine_start + i);
    Ok(SearchOutcome {
        best_position: samples[best].position,
        best_score: samples[best].score,
        coarse_peak,
        flat,
        samples,
    })
}
