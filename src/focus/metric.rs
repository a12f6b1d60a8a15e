//! Masked sharpness scoring.
//!
//! The score is a weighted sum of three focus measures:
//!
//! | measure | default weight |
//! |---|---|
//! | variance of the 4-neighbour Laplacian | 0.25 |
//! | mean squared central-difference gradient | 0.50 |
//! | intensity variance divided by mean intensity | 0.25 |
//!
//! With a non-empty mask every statistic is taken over included pixels only, and the
//! derivative measures are evaluated only where the whole 4-neighbourhood is included.
//! Two regions that differ only outside the mask therefore score identically.

use serde::{Deserialize, Serialize};

use crate::core::ObjectMask;

const EPS: f64 = 1e-12;

/// Relative weights of the three focus measures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricWeights {
    /// Laplacian variance weight
    pub laplacian: f64,
    /// Gradient energy weight
    pub gradient: f64,
    /// Normalized intensity variance weight
    pub variance: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            laplacian: 0.25,
            gradient: 0.50,
            variance: 0.25,
        }
    }
}

impl MetricWeights {
    /// Weights must be finite, non-negative and not all zero.
    pub fn validate(&self) -> Result<(), String> {
        let all = [self.laplacian, self.gradient, self.variance];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("metric weights must be finite and non-negative".into());
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err("metric weights must not all be zero".into());
        }
        Ok(())
    }
}

/// Borrowed row-major grayscale region.
#[derive(Debug, Clone, Copy)]
pub struct RegionView<'a> {
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
    /// `width * height` intensities
    pub pixels: &'a [f64],
}

impl<'a> RegionView<'a> {
    /// Wraps a pixel slice.
    pub fn new(width: usize, height: usize, pixels: &'a [f64]) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    #[inline]
    fn at(&self, col: i64, row: i64) -> f64 {
        self.pixels[row as usize * self.width + col as usize]
    }
}

/// Individual focus measures, before weighting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SharpnessComponents {
    /// Variance of the Laplacian response
    pub laplacian_variance: f64,
    /// Mean squared gradient magnitude
    pub gradient_energy: f64,
    /// Intensity variance over mean intensity
    pub normalized_variance: f64,
}

/// Pure scoring function over a (masked) region.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharpnessMetric {
    weights: MetricWeights,
}

impl SharpnessMetric {
    /// Metric with custom weights.
    pub fn new(weights: MetricWeights) -> Self {
        Self { weights }
    }

    /// Weighted score. Degenerate input yields `0.0`.
    pub fn score(&self, region: RegionView<'_>, mask: Option<&ObjectMask>) -> f64 {
        match self.components(region, mask) {
            Some(c) => {
                let score = self.weights.laplacian * c.laplacian_variance
                    + self.weights.gradient * c.gradient_energy
                    + self.weights.variance * c.normalized_variance;
                if score.is_finite() {
                    score
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// Unweighted focus measures, or `None` for degenerate input.
    ///
    /// Degenerate means: zero-area region, a buffer that does not match the
    /// dimensions, a mask whose dimensions do not match the region, or a mean
    /// intensity of zero. An all-excluded mask is not degenerate; the whole region
    /// is used instead.
    pub fn components(
        &self,
        region: RegionView<'_>,
        mask: Option<&ObjectMask>,
    ) -> Option<SharpnessComponents> {
        let (w, h) = (region.width, region.height);
        if w == 0 || h == 0 || region.pixels.len() != w * h {
            return None;
        }
        if let Some(m) = mask {
            if m.width as usize != w || m.height as usize != h {
                return None;
            }
        }
        let mask = mask.filter(|m| !m.is_empty());
        let included = |col: i64, row: i64| -> bool {
            if col < 0 || row < 0 || col >= w as i64 || row >= h as i64 {
                return false;
            }
            mask.map_or(true, |m| m.contains(col, row))
        };

        // Intensity statistics (Welford)
        let (mut n, mut mean, mut m2) = (0usize, 0.0f64, 0.0f64);
        for row in 0..h as i64 {
            for col in 0..w as i64 {
                if !included(col, row) {
                    continue;
                }
                let v = region.at(col, row);
                n += 1;
                let delta = v - mean;
                mean += delta / n as f64;
                m2 += delta * (v - mean);
            }
        }
        if n == 0 || mean.abs() <= EPS {
            return None;
        }
        let variance = m2 / n as f64;

        // Derivative measures over pixels whose full 4-neighbourhood is included
        let (mut k, mut lap_mean, mut lap_m2, mut grad_sum) = (0usize, 0.0f64, 0.0f64, 0.0f64);
        for row in 0..h as i64 {
            for col in 0..w as i64 {
                if !(included(col, row)
                    && included(col - 1, row)
                    && included(col + 1, row)
                    && included(col, row - 1)
                    && included(col, row + 1))
                {
                    continue;
                }
                let c = region.at(col, row);
                let (l, r) = (region.at(col - 1, row), region.at(col + 1, row));
                let (u, d) = (region.at(col, row - 1), region.at(col, row + 1));

                let lap = l + r + u + d - 4.0 * c;
                k += 1;
                let delta = lap - lap_mean;
                lap_mean += delta / k as f64;
                lap_m2 += delta * (lap - lap_mean);

                let gx = (r - l) / 2.0;
                let gy = (d - u) / 2.0;
                grad_sum += gx * gx + gy * gy;
            }
        }
        let (laplacian_variance, gradient_energy) = if k == 0 {
            (0.0, 0.0)
        } else {
            (lap_m2 / k as f64, grad_sum / k as f64)
        };

        Some(SharpnessComponents {
            laplacian_variance,
            gradient_energy,
            normalized_variance: variance / mean.abs(),
        })
    }
}
