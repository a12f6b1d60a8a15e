//! Core data types for the acquisition system.
//!
//! This module defines the immutable value objects that flow between the hardware
//! collaborators, the detector, the autofocus engine and the capture sink:
//!
//! - [`Frame`]: one camera readout, shared as `Arc<Frame>` once captured
//! - [`Region`] / [`ObjectMask`]: pixel-space bounding box and per-object shape mask
//! - [`DetectedObject`]: a normalized detection at one trajectory point
//! - [`TrajectoryPoint`] / [`Trajectory`]: the ordered XY targets of a run
//!
//! # Data Flow
//!
//! ```text
//! FrameSource --[Frame]--> DetectionAdapter --[DetectedObject]--> AutofocusEngine
//!                                                                   |
//!                               CaptureSink <--[AutofocusResult]----+
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ScopeError};

// =============================================================================
// Pixel Data
// =============================================================================

/// Memory-efficient pixel buffer supporting multiple bit depths.
///
/// Camera sensors typically output 8-bit or 16-bit unsigned integers; `F64` is for
/// computed or synthetic images.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels (2 bytes/pixel)
    U16(Vec<u16>),
    /// 64-bit floating point pixels (8 bytes/pixel)
    F64(Vec<f64>),
}

impl PixelBuffer {
    /// Returns the number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
            PixelBuffer::F64(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads a single pixel as f64, `None` past the end of the buffer.
    #[inline]
    pub fn get_f64(&self, idx: usize) -> Option<f64> {
        match self {
            PixelBuffer::U8(data) => data.get(idx).copied().map(f64::from),
            PixelBuffer::U16(data) => data.get(idx).copied().map(f64::from),
            PixelBuffer::F64(data) => data.get(idx).copied(),
        }
    }
}

/// A single camera readout.
///
/// Frames are never mutated after capture. The autofocus engine stores the frame it
/// captured at the winning axial position inside its result, so consumers never need
/// to go back to a live feed that may have moved on since.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Monotonic sequence number assigned by the frame source
    pub sequence: u64,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Row-major pixel data, `width * height` entries
    pub pixels: PixelBuffer,
    /// When the frame was read out
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Creates a frame, checking that the buffer matches the dimensions.
    pub fn new(sequence: u64, width: u32, height: u32, pixels: PixelBuffer) -> AppResult<Self> {
        let frame = Self {
            sequence,
            width,
            height,
            pixels,
            captured_at: Utc::now(),
        };
        frame.check()?;
        Ok(frame)
    }

    /// Checks that the buffer holds exactly `width * height` pixels.
    ///
    /// Fields are public, so frames built or deserialized outside [`Frame::new`] are
    /// checked again wherever they enter the autofocus path.
    pub fn check(&self) -> AppResult<()> {
        let expected = self.width as usize * self.height as usize;
        if self.pixels.len() != expected {
            return Err(ScopeError::Hardware(format!(
                "frame buffer holds {} pixels, expected {}x{}={}",
                self.pixels.len(),
                self.width,
                self.height,
                expected
            )));
        }
        Ok(())
    }

    /// Full-frame bounding region.
    pub fn bounds(&self) -> Region {
        Region::new(0, 0, self.width, self.height)
    }

    /// Copies the pixels inside `region` out as f64, clipping to the frame.
    ///
    /// Returns the clipped region together with its pixels, or `None` if the buffer
    /// is shorter than the dimensions claim.
    pub fn crop(&self, region: &Region) -> Option<(Region, Vec<f64>)> {
        let clipped = region.clip_to(self.width, self.height);
        let mut out = Vec::with_capacity(clipped.area() as usize);
        for row in clipped.y..clipped.y + clipped.height {
            let base = row as usize * self.width as usize;
            for col in clipped.x..clipped.x + clipped.width {
                out.push(self.pixels.get_f64(base + col as usize)?);
            }
        }
        Some((clipped, out))
    }
}

// =============================================================================
// Regions and Masks
// =============================================================================

/// Axis-aligned pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    /// Top-left X coordinate (pixel)
    pub x: u32,
    /// Top-left Y coordinate (pixel)
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Region {
    /// Creates a region.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Pixel count.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Geometric centre in pixel coordinates.
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.width) / 2.0,
            f64::from(self.y) + f64::from(self.height) / 2.0,
        )
    }

    /// Intersects the region with a `frame_width x frame_height` frame.
    pub fn clip_to(&self, frame_width: u32, frame_height: u32) -> Region {
        let x0 = self.x.min(frame_width);
        let y0 = self.y.min(frame_height);
        let x1 = self.x.saturating_add(self.width).min(frame_width);
        let y1 = self.y.saturating_add(self.height).min(frame_height);
        Region::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// Binary shape mask in region-local coordinates (row-major).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMask {
    /// Mask width, equal to the owning region's width
    pub width: u32,
    /// Mask height, equal to the owning region's height
    pub height: u32,
    bits: Vec<bool>,
}

impl ObjectMask {
    /// Builds a mask; `bits.len()` must equal `width * height`.
    pub fn new(width: u32, height: u32, bits: Vec<bool>) -> Option<Self> {
        (bits.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            bits,
        })
    }

    /// Mask with every pixel included.
    pub fn filled(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![true; width as usize * height as usize],
        }
    }

    /// Whether the pixel at local `(col, row)` is included. Out of range is excluded.
    #[inline]
    pub fn contains(&self, col: i64, row: i64) -> bool {
        if col < 0 || row < 0 || col >= i64::from(self.width) || row >= i64::from(self.height) {
            return false;
        }
        self.bits[row as usize * self.width as usize + col as usize]
    }

    /// Raw row-major bits.
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// Number of included pixels.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// True if no pixel is included.
    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|b| *b)
    }

    /// Mean local `(col, row)` of included pixels.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        let mut n = 0usize;
        let (mut sx, mut sy) = (0.0, 0.0);
        for (i, _) in self.bits.iter().enumerate().filter(|(_, b)| **b) {
            sx += (i % self.width as usize) as f64 + 0.5;
            sy += (i / self.width as usize) as f64 + 0.5;
            n += 1;
        }
        (n > 0).then(|| (sx / n as f64, sy / n as f64))
    }

    /// Number of pixel edges separating included from excluded pixels.
    pub fn crack_length(&self) -> usize {
        let mut edges = 0;
        for row in 0..i64::from(self.height) {
            for col in 0..i64::from(self.width) {
                if !self.contains(col, row) {
                    continue;
                }
                for (dc, dr) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                    if !self.contains(col + dc, row + dr) {
                        edges += 1;
                    }
                }
            }
        }
        edges
    }
}

// =============================================================================
// Detections
// =============================================================================

/// A normalized detection produced by [`crate::detection::DetectionAdapter`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    /// Position in the adapter's output list, contiguous from 0
    pub index: usize,
    /// Bounding region in frame pixels
    pub region: Region,
    /// Pixel area (mask count when a mask is present, else box area)
    pub area: f64,
    /// Detector confidence in `[0, 1]`
    pub confidence: f64,
    /// Centroid in frame pixel coordinates
    pub centroid: (f64, f64),
    /// Optional shape mask, region-local
    pub mask: Option<ObjectMask>,
    /// `4*pi*area / perimeter^2`, clamped to `[0, 1]`
    pub circularity: f64,
    /// Short side over long side of the bounding region, in `(0, 1]`
    pub aspect_ratio: f64,
}

// =============================================================================
// Trajectory
// =============================================================================

/// A single XY target in stage micrometers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    /// Position in the trajectory, contiguous from 0
    pub index: usize,
    /// Stage X in micrometers
    pub x_um: f64,
    /// Stage Y in micrometers
    pub y_um: f64,
}

/// Ordered, validated list of XY targets for one acquisition run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    /// Validates and wraps explicit points.
    ///
    /// Rejects an empty list, indices that are not exactly `0, 1, 2, ...`, and
    /// non-finite coordinates.
    pub fn from_points(points: Vec<TrajectoryPoint>) -> AppResult<Self> {
        if points.is_empty() {
            return Err(ScopeError::Configuration("trajectory is empty".into()));
        }
        for (expected, point) in points.iter().enumerate() {
            if point.index != expected {
                return Err(ScopeError::Configuration(format!(
                    "trajectory index {} found where {} was expected",
                    point.index, expected
                )));
            }
            if !point.x_um.is_finite() || !point.y_um.is_finite() {
                return Err(ScopeError::Configuration(format!(
                    "trajectory point {} has non-finite coordinates",
                    point.index
                )));
            }
        }
        Ok(Self { points })
    }

    /// Builds a trajectory from bare XY pairs, numbering them in order.
    pub fn from_xy(coords: &[(f64, f64)]) -> AppResult<Self> {
        Self::from_points(
            coords
                .iter()
                .enumerate()
                .map(|(index, &(x_um, y_um))| TrajectoryPoint { index, x_um, y_um })
                .collect(),
        )
    }

    /// Boustrophedon raster: rows alternate direction so the stage never flies back.
    pub fn serpentine(
        origin: (f64, f64),
        cols: usize,
        rows: usize,
        pitch_x_um: f64,
        pitch_y_um: f64,
    ) -> AppResult<Self> {
        let mut coords = Vec::with_capacity(cols * rows);
        for row in 0..rows {
            for step in 0..cols {
                let col = if row % 2 == 0 { step } else { cols - 1 - step };
                coords.push((
                    origin.0 + col as f64 * pitch_x_um,
                    origin.1 + row as f64 * pitch_y_um,
                ));
            }
        }
        Self::from_xy(&coords)
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false for a validated trajectory.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Point at `index`.
    pub fn get(&self, index: usize) -> Option<&TrajectoryPoint> {
        self.points.get(index)
    }

    /// All points in order.
    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_clip_handles_overhang() {
        let r = Region::new(90, 95, 20, 20).clip_to(100, 100);
        assert_eq!(r, Region::new(90, 95, 10, 5));
        let outside = Region::new(150, 10, 5, 5).clip_to(100, 100);
        assert_eq!(outside.area(), 0);
    }

    #[test]
    fn frame_rejects_mismatched_buffer() {
        assert!(Frame::new(0, 4, 4, PixelBuffer::U8(vec![0; 15])).is_err());
        assert!(Frame::new(0, 4, 4, PixelBuffer::U8(vec![0; 16])).is_ok());
    }

    #[test]
    fn crop_reads_row_major() {
        let pixels: Vec<u16> = (0..16).collect();
        let frame = Frame::new(1, 4, 4, PixelBuffer::U16(pixels)).unwrap();
        let (region, data) = frame.crop(&Region::new(1, 2, 2, 2)).unwrap();
        assert_eq!(region, Region::new(1, 2, 2, 2));
        assert_eq!(data, vec![9.0, 10.0, 13.0, 14.0]);
    }

    #[test]
    fn short_buffer_is_caught_without_panicking() {
        // Public fields let a collaborator skip Frame::new
        let mut frame = Frame::new(3, 4, 4, PixelBuffer::U8(vec![1; 16])).unwrap();
        frame.pixels = PixelBuffer::U8(vec![1; 6]);
        assert!(frame.check().is_err());
        assert!(frame.crop(&Region::new(0, 0, 4, 4)).is_none());
        assert!(frame.crop(&Region::new(0, 0, 2, 1)).is_some());
    }

    #[test]
    fn mask_geometry() {
        // 3x3 block inside a 5x5 mask
        let bits = (0..25)
            .map(|i| {
                let (c, r) = (i % 5, i / 5);
                (1..4).contains(&c) && (1..4).contains(&r)
            })
            .collect();
        let mask = ObjectMask::new(5, 5, bits).unwrap();
        assert_eq!(mask.count(), 9);
        assert_eq!(mask.crack_length(), 12);
        assert_eq!(mask.centroid(), Some((2.5, 2.5)));
        assert!(!mask.contains(-1, 0));
        assert!(ObjectMask::new(2, 2, vec![true; 3]).is_none());
    }

    #[test]
    fn trajectory_rejects_empty_and_gaps() {
        assert!(Trajectory::from_points(vec![]).is_err());
        let gap = vec![
            TrajectoryPoint { index: 0, x_um: 0.0, y_um: 0.0 },
            TrajectoryPoint { index: 2, x_um: 1.0, y_um: 0.0 },
        ];
        assert!(Trajectory::from_points(gap).is_err());
        assert!(Trajectory::from_xy(&[(f64::NAN, 0.0)]).is_err());
    }

    #[test]
    fn serpentine_alternates_rows() {
        let t = Trajectory::serpentine((0.0, 0.0), 3, 2, 10.0, 5.0).unwrap();
        let xs: Vec<f64> = t.points().iter().map(|p| p.x_um).collect();
        assert_eq!(xs, vec![0.0, 10.0, 20.0, 20.0, 10.0, 0.0]);
        assert_eq!(t.get(3).map(|p| p.y_um), Some(5.0));
        assert_eq!(t.points().last().map(|p| p.index), Some(5));
    }
}
