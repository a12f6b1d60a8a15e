//! Detection adapter.
//!
//! Turns whatever the shared [`ObjectDetector`] returns into a clean, contiguous list
//! of [`DetectedObject`]s:
//!
//! 1. every raw detection is checked; one malformed entry discards the whole response
//! 2. boxes are clipped to the frame and masks cropped with them
//! 3. area, centroid and shape descriptors are derived
//! 4. the configured thresholds are applied and survivors renumbered from 0
//!
//! A detector failure never produces a partial list. The caller gets an empty list
//! and a [`DetectionError`] instead.

use std::f64::consts::PI;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DetectionConfig;
use crate::core::{DetectedObject, Frame, ObjectMask, Region};
use crate::hardware::capabilities::ObjectDetector;

/// Largest pixel coordinate a box edge may sit at, on either side of the origin.
const MAX_EDGE: f64 = u32::MAX as f64;

/// Detector output before normalization, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// Left edge
    pub x: f64,
    /// Top edge
    pub y: f64,
    /// Box width
    pub width: f64,
    /// Box height
    pub height: f64,
    /// Detector confidence, expected in `[0, 1]`
    pub confidence: f64,
    /// Shape mask covering the pixel box `floor(x)..ceil(x + width)` by
    /// `floor(y)..ceil(y + height)`
    pub mask: Option<ObjectMask>,
    /// Circularity reported by the detector, if it computes one
    pub circularity: Option<f64>,
}

impl RawDetection {
    /// Box-only detection.
    pub fn boxed(x: f64, y: f64, width: f64, height: f64, confidence: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            mask: None,
            circularity: None,
        }
    }

    /// Attach a shape mask.
    pub fn with_mask(mut self, mask: ObjectMask) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Attach a detector-computed circularity.
    pub fn with_circularity(mut self, circularity: f64) -> Self {
        self.circularity = Some(circularity);
        self
    }

    /// Integer pixel box `(x0, y0, x1, y1)`, exclusive end.
    fn pixel_box(&self) -> (i64, i64, i64, i64) {
        (
            self.x.floor() as i64,
            self.y.floor() as i64,
            (self.x + self.width).ceil() as i64,
            (self.y + self.height).ceil() as i64,
        )
    }

    fn check(&self) -> Result<(), String> {
        let coords = [self.x, self.y, self.width, self.height, self.confidence];
        if coords.iter().any(|v| !v.is_finite()) {
            return Err("non-finite value".into());
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(format!("non-positive size {}x{}", self.width, self.height));
        }
        let edges = [self.x, self.y, self.x + self.width, self.y + self.height];
        if edges.iter().any(|e| !(-MAX_EDGE..=MAX_EDGE).contains(e)) {
            return Err(format!(
                "box ({}, {}, {}, {}) lies outside the pixel coordinate range",
                self.x, self.y, self.width, self.height
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if let Some(c) = self.circularity {
            if !c.is_finite() || c < 0.0 {
                return Err(format!("invalid circularity {c}"));
            }
        }
        if let Some(mask) = &self.mask {
            let (x0, y0, x1, y1) = self.pixel_box();
            if i64::from(mask.width) != x1 - x0 || i64::from(mask.height) != y1 - y0 {
                return Err(format!(
                    "mask is {}x{} but the box covers {}x{} pixels",
                    mask.width,
                    mask.height,
                    x1 - x0,
                    y1 - y0
                ));
            }
        }
        Ok(())
    }
}

/// Why a detection call produced no objects.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectionError {
    /// The detector itself failed
    #[error("detector failed: {0}")]
    Detector(String),
    /// The detector returned an unusable entry
    #[error("malformed detection #{index}: {reason}")]
    Malformed {
        /// Position in the raw response
        index: usize,
        /// What was wrong with it
        reason: String,
    },
}

/// Result of one adapter call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionOutcome {
    /// Accepted objects, indices `0..n`
    pub objects: Vec<DetectedObject>,
    /// Set when the detector failed; `objects` is then empty
    pub error: Option<DetectionError>,
}

impl DetectionOutcome {
    fn failed(error: DetectionError) -> Self {
        Self {
            objects: Vec::new(),
            error: Some(error),
        }
    }
}

/// Wraps the shared detector with normalization and filtering.
#[derive(Clone)]
pub struct DetectionAdapter {
    config: DetectionConfig,
    detector: Arc<dyn ObjectDetector>,
}

impl std::fmt::Debug for DetectionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionAdapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DetectionAdapter {
    /// Adapter over a shared detector instance.
    pub fn new(config: DetectionConfig, detector: Arc<dyn ObjectDetector>) -> Self {
        Self { config, detector }
    }

    /// Filter thresholds in use.
    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Run the detector and normalize its output.
    pub async fn detect(&self, frame: &Frame) -> DetectionOutcome {
        let raw = match self.detector.detect(frame).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(frame = frame.sequence, error = %e, "Detector failed");
                return DetectionOutcome::failed(DetectionError::Detector(format!("{e:#}")));
            }
        };
        match self.normalize(frame, &raw) {
            Ok(objects) => {
                debug!(
                    frame = frame.sequence,
                    raw = raw.len(),
                    kept = objects.len(),
                    "Detections normalized"
                );
                DetectionOutcome {
                    objects,
                    error: None,
                }
            }
            Err(error) => {
                warn!(frame = frame.sequence, %error, "Discarding detector output");
                DetectionOutcome::failed(error)
            }
        }
    }

    /// Normalize and filter an already-obtained raw response.
    pub fn normalize(
        &self,
        frame: &Frame,
        raw: &[RawDetection],
    ) -> Result<Vec<DetectedObject>, DetectionError> {
        for (index, det) in raw.iter().enumerate() {
            det.check()
                .map_err(|reason| DetectionError::Malformed { index, reason })?;
        }

        let cfg = &self.config;
        let objects = raw
            .iter()
            .filter_map(|det| describe(frame, det))
            .filter(|obj| {
                obj.area >= cfg.min_area
                    && obj.area <= cfg.max_area
                    && obj.circularity >= cfg.min_circularity
                    && obj.aspect_ratio >= cfg.min_aspect_ratio
                    && obj.confidence >= cfg.min_confidence
            })
            .enumerate()
            .map(|(index, obj)| DetectedObject { index, ..obj })
            .collect();
        Ok(objects)
    }
}

/// Largest-area object; ties go to the lowest index.
pub fn primary(objects: &[DetectedObject]) -> Option<&DetectedObject> {
    objects.iter().fold(None, |best: Option<&DetectedObject>, obj| match best {
        Some(b) if b.area >= obj.area => Some(b),
        _ => Some(obj),
    })
}

/// Clip one validated detection to the frame and derive its descriptors.
/// Returns `None` when nothing of it lies inside the frame.
fn describe(frame: &Frame, det: &RawDetection) -> Option<DetectedObject> {
    let (bx0, by0, bx1, by1) = det.pixel_box();
    let cx0 = bx0.clamp(0, i64::from(frame.width));
    let cy0 = by0.clamp(0, i64::from(frame.height));
    let cx1 = bx1.clamp(0, i64::from(frame.width));
    let cy1 = by1.clamp(0, i64::from(frame.height));
    if cx1 <= cx0 || cy1 <= cy0 {
        return None;
    }
    let region = Region::new(
        cx0 as u32,
        cy0 as u32,
        (cx1 - cx0) as u32,
        (cy1 - cy0) as u32,
    );

    let mask = det.mask.as_ref().map(|m| {
        let (dx, dy) = (cx0 - bx0, cy0 - by0);
        let bits = (0..i64::from(region.height))
            .flat_map(|row| {
                (0..i64::from(region.width)).map(move |col| m.contains(col + dx, row + dy))
            })
            .collect();
        ObjectMask::new(region.width, region.height, bits)
            .unwrap_or_else(|| ObjectMask::filled(region.width, region.height))
    });

    let (w, h) = (f64::from(region.width), f64::from(region.height));
    let (origin_x, origin_y) = (f64::from(region.x), f64::from(region.y));
    let (area, centroid, shape_circularity) = match &mask {
        Some(m) => {
            let area = m.count() as f64;
            let centroid = m
                .centroid()
                .map(|(c, r)| (origin_x + c, origin_y + r))
                .unwrap_or_else(|| region.center());
            (area, centroid, mask_circularity(m))
        }
        None => (region.area() as f64, region.center(), ellipse_circularity(w, h)),
    };

    Some(DetectedObject {
        index: 0,
        region,
        area,
        confidence: det.confidence,
        centroid,
        circularity: det.circularity.unwrap_or(shape_circularity).clamp(0.0, 1.0),
        aspect_ratio: w.min(h) / w.max(h),
        mask,
    })
}

/// `4*pi*A / P^2` with the crack length scaled by `pi/4` to approximate the true
/// perimeter of a digitized shape.
fn mask_circularity(mask: &ObjectMask) -> f64 {
    let area = mask.count() as f64;
    let perimeter = mask.crack_length() as f64 * PI / 4.0;
    if perimeter <= 0.0 {
        return 0.0;
    }
    (4.0 * PI * area / (perimeter * perimeter)).clamp(0.0, 1.0)
}

/// Circularity of the ellipse inscribed in a `w x h` box (Ramanujan perimeter).
fn ellipse_circularity(w: f64, h: f64) -> f64 {
    let (a, b) = (w / 2.0, h / 2.0);
    let perimeter = PI * (3.0 * (a + b) - ((3.0 * a + b) * (a + 3.0 * b)).sqrt());
    if perimeter <= 0.0 {
        return 0.0;
    }
    (4.0 * PI * PI * a * b / (perimeter * perimeter)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PixelBuffer;
    use crate::hardware::mock::MockDetector;

    fn frame(w: u32, h: u32) -> Frame {
        Frame::new(7, w, h, PixelBuffer::U8(vec![0; (w * h) as usize])).unwrap()
    }

    fn adapter(config: DetectionConfig, detector: MockDetector) -> DetectionAdapter {
        DetectionAdapter::new(config, Arc::new(detector))
    }

    fn permissive() -> DetectionConfig {
        DetectionConfig {
            min_area: 0.0,
            ..DetectionConfig::default()
        }
    }

    #[tokio::test]
    async fn filters_and_renumbers_contiguously() {
        let config = DetectionConfig {
            min_area: 50.0,
            max_area: 500.0,
            ..DetectionConfig::default()
        };
        let detector = MockDetector::scripted(vec![vec![
            RawDetection::boxed(0.0, 0.0, 5.0, 5.0, 0.9),    // 25 px, too small
            RawDetection::boxed(10.0, 10.0, 10.0, 10.0, 0.8), // kept
            RawDetection::boxed(30.0, 0.0, 40.0, 40.0, 0.7),  // 1600 px, too large
            RawDetection::boxed(0.0, 40.0, 8.0, 8.0, 0.6),    // kept
        ]]);
        let out = adapter(config, detector).detect(&frame(100, 100)).await;
        assert!(out.error.is_none());
        let indices: Vec<usize> = out.objects.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(out.objects[0].region, Region::new(10, 10, 10, 10));
        assert_eq!(out.objects[1].area, 64.0);
    }

    #[tokio::test]
    async fn detector_failure_yields_empty_list_and_error() {
        let out = adapter(permissive(), MockDetector::failing("model crashed"))
            .detect(&frame(10, 10))
            .await;
        assert!(out.objects.is_empty());
        assert!(matches!(out.error, Some(DetectionError::Detector(_))));
    }

    #[tokio::test]
    async fn one_malformed_entry_discards_everything() {
        let detector = MockDetector::scripted(vec![vec![
            RawDetection::boxed(1.0, 1.0, 4.0, 4.0, 0.9),
            RawDetection::boxed(1.0, 1.0, f64::NAN, 4.0, 0.9),
        ]]);
        let out = adapter(permissive(), detector).detect(&frame(10, 10)).await;
        assert!(out.objects.is_empty());
        assert_eq!(
            out.error.map(|e| matches!(e, DetectionError::Malformed { index: 1, .. })),
            Some(true)
        );
    }

    #[test]
    fn confidence_outside_unit_interval_is_malformed() {
        let a = adapter(permissive(), MockDetector::default());
        let raw = [RawDetection::boxed(0.0, 0.0, 2.0, 2.0, 1.5)];
        assert!(a.normalize(&frame(10, 10), &raw).is_err());
    }

    #[test]
    fn boxes_are_clipped_and_masks_cropped() {
        let a = adapter(permissive(), MockDetector::default());
        // 4x4 box hanging 2 px off the right edge, left column of the mask excluded
        let bits = (0..16).map(|i| i % 4 != 0).collect();
        let mask = ObjectMask::new(4, 4, bits).unwrap();
        let raw = [RawDetection::boxed(8.0, 0.0, 4.0, 4.0, 1.0).with_mask(mask)];
        let objects = a.normalize(&frame(10, 10), &raw).unwrap();
        assert_eq!(objects[0].region, Region::new(8, 0, 2, 4));
        let cropped = objects[0].mask.as_ref().unwrap();
        assert_eq!((cropped.width, cropped.height), (2, 4));
        assert_eq!(objects[0].area, 4.0);
        assert_eq!(objects[0].centroid, (9.5, 2.0));
    }

    #[test]
    fn mask_dimensions_must_match_box() {
        let a = adapter(permissive(), MockDetector::default());
        let raw = [RawDetection::boxed(0.0, 0.0, 4.0, 4.0, 1.0).with_mask(ObjectMask::filled(3, 3))];
        assert!(matches!(
            a.normalize(&frame(10, 10), &raw),
            Err(DetectionError::Malformed { index: 0, .. })
        ));
    }

    #[test]
    fn boxes_beyond_pixel_range_are_malformed() {
        let a = adapter(permissive(), MockDetector::default());
        let raw = [
            RawDetection::boxed(1.0, 1.0, 2.0, 2.0, 1.0),
            RawDetection::boxed(-1e300, 0.0, 2e300, 2.0, 0.5).with_mask(ObjectMask::filled(2, 2)),
        ];
        assert!(matches!(
            a.normalize(&frame(4, 4), &raw),
            Err(DetectionError::Malformed { index: 1, .. })
        ));

        let huge = [RawDetection::boxed(0.0, 0.0, 1e300, 1e300, 0.5)];
        assert!(a.normalize(&frame(4, 4), &huge).is_err());
    }

    #[test]
    fn shape_descriptors() {
        let a = adapter(
            DetectionConfig {
                min_area: 0.0,
                min_aspect_ratio: 0.5,
                ..DetectionConfig::default()
            },
            MockDetector::default(),
        );
        let raw = [
            RawDetection::boxed(0.0, 0.0, 10.0, 10.0, 1.0),
            RawDetection::boxed(20.0, 0.0, 30.0, 5.0, 1.0),
        ];
        let objects = a.normalize(&frame(100, 100), &raw).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].aspect_ratio, 1.0);
        assert!((objects[0].circularity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn detections_outside_frame_are_dropped() {
        let a = adapter(permissive(), MockDetector::default());
        let raw = [
            RawDetection::boxed(50.0, 50.0, 5.0, 5.0, 1.0),
            RawDetection::boxed(1.0, 1.0, 2.0, 2.0, 1.0),
        ];
        let objects = a.normalize(&frame(10, 10), &raw).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].index, 0);
    }

    #[test]
    fn primary_prefers_largest_then_lowest_index() {
        let a = adapter(permissive(), MockDetector::default());
        let raw = [
            RawDetection::boxed(0.0, 0.0, 2.0, 2.0, 1.0),
            RawDetection::boxed(10.0, 0.0, 4.0, 4.0, 1.0),
            RawDetection::boxed(20.0, 0.0, 4.0, 4.0, 1.0),
        ];
        let objects = a.normalize(&frame(40, 10), &raw).unwrap();
        assert_eq!(primary(&objects).map(|o| o.index), Some(1));
        assert!(primary(&[]).is_none());
    }
}
