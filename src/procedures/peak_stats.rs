//! Peak statistics over a scan's document stream.
//!
//! [`PeakStats`] subscribes to one run, collects `(x, y)` pairs from its events
//! and, when the Stop document arrives, computes statistics for the raw curve
//! and for its numerical derivative:
//!
//! | field  | meaning                                                   |
//! |--------|-----------------------------------------------------------|
//! | `min`  | x at the smallest y                                       |
//! | `max`  | x at the largest y                                        |
//! | `com`  | baseline-subtracted centre of mass `Σx(y−ymin)/Σ(y−ymin)` |
//! | `cen`  | mean of the half-maximum crossings                        |
//! | `fwhm` | distance between first and last half-maximum crossing     |
//!
//! Half maximum is `(ymax + ymin) / 2`; crossings are located by linear
//! interpolation between neighbouring points after sorting by x. A curve with
//! fewer than two crossings has no FWHM, which consumers treat as "no peak".

use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::error::{AlignError, AlignResult};
use crate::experiment::document::Document;
use crate::experiment::run_engine::DocumentSubscriber;

/// Relative spread below which a curve is treated as flat.
const FLAT_TOLERANCE: f64 = 1e-9;

/// Which curve a statistic is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CurveFamily {
    /// Detector value against motor position
    Raw,
    /// dy/dx of the raw curve
    Derivative,
}

impl CurveFamily {
    /// Conventional record name
    pub fn as_str(self) -> &'static str {
        match self {
            CurveFamily::Raw => "stats",
            CurveFamily::Derivative => "derivative_stats",
        }
    }
}

/// Field within a [`PeakRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatField {
    /// Centre of mass
    Com,
    /// Half-maximum centre
    Cen,
    /// Position of the minimum
    Min,
    /// Position of the maximum
    Max,
}

impl StatField {
    /// Conventional field name
    pub fn as_str(self) -> &'static str {
        match self {
            StatField::Com => "com",
            StatField::Cen => "cen",
            StatField::Min => "min",
            StatField::Max => "max",
        }
    }
}

/// Extreme point of a curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Extremum {
    /// x of the extreme point
    pub position: f64,
    /// y at that point
    pub value: f64,
}

/// Statistics of one curve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakRecord {
    /// Centre of mass, `None` when every y equals the minimum
    pub com: Option<f64>,
    /// Mean of the half-maximum crossings, `None` without crossings
    pub cen: Option<f64>,
    /// Lowest point
    pub min: Extremum,
    /// Highest point
    pub max: Extremum,
    /// Full width at half maximum, `None` with fewer than two crossings
    pub fwhm: Option<f64>,
    /// Half-maximum crossing positions, ascending in x
    pub crossings: Vec<f64>,
    /// Number of points the record was computed from
    pub num_points: usize,
}

impl PeakRecord {
    /// Compute statistics for `points`, which need not be sorted.
    ///
    /// Non-finite points are ignored. Returns `None` with fewer than two
    /// usable points.
    pub fn from_points(points: &[(f64, f64)]) -> Option<Self> {
        let mut pts: Vec<(f64, f64)> = points
            .iter()
            .copied()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .collect();
        if pts.len() < 2 {
            return None;
        }
        pts.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut min = Extremum {
            position: pts[0].0,
            value: pts[0].1,
        };
        let mut max = min;
        for &(x, y) in &pts[1..] {
            if y < min.value {
                min = Extremum { position: x, value: y };
            }
            if y > max.value {
                max = Extremum { position: x, value: y };
            }
        }

        let weight: f64 = pts.iter().map(|(_, y)| y - min.value).sum();
        let com = (weight > 0.0).then(|| {
            pts.iter().map(|(x, y)| x * (y - min.value)).sum::<f64>() / weight
        });

        let scale = max.value.abs().max(min.value.abs()).max(1.0);
        let flat = max.value - min.value <= FLAT_TOLERANCE * scale;
        let crossings = if flat {
            Vec::new()
        } else {
            half_max_crossings(&pts, (max.value + min.value) / 2.0)
        };

        let cen = (!crossings.is_empty())
            .then(|| crossings.iter().sum::<f64>() / crossings.len() as f64);
        let fwhm = match (crossings.first(), crossings.last()) {
            (Some(first), Some(last)) if crossings.len() >= 2 => Some((last - first).abs()),
            _ => None,
        };

        Some(Self {
            com,
            cen,
            min,
            max,
            fwhm,
            crossings,
            num_points: pts.len(),
        })
    }

    /// Position of a statistic, if defined
    pub fn field(&self, field: StatField) -> Option<f64> {
        match field {
            StatField::Com => self.com,
            StatField::Cen => self.cen,
            StatField::Min => Some(self.min.position),
            StatField::Max => Some(self.max.position),
        }
    }

    /// True when a usable peak was found (FWHM defined and non-zero)
    pub fn has_peak(&self) -> bool {
        matches!(self.fwhm, Some(w) if w > 0.0)
    }
}

impl fmt::Display for PeakRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<f64>| v.map_or_else(|| "none".to_string(), |v| format!("{v:.6}"));
        write!(
            f,
            "com={} cen={} min={:.6} max={:.6} fwhm={}",
            show(self.com),
            show(self.cen),
            self.min.position,
            self.max.position,
            show(self.fwhm)
        )
    }
}

fn half_max_crossings(pts: &[(f64, f64)], mid: f64) -> Vec<f64> {
    pts.windows(2)
        .filter_map(|w| {
            let ((x0, y0), (x1, y1)) = (w[0], w[1]);
            if (y0 > mid) == (y1 > mid) {
                return None;
            }
            let t = (mid - y0) / (y1 - y0);
            Some(x0 + t * (x1 - x0))
        })
        .collect()
}

/// Numerical derivative at interval midpoints of x-sorted points.
///
/// Intervals with zero width are skipped.
pub fn derivative(points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut pts: Vec<(f64, f64)> = points
        .iter()
        .copied()
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    pts.sort_by(|a, b| a.0.total_cmp(&b.0));
    pts.windows(2)
        .filter_map(|w| {
            let ((x0, y0), (x1, y1)) = (w[0], w[1]);
            let dx = x1 - x0;
            (dx != 0.0).then(|| ((x0 + x1) / 2.0, (y1 - y0) / dx))
        })
        .collect()
}

/// Statistics of both curve families for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    /// Raw curve, `None` with fewer than two points
    pub stats: Option<PeakRecord>,
    /// Derivative curve, `None` with fewer than two derivative points
    pub derivative_stats: Option<PeakRecord>,
}

impl FitResult {
    /// Compute both families from raw points
    pub fn from_points(points: &[(f64, f64)]) -> Self {
        Self {
            stats: PeakRecord::from_points(points),
            derivative_stats: PeakRecord::from_points(&derivative(points)),
        }
    }

    /// Record of a family, if one was produced
    pub fn record(&self, family: CurveFamily) -> Option<&PeakRecord> {
        match family {
            CurveFamily::Raw => self.stats.as_ref(),
            CurveFamily::Derivative => self.derivative_stats.as_ref(),
        }
    }
}

/// Feature extractor attached to one scan.
///
/// x is taken from the event's `positions[x_key]` (falling back to
/// `data[x_key]`) and y from `data[y_key]`. Events missing either are skipped.
#[derive(Debug, Clone)]
pub struct PeakStats {
    x_key: String,
    y_key: String,
    points: Vec<(f64, f64)>,
    skipped: usize,
    result: Option<FitResult>,
}

impl PeakStats {
    /// Extractor for motor field `x_key` and detector field `y_key`
    pub fn new(x_key: impl Into<String>, y_key: impl Into<String>) -> Self {
        Self {
            x_key: x_key.into(),
            y_key: y_key.into(),
            points: Vec::new(),
            skipped: 0,
            result: None,
        }
    }

    /// Motor field name
    pub fn x_key(&self) -> &str {
        &self.x_key
    }

    /// Detector field name
    pub fn y_key(&self) -> &str {
        &self.y_key
    }

    /// Points collected so far
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Statistics for the completed run.
    ///
    /// # Errors
    /// [`AlignError::FittingUnavailable`] until the run's Stop document arrives.
    pub fn result(&self) -> AlignResult<&FitResult> {
        self.result.as_ref().ok_or_else(|| {
            AlignError::FittingUnavailable(format!(
                "no completed scan of {} against {}",
                self.y_key, self.x_key
            ))
        })
    }

    /// Record of one curve family for the completed run.
    ///
    /// # Errors
    /// [`AlignError::FittingUnavailable`] before Stop or when the family has no record.
    pub fn record(&self, family: CurveFamily) -> AlignResult<&PeakRecord> {
        self.result()?.record(family).ok_or_else(|| {
            AlignError::FittingUnavailable(format!(
                "no {} record for {} against {}",
                family.as_str(),
                self.y_key,
                self.x_key
            ))
        })
    }
}

impl DocumentSubscriber for PeakStats {
    fn on_document(&mut self, doc: &Document) {
        match doc {
            Document::Start(_) => {
                self.points.clear();
                self.skipped = 0;
                self.result = None;
            }
            Document::Event(event) => {
                let x = event.value(&self.x_key);
                let y = event.data.get(&self.y_key).copied();
                match (x, y) {
                    (Some(x), Some(y)) => self.points.push((x, y)),
                    _ => self.skipped += 1,
                }
            }
            Document::Stop(_) => {
                if self.skipped > 0 {
                    warn!(
                        x = %self.x_key,
                        y = %self.y_key,
                        skipped = self.skipped,
                        "Events without the fitted fields were ignored"
                    );
                }
                let result = FitResult::from_points(&self.points);
                debug!(
                    points = self.points.len(),
                    stats = ?result.stats.as_ref().map(|r| r.to_string()),
                    "Peak statistics computed"
                );
                self.result = Some(result);
            }
            Document::Descriptor(_) => {}
        }
    }
}
