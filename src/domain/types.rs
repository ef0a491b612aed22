//! Shared types for the zone counter

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock instant used for every dwell/grace computation
pub type Timestamp = DateTime<Utc>;

/// Person id that upstream uses for detections it could not track
pub const UNTRACKED_PERSON: PersonId = PersonId(-1);

/// Newtype wrapper for upstream track ids
///
/// Opaque to this crate; only valid while the upstream tracker keeps the track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PersonId(pub i64);

impl std::fmt::Display for PersonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds elapsed from `earlier` to `later` (negative if reversed)
#[inline]
pub fn seconds_between(earlier: Timestamp, later: Timestamp) -> f64 {
    let delta = later - earlier;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1000.0,
    }
}

/// Format a timestamp the way zone history stores it (local time, second precision)
pub fn history_time(ts: Timestamp) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// 2D pixel position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// How a bounding box is reduced to a single position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMethod {
    /// Feet position: horizontal centre, bottom edge
    #[default]
    BottomCenter,
    Center,
}

impl PositionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionMethod::BottomCenter => "bottom_center",
            PositionMethod::Center => "center",
        }
    }
}

/// A single per-frame person detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    Point { id: PersonId, x: f64, y: f64 },
    BoundingBox { id: PersonId, x1: f64, y1: f64, x2: f64, y2: f64 },
    /// Detection whose shape could not be read; only the id survived.
    /// Keeps the person present in the frame without a position.
    Unreadable { id: PersonId },
}

impl Observation {
    pub fn point(id: i64, x: f64, y: f64) -> Self {
        Observation::Point { id: PersonId(id), x, y }
    }

    pub fn bbox(id: i64, x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Observation::BoundingBox { id: PersonId(id), x1, y1, x2, y2 }
    }

    pub fn unreadable(id: i64) -> Self {
        Observation::Unreadable { id: PersonId(id) }
    }

    #[inline]
    pub fn person_id(&self) -> PersonId {
        match *self {
            Observation::Point { id, .. }
            | Observation::BoundingBox { id, .. }
            | Observation::Unreadable { id } => id,
        }
    }

    /// Derive the position used for zone containment
    pub fn position(&self, method: PositionMethod) -> Result<Point, ObservationError> {
        match *self {
            Observation::Point { id, x, y } => {
                if !x.is_finite() || !y.is_finite() {
                    return Err(ObservationError::NonFiniteCoordinate(id));
                }
                Ok(Point::new(x, y))
            }
            Observation::BoundingBox { id, x1, y1, x2, y2 } => {
                if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
                    return Err(ObservationError::NonFiniteCoordinate(id));
                }
                if x2 < x1 || y2 < y1 {
                    return Err(ObservationError::InvertedBoundingBox(id));
                }
                let cx = (x1 + x2) / 2.0;
                Ok(match method {
                    PositionMethod::BottomCenter => Point::new(cx, y2),
                    PositionMethod::Center => Point::new(cx, (y1 + y2) / 2.0),
                })
            }
            Observation::Unreadable { id } => Err(ObservationError::UnreadableShape(id)),
        }
    }
}

/// One frame of detections for one camera, as delivered by ingest
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionFrame {
    pub camera_id: String,
    pub observations: Vec<Observation>,
    /// When ingest received the frame; the frame is processed at this time
    pub received_at: Timestamp,
}

/// Why a single observation was skipped
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObservationError {
    NonFiniteCoordinate(PersonId),
    InvertedBoundingBox(PersonId),
    UnreadableShape(PersonId),
}

impl ObservationError {
    pub fn person_id(&self) -> PersonId {
        match *self {
            ObservationError::NonFiniteCoordinate(id)
            | ObservationError::InvertedBoundingBox(id)
            | ObservationError::UnreadableShape(id) => id,
        }
    }
}

impl std::fmt::Display for ObservationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservationError::NonFiniteCoordinate(id) => {
                write!(f, "observation for person {id} has a non-finite coordinate")
            }
            ObservationError::InvertedBoundingBox(id) => {
                write!(f, "bounding box for person {id} has bottom-right above or left of top-left")
            }
            ObservationError::UnreadableShape(id) => {
                write!(f, "detection for person {id} has neither a 4-value bbox nor a 2-value point")
            }
        }
    }
}

impl std::error::Error for ObservationError {}
