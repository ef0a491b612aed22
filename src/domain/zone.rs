//! Zone data model: rectangles, persisted zone records, and read views
//!
//! `ZoneRecord` doubles as the persisted layout
//! (camera_id -> {zones: name -> record}) shared with the snapshot store.

use crate::domain::types::PersonId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the zone auto-provisioned for cameras seen for the first time
pub const DEFAULT_ZONE_NAME: &str = "zone1";

/// Rectangle of the auto-provisioned zone (1080p frame, centre region)
pub const DEFAULT_ZONE_RECT: ZoneRect = ZoneRect { top_left: [640, 360], bottom_right: [1280, 700] };

/// Axis-aligned zone rectangle in integer pixel coordinates
///
/// Invariant: `top_left < bottom_right` on both axes. Only constructible
/// through [`ZoneRect::new`] outside this module; deserialized values must
/// be checked with [`ZoneRect::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRect {
    pub top_left: [i32; 2],
    pub bottom_right: [i32; 2],
}

impl ZoneRect {
    pub fn new(top_left: [i32; 2], bottom_right: [i32; 2]) -> Result<Self, ZoneError> {
        let rect = Self { top_left, bottom_right };
        rect.validate()?;
        Ok(rect)
    }

    pub fn validate(&self) -> Result<(), ZoneError> {
        if self.top_left[0] >= self.bottom_right[0] || self.top_left[1] >= self.bottom_right[1] {
            return Err(ZoneError::InvalidRectangle {
                top_left: self.top_left,
                bottom_right: self.bottom_right,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn left(&self) -> i32 {
        self.top_left[0]
    }

    #[inline]
    pub fn top(&self) -> i32 {
        self.top_left[1]
    }

    #[inline]
    pub fn right(&self) -> i32 {
        self.bottom_right[0]
    }

    #[inline]
    pub fn bottom(&self) -> i32 {
        self.bottom_right[1]
    }
}

/// Count-affecting zone history action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryAction {
    Entered,
    Exited,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Entered => "entered",
            HistoryAction::Exited => "exited",
        }
    }
}

/// One append-only entry in a zone's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: PersonId,
    pub action: HistoryAction,
    /// Local time, "YYYY-MM-DD HH:MM:SS"
    pub time: String,
}

/// Aggregate, persistable state of a single zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRecord {
    #[serde(flatten)]
    pub rect: ZoneRect,
    #[serde(default)]
    pub in_count: u64,
    #[serde(default)]
    pub out_count: u64,
    #[serde(default)]
    pub inside_ids: Vec<PersonId>,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
}

impl ZoneRecord {
    pub fn new(rect: ZoneRect) -> Self {
        Self { rect, in_count: 0, out_count: 0, inside_ids: Vec::new(), history: Vec::new() }
    }
}

/// Persisted/published view of one camera
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    #[serde(default)]
    pub zones: BTreeMap<String, ZoneRecord>,
}

/// Full aggregate state: camera_id -> camera record
pub type Snapshot = BTreeMap<String, CameraRecord>;

/// Counts-only view of a zone
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneCounts {
    pub in_count: u64,
    pub out_count: u64,
    pub history: Vec<HistoryEvent>,
}

/// Aggregates over the people currently dwelling inside a zone
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DwellStats {
    /// People currently inside (not in exit grace)
    pub active: usize,
    pub avg_dwell: f64,
    pub max_dwell: f64,
    /// Of `active`, how many already produced an Entered event
    pub qualified: usize,
}

/// Zone statistics returned to API consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStats {
    pub in_count: u64,
    pub out_count: u64,
    pub current_occupancy: usize,
    pub inside_ids: Vec<PersonId>,
    pub dwell_stats: DwellStats,
    pub coordinates: ZoneRect,
}

/// Per-person dwell detail for a zone
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DwellDetail {
    pub id: PersonId,
    pub dwell_secs: f64,
    pub counted: bool,
    /// "inside" or "exiting"
    pub state: &'static str,
}

/// Declined zone-management or query result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneError {
    InvalidRectangle { top_left: [i32; 2], bottom_right: [i32; 2] },
    CameraNotFound(String),
    ZoneNotFound { camera_id: String, zone: String },
    MissingField(&'static str),
}

impl std::fmt::Display for ZoneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneError::InvalidRectangle { top_left, bottom_right } => write!(
                f,
                "invalid zone coordinates {top_left:?}..{bottom_right:?}: top_left must be less than bottom_right"
            ),
            ZoneError::CameraNotFound(camera_id) => write!(f, "camera {camera_id} not found"),
            ZoneError::ZoneNotFound { camera_id, zone } => {
                write!(f, "zone {zone} not found in camera {camera_id}")
            }
            ZoneError::MissingField(field) => write!(f, "missing required field: {field}"),
        }
    }
}

impl std::error::Error for ZoneError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_validation() {
        assert!(ZoneRect::new([0, 0], [10, 10]).is_ok());
        assert!(matches!(
            ZoneRect::new([10, 0], [10, 10]),
            Err(ZoneError::InvalidRectangle { .. })
        ));
        assert!(ZoneRect::new([0, 20], [10, 10]).is_err());
    }

    #[test]
    fn test_default_rect_is_valid() {
        assert!(DEFAULT_ZONE_RECT.validate().is_ok());
    }

    #[test]
    fn test_zone_record_persisted_layout() {
        let mut record = ZoneRecord::new(ZoneRect::new([1, 2], [3, 4]).unwrap());
        record.in_count = 2;
        record.history.push(HistoryEvent {
            id: PersonId(7),
            action: HistoryAction::Entered,
            time: "2026-01-05 16:41:30".to_string(),
        });

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["top_left"], serde_json::json!([1, 2]));
        assert_eq!(value["bottom_right"], serde_json::json!([3, 4]));
        assert_eq!(value["in_count"], 2);
        assert_eq!(value["inside_ids"], serde_json::json!([]));
        assert_eq!(value["history"][0]["id"], 7);
        assert_eq!(value["history"][0]["action"], "Entered");
    }

    #[test]
    fn test_zone_record_missing_counts_default_to_zero() {
        let json = r#"{"top_left": [0, 0], "bottom_right": [5, 5]}"#;
        let record: ZoneRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.in_count, 0);
        assert_eq!(record.out_count, 0);
        assert!(record.history.is_empty());
    }

    #[test]
    fn test_zone_error_messages() {
        let err = ZoneError::ZoneNotFound { camera_id: "camera1".into(), zone: "door".into() };
        assert_eq!(err.to_string(), "zone door not found in camera camera1");
        assert_eq!(ZoneError::MissingField("zone").to_string(), "missing required field: zone");
    }
}
