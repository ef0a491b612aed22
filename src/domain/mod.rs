//! Domain models - core types for zone occupancy counting
//!
//! This module contains the canonical data types used throughout the system:
//! - `PersonId` / `Observation` - per-frame detections from the inference pipeline
//! - `ZoneRect` / `ZoneRecord` - zone geometry and persisted aggregate state
//! - `ZoneStats` / `DwellDetail` - read views handed to API consumers
//! - `ZoneError` - declined zone operations

pub mod types;
pub mod zone;

// Re-export commonly used types at module level
pub use types::{
    DetectionFrame, Observation, ObservationError, PersonId, Point, PositionMethod, Timestamp,
};
pub use zone::{HistoryAction, HistoryEvent, Snapshot, ZoneError, ZoneRecord, ZoneRect};
