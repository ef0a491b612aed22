//! Services - business logic and state management
//!
//! This module contains the zone occupancy state machine and its drivers:
//! - `containment` - Point-in-zone classifier with padding
//! - `debounce` - Per-person hysteresis over raw containment
//! - `dwell` - Minimum-dwell / exit-grace state machine
//! - `reaper` - Stale track garbage collection
//! - `registry` - Zones per camera: rectangles, counts, history
//! - `occupancy` - Per-frame orchestrator and zone management entry point
//! - `dispatcher` - Per-camera single-writer frame workers

pub mod containment;
pub mod debounce;
pub mod dispatcher;
pub mod dwell;
pub mod occupancy;
pub mod reaper;
pub mod registry;

// Re-export commonly used types
pub use dispatcher::FrameDispatcher;
pub use occupancy::{BatchReport, CountEvent, OccupancyService};
