// src/analysis/mod.rs
//
// Counting and analytics pipeline modules.
//
// Signal flow, one frame at a time:
//   Tracker detections → identity_history (positions) ─┐
//                      → heatmap (intensity)           ├→ state_machine → count_aggregator
//   Media clock        ───────────────────────────────┘        │
//                                                              ▼
//                                             periodic_aggregator → TimeSliceReport
//
// Orchestrated by frame_orchestrator::FrameOrchestrator.

pub mod count_aggregator;
pub mod frame_orchestrator;
pub mod heatmap;
pub mod identity_history;
pub mod periodic_aggregator;
pub mod state_machine;

// Re-exports for ergonomic access from main.rs
pub use frame_orchestrator::{FrameOrchestrator, FrameOutput};
pub use heatmap::HeatmapAccumulator;
pub use periodic_aggregator::{PeriodicAggregator, TimeSliceReport};
pub use state_machine::{EntryExitStateMachine, Region};
