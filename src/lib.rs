// src/lib.rs

// Import the top-level `charla` module.
pub mod charla;

// Re-exporting key items for easier external access.
pub use charla::config::OrchestratorConfig;
pub use charla::pipeline::{DecideResponse, Pipeline, StageClients};
pub use charla::snapshot::{SlotValue, Snapshot, Vertical};
