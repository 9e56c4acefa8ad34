//! Viewer-facing pipeline
//!
//! Everything between a world snapshot and the bytes on a viewer's wire:
//! link monitoring, relevance scoring, send cadence, delta encoding, and
//! the orchestrator that drives them.

pub mod adaptation;
pub mod cadence;
pub mod codec;
pub mod monitor;
pub mod orchestrator;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod relevance;
pub mod wire;
