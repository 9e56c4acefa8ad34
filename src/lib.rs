//! Worldcast Server Library
//!
//! A state-synchronization server that broadcasts a simulated world to many
//! viewers at once. Each viewer gets a relevance-filtered, delta-compressed
//! view of the world, paced to their own activity and link quality, with the
//! whole pipeline adapting to congestion and load as conditions change.
//!
//! # Features
//!
//! - `metrics_endpoint` - Prometheus/JSON scrape endpoint on a raw TCP listener (enabled by default)
//! - `minimal` - Build without optional surfaces for testing/debugging

pub mod config;
pub mod util;
pub mod world;
pub mod net;
pub mod metrics;
