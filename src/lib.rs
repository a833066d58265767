//! crystfel-engine - serial femtosecond crystallography processing engine.
//!
//! Turns a stream of diffraction images into a stream of indexed,
//! integrated chunks: peak search, auto-indexing against a reference cell,
//! prediction refinement and integration, dispatched across a worker pool
//! with strictly ordered output.
//!
//! # Example
//!
//! ```ignore
//! use crystfel_engine::config::EngineConfig;
//! use crystfel_engine::geometry::Geometry;
//! use crystfel_engine::dispatcher;
//! use std::sync::Arc;
//!
//! let geom = Arc::new(Geometry::single_panel(1024, 1024, 75e-6, 0.1, 1.0));
//! let config = Arc::new(EngineConfig::default());
//! let backends = Arc::new(Vec::new());
//! let images = Vec::new();
//! let stats = dispatcher::run(images, geom, config, backends, std::io::stdout())?;
//! # Ok::<(), crystfel_engine::error::EngineError>(())
//! ```

pub mod cell;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod geometry;
pub mod image_source;
pub mod indexing;
pub mod integration;
pub mod peaksearch;
pub mod pipeline;
pub mod prediction;
pub mod stream;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::EngineConfig;
pub use error::EngineError;
pub use geometry::Geometry;
pub use types::{Chunk, Crystal, Peak, PeakList, Reflection};
