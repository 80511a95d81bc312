//! A multi-object visual tracker: per-frame bounding-box detections go in, a stable
//! stream of identified tracks comes out.
//!
//! The pipeline is a cascade of bipartite-matching stages (motion cost, optionally
//! fused with appearance cost) layered over a constant-velocity Kalman motion model
//! and an append-only Structure-of-Arrays track store. See [`tracker::Tracker`] for
//! the per-frame entry point and [`config::TrackerConfig`] for its tunables.

mod assignment;
mod class_vote;
mod embedding;
pub mod config;
pub mod error;
pub mod geometry;
pub mod motion;
mod storage;
pub mod tracker;

#[cfg(feature = "python")]
mod python_api;

pub use config::{ClassMode, EmbeddingMode, TrackerConfig};
pub use error::TrackError;
pub use geometry::{Xywh, Xyxy};
pub use storage::TrackState;
pub use tracker::{CameraMotionEstimator, Detection, EmbeddingExtractor, Image, OutputTrack, Tracker};
