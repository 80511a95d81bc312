use thiserror::Error;

/// Failure modes surfaced by a single [`crate::tracker::Tracker::update`] call.
///
/// Numerical anomalies inside the Kalman filter are deliberately not a variant here:
/// a non-finite mean or covariance degrades the affected track to `Removed` and is
/// logged, but it does not fail the frame. See the motion module for that path.
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("embedding extractor failed: {0}")]
    ExtractorFailure(String),

    #[error("camera motion estimator failed: {0}")]
    CameraEstimatorFailure(String),

    #[error(
        "track storage full: requested {requested} free slots but only {available} available and growth is disabled"
    )]
    StorageFull { requested: usize, available: usize },
}
