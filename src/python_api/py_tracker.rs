use nalgebra::DVector;
use pyo3::{exceptions::PyValueError, pyclass, pymethods, PyResult};

use crate::{
    config::{ClassMode, EmbeddingMode, TrackerConfig},
    python_api::{PyDetection, PyTrack},
    Tracker,
};

/// New tracker, push detections in, get tracks out.
///
/// This binding only supports the pre-computed-embeddings path of [`Tracker::update`]:
/// there is no way to hand a Python callable across the FFI boundary for the
/// embedding extractor or camera-motion estimator, so `with_ecc` is always disabled
/// here and `with_reid` only works if the caller passes `embs` on every call.
#[pyclass(name = "Tracker")]
pub struct PyTracker {
    inner: Tracker,
}

#[pymethods]
impl PyTracker {
    #[new]
    #[pyo3(signature = (
        track_high_thresh=0.6,
        track_low_thresh=0.1,
        track_new_thresh=0.7,
        match_thresh=0.8,
        max_time_lost=2.0,
        max_time_reidable=5.0,
        frame_rate=30,
        with_reid=false,
        with_emb_reactivation=true,
    ))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        track_high_thresh: f64,
        track_low_thresh: f64,
        track_new_thresh: f64,
        match_thresh: f64,
        max_time_lost: f64,
        max_time_reidable: f64,
        frame_rate: u32,
        with_reid: bool,
        with_emb_reactivation: bool,
    ) -> Self {
        let config = TrackerConfig {
            track_high_thresh,
            track_low_thresh,
            track_new_thresh,
            match_thresh,
            max_time_lost,
            max_time_reidable,
            frame_rate,
            with_reid,
            with_ecc: false,
            with_emb_reactivation,
            emb_mode: EmbeddingMode::Ema,
            class_mode: ClassMode::Last,
            ..TrackerConfig::default()
        };
        Self { inner: Tracker::new(config, None, None) }
    }

    /// Resets id sequence, pools and storage as if the tracker had just been built.
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    #[pyo3(signature = (detections, embeddings=None))]
    pub fn update(
        &mut self,
        detections: Vec<PyDetection>,
        embeddings: Option<Vec<Vec<f64>>>,
    ) -> PyResult<Vec<PyTrack>> {
        let dets: Vec<_> = detections.into_iter().map(|d| d.inner).collect();
        let embs: Option<Vec<DVector<f64>>> =
            embeddings.map(|rows| rows.into_iter().map(DVector::from_vec).collect());

        let outputs = self
            .inner
            .update(&dets, None, embs.as_deref())
            .map_err(|e| PyValueError::new_err(e.to_string()))?;

        Ok(outputs.into_iter().map(|inner| PyTrack { inner }).collect())
    }
}
