/// How a track's running appearance embedding is folded in as new observations arrive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingMode {
    /// Exponential moving average against the previous embedding, then re-normalized.
    Ema,
    /// Replace with the latest observation, re-normalized.
    Last,
}

/// How a track's reported class is resolved from its observation history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassMode {
    /// Report the class of the most recent matched detection.
    Last,
    /// Keep a bounded history of (class, confidence) pairs and report the class with the
    /// highest summed confidence.
    Vote { max_len: usize },
}

/// Tunables for a [`crate::tracker::Tracker`] instance.
///
/// Field defaults mirror common second-association / ReID tracker configurations; the
/// embedding and IoU gating thresholds default to the values this design is grounded on.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Detections at or above this score participate in the first association stage.
    pub track_high_thresh: f64,
    /// Detections strictly below `track_high_thresh` and at or above this score
    /// participate in the second (BYTE-style) association stage.
    pub track_low_thresh: f64,
    /// Minimum score an unmatched high-confidence detection needs to spawn a new track.
    pub track_new_thresh: f64,
    /// Cost cap for the first association stage (fused IoU/embedding cost).
    pub match_thresh: f64,

    /// If the embedding distance for a candidate pair exceeds this, its IoU cost is
    /// forced to the maximum (cross-gate: appearance vetoes motion).
    pub iou_emb_thresh: f64,
    /// If the IoU distance for a candidate pair exceeds this, its embedding cost is
    /// forced to the maximum (cross-gate: motion vetoes appearance).
    pub emb_iou_thresh: f64,
    /// Embedding distances above this are forced to the maximum before fusing.
    pub emb_thresh: f64,
    /// Minimum visibility ratio for a detection to be considered "pure" and allowed to
    /// refresh a track's pure (occlusion-free) embedding.
    pub vr_thresh: f64,
    /// Cost cap for the ReID reactivation stage against `Reidable` tracks.
    pub emb_reid_thresh: f64,

    /// Seconds a track may stay `Lost` (or `Reidable`, if reactivation is disabled)
    /// before removal, converted to frames via `frame_rate`.
    pub max_time_lost: f64,
    /// Seconds a track may stay `Reidable` before removal, converted to frames.
    pub max_time_reidable: f64,
    /// Nominal frame rate used to convert the two durations above into frame counts.
    pub frame_rate: u32,

    /// Enables the embedding-based association and reactivation paths.
    pub with_reid: bool,
    /// Enables camera-motion compensation of track positions before association.
    pub with_ecc: bool,
    /// Enables the `Lost -> Reidable -> Removed` path; when disabled, `Lost` tracks are
    /// removed directly once `max_time_lost` elapses.
    pub with_emb_reactivation: bool,

    /// Embedding aggregation mode.
    pub emb_mode: EmbeddingMode,
    /// EMA blend factor applied to the previous embedding when `emb_mode` is `Ema`.
    pub emb_ema_alpha: f64,

    /// Class resolution policy.
    pub class_mode: ClassMode,

    /// Number of track slots preallocated at construction.
    pub initial_storage_capacity: usize,
    /// Whether storage may grow (by doubling) past its initial capacity.
    pub auto_grow_storage: bool,
    /// Run storage compaction every this many frames.
    pub cleanup_every: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            track_high_thresh: 0.6,
            track_low_thresh: 0.1,
            track_new_thresh: 0.7,
            match_thresh: 0.8,

            iou_emb_thresh: 0.17,
            emb_iou_thresh: 0.5,
            emb_thresh: 0.5,
            vr_thresh: 0.3,
            emb_reid_thresh: 0.1,

            max_time_lost: 2.0,
            max_time_reidable: 5.0,
            frame_rate: 30,

            with_reid: true,
            with_ecc: false,
            with_emb_reactivation: true,

            emb_mode: EmbeddingMode::Ema,
            emb_ema_alpha: 0.9,

            class_mode: ClassMode::Last,

            initial_storage_capacity: 128,
            auto_grow_storage: true,
            cleanup_every: 30,
        }
    }
}

impl TrackerConfig {
    pub fn max_frames_lost(&self) -> u64 {
        (self.max_time_lost * self.frame_rate as f64).round() as u64
    }

    pub fn max_frames_reidable(&self) -> u64 {
        (self.max_time_reidable * self.frame_rate as f64).round() as u64
    }
}
