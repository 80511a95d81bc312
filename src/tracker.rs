//! The multi-object tracker core: per-frame ingest, cascaded association, lifecycle
//! bookkeeping and output emission.

use std::collections::BTreeSet;

use itertools::{Either, Itertools};
use nalgebra::{DVector, SMatrix};

use crate::assignment;
use crate::config::TrackerConfig;
use crate::error::TrackError;
use crate::geometry::{self, Xyxy};
use crate::motion::KalmanFilterXywh;
use crate::storage::{AssocDet, TrackStorage, TrackState};

/// A single incoming detection for one frame.
#[derive(Clone, Debug)]
pub struct Detection {
    /// `[x1, y1, x2, y2]`.
    pub bbox: Xyxy,
    pub conf: f64,
    pub class: u32,
}

/// One track reported for a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputTrack {
    pub bbox: Xyxy,
    pub id: u32,
    pub conf: f64,
    pub class: u32,
    /// Row index into the `dets` slice passed to `update`, or `-1` if this output came
    /// from a frame where the track had no matched detection (cascade-recovered track).
    pub det_id: i64,
}

/// An opaque frame buffer handed to the injected collaborators below. The tracker core
/// never reads pixels itself; it only threads this reference through.
pub struct Image<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

/// Produces appearance embeddings for a batch of boxes in a frame. Out of core scope:
/// callers either supply embeddings directly to `Tracker::update` or inject one of
/// these.
pub trait EmbeddingExtractor {
    fn extract(&mut self, boxes_xyxy: &[Xyxy], image: &Image) -> Result<Vec<DVector<f64>>, TrackError>;
}

/// Estimates the camera motion between the previous frame and `image` as a 3x3
/// homography, for compensating track positions before association.
pub trait CameraMotionEstimator {
    fn estimate(&mut self, image: &Image, frame_id: u64) -> Result<SMatrix<f64, 3, 3>, TrackError>;
}

fn union_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    let set: BTreeSet<usize> = a.iter().chain(b.iter()).copied().collect();
    set.into_iter().collect()
}

fn difference_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    let b_set: BTreeSet<usize> = b.iter().copied().collect();
    a.iter().copied().filter(|s| !b_set.contains(s)).collect()
}

fn intersect_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    let b_set: BTreeSet<usize> = b.iter().copied().collect();
    a.iter().copied().filter(|s| b_set.contains(s)).collect()
}

pub struct Tracker {
    config: TrackerConfig,
    storage: TrackStorage,
    extractor: Option<Box<dyn EmbeddingExtractor>>,
    ecc: Option<Box<dyn CameraMotionEstimator>>,

    active_pool: Vec<usize>,
    lost_pool: Vec<usize>,
    reidable_pool: Vec<usize>,
    removed_pool: Vec<usize>,

    frame_count: u64,
    embedding_dim: Option<usize>,
}

impl Tracker {
    pub fn new(
        config: TrackerConfig,
        extractor: Option<Box<dyn EmbeddingExtractor>>,
        ecc: Option<Box<dyn CameraMotionEstimator>>,
    ) -> Self {
        let storage = TrackStorage::new(
            config.initial_storage_capacity,
            config.auto_grow_storage,
            KalmanFilterXywh::new(),
            config.emb_mode,
            config.emb_ema_alpha,
            config.class_mode,
        );
        Self {
            config,
            storage,
            extractor,
            ecc,
            active_pool: Vec::new(),
            lost_pool: Vec::new(),
            reidable_pool: Vec::new(),
            removed_pool: Vec::new(),
            frame_count: 0,
            embedding_dim: None,
        }
    }

    /// Drops all tracker state (pools, storage, frame counter, id sequence) as if the
    /// tracker had just been constructed, keeping the same configuration and injected
    /// collaborators. Used when restarting tracking on a new, unrelated video.
    pub fn reset(&mut self) {
        self.storage = TrackStorage::new(
            self.config.initial_storage_capacity,
            self.config.auto_grow_storage,
            KalmanFilterXywh::new(),
            self.config.emb_mode,
            self.config.emb_ema_alpha,
            self.config.class_mode,
        );
        self.active_pool.clear();
        self.lost_pool.clear();
        self.reidable_pool.clear();
        self.removed_pool.clear();
        self.frame_count = 0;
        self.embedding_dim = None;
    }

    fn validate_inputs(&self, dets: &[Detection], embs: Option<&[DVector<f64>]>) -> Result<(), TrackError> {
        for d in dets {
            if !(0.0..=1.0).contains(&d.conf) {
                return Err(TrackError::InvalidInput(format!(
                    "detection confidence {} is outside [0, 1]",
                    d.conf
                )));
            }
            if d.bbox.iter().any(|v| !v.is_finite()) {
                return Err(TrackError::InvalidInput(
                    "detection bounding box contains a non-finite coordinate".into(),
                ));
            }
            if d.bbox[2] <= d.bbox[0] || d.bbox[3] <= d.bbox[1] {
                return Err(TrackError::InvalidInput(
                    "detection bounding box has non-positive width or height".into(),
                ));
            }
        }
        if let Some(embs) = embs {
            if embs.len() != dets.len() {
                return Err(TrackError::ShapeMismatch(format!(
                    "{} embeddings supplied for {} detections",
                    embs.len(),
                    dets.len()
                )));
            }
            if let Some(first) = embs.first() {
                let dim = first.len();
                if let Some(expected) = self.embedding_dim {
                    if dim != expected {
                        return Err(TrackError::ShapeMismatch(format!(
                            "embedding dimension changed from {expected} to {dim}"
                        )));
                    }
                }
                if embs.iter().any(|e| e.len() != dim) {
                    return Err(TrackError::ShapeMismatch(
                        "embeddings have inconsistent dimension within a single frame".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Advances the tracker by one frame.
    ///
    /// `image` is required when `with_ecc` is enabled, and when `with_reid` is enabled
    /// and `embs` is not supplied (it is handed to the configured extractor).
    /// `embs`, if supplied, must have one row per detection in `dets` and supersedes
    /// the extractor entirely.
    pub fn update(
        &mut self,
        dets: &[Detection],
        image: Option<&Image>,
        embs: Option<&[DVector<f64>]>,
    ) -> Result<Vec<OutputTrack>, TrackError> {
        self.validate_inputs(dets, embs)?;
        if self.config.with_reid && embs.is_none() && image.is_none() {
            return Err(TrackError::InvalidInput(
                "image is required when with_reid is enabled and embeddings were not supplied".into(),
            ));
        }
        if self.config.with_ecc && image.is_none() {
            return Err(TrackError::InvalidInput(
                "image is required when with_ecc is enabled".into(),
            ));
        }

        self.frame_count += 1;
        let frame = self.frame_count;

        // -- step 0: ingest + split -------------------------------------------------
        let high_thresh = self.config.track_high_thresh;
        let low_thresh = self.config.track_low_thresh;

        let high_indices: Vec<usize> = dets
            .iter()
            .enumerate()
            .filter(|(_, d)| d.conf > high_thresh)
            .map(|(i, _)| i)
            .collect();
        let low_indices: Vec<usize> = dets
            .iter()
            .enumerate()
            .filter(|(_, d)| d.conf > low_thresh && d.conf <= high_thresh)
            .map(|(i, _)| i)
            .collect();

        let mut dets_high: Vec<AssocDet> = high_indices
            .iter()
            .map(|&i| AssocDet {
                bbox_xywh: geometry::xyxy_to_xywh(dets[i].bbox),
                conf: dets[i].conf,
                class: dets[i].class,
                det_id: i,
            })
            .collect();
        let dets_low: Vec<AssocDet> = low_indices
            .iter()
            .map(|&i| AssocDet {
                bbox_xywh: geometry::xyxy_to_xywh(dets[i].bbox),
                conf: dets[i].conf,
                class: dets[i].class,
                det_id: i,
            })
            .collect();

        let mut embs_high: Vec<DVector<f64>> = if self.config.with_reid {
            let high_boxes: Vec<Xyxy> = high_indices.iter().map(|&i| dets[i].bbox).collect();
            if let Some(provided) = embs {
                high_indices.iter().map(|&i| provided[i].clone()).collect()
            } else {
                let extractor = self.extractor.as_mut().ok_or_else(|| {
                    TrackError::InvalidInput(
                        "with_reid is enabled but no embedding extractor is configured".into(),
                    )
                })?;
                extractor.extract(&high_boxes, image.expect("checked above"))?
            }
        } else {
            Vec::new()
        };
        if self.embedding_dim.is_none() {
            if let Some(first) = embs_high.first() {
                self.embedding_dim = Some(first.len());
            }
        }

        let mut activated_pool: Vec<usize> = Vec::new();
        let mut reactivated_pool: Vec<usize> = Vec::new();
        let mut removed_this_frame: Vec<usize> = Vec::new();
        let mut lost_this_frame: Vec<usize> = Vec::new();

        // Camera compensation is estimated once per frame and reused for every pool it
        // applies to, rather than re-estimated per stage: a bad homography would
        // silently corrupt every downstream cost, so a failure here aborts the frame.
        let homography = if self.config.with_ecc {
            Some(
                self.ecc
                    .as_mut()
                    .ok_or_else(|| {
                        TrackError::InvalidInput(
                            "with_ecc is enabled but no camera motion estimator is configured".into(),
                        )
                    })?
                    .estimate(image.expect("checked above"), frame)?,
            )
        } else {
            None
        };

        // -- step 1: split the persistent active pool into confirmed/unconfirmed ---
        let (tracked_pool, unconfirmed_pool): (Vec<usize>, Vec<usize>) =
            self.active_pool.iter().partition_map(|&s| {
                if self.storage.is_activated(s) {
                    Either::Left(s)
                } else {
                    Either::Right(s)
                }
            });

        if let Some(h) = &homography {
            if !self.reidable_pool.is_empty() {
                let boxes: Vec<_> = self.reidable_pool.iter().map(|&s| self.storage.mean_box(s)).collect();
                let warped = geometry::camera_update(&boxes, h);
                for (&s, box_xywh) in self.reidable_pool.iter().zip(warped) {
                    self.storage.set_mean_box(s, box_xywh);
                }
            }
        }

        // -- step 2: ReID reactivation against the reidable pool --------------------
        if self.config.with_reid && self.config.with_emb_reactivation && !self.reidable_pool.is_empty()
            && !embs_high.is_empty()
        {
            let dim = self.embedding_dim.unwrap_or(0);
            let reid_embs: Vec<DVector<f64>> = self
                .reidable_pool
                .iter()
                .map(|&s| self.storage.pure_emb(s).cloned().unwrap_or_else(|| DVector::zeros(dim)))
                .collect();
            let emb_dists = geometry::cosine_distance_matrix(&reid_embs, &embs_high).map(|v| v / 2.0);
            let reid_assignment = assignment::assign(&emb_dists, self.config.emb_reid_thresh);

            let matched_slots: Vec<usize> =
                reid_assignment.matches.iter().map(|&(r, _)| self.reidable_pool[r]).collect();
            let matched_dets: Vec<AssocDet> =
                reid_assignment.matches.iter().map(|&(_, c)| dets_high[c].clone()).collect();
            let matched_embs: Vec<DVector<f64>> =
                reid_assignment.matches.iter().map(|&(_, c)| embs_high[c].clone()).collect();

            self.storage.reactivate(&matched_slots, &matched_dets, frame, Some(&matched_embs));
            reactivated_pool.extend(matched_slots);

            let matched_cols: BTreeSet<usize> =
                reid_assignment.matches.iter().map(|&(_, c)| c).collect();
            let keep: Vec<usize> = (0..dets_high.len()).filter(|c| !matched_cols.contains(c)).collect();
            dets_high = keep.iter().map(|&c| dets_high[c].clone()).collect();
            if self.config.with_reid {
                embs_high = keep.iter().map(|&c| embs_high[c].clone()).collect();
            }
        }

        // -- step 3: first association (tracked + lost) vs. high-conf detections ---
        let mut tracks_pool = union_sorted(&tracked_pool, &self.lost_pool);
        self.storage.multi_predict(&tracks_pool);
        let numerically_removed: Vec<usize> = tracks_pool
            .iter()
            .copied()
            .filter(|&s| self.storage.state(s) == TrackState::Removed)
            .collect();
        removed_this_frame.extend(numerically_removed);
        tracks_pool.retain(|&s| self.storage.state(s) != TrackState::Removed);

        if let Some(h) = &homography {
            if !tracks_pool.is_empty() {
                let boxes: Vec<_> = tracks_pool.iter().map(|&s| self.storage.mean_box(s)).collect();
                let warped = geometry::camera_update(&boxes, h);
                for (&s, box_xywh) in tracks_pool.iter().zip(warped) {
                    self.storage.set_mean_box(s, box_xywh);
                }
            }
        }

        let track_boxes: Vec<_> = tracks_pool.iter().map(|&s| self.storage.mean_box(s)).collect();
        let det_high_boxes: Vec<_> = dets_high.iter().map(|d| d.bbox_xywh).collect();
        let (ious, vrs) = geometry::iou_vr_matrix(&track_boxes, &det_high_boxes);
        let mut iou_dist = ious.map(|v| 1.0 - v);
        let det_high_confs: Vec<f64> = dets_high.iter().map(|d| d.conf).collect();
        geometry::fuse_score(&mut iou_dist, &det_high_confs);

        let cost = if self.config.with_reid && !embs_high.is_empty() {
            let track_embs: Vec<DVector<f64>> = tracks_pool
                .iter()
                .map(|&s| {
                    self.storage
                        .emb(s)
                        .cloned()
                        .unwrap_or_else(|| DVector::zeros(self.embedding_dim.unwrap_or(0)))
                })
                .collect();
            let mut emb_dist = geometry::cosine_distance_matrix(&track_embs, &embs_high).map(|v| v / 2.0);
            let (rows, cols) = iou_dist.shape();
            for i in 0..rows {
                for j in 0..cols {
                    if emb_dist[(i, j)] > self.config.iou_emb_thresh {
                        iou_dist[(i, j)] = 1.0;
                    }
                }
            }
            for i in 0..rows {
                for j in 0..cols {
                    if emb_dist[(i, j)] > self.config.emb_thresh {
                        emb_dist[(i, j)] = 1.0;
                    }
                }
            }
            for i in 0..rows {
                for j in 0..cols {
                    if iou_dist[(i, j)] > self.config.emb_iou_thresh {
                        emb_dist[(i, j)] = 1.0;
                    }
                }
            }
            iou_dist.zip_map(&emb_dist, f64::min)
        } else {
            iou_dist
        };

        let assignment3 = assignment::assign(&cost, self.config.match_thresh);

        let pure_cols: Option<BTreeSet<usize>> = if self.config.with_emb_reactivation {
            let seconds = geometry::second_smallest_per_column(&vrs);
            Some(
                (0..seconds.len())
                    .filter(|&j| seconds[j] > self.config.vr_thresh)
                    .collect(),
            )
        } else {
            None
        };

        let matched_slots3: Vec<usize> = assignment3.matches.iter().map(|&(r, _)| tracks_pool[r]).collect();
        let matched_dets3: Vec<AssocDet> = assignment3.matches.iter().map(|&(_, c)| dets_high[c].clone()).collect();
        let matched_embs3: Option<Vec<DVector<f64>>> = if self.config.with_reid && !embs_high.is_empty() {
            Some(assignment3.matches.iter().map(|&(_, c)| embs_high[c].clone()).collect())
        } else {
            None
        };
        let pure_slots3: Option<Vec<usize>> = pure_cols.as_ref().map(|pure| {
            assignment3
                .matches
                .iter()
                .filter(|&&(_, c)| pure.contains(&c))
                .map(|&(r, _)| tracks_pool[r])
                .collect()
        });

        let (update_slots3, reactivate_slots3) =
            self.process_matches(&matched_slots3, &matched_dets3, matched_embs3.as_deref(), pure_slots3.as_deref(), frame);
        activated_pool.extend(update_slots3);
        reactivated_pool.extend(reactivate_slots3);

        let unmatched_tracks3: Vec<usize> = assignment3.unmatched_rows.iter().map(|&r| tracks_pool[r]).collect();
        let unmatched_dets_high: Vec<AssocDet> =
            assignment3.unmatched_cols.iter().map(|&c| dets_high[c].clone()).collect();
        let unmatched_embs_high: Vec<DVector<f64>> = if self.config.with_reid && !embs_high.is_empty() {
            assignment3.unmatched_cols.iter().map(|&c| embs_high[c].clone()).collect()
        } else {
            Vec::new()
        };

        // -- step 4: second association (remaining tracked-only) vs. low-conf -------
        let remain_tracked: Vec<usize> = unmatched_tracks3
            .iter()
            .copied()
            .filter(|&s| self.storage.state(s) == TrackState::Tracked)
            .collect();
        let det_low_boxes: Vec<_> = dets_low.iter().map(|d| d.bbox_xywh).collect();
        let track_boxes4: Vec<_> = remain_tracked.iter().map(|&s| self.storage.mean_box(s)).collect();
        let iou4 = geometry::iou_matrix(&track_boxes4, &det_low_boxes);
        let iou_dist4 = iou4.map(|v| 1.0 - v);
        let assignment4 = assignment::assign(&iou_dist4, 0.5);

        let matched_slots4: Vec<usize> = assignment4.matches.iter().map(|&(r, _)| remain_tracked[r]).collect();
        let matched_dets4: Vec<AssocDet> = assignment4.matches.iter().map(|&(_, c)| dets_low[c].clone()).collect();
        let (update_slots4, reactivate_slots4) =
            self.process_matches(&matched_slots4, &matched_dets4, None, None, frame);
        activated_pool.extend(update_slots4);
        reactivated_pool.extend(reactivate_slots4);

        let newly_lost: Vec<usize> = assignment4.unmatched_rows.iter().map(|&r| remain_tracked[r]).collect();
        for &s in &newly_lost {
            self.storage.set_state(s, TrackState::Lost);
        }
        lost_this_frame.extend(newly_lost);

        // -- step 5: unconfirmed-track resolution ------------------------------------
        let unconfirmed_boxes: Vec<_> = unconfirmed_pool.iter().map(|&s| self.storage.mean_box(s)).collect();
        let det_high_unmatched_boxes: Vec<_> = unmatched_dets_high.iter().map(|d| d.bbox_xywh).collect();
        let iou5 = geometry::iou_matrix(&unconfirmed_boxes, &det_high_unmatched_boxes);
        let mut iou_dist5 = iou5.map(|v| 1.0 - v);
        let confs5: Vec<f64> = unmatched_dets_high.iter().map(|d| d.conf).collect();
        geometry::fuse_score(&mut iou_dist5, &confs5);
        let assignment5 = assignment::assign(&iou_dist5, 0.7);

        let matched_slots5: Vec<usize> = assignment5.matches.iter().map(|&(r, _)| unconfirmed_pool[r]).collect();
        let matched_dets5: Vec<AssocDet> = assignment5.matches.iter().map(|&(_, c)| unmatched_dets_high[c].clone()).collect();
        let matched_embs5: Option<Vec<DVector<f64>>> = if self.config.with_reid && !unmatched_embs_high.is_empty() {
            Some(assignment5.matches.iter().map(|&(_, c)| unmatched_embs_high[c].clone()).collect())
        } else {
            None
        };
        self.storage.update(&matched_slots5, &matched_dets5, frame, matched_embs5.as_deref(), None, None);
        activated_pool.extend(matched_slots5.iter().copied());

        let removed_unconfirmed: Vec<usize> = assignment5.unmatched_rows.iter().map(|&r| unconfirmed_pool[r]).collect();
        for &s in &removed_unconfirmed {
            self.storage.set_state(s, TrackState::Removed);
        }
        removed_this_frame.extend(removed_unconfirmed);

        let remaining_high_dets: Vec<AssocDet> =
            assignment5.unmatched_cols.iter().map(|&c| unmatched_dets_high[c].clone()).collect();
        let remaining_high_embs: Vec<DVector<f64>> = if self.config.with_reid && !unmatched_embs_high.is_empty() {
            assignment5.unmatched_cols.iter().map(|&c| unmatched_embs_high[c].clone()).collect()
        } else {
            Vec::new()
        };

        // -- step 6: birth ------------------------------------------------------------
        let new_thresh = self.config.track_new_thresh;
        let mut new_dets: Vec<AssocDet> = Vec::new();
        let mut new_embs: Vec<DVector<f64>> = Vec::new();
        for (i, d) in remaining_high_dets.iter().enumerate() {
            if d.conf >= new_thresh {
                new_dets.push(d.clone());
                if let Some(e) = remaining_high_embs.get(i) {
                    new_embs.push(e.clone());
                }
            }
        }
        let new_embs_opt: Option<&[DVector<f64>]> = if self.config.with_reid && !new_embs.is_empty() {
            Some(&new_embs)
        } else {
            None
        };
        let new_slots = self.storage.activate(&new_dets, frame, new_embs_opt)?;
        activated_pool.extend(new_slots);

        // -- step 7: lifecycle tick ---------------------------------------------------
        let output_pool =
            self.update_lifecycle(removed_this_frame, activated_pool, reactivated_pool, lost_this_frame);

        // -- step 8: emit --------------------------------------------------------------
        let mut outputs: Vec<OutputTrack> = output_pool
            .into_iter()
            .map(|slot| OutputTrack {
                bbox: geometry::xywh_to_xyxy(self.storage.mean_box(slot)),
                id: self.storage.id_of(slot).expect("output slot must be live"),
                conf: self.storage.conf(slot),
                class: self.storage.effective_class(slot),
                det_id: self.storage.det_id(slot),
            })
            .collect();
        outputs.sort_by_key(|t| t.id);
        Ok(outputs)
    }

    /// Ids currently in the active (`Tracked`) pool.
    pub fn active_ids(&self) -> Vec<u32> {
        self.active_pool.iter().filter_map(|&s| self.storage.id_of(s)).collect()
    }

    /// Ids currently in the `Lost` pool.
    pub fn lost_ids(&self) -> Vec<u32> {
        self.lost_pool.iter().filter_map(|&s| self.storage.id_of(s)).collect()
    }

    /// Ids currently in the `Reidable` pool.
    pub fn reidable_ids(&self) -> Vec<u32> {
        self.reidable_pool.iter().filter_map(|&s| self.storage.id_of(s)).collect()
    }

    /// The state of the track with the given id, if its storage slot hasn't been
    /// reclaimed by compaction yet.
    pub fn state_of(&self, id: u32) -> Option<TrackState> {
        let slot = self.storage.slot_of(id)?;
        Some(self.storage.state(slot))
    }

    /// Splits matched (track slot, detection) pairs by whether the track was already
    /// `Tracked` (plain update) or recovering from `Lost`/`Reidable` (reactivate), and
    /// applies the corresponding storage operation. Returns (updated slots, reactivated
    /// slots).
    fn process_matches(
        &mut self,
        matched_slots: &[usize],
        matched_dets: &[AssocDet],
        matched_embs: Option<&[DVector<f64>]>,
        pure_slots: Option<&[usize]>,
        frame: u64,
    ) -> (Vec<usize>, Vec<usize>) {
        let mut update_slots = Vec::new();
        let mut update_dets = Vec::new();
        let mut update_embs = Vec::new();
        let mut reactivate_slots = Vec::new();
        let mut reactivate_dets = Vec::new();

        for (idx, (&slot, det)) in matched_slots.iter().zip(matched_dets).enumerate() {
            if self.storage.state(slot) == TrackState::Tracked {
                update_slots.push(slot);
                update_dets.push(det.clone());
                if let Some(embs) = matched_embs {
                    update_embs.push(embs[idx].clone());
                }
            } else {
                reactivate_slots.push(slot);
                reactivate_dets.push(det.clone());
            }
        }

        let (pure_slots_vec, pure_embs_vec): (Vec<usize>, Vec<DVector<f64>>) = match pure_slots {
            Some(pure) if !update_embs.is_empty() => update_slots
                .iter()
                .zip(update_embs.iter())
                .filter(|(&slot, _)| pure.contains(&slot))
                .map(|(&slot, emb)| (slot, emb.clone()))
                .unzip(),
            _ => (Vec::new(), Vec::new()),
        };

        let update_embs_opt = if update_embs.is_empty() { None } else { Some(update_embs.as_slice()) };
        let pure_slots_opt = if pure_slots_vec.is_empty() { None } else { Some(pure_slots_vec.as_slice()) };
        let pure_embs_opt = if pure_embs_vec.is_empty() { None } else { Some(pure_embs_vec.as_slice()) };

        self.storage.update(&update_slots, &update_dets, frame, update_embs_opt, pure_slots_opt, pure_embs_opt);
        self.storage.reactivate(&reactivate_slots, &reactivate_dets, frame, None);

        (update_slots, reactivate_slots)
    }

    fn update_lifecycle(
        &mut self,
        mut removed_this_frame: Vec<usize>,
        activated: Vec<usize>,
        reactivated: Vec<usize>,
        lost_this_frame: Vec<usize>,
    ) -> Vec<usize> {
        let frame = self.frame_count;
        let max_lost = self.config.max_frames_lost();
        let max_reidable = self.config.max_frames_reidable();

        let reidable_new: Vec<usize> = if self.config.with_emb_reactivation {
            let (over, _under): (Vec<usize>, Vec<usize>) = self
                .lost_pool
                .iter()
                .copied()
                .partition(|&s| frame.saturating_sub(self.storage.frame_id(s)) > max_lost);
            for &s in &over {
                self.storage.set_state(s, TrackState::Reidable);
                self.storage.set_frame_id(s, frame);
                log::debug!("track {:?} transitioned lost -> reidable at frame {frame}", self.storage.id_of(s));
            }
            let expired_reidable: Vec<usize> = self
                .reidable_pool
                .iter()
                .copied()
                .filter(|&s| frame.saturating_sub(self.storage.frame_id(s)) > max_reidable)
                .collect();
            for &s in &expired_reidable {
                self.storage.set_state(s, TrackState::Removed);
                log::debug!("track {:?} reidable budget expired at frame {frame}", self.storage.id_of(s));
            }
            removed_this_frame.extend(expired_reidable);
            over
        } else {
            let expired_lost: Vec<usize> = self
                .lost_pool
                .iter()
                .copied()
                .filter(|&s| frame.saturating_sub(self.storage.frame_id(s)) > max_lost)
                .collect();
            for &s in &expired_lost {
                self.storage.set_state(s, TrackState::Removed);
            }
            removed_this_frame.extend(expired_lost);
            Vec::new()
        };

        self.removed_pool = union_sorted(&self.removed_pool, &removed_this_frame);

        self.active_pool.retain(|&s| self.storage.state(s) == TrackState::Tracked);
        self.active_pool = union_sorted(&self.active_pool, &activated);
        self.active_pool = union_sorted(&self.active_pool, &reactivated);

        self.lost_pool = difference_sorted(&self.lost_pool, &self.active_pool);
        self.lost_pool = union_sorted(&self.lost_pool, &lost_this_frame);
        self.lost_pool = difference_sorted(&self.lost_pool, &reidable_new);
        self.lost_pool = difference_sorted(&self.lost_pool, &self.removed_pool);

        if self.config.with_emb_reactivation {
            self.reidable_pool = difference_sorted(&self.reidable_pool, &self.active_pool);
            self.reidable_pool = union_sorted(&self.reidable_pool, &reidable_new);
            self.reidable_pool = difference_sorted(&self.reidable_pool, &self.removed_pool);
        }

        self.remove_duplicates();

        if self.config.cleanup_every > 0 && frame % self.config.cleanup_every == 0 {
            let mut save = union_sorted(&self.active_pool, &self.lost_pool);
            save = union_sorted(&save, &self.reidable_pool);
            self.storage.cleanup(&save);
            self.removed_pool = intersect_sorted(&self.removed_pool, &save);
            log::debug!("periodic cleanup at frame {frame}: retained {} live slots", save.len());
        }

        self.active_pool
            .iter()
            .copied()
            .filter(|&s| self.storage.is_activated(s))
            .collect()
    }

    /// Drops the shorter-lived of any active/lost pair of tracks whose boxes overlap
    /// enough (IoU distance below 0.15) to plausibly be duplicate detections of the
    /// same object. Ties drop the active-side track.
    fn remove_duplicates(&mut self) {
        if self.active_pool.is_empty() || self.lost_pool.is_empty() {
            return;
        }
        let active_boxes: Vec<_> = self.active_pool.iter().map(|&s| self.storage.mean_box(s)).collect();
        let lost_boxes: Vec<_> = self.lost_pool.iter().map(|&s| self.storage.mean_box(s)).collect();
        let ious = geometry::iou_matrix(&active_boxes, &lost_boxes);

        let mut drop_active: std::collections::HashSet<usize> = std::collections::HashSet::new();
        let mut drop_lost: std::collections::HashSet<usize> = std::collections::HashSet::new();

        for i in 0..self.active_pool.len() {
            for j in 0..self.lost_pool.len() {
                if 1.0 - ious[(i, j)] < 0.15 {
                    let slot_a = self.active_pool[i];
                    let slot_b = self.lost_pool[j];
                    let life_a = self.storage.frame_id(slot_a) as i64 - self.storage.start_frame(slot_a) as i64;
                    let life_b = self.storage.frame_id(slot_b) as i64 - self.storage.start_frame(slot_b) as i64;
                    if life_a <= life_b {
                        drop_active.insert(slot_a);
                    } else {
                        drop_lost.insert(slot_b);
                    }
                }
            }
        }
        self.active_pool.retain(|s| !drop_active.contains(s));
        self.lost_pool.retain(|s| !drop_lost.contains(s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;
    use rstest::rstest;

    fn det(bbox: Xyxy, conf: f64) -> Detection {
        Detection { bbox, conf, class: 0 }
    }

    fn no_reid_config() -> TrackerConfig {
        TrackerConfig { with_reid: false, ..TrackerConfig::default() }
    }

    fn tracker(config: TrackerConfig) -> Tracker {
        Tracker::new(config, None, None)
    }

    /// Always returns the same embedding per box, regardless of pixel contents — good
    /// enough to exercise the `with_reid`-without-precomputed-embeddings path.
    struct ConstantExtractor {
        emb: DVector<f64>,
    }

    impl EmbeddingExtractor for ConstantExtractor {
        fn extract(&mut self, boxes: &[Xyxy], _image: &Image) -> Result<Vec<DVector<f64>>, TrackError> {
            Ok(boxes.iter().map(|_| self.emb.clone()).collect())
        }
    }

    /// Always reports no camera motion.
    struct IdentityEcc;

    impl CameraMotionEstimator for IdentityEcc {
        fn estimate(&mut self, _image: &Image, _frame_id: u64) -> Result<SMatrix<f64, 3, 3>, TrackError> {
            Ok(SMatrix::<f64, 3, 3>::identity())
        }
    }

    fn blank_image() -> Image<'static> {
        Image { data: &[], width: 0, height: 0, channels: 0 }
    }

    #[test]
    fn update_uses_injected_extractor_when_no_embeddings_supplied() {
        let config = TrackerConfig { with_reid: true, ..TrackerConfig::default() };
        let extractor = ConstantExtractor { emb: DVector::from_vec(vec![1.0, 0.0]) };
        let mut t = Tracker::new(config, Some(Box::new(extractor)), None);

        let image = blank_image();
        let out = t.update(&[det([10.0, 10.0, 50.0, 60.0], 0.9)], Some(&image), None).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 1);
    }

    #[test]
    fn update_without_reid_requires_no_image() {
        let mut t = tracker(no_reid_config());
        let out = t.update(&[det([10.0, 10.0, 50.0, 60.0], 0.9)], None, None).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn update_with_reid_and_no_extractor_or_embeddings_errors() {
        let config = TrackerConfig { with_reid: true, ..TrackerConfig::default() };
        let mut t = Tracker::new(config, None, None);
        let result = t.update(&[det([10.0, 10.0, 50.0, 60.0], 0.9)], None, None);
        assert!(matches!(result, Err(TrackError::InvalidInput(_))));
    }

    #[test]
    fn update_applies_camera_compensation_without_disturbing_a_static_track() {
        let config = TrackerConfig { with_reid: false, with_ecc: true, ..TrackerConfig::default() };
        let mut t = Tracker::new(config, None, Some(Box::new(IdentityEcc)));

        let image = blank_image();
        let out1 = t.update(&[det([10.0, 10.0, 50.0, 60.0], 0.9)], Some(&image), None).unwrap();
        let id = out1[0].id;

        let out2 = t.update(&[det([11.0, 11.0, 51.0, 61.0], 0.9)], Some(&image), None).unwrap();
        assert_eq!(out2[0].id, id);
        assert_relative_eq(out2[0].bbox, [11.0, 11.0, 51.0, 61.0]);
    }

    #[test]
    fn update_with_ecc_and_no_image_errors() {
        let config = TrackerConfig { with_ecc: true, ..TrackerConfig::default() };
        let mut t = Tracker::new(config, None, Some(Box::new(IdentityEcc)));
        let result = t.update(&[det([10.0, 10.0, 50.0, 60.0], 0.9)], None, None);
        assert!(matches!(result, Err(TrackError::InvalidInput(_))));
    }

    // -- scenario 1: single detection, birth on frame 1 -----------------------------

    #[test]
    fn scenario_birth_on_frame_one() {
        let mut t = tracker(no_reid_config());
        let out = t.update(&[det([10.0, 10.0, 50.0, 60.0], 0.9)], None, None).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 1);
        assert_relative_eq(out[0].bbox, [10.0, 10.0, 50.0, 60.0]);
    }

    // -- scenario 2: birth, then confirmed match on frame 2 --------------------------

    #[test]
    fn scenario_birth_confirm_match() {
        let mut t = tracker(no_reid_config());
        let out1 = t.update(&[det([10.0, 10.0, 50.0, 60.0], 0.9)], None, None).unwrap();
        assert_eq!(out1[0].id, 1);

        let out2 = t.update(&[det([12.0, 11.0, 52.0, 61.0], 0.92)], None, None).unwrap();
        assert_eq!(out2.len(), 1);
        assert_eq!(out2[0].id, 1);
        assert_relative_eq(out2[0].bbox, [12.0, 11.0, 52.0, 61.0]);
    }

    // -- scenario 3: low-confidence rescue via the second association stage ---------

    #[test]
    fn scenario_low_conf_rescue() {
        let config = TrackerConfig {
            with_reid: false,
            track_high_thresh: 0.6,
            track_low_thresh: 0.3,
            ..TrackerConfig::default()
        };
        let mut t = tracker(config);
        let out1 = t.update(&[det([10.0, 10.0, 50.0, 60.0], 0.9)], None, None).unwrap();
        let id = out1[0].id;

        let out2 = t.update(&[det([11.0, 11.0, 51.0, 61.0], 0.4)], None, None).unwrap();
        assert_eq!(out2.len(), 1);
        assert_eq!(out2[0].id, id, "low-confidence detection should rescue the existing track");
    }

    // -- scenario 4: loss, then reID reactivation ------------------------------------

    #[test]
    fn scenario_loss_and_reid_reactivation() {
        let config = TrackerConfig {
            with_reid: true,
            with_emb_reactivation: true,
            frame_rate: 1,
            max_time_lost: 3.0,
            max_time_reidable: 6.0,
            emb_reid_thresh: 0.1,
            ..TrackerConfig::default()
        };
        let mut t = tracker(config);

        let emb = DVector::from_vec(vec![1.0, 0.0]);
        let out1 = t.update(&[det([10.0, 10.0, 30.0, 30.0], 0.9)], None, Some(&[emb.clone()])).unwrap();
        let id = out1[0].id;

        // frames 2..5: no detections at all; embs is `Some(&[])` to keep the with_reid
        // path satisfied without needing a mock extractor.
        for _ in 0..4 {
            let out = t.update(&[], None, Some(&[])).unwrap();
            assert!(out.is_empty());
        }

        // by now the track has gone Lost -> Reidable; a matching embedding reactivates
        // it under the same id.
        let out_reactivate =
            t.update(&[det([10.0, 10.0, 30.0, 30.0], 0.9)], None, Some(&[emb])).unwrap();
        assert_eq!(out_reactivate.len(), 1);
        assert_eq!(out_reactivate[0].id, id, "reID should recover the same identity");
    }

    #[test]
    fn scenario_loss_without_reid_mints_new_id() {
        let config = TrackerConfig {
            with_reid: false,
            with_emb_reactivation: false,
            frame_rate: 1,
            max_time_lost: 3.0,
            ..TrackerConfig::default()
        };
        let mut t = tracker(config);
        let out1 = t.update(&[det([10.0, 10.0, 30.0, 30.0], 0.9)], None, None).unwrap();
        let old_id = out1[0].id;

        for _ in 0..5 {
            let out = t.update(&[], None, None).unwrap();
            assert!(out.is_empty());
        }

        let out2 = t.update(&[det([10.0, 10.0, 30.0, 30.0], 0.9)], None, None).unwrap();
        assert_eq!(out2.len(), 1);
        assert_ne!(out2[0].id, old_id, "without reID, a removed track's old id is never reused");
    }

    // -- scenario 5: duplicate suppression -------------------------------------------

    #[test]
    fn scenario_duplicate_suppression_keeps_longer_lived_track() {
        let mut t = tracker(no_reid_config());
        let box_xywh = geometry::xyxy_to_xywh([0.0, 0.0, 20.0, 20.0]);
        let d = AssocDet { bbox_xywh: box_xywh, conf: 0.9, class: 0, det_id: 0 };
        let slots = t.storage.activate(&[d.clone(), d], 1, None).unwrap();
        let (long_lived, short_lived) = (slots[0], slots[1]);
        t.storage.set_frame_id(long_lived, 10);
        t.storage.set_frame_id(short_lived, 2);
        t.active_pool = vec![long_lived];
        t.lost_pool = vec![short_lived];

        t.remove_duplicates();

        assert_eq!(t.active_pool, vec![long_lived]);
        assert!(t.lost_pool.is_empty(), "the shorter-lived duplicate should be dropped");
    }

    // -- scenario 6: occlusion gates the pure embedding ------------------------------

    // Two tracks born on top of each other, then a single high-confidence detection
    // matches the better-aligned one. With a second track also plausibly explaining
    // the same detection, its visibility ratio's second-smallest column value drops
    // below `vr_thresh`: the match still refreshes the running embedding, but the
    // pure embedding must not move.
    #[test]
    fn scenario_occlusion_gates_pure_embedding() {
        let config = TrackerConfig {
            with_reid: true,
            with_emb_reactivation: true,
            vr_thresh: 0.3,
            ..TrackerConfig::default()
        };
        let mut t = tracker(config);

        let emb_a = DVector::from_vec(vec![1.0, 0.0]);
        let emb_b = DVector::from_vec(vec![1.0, 0.0]);
        let out1 = t
            .update(
                &[det([0.0, 0.0, 20.0, 20.0], 0.9), det([0.5, 0.5, 20.5, 20.5], 0.9)],
                None,
                Some(&[emb_a, emb_b]),
            )
            .unwrap();
        assert_eq!(out1.len(), 2);
        let track_a_id = out1[0].id;

        let new_emb = DVector::from_vec(vec![0.0, 1.0]);
        t.update(&[det([0.0, 0.0, 20.0, 20.0], 0.95)], None, Some(&[new_emb])).unwrap();

        let slot = t
            .active_pool
            .iter()
            .copied()
            .find(|&s| t.storage.id_of(s) == Some(track_a_id))
            .expect("track A should still be active");
        let pure = t.storage.pure_emb(slot).unwrap();
        let running = t.storage.emb(slot).unwrap();
        approx::assert_relative_eq!(pure[0], 1.0, epsilon = 1e-6);
        approx::assert_relative_eq!(pure[1], 0.0, epsilon = 1e-6);
        assert!(running[1] > 0.0, "running embedding should move toward the new observation");
    }

    // -- §9 cross-gate order sensitivity ---------------------------------------------

    #[rstest]
    #[case(0.5, 1.0, 1.0, true)] // emb_dist exceeds iou_emb_thresh: iou forced to 1 first
    #[case(1.0, 0.5, 1.0, false)] // emb_dist within iou_emb_thresh: iou survives first gate
    fn cross_gate_order_matters(
        #[case] iou_emb_thresh: f64,
        #[case] emb_thresh: f64,
        #[case] emb_iou_thresh: f64,
        #[case] iou_forced_to_max: bool,
    ) {
        // with emb_dist = 0.6: it exceeds iou_emb_thresh=0.5 in the first case (forcing
        // iou_dist to 1), but not in the second (iou_emb_thresh=1.0, so iou survives).
        let mut iou_dist = nalgebra::DMatrix::from_row_slice(1, 1, &[0.2]);
        let mut emb_dist = nalgebra::DMatrix::from_row_slice(1, 1, &[0.6]);
        if emb_dist[(0, 0)] > iou_emb_thresh {
            iou_dist[(0, 0)] = 1.0;
        }
        if emb_dist[(0, 0)] > emb_thresh {
            emb_dist[(0, 0)] = 1.0;
        }
        if iou_dist[(0, 0)] > emb_iou_thresh {
            emb_dist[(0, 0)] = 1.0;
        }
        assert_eq!(iou_dist[(0, 0)] >= 1.0, iou_forced_to_max);
    }

    fn assert_relative_eq(a: Xyxy, b: Xyxy) {
        for i in 0..4 {
            approx::assert_relative_eq!(a[i], b[i], epsilon = 1e-6);
        }
    }
}
