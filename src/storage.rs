//! Structure-of-arrays track storage, addressed by recyclable slot index with a
//! persistent, monotonically increasing track id layered on top.
//!
//! This replaces the dynamic-attribute, growth-by-id-reuse-never storage that this
//! design's reference implementation used: here, ids and slots are two different
//! things. An id is assigned once and never reused; a slot is freed by `cleanup` and
//! handed back out by a later `activate` call. Pools (`active`, `lost`, `reidable`,
//! `removed`) hold slot indices, not ids — the tracker core maps to/from ids only at
//! the point it emits output rows.

use std::collections::HashMap;

use nalgebra::DVector;

use crate::class_vote::ClassHistory;
use crate::config::{ClassMode, EmbeddingMode};
use crate::embedding::update_embedding;
use crate::error::TrackError;
use crate::geometry::Xywh;
use crate::motion::{Cov, KalmanFilterXywh, Mean};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    Tracked,
    Lost,
    Reidable,
    Removed,
}

/// One detection already assigned to xywh form, carrying its originating row index.
#[derive(Clone, Debug)]
pub struct AssocDet {
    pub bbox_xywh: Xywh,
    pub conf: f64,
    pub class: u32,
    pub det_id: usize,
}

#[derive(Default)]
struct IdSlotManager {
    id_to_slot: HashMap<u32, usize>,
    slot_to_id: Vec<Option<u32>>,
    free_slots: Vec<usize>,
    max_id: u32,
}

impl IdSlotManager {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            id_to_slot: HashMap::new(),
            slot_to_id: vec![None; capacity],
            free_slots: (0..capacity).rev().collect(),
            max_id: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slot_to_id.len()
    }

    fn free_len(&self) -> usize {
        self.free_slots.len()
    }

    fn grow_to(&mut self, new_capacity: usize) {
        let old_capacity = self.capacity();
        if new_capacity <= old_capacity {
            return;
        }
        self.slot_to_id.resize(new_capacity, None);
        self.free_slots.extend((old_capacity..new_capacity).rev());
    }

    fn next_id(&mut self) -> u32 {
        self.max_id += 1;
        self.max_id
    }

    fn bind(&mut self, id: u32) -> usize {
        let slot = self.free_slots.pop().expect("ensure_capacity violated: no free slot");
        self.id_to_slot.insert(id, slot);
        self.slot_to_id[slot] = Some(id);
        slot
    }

    fn unbind(&mut self, id: u32) {
        if let Some(slot) = self.id_to_slot.remove(&id) {
            self.slot_to_id[slot] = None;
            self.free_slots.push(slot);
        }
    }

    fn id_of(&self, slot: usize) -> Option<u32> {
        self.slot_to_id.get(slot).copied().flatten()
    }

    fn slot_of(&self, id: u32) -> Option<usize> {
        self.id_to_slot.get(&id).copied()
    }

    fn live_slots(&self) -> Vec<usize> {
        self.id_to_slot.values().copied().collect()
    }
}

pub struct TrackStorage {
    manager: IdSlotManager,
    kalman: KalmanFilterXywh,
    emb_mode: EmbeddingMode,
    emb_ema_alpha: f64,
    class_mode: ClassMode,
    auto_grow: bool,

    means: Vec<Mean>,
    covs: Vec<Cov>,
    boxes: Vec<Xywh>,
    confs: Vec<f64>,
    classes: Vec<u32>,
    det_ids: Vec<i64>,
    embs: Vec<Option<DVector<f64>>>,
    pure_embs: Vec<Option<DVector<f64>>>,
    states: Vec<TrackState>,
    is_activated: Vec<bool>,
    frame_ids: Vec<u64>,
    start_frames: Vec<u64>,
    history: Vec<ClassHistory>,
}

impl TrackStorage {
    pub fn new(
        initial_capacity: usize,
        auto_grow: bool,
        kalman: KalmanFilterXywh,
        emb_mode: EmbeddingMode,
        emb_ema_alpha: f64,
        class_mode: ClassMode,
    ) -> Self {
        let manager = IdSlotManager::with_capacity(initial_capacity);
        let cap = manager.capacity();
        Self {
            manager,
            kalman,
            emb_mode,
            emb_ema_alpha,
            class_mode,
            auto_grow,
            means: vec![Mean::zeros(); cap],
            covs: vec![Cov::zeros(); cap],
            boxes: vec![[0.0; 4]; cap],
            confs: vec![0.0; cap],
            classes: vec![0; cap],
            det_ids: vec![-1; cap],
            embs: vec![None; cap],
            pure_embs: vec![None; cap],
            states: vec![TrackState::Removed; cap],
            is_activated: vec![false; cap],
            frame_ids: vec![0; cap],
            start_frames: vec![0; cap],
            history: vec![ClassHistory::default(); cap],
        }
    }

    fn ensure_capacity(&mut self, additional: usize) -> Result<(), TrackError> {
        if self.manager.free_len() >= additional {
            return Ok(());
        }
        if !self.auto_grow {
            return Err(TrackError::StorageFull {
                requested: additional,
                available: self.manager.free_len(),
            });
        }
        let occupied = self.manager.capacity() - self.manager.free_len();
        let mut new_capacity = self.manager.capacity().max(1);
        while new_capacity - occupied < additional {
            new_capacity *= 2;
        }
        self.grow_to(new_capacity);
        Ok(())
    }

    fn grow_to(&mut self, new_capacity: usize) {
        let old_capacity = self.manager.capacity();
        if new_capacity <= old_capacity {
            return;
        }
        self.manager.grow_to(new_capacity);
        self.means.resize(new_capacity, Mean::zeros());
        self.covs.resize(new_capacity, Cov::zeros());
        self.boxes.resize(new_capacity, [0.0; 4]);
        self.confs.resize(new_capacity, 0.0);
        self.classes.resize(new_capacity, 0);
        self.det_ids.resize(new_capacity, -1);
        self.embs.resize(new_capacity, None);
        self.pure_embs.resize(new_capacity, None);
        self.states.resize(new_capacity, TrackState::Removed);
        self.is_activated.resize(new_capacity, false);
        self.frame_ids.resize(new_capacity, 0);
        self.start_frames.resize(new_capacity, 0);
        self.history.resize(new_capacity, ClassHistory::default());
    }

    // -- accessors -----------------------------------------------------------------

    pub fn id_of(&self, slot: usize) -> Option<u32> {
        self.manager.id_of(slot)
    }

    pub fn slot_of(&self, id: u32) -> Option<usize> {
        self.manager.slot_of(id)
    }

    pub fn state(&self, slot: usize) -> TrackState {
        self.states[slot]
    }

    pub fn set_state(&mut self, slot: usize, state: TrackState) {
        self.states[slot] = state;
    }

    pub fn is_activated(&self, slot: usize) -> bool {
        self.is_activated[slot]
    }

    pub fn mean_box(&self, slot: usize) -> Xywh {
        let mean = &self.means[slot];
        [mean[0], mean[1], mean[2], mean[3]]
    }

    pub fn set_mean_box(&mut self, slot: usize, xywh: Xywh) {
        self.means[slot][0] = xywh[0];
        self.means[slot][1] = xywh[1];
        self.means[slot][2] = xywh[2];
        self.means[slot][3] = xywh[3];
    }

    pub fn conf(&self, slot: usize) -> f64 {
        self.confs[slot]
    }

    pub fn effective_class(&self, slot: usize) -> u32 {
        self.history[slot].resolve(self.classes[slot])
    }

    pub fn det_id(&self, slot: usize) -> i64 {
        self.det_ids[slot]
    }

    pub fn frame_id(&self, slot: usize) -> u64 {
        self.frame_ids[slot]
    }

    pub fn set_frame_id(&mut self, slot: usize, frame_id: u64) {
        self.frame_ids[slot] = frame_id;
    }

    pub fn start_frame(&self, slot: usize) -> u64 {
        self.start_frames[slot]
    }

    pub fn emb(&self, slot: usize) -> Option<&DVector<f64>> {
        self.embs[slot].as_ref()
    }

    pub fn pure_emb(&self, slot: usize) -> Option<&DVector<f64>> {
        self.pure_embs[slot].as_ref()
    }

    // -- batch motion operations -----------------------------------------------------

    /// Predicts every slot one step forward. Non-`Tracked` tracks have their
    /// height-velocity component zeroed first (a lost track's last known vertical
    /// motion shouldn't be extrapolated indefinitely). A slot whose prediction goes
    /// non-finite is marked `Removed` and logged; the caller is expected to drop it
    /// from whatever pool it was drawn from.
    pub fn multi_predict(&mut self, slots: &[usize]) {
        if slots.is_empty() {
            return;
        }
        let mut means: Vec<Mean> = slots.iter().map(|&s| self.means[s]).collect();
        let covs: Vec<Cov> = slots.iter().map(|&s| self.covs[s]).collect();
        for (i, &s) in slots.iter().enumerate() {
            if self.states[s] != TrackState::Tracked {
                means[i][7] = 0.0;
            }
        }
        let results = self.kalman.multi_predict(&means, &covs);
        for (&s, result) in slots.iter().zip(results) {
            match result {
                Some((mean, cov)) => {
                    self.means[s] = mean;
                    self.covs[s] = cov;
                }
                None => {
                    log::warn!("kalman predict produced a non-finite state for slot {s}; removing track");
                    self.states[s] = TrackState::Removed;
                }
            }
        }
    }

    /// Updates already-`Tracked` slots with their matched detections: Kalman update,
    /// box/conf/class/det_id bookkeeping, class history push, and (when supplied)
    /// running and pure embedding refresh.
    pub fn update(
        &mut self,
        slots: &[usize],
        dets: &[AssocDet],
        frame_id: u64,
        embs: Option<&[DVector<f64>]>,
        pure_slots: Option<&[usize]>,
        pure_embs: Option<&[DVector<f64>]>,
    ) {
        self.apply_measurement(slots, dets, frame_id);
        if let Some(embs) = embs {
            for (&s, e) in slots.iter().zip(embs) {
                let blended = update_embedding(self.embs[s].as_ref(), e, self.emb_mode, self.emb_ema_alpha);
                self.embs[s] = Some(blended);
            }
        }
        if let (Some(pslots), Some(pembs)) = (pure_slots, pure_embs) {
            for (&s, e) in pslots.iter().zip(pembs) {
                let blended = update_embedding(self.pure_embs[s].as_ref(), e, self.emb_mode, self.emb_ema_alpha);
                self.pure_embs[s] = Some(blended);
            }
        }
    }

    /// Brings a `Lost`/`Reidable` slot back to `Tracked` with a matched detection.
    /// Embeddings are only refreshed when `embs` is `Some` — the cascade reactivation
    /// path (second/unconfirmed association recovering a lost track by motion alone)
    /// intentionally passes `None`, while ReID reactivation against the `Reidable` pool
    /// passes the matched detection's embedding.
    pub fn reactivate(
        &mut self,
        slots: &[usize],
        dets: &[AssocDet],
        frame_id: u64,
        embs: Option<&[DVector<f64>]>,
    ) {
        self.apply_measurement(slots, dets, frame_id);
        for &s in slots {
            self.states[s] = TrackState::Tracked;
        }
        if let Some(embs) = embs {
            for (&s, e) in slots.iter().zip(embs) {
                let blended = update_embedding(self.embs[s].as_ref(), e, self.emb_mode, self.emb_ema_alpha);
                self.embs[s] = Some(blended);
            }
        }
    }

    fn apply_measurement(&mut self, slots: &[usize], dets: &[AssocDet], frame_id: u64) {
        if slots.is_empty() || dets.is_empty() {
            return;
        }
        debug_assert_eq!(slots.len(), dets.len());
        let means: Vec<Mean> = slots.iter().map(|&s| self.means[s]).collect();
        let covs: Vec<Cov> = slots.iter().map(|&s| self.covs[s]).collect();
        let measurements: Vec<[f64; 4]> = dets.iter().map(|d| d.bbox_xywh).collect();
        let results = self.kalman.multi_update(&means, &covs, &measurements);
        for ((&s, det), result) in slots.iter().zip(dets).zip(results) {
            let Some((mean, cov)) = result else {
                log::warn!("kalman update produced a non-finite state for slot {s}; removing track");
                self.states[s] = TrackState::Removed;
                continue;
            };
            self.means[s] = mean;
            self.covs[s] = cov;
            self.boxes[s] = det.bbox_xywh;
            self.confs[s] = det.conf;
            self.classes[s] = det.class;
            self.det_ids[s] = det.det_id as i64;
            self.history[s].push(det.class, det.conf, self.class_mode);
            self.is_activated[s] = true;
            self.frame_ids[s] = frame_id;
        }
    }

    /// Spawns a brand-new track per detection, assigning contiguous ids from
    /// `max_id + 1`. A new track is only considered "confirmed" (`is_activated`) if
    /// this is the very first frame — otherwise it waits for the unconfirmed-track
    /// resolution stage to confirm it on a subsequent frame.
    pub fn activate(
        &mut self,
        dets: &[AssocDet],
        frame_id: u64,
        embs: Option<&[DVector<f64>]>,
    ) -> Result<Vec<usize>, TrackError> {
        if dets.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_capacity(dets.len())?;
        let mut slots = Vec::with_capacity(dets.len());
        for det in dets {
            let id = self.manager.next_id();
            let slot = self.manager.bind(id);
            let (mean, cov) = self.kalman.initiate(det.bbox_xywh);
            self.means[slot] = mean;
            self.covs[slot] = cov;
            self.boxes[slot] = det.bbox_xywh;
            self.confs[slot] = det.conf;
            self.classes[slot] = det.class;
            self.det_ids[slot] = det.det_id as i64;
            self.history[slot] = ClassHistory::default();
            self.history[slot].push(det.class, det.conf, self.class_mode);
            self.states[slot] = TrackState::Tracked;
            self.frame_ids[slot] = frame_id;
            self.start_frames[slot] = frame_id;
            self.is_activated[slot] = frame_id == 1;
            self.embs[slot] = None;
            self.pure_embs[slot] = None;
            slots.push(slot);
        }
        if let Some(embs) = embs {
            for (&s, e) in slots.iter().zip(embs) {
                let normalized = update_embedding(None, e, self.emb_mode, self.emb_ema_alpha);
                self.embs[s] = Some(normalized.clone());
                self.pure_embs[s] = Some(normalized);
            }
        }
        Ok(slots)
    }

    /// Frees every live slot not present in `save_slots`, recycling its id->slot
    /// mapping for a future `activate` call. Ids themselves are never reused.
    pub fn cleanup(&mut self, save_slots: &[usize]) {
        let save: std::collections::HashSet<usize> = save_slots.iter().copied().collect();
        for slot in self.manager.live_slots() {
            if !save.contains(&slot) {
                if let Some(id) = self.manager.id_of(slot) {
                    self.manager.unbind(id);
                }
            }
        }
    }
}
