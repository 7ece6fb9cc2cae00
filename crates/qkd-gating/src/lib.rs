//! Detection gating: aligns a site's raw detector timing stream against the
//! peer's reference markers to recover a shared qubit sequence (spec §4.1).
//!
//! Grounded in `CQPToolkit/Alignment/DetectionGating.{h,cpp}`: the shape of
//! the algorithm (count into bins, vote on the busiest bin range to track
//! clock drift, then score candidate slot offsets against the peer's
//! markers) is unchanged. The concurrency primitive is not: the original's
//! hand-rolled atomic-counter-plus-condvar staging is replaced with
//! `std::sync::Barrier` across a `std::thread::scope`, which expresses the
//! same three-phase fork/join without a bespoke wait predicate.

mod error;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Barrier, Mutex};

pub use error::GatingError;
use qkd_types::{BinId, QubitByIndex, SlotId};
use qkd_types::{Basis, DetectionReport, Qubit};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

pub const DEFAULT_OFFSET_TEST_RANGE: u64 = 100;
pub const DEFAULT_ACCEPTANCE_RATIO: f64 = 0.1;

/// A raw detector firing paired with the qubit value the detector channel
/// decodes to. The peer's markers are compared against these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectionSample {
    pub report: DetectionReport,
    pub qubit: Qubit,
}

impl DetectionSample {
    pub fn new(report: DetectionReport, qubit: Qubit) -> Self {
        Self { report, qubit }
    }

    /// Maps a 4-valued detector channel to a basis/bit pair, the way a real
    /// detector's four single-photon channels each correspond to one of the
    /// two bases' two polarization states.
    pub fn from_channel(time_ps: u64, channel: u8) -> Self {
        let (basis, bit) = match channel % 4 {
            0 => (Basis::Rectilinear, 0),
            1 => (Basis::Rectilinear, 1),
            2 => (Basis::Diagonal, 0),
            _ => (Basis::Diagonal, 1),
        };
        Self {
            report: DetectionReport::new(time_ps, channel),
            qubit: Qubit::new(basis, bit),
        }
    }
}

/// The other side of the link: supplies reference markers for a frame and
/// receives back the slot ids this side could use.
pub trait AlignmentPeer {
    fn get_markers(&self, frame_id: u64) -> Result<QubitByIndex, GatingError>;
    fn send_valid_detections(
        &self,
        frame_id: u64,
        slot_ids: &[SlotId],
        offset: u64,
    ) -> Result<(), GatingError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct OffsetHighscore {
    slot_id_offset: u64,
    score: i64,
}

#[derive(Clone, Debug, Default)]
struct DriftResult {
    min_bin_id: BinId,
    max_bin_id: BinId,
    drift_ps: i64,
    saturated: bool,
}

type ValuesBySlot = BTreeMap<SlotId, Vec<Qubit>>;
type ResultsByBinBySlot = HashMap<BinId, ValuesBySlot>;

/// Aligns a detector stream against a peer's markers, tracking clock drift
/// between histogram builds.
pub struct DetectionGating {
    num_slots: u64,
    slot_width_ps: u64,
    pulse_width_ps: u64,
    num_bins: u64,
    acceptance_ratio: f64,
    slot_offset_test_range: u64,
    calculated_drift_ps: i64,
    max_threads: usize,
    /// Tie-break source for candidate qubits sharing a corrected slot (spec
    /// §9 "Random source"): injected so tests can seed it and assert exact
    /// output instead of depending on process-global entropy.
    tie_break_rng: Box<dyn RngCore + Send + Sync>,
}

impl DetectionGating {
    pub fn new() -> Self {
        Self::with_rng(Box::new(StdRng::from_entropy()))
    }

    /// Builds a gating engine with a caller-supplied tie-break source. Tests
    /// construct this with `StdRng::seed_from_u64(seed)` for deterministic,
    /// reproducible tie-breaking.
    pub fn with_rng(rng: Box<dyn RngCore + Send + Sync>) -> Self {
        Self {
            num_slots: 100,
            slot_width_ps: 10_000,
            pulse_width_ps: 100,
            num_bins: 100,
            acceptance_ratio: DEFAULT_ACCEPTANCE_RATIO,
            slot_offset_test_range: DEFAULT_OFFSET_TEST_RANGE,
            calculated_drift_ps: 0,
            max_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            tie_break_rng: rng,
        }
    }

    /// Validates the new parameters before committing them — unlike the
    /// original, which logged an error on invalid input and then applied the
    /// bad values anyway.
    pub fn set_system_parameters(
        &mut self,
        frame_width_ps: u64,
        slot_width_ps: u64,
        pulse_width_ps: u64,
        slot_offset_test_range: u64,
        acceptance_ratio: f64,
    ) -> Result<(), GatingError> {
        if slot_width_ps == 0 || pulse_width_ps == 0 {
            return Err(GatingError::InvalidParameters(
                "slot_width_ps and pulse_width_ps must be non-zero".into(),
            ));
        }
        if !(0.0 < acceptance_ratio && acceptance_ratio < 1.0) {
            return Err(GatingError::InvalidParameters(format!(
                "acceptance_ratio must be in (0, 1), got {acceptance_ratio}"
            )));
        }
        self.num_slots = frame_width_ps / slot_width_ps;
        self.slot_width_ps = slot_width_ps;
        self.pulse_width_ps = pulse_width_ps;
        self.acceptance_ratio = acceptance_ratio;
        self.num_bins = slot_width_ps / pulse_width_ps;
        self.slot_offset_test_range = slot_offset_test_range;
        Ok(())
    }

    pub fn set_number_threads(&mut self, threads: usize) {
        self.max_threads = if threads == 0 { 1 } else { threads };
    }

    pub fn reset_drift(&mut self, new_drift_ps: i64) {
        self.calculated_drift_ps = new_drift_ps;
    }

    pub fn calculated_drift_ps(&self) -> i64 {
        self.calculated_drift_ps
    }

    fn slot_and_bin(&self, time_ps: u64) -> (SlotId, BinId) {
        let offset_ps = {
            let product = self.calculated_drift_ps as i128 * time_ps as i128;
            let divided = product as f64 / 1_000_000_000.0;
            divided.ceil() as i64
        };
        let adjusted = (time_ps as i64).saturating_add(offset_ps).max(0) as u64;
        let slot = SlotId::new(adjusted / self.slot_width_ps);
        let bin = BinId::new((adjusted % self.slot_width_ps) / self.pulse_width_ps);
        (slot, bin)
    }

    fn calculate_drift(&self, global_counts: &[u64]) -> DriftResult {
        let num_bins = self.num_bins;
        let mut target_bin = 0usize;
        for (idx, count) in global_counts.iter().enumerate() {
            if *count > global_counts[target_bin] {
                target_bin = idx;
            }
        }

        let min_count = std::cmp::max(1, (global_counts[target_bin] as f64 * self.acceptance_ratio) as u64);

        let mut max_bin = target_bin;
        let mut right_steps = 0u64;
        for step in 1..num_bins {
            let idx = ((target_bin as u64 + step) % num_bins) as usize;
            if global_counts[idx] >= min_count {
                right_steps += 1;
                max_bin = idx;
            } else {
                break;
            }
        }

        let mut min_bin = target_bin;
        let mut left_steps = 0u64;
        for step in 1..num_bins {
            let idx = ((num_bins + target_bin as u64 - step) % num_bins) as usize;
            if global_counts[idx] >= min_count {
                left_steps += 1;
                min_bin = idx;
            } else {
                break;
            }
        }

        let drift_offset = right_steps as i64 - left_steps as i64;
        let drift_ps =
            self.calculated_drift_ps + (self.pulse_width_ps as i64 * drift_offset) / 2;

        // every bin voted within tolerance of the peak: there is no usable
        // alignment signal, only noise.
        let saturated = right_steps + left_steps + 1 >= num_bins;
        if saturated {
            log::error!("all bins within drift tolerance, noise level too high");
        }

        DriftResult {
            min_bin_id: BinId::new(min_bin as u64),
            max_bin_id: BinId::new(max_bin as u64),
            drift_ps,
            saturated,
        }
    }

    fn score_offsets(
        offset_range: std::ops::Range<u64>,
        markers: &QubitByIndex,
        all_results: &ValuesBySlot,
    ) -> OffsetHighscore {
        let mut best = OffsetHighscore::default();
        for test_offset in offset_range {
            let mut score = 0i64;
            for (&marker_slot, marker_qubit) in markers.iter() {
                let Some(shifted) = marker_slot.get().checked_add(test_offset) else {
                    continue;
                };
                if let Some(candidates) = all_results.get(&SlotId::new(shifted)) {
                    for candidate in candidates {
                        if candidate.basis() == marker_qubit.basis() {
                            if candidate.bit() == marker_qubit.bit() {
                                score += 1;
                            } else {
                                score -= 1;
                            }
                        }
                    }
                }
            }
            if score > best.score {
                best = OffsetHighscore {
                    slot_id_offset: test_offset,
                    score,
                };
            }
        }
        best
    }

    /// Blocking call: builds the histogram for one frame against the peer's
    /// markers and returns the qubits this side can use for that frame.
    ///
    /// Returns an empty list (logging the cause) rather than an error when
    /// the frame carries no usable alignment signal — a caller retries on
    /// the next frame rather than treating gating noise as fatal.
    pub fn build_histogram(
        &mut self,
        source: &[DetectionSample],
        frame_id: u64,
        peer: &dyn AlignmentPeer,
    ) -> Result<Vec<Qubit>, GatingError> {
        if source.is_empty() {
            log::debug!("build_histogram called with no detections");
            return Ok(Vec::new());
        }

        let markers = peer.get_markers(frame_id)?;
        if markers.is_empty() {
            log::error!("peer supplied no alignment markers for frame {frame_id}");
            return Ok(Vec::new());
        }

        let num_threads = std::cmp::min(source.len(), self.max_threads).max(1);
        let items_per_thread = source.len() / num_threads;
        let offsets_per_thread = self.slot_offset_test_range / num_threads as u64;

        let global_counts: Mutex<Vec<u64>> = Mutex::new(vec![0; self.num_bins as usize]);
        let shared_results: Mutex<ValuesBySlot> = Mutex::new(BTreeMap::new());
        let drift_result: Mutex<DriftResult> = Mutex::new(DriftResult::default());

        let merge_barrier = Barrier::new(num_threads);
        let drift_barrier = Barrier::new(num_threads);
        let collect_barrier = Barrier::new(num_threads);

        let highscores: Mutex<Vec<OffsetHighscore>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for thread_id in 0..num_threads {
                let start = thread_id * items_per_thread;
                let (end, offset_start, offset_end) = if thread_id == num_threads - 1 {
                    (source.len(), thread_id as u64 * offsets_per_thread, self.slot_offset_test_range + 1)
                } else {
                    (
                        start + items_per_thread,
                        thread_id as u64 * offsets_per_thread,
                        (thread_id as u64 + 1) * offsets_per_thread,
                    )
                };
                let chunk = &source[start..end];

                let global_counts = &global_counts;
                let shared_results = &shared_results;
                let drift_result = &drift_result;
                let merge_barrier = &merge_barrier;
                let drift_barrier = &drift_barrier;
                let collect_barrier = &collect_barrier;
                let highscores = &highscores;
                let markers = &markers;
                let this = &*self;

                scope.spawn(move || {
                    let mut local_counts = vec![0u64; this.num_bins as usize];
                    let mut local_results: ResultsByBinBySlot = HashMap::new();
                    for sample in chunk {
                        let (slot, bin) = this.slot_and_bin(sample.report.time_ps);
                        local_counts[bin.get() as usize] += 1;
                        local_results
                            .entry(bin)
                            .or_default()
                            .entry(slot)
                            .or_default()
                            .push(sample.qubit);
                    }

                    {
                        let mut counts = global_counts.lock().unwrap();
                        for (total, delta) in counts.iter_mut().zip(local_counts.iter()) {
                            *total += delta;
                        }
                    }

                    let leader = merge_barrier.wait();
                    if leader.is_leader() {
                        let counts = global_counts.lock().unwrap();
                        let computed = this.calculate_drift(&counts);
                        *drift_result.lock().unwrap() = computed;
                    }
                    drift_barrier.wait();

                    let drift = drift_result.lock().unwrap().clone();
                    if drift.saturated {
                        return;
                    }

                    {
                        let mut shared = shared_results.lock().unwrap();
                        let mut bin_id = drift.min_bin_id.get();
                        loop {
                            if let Some(slots) = local_results.get(&BinId::new(bin_id)) {
                                for (slot, qubits) in slots {
                                    shared.entry(*slot).or_default().extend(qubits.iter().copied());
                                }
                            }
                            if bin_id == drift.max_bin_id.get() {
                                break;
                            }
                            bin_id = (bin_id + 1) % this.num_bins;
                        }
                    }

                    collect_barrier.wait();

                    let snapshot = shared_results.lock().unwrap().clone();
                    let score = Self::score_offsets(offset_start..offset_end, markers, &snapshot);
                    highscores.lock().unwrap().push(score);
                });
            }
        });

        let drift = drift_result.into_inner().unwrap();
        self.calculated_drift_ps = drift.drift_ps;
        if drift.saturated {
            return Ok(Vec::new());
        }

        let best = highscores
            .into_inner()
            .unwrap()
            .into_iter()
            .fold(OffsetHighscore::default(), |acc, candidate| {
                if candidate.score > acc.score {
                    candidate
                } else {
                    acc
                }
            });

        let all_results = shared_results.into_inner().unwrap();
        if all_results.len() <= markers.len() {
            log::warn!("no usable results in frame {frame_id}");
            peer.send_valid_detections(frame_id, &[], best.slot_id_offset)?;
            return Ok(Vec::new());
        }

        let mut detected_slots = Vec::new();
        let mut results = Vec::with_capacity(all_results.len() - markers.len());
        for (slot_id, candidates) in &all_results {
            let Some(corrected) = slot_id.get().checked_add(best.slot_id_offset) else {
                continue;
            };
            let corrected_slot = SlotId::new(corrected);
            if corrected >= self.num_slots || candidates.is_empty() || markers.contains_key(&corrected_slot) {
                continue;
            }
            detected_slots.push(corrected_slot);
            let chosen = if candidates.len() == 1 {
                candidates[0]
            } else {
                candidates[self.tie_break_rng.gen_range(0..candidates.len())]
            };
            results.push(chosen);
        }

        peer.send_valid_detections(frame_id, &detected_slots, best.slot_id_offset)?;
        Ok(results)
    }
}

impl Default for DetectionGating {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakePeer {
        markers: QubitByIndex,
        sent: StdMutex<Vec<(u64, Vec<SlotId>, u64)>>,
    }

    impl FakePeer {
        fn new(markers: QubitByIndex) -> Self {
            Self {
                markers,
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    impl AlignmentPeer for FakePeer {
        fn get_markers(&self, _frame_id: u64) -> Result<QubitByIndex, GatingError> {
            Ok(self.markers.clone())
        }

        fn send_valid_detections(
            &self,
            frame_id: u64,
            slot_ids: &[SlotId],
            offset: u64,
        ) -> Result<(), GatingError> {
            self.sent.lock().unwrap().push((frame_id, slot_ids.to_vec(), offset));
            Ok(())
        }
    }

    fn gating() -> DetectionGating {
        let mut g = DetectionGating::with_rng(Box::new(StdRng::seed_from_u64(7)));
        g.set_system_parameters(1_000_000, 10_000, 1_000, 20, 0.1).unwrap();
        g.set_number_threads(2);
        g
    }

    #[test]
    fn rejects_zero_widths() {
        let mut g = DetectionGating::new();
        assert!(g.set_system_parameters(1000, 0, 100, 10, 0.1).is_err());
        assert!(g.set_system_parameters(1000, 100, 0, 10, 0.1).is_err());
    }

    #[test]
    fn rejects_out_of_range_acceptance_ratio() {
        let mut g = DetectionGating::new();
        assert!(g.set_system_parameters(1000, 100, 10, 10, 0.0).is_err());
        assert!(g.set_system_parameters(1000, 100, 10, 10, 1.0).is_err());
    }

    #[test]
    fn noiseless_happy_path_recovers_markers() {
        let mut g = gating();
        let mut markers = QubitByIndex::new();
        markers.insert(SlotId::new(3), Qubit::new(Basis::Rectilinear, 1));
        markers.insert(SlotId::new(5), Qubit::new(Basis::Diagonal, 0));

        // detections line up exactly with marker slots, one bin in, no drift
        let source = vec![
            DetectionSample::new(DetectionReport::new(3 * 10_000 + 500, 1), Qubit::new(Basis::Rectilinear, 1)),
            DetectionSample::new(DetectionReport::new(5 * 10_000 + 500, 1), Qubit::new(Basis::Diagonal, 0)),
            DetectionSample::new(DetectionReport::new(7 * 10_000 + 500, 1), Qubit::new(Basis::Rectilinear, 0)),
        ];

        let peer = FakePeer::new(markers);
        let result = g.build_histogram(&source, 1, &peer).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], Qubit::new(Basis::Rectilinear, 0));
        assert_eq!(peer.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_source_returns_empty_without_panicking() {
        let mut g = gating();
        let peer = FakePeer::new(QubitByIndex::new());
        let result = g.build_histogram(&[], 1, &peer).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn all_bins_saturated_returns_empty_and_logs() {
        let mut g = gating();
        // every slot fires in every bin: acceptance ratio makes every bin
        // look like a plausible peak, so drift calculation saturates.
        let mut source = Vec::new();
        for slot in 0..5u64 {
            for bin in 0..100u64 {
                source.push(DetectionSample::new(
                    DetectionReport::new(slot * 10_000 + bin * 100 + 50, 0),
                    Qubit::new(Basis::Rectilinear, 0),
                ));
            }
        }
        let mut markers = QubitByIndex::new();
        markers.insert(SlotId::new(1), Qubit::new(Basis::Rectilinear, 0));
        let peer = FakePeer::new(markers);
        let result = g.build_histogram(&source, 2, &peer).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn drift_is_retained_between_calls() {
        let mut g = gating();
        g.reset_drift(42);
        assert_eq!(g.calculated_drift_ps(), 42);
    }

    /// Two engines seeded identically must make the same tie-break choice
    /// when a corrected slot carries more than one candidate qubit — the
    /// reason the rng is injected rather than pulled from thread-local
    /// entropy (spec §9 "Random source").
    #[test]
    fn seeded_rng_makes_tie_breaking_reproducible() {
        let mut markers = QubitByIndex::new();
        markers.insert(SlotId::new(3), Qubit::new(Basis::Rectilinear, 1));

        // two detections land in the same corrected slot with conflicting
        // bases, so build_histogram must break the tie with the rng.
        let source = vec![
            DetectionSample::new(DetectionReport::new(5 * 10_000 + 500, 1), Qubit::new(Basis::Rectilinear, 0)),
            DetectionSample::new(DetectionReport::new(5 * 10_000 + 600, 2), Qubit::new(Basis::Diagonal, 1)),
        ];

        let run = || {
            let mut g = DetectionGating::with_rng(Box::new(StdRng::seed_from_u64(99)));
            g.set_system_parameters(1_000_000, 10_000, 1_000, 20, 0.1).unwrap();
            g.set_number_threads(1);
            let peer = FakePeer::new(markers.clone());
            g.build_histogram(&source, 1, &peer).unwrap()
        };

        assert_eq!(run(), run());
    }
}
