//! Raw detector events and the sparse, slot-indexed qubit stream built from
//! them (spec §3, §4.1).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::SlotId;
use crate::qubit::Qubit;

/// A single detector firing: arrival time in picoseconds since the epoch of
/// the current histogram window, plus the detector channel value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct DetectionReport {
    pub time_ps: u64,
    pub value: u8,
}

impl DetectionReport {
    pub fn new(time_ps: u64, value: u8) -> Self {
        Self { time_ps, value }
    }
}

/// The qubit stream indexed by slot, sparse because not every slot produces
/// a usable detection.
pub type QubitByIndex = BTreeMap<SlotId, Qubit>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qubit::Basis;

    #[test]
    fn detection_reports_order_by_arrival_time() {
        let mut reports = vec![
            DetectionReport::new(300, 1),
            DetectionReport::new(100, 0),
            DetectionReport::new(200, 1),
        ];
        reports.sort();
        assert_eq!(reports[0].time_ps, 100);
        assert_eq!(reports[2].time_ps, 300);
    }

    #[test]
    fn qubit_by_index_is_sparse() {
        let mut stream: QubitByIndex = QubitByIndex::new();
        stream.insert(SlotId::new(5), Qubit::new(Basis::Rectilinear, 1));
        stream.insert(SlotId::new(9), Qubit::new(Basis::Diagonal, 0));
        assert_eq!(stream.len(), 2);
        assert!(stream.get(&SlotId::new(7)).is_none());
    }
}
