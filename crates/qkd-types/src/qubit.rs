//! The classical observation of one polarization measurement (spec §3).

use serde::{Deserialize, Serialize};

/// Measurement basis used for a single polarization observation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Basis {
    Rectilinear,
    Diagonal,
}

/// A 2-bit polarization observation: `(basis, bit)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Qubit {
    pub basis: Basis,
    pub bit: u8,
}

impl Qubit {
    pub fn new(basis: Basis, bit: u8) -> Self {
        Self { basis, bit: bit & 1 }
    }

    pub fn basis(&self) -> Basis {
        self.basis
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_is_masked_to_a_single_bit() {
        let q = Qubit::new(Basis::Diagonal, 7);
        assert_eq!(q.bit(), 1);
        assert_eq!(q.basis(), Basis::Diagonal);
    }

    #[test]
    fn equality_is_by_value() {
        let a = Qubit::new(Basis::Rectilinear, 0);
        let b = Qubit::new(Basis::Rectilinear, 0);
        let c = Qubit::new(Basis::Rectilinear, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
