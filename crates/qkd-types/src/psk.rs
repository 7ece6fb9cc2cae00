//! Pre-shared key bytes (spec §3): length-checked, XOR-combinable.

use std::fmt;

use crate::error::QkdError;

/// Byte lengths a site may configure for its PSKs; peer-agreed.
pub const VALID_PSK_LENGTHS: [usize; 3] = [16, 32, 64];

/// A symmetric key value of site-configured length.
#[derive(Clone, PartialEq, Eq)]
pub struct Psk(Vec<u8>);

impl Psk {
    /// Builds a `Psk`, rejecting any length other than 16, 32, or 64 bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, QkdError> {
        if !VALID_PSK_LENGTHS.contains(&bytes.len()) {
            return Err(QkdError::invalid_parameters(format!(
                "psk length {} is not one of {:?}",
                bytes.len(),
                VALID_PSK_LENGTHS
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Combines two keys of equal length byte-wise.
    ///
    /// `xor(a, a) = 0`; `xor(a, b) = xor(b, a)`; `xor(xor(a, b), b) = a`.
    pub fn xor(&self, other: &Psk) -> Result<Psk, QkdError> {
        if self.len() != other.len() {
            return Err(QkdError::invalid_parameters(format!(
                "cannot xor psks of different lengths ({} vs {})",
                self.len(),
                other.len()
            )));
        }
        let combined = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        // xor of two validly-sized keys is always a validly-sized key
        Ok(Psk(combined))
    }
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Psk({} bytes, redacted)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8, len: usize) -> Psk {
        Psk::new(vec![byte; len]).unwrap()
    }

    #[test]
    fn rejects_invalid_lengths() {
        assert!(Psk::new(vec![0u8; 17]).is_err());
        assert!(Psk::new(vec![0u8; 16]).is_ok());
        assert!(Psk::new(vec![0u8; 32]).is_ok());
        assert!(Psk::new(vec![0u8; 64]).is_ok());
    }

    #[test]
    fn xor_with_self_is_zero() {
        let a = key(0xAB, 16);
        let zero = a.xor(&a).unwrap();
        assert!(zero.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn xor_is_commutative() {
        let a = key(0x12, 16);
        let b = key(0x34, 16);
        assert_eq!(a.xor(&b).unwrap().as_bytes(), b.xor(&a).unwrap().as_bytes());
    }

    #[test]
    fn xor_is_self_inverse() {
        let a = key(0x55, 32);
        let b = key(0xAA, 32);
        let combined = a.xor(&b).unwrap();
        let recovered = combined.xor(&b).unwrap();
        assert_eq!(recovered.as_bytes(), a.as_bytes());
    }

    #[test]
    fn xor_rejects_mismatched_lengths() {
        let a = key(1, 16);
        let b = key(2, 32);
        assert!(a.xor(&b).is_err());
    }
}
