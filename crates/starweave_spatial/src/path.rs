//! Packed quadrant paths.
//!
//! A node's address in the partition tree is the quadrant sequence walked
//! from the root. On the wire each quadrant takes two bits: element `i`
//! lands in bits `(i % 4) * 2..` of byte `i / 4`, so four quadrants pack
//! into one byte and `byte_len = ceil(len / 4)`.

use crate::error::SpatialError;
use crate::quad::Quadrant;

/// Maximum partition depth, and therefore maximum path length.
pub const MAX_DEPTH: usize = 15;

/// Root-to-node quadrant sequence, at most [`MAX_DEPTH`] elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NodePath(Vec<Quadrant>);

impl NodePath {
    /// The empty path (the root).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_quadrants(quadrants: Vec<Quadrant>) -> Result<Self, SpatialError> {
        if quadrants.len() > MAX_DEPTH {
            return Err(SpatialError::DepthExceeded);
        }
        Ok(Self(quadrants))
    }

    pub fn push(&mut self, q: Quadrant) -> Result<(), SpatialError> {
        if self.0.len() == MAX_DEPTH {
            return Err(SpatialError::DepthExceeded);
        }
        self.0.push(q);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn quadrants(&self) -> &[Quadrant] {
        &self.0
    }

    /// Packed size in bytes for a path of `len` quadrants.
    pub fn byte_len(len: usize) -> usize {
        (len + 3) / 4
    }

    /// Packs the path, two bits per quadrant, low bits first within a byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::byte_len(self.0.len())];
        for (i, q) in self.0.iter().enumerate() {
            bytes[i / 4] |= (q.index() as u8) << ((i % 4) * 2);
        }
        bytes
    }

    /// Unpacks `len` quadrants from `bytes`.
    pub fn from_bytes(len: usize, bytes: &[u8]) -> Result<Self, SpatialError> {
        if len > MAX_DEPTH {
            return Err(SpatialError::DepthExceeded);
        }
        if bytes.len() < Self::byte_len(len) {
            return Err(SpatialError::TruncatedPath {
                expected: len,
                actual: bytes.len(),
            });
        }
        let mut quadrants = Vec::with_capacity(len);
        for i in 0..len {
            let two_bits = (bytes[i / 4] >> ((i % 4) * 2)) & 0b11;
            // Two bits always decode to a valid quadrant.
            quadrants.push(Quadrant::from_index(two_bits).unwrap());
        }
        Ok(Self(quadrants))
    }
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for q in &self.0 {
            write!(f, "/{q}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a NodePath {
    type Item = Quadrant;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, Quadrant>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn byte_len_rounds_up() {
        assert_eq!(NodePath::byte_len(0), 0);
        assert_eq!(NodePath::byte_len(1), 1);
        assert_eq!(NodePath::byte_len(4), 1);
        assert_eq!(NodePath::byte_len(5), 2);
        assert_eq!(NodePath::byte_len(15), 4);
    }

    #[test]
    fn round_trips_every_length() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for len in 0..=MAX_DEPTH {
            for _ in 0..32 {
                let quadrants: Vec<Quadrant> = (0..len)
                    .map(|_| Quadrant::from_index(rng.gen_range(0..4)).unwrap())
                    .collect();
                let path = NodePath::from_quadrants(quadrants).unwrap();
                let bytes = path.to_bytes();
                assert_eq!(bytes.len(), NodePath::byte_len(len));
                let back = NodePath::from_bytes(len, &bytes).unwrap();
                assert_eq!(back, path);
            }
        }
    }

    #[test]
    fn packing_layout_is_low_bits_first() {
        // NE(0), SW(3), NW(1), SE(2) -> 0b10_01_11_00
        let path = NodePath::from_quadrants(vec![
            Quadrant::Ne,
            Quadrant::Sw,
            Quadrant::Nw,
            Quadrant::Se,
        ])
        .unwrap();
        assert_eq!(path.to_bytes(), vec![0b10_01_11_00]);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut path = NodePath::from_quadrants(vec![Quadrant::Ne; MAX_DEPTH]).unwrap();
        assert_eq!(path.push(Quadrant::Sw), Err(SpatialError::DepthExceeded));
        assert_eq!(path.len(), MAX_DEPTH);
        assert!(NodePath::from_quadrants(vec![Quadrant::Ne; MAX_DEPTH + 1]).is_err());
        assert!(NodePath::from_bytes(MAX_DEPTH + 1, &[0u8; 4]).is_err());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let err = NodePath::from_bytes(5, &[0u8]).unwrap_err();
        assert!(matches!(err, SpatialError::TruncatedPath { expected: 5, actual: 1 }));
    }
}
