use std::fmt;

use bitvec::prelude::*;
use rand::RngCore;
use serde::{Serialize, Serializer};

pub type Bitfield = BitVec<u8, Msb0>;

/// bitfield of `len` bits with every bit set, what a seed advertises.
pub fn full_bitfield(len: usize) -> Bitfield {
    let mut bf = Bitfield::new();
    bf.resize(len, true);
    bf
}

pub fn empty_bitfield(len: usize) -> Bitfield {
    let mut bf = Bitfield::new();
    bf.resize(len, false);
    bf
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    const CLIENT_PREFIX: &'static [u8; 8] = b"-SC0100-";

    pub fn random() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(Self::CLIENT_PREFIX);
        rand::thread_rng().fill_bytes(&mut id[8..]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_peer_ids_carry_client_prefix() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(a, b);
        assert_eq!(&a.as_bytes()[..8], b"-SC0100-");
        assert_eq!(a.to_string().len(), 40);
    }

    #[test]
    fn full_bitfield_has_no_zeros() {
        let bf = full_bitfield(13);
        assert_eq!(bf.len(), 13);
        assert_eq!(bf.count_zeros(), 0);
        assert_eq!(empty_bitfield(13).count_ones(), 0);
    }
}
