//! Peer identity

use serde::{Deserialize, Serialize};

/// A 32-byte peer identifier.
///
/// Opaque to the consensus core; equality is bytewise and ordering is
/// lexicographic, which doubles as big-endian unsigned comparison for
/// XOR-distance math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Creates a PeerId from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance between this peer id and a 32-byte key.
    pub fn distance(&self, key: &[u8; 32]) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ key[i];
        }
        out
    }

    /// Returns a short hex representation for logging.
    pub fn short_hex(&self) -> String {
        format!(
            "{:02x}{:02x}..{:02x}{:02x}",
            self.0[0], self.0[1], self.0[30], self.0[31]
        )
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::from_bytes([0xab; 32]);
        let display = format!("{}", id);
        assert!(display.starts_with("0x"));
        assert_eq!(display.len(), 66); // 0x + 64 hex chars
    }

    #[test]
    fn test_distance_symmetry() {
        let a = PeerId::from_bytes([0x0f; 32]);
        let key = [0xf0u8; 32];
        assert_eq!(a.distance(&key), [0xffu8; 32]);
        assert_eq!(a.distance(a.as_bytes()), [0u8; 32]);
    }
}
