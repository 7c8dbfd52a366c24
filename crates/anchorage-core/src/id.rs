//! Identity types for anchors
//!
//! Anchor identities are 128-bit so that identities minted by the
//! localization backend and identities carried inside restored payloads
//! share one key space in the registry.

use std::fmt;

/// Anchor identity - globally unique, stable once assigned
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AnchorId(pub u128);

impl AnchorId {
    pub const NIL: AnchorId = AnchorId(0);

    #[inline]
    pub fn new(id: u128) -> Self {
        AnchorId(id)
    }

    /// Mint a fresh random identity
    pub fn random() -> Self {
        loop {
            let id = rand::random::<u128>();
            if id != 0 {
                return AnchorId(id);
            }
        }
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        AnchorId(u128::from_le_bytes(bytes))
    }
}

impl fmt::Debug for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Anchor({})", self)
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}
