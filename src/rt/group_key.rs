use anyhow::{bail, Result};
use std::fmt;

/// Identifies which logical group (one traceable program) a shader belongs to,
/// and for hit shaders, which hit group inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKey {
    General { logical: u16 },
    Hit { logical: u16, hit: u16 },
}

const INDEX_MASK: u32 = 0xFFFF;

impl GroupKey {
    pub fn general(logical: u32) -> Result<Self> {
        Ok(GroupKey::General { logical: logical_index(logical)? })
    }

    pub fn hit(logical: u32, hit: u32) -> Result<Self> {
        // The packed form stores hit + 1 in 16 bits.
        if hit >= INDEX_MASK {
            bail!("Hit group index {} does not fit into a group key (max {})", hit, INDEX_MASK - 1);
        }

        Ok(GroupKey::Hit {
            logical: logical_index(logical)?,
            hit: hit as u16,
        })
    }

    #[inline]
    pub fn logical_group(self) -> u16 {
        match self {
            GroupKey::General { logical } | GroupKey::Hit { logical, .. } => logical,
        }
    }

    #[inline]
    pub fn hit_group(self) -> Option<u16> {
        match self {
            GroupKey::General { .. } => None,
            GroupKey::Hit { hit, .. } => Some(hit),
        }
    }

    /// Packs the key into 32 bits: low half is the logical group, high half is `hit + 1`, or 0 for general shaders.
    pub fn encode(self) -> u32 {
        match self {
            GroupKey::General { logical } => logical as u32,
            GroupKey::Hit { logical, hit } => (logical as u32) | ((hit as u32 + 1) << 16),
        }
    }

    pub fn decode(key: u32) -> Self {
        let logical = (key & INDEX_MASK) as u16;

        match key >> 16 {
            0 => GroupKey::General { logical },
            biased => GroupKey::Hit {
                logical,
                hit: (biased - 1) as u16,
            },
        }
    }
}

fn logical_index(logical: u32) -> Result<u16> {
    u16::try_from(logical).map_err(|_| anyhow::anyhow!("Logical group index {} does not fit into a group key", logical))
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::General { logical } => write!(f, "logical group {}", logical),
            GroupKey::Hit { logical, hit } => write!(f, "logical group {}, hit group {}", logical, hit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        for logical in [0, 1, 7, 0x1234, 0xFFFF] {
            let general = GroupKey::general(logical).unwrap();
            assert_eq!(GroupKey::decode(general.encode()), general);

            for hit in [0, 1, 2, 0x4321, 0xFFFE] {
                let key = GroupKey::hit(logical, hit).unwrap();
                assert_eq!(GroupKey::decode(key.encode()), key);
                assert_eq!(key.logical_group() as u32, logical);
                assert_eq!(key.hit_group(), Some(hit as u16));
            }
        }
    }

    #[test]
    fn hit_zero_is_distinct_from_general() {
        let general = GroupKey::general(3).unwrap().encode();
        let hit = GroupKey::hit(3, 0).unwrap().encode();

        assert_eq!(general, 3);
        assert_eq!(hit, 3 | (1 << 16));
        assert_eq!(GroupKey::decode(hit).hit_group(), Some(0));
        assert_eq!(GroupKey::decode(general).hit_group(), None);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        assert!(GroupKey::general(0x1_0000).is_err());
        assert!(GroupKey::hit(0x1_0000, 0).is_err());
        assert!(GroupKey::hit(0, 0xFFFF).is_err());
    }
}
