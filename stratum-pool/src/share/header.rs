//! 80-byte header assembly, canonical and compatibility layouts.

use bitcoin::hashes::{sha256d, Hash};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Byte layout used to build a header.
///
/// `Canonical` is the consensus encoding: every integer field little-endian.
/// The others reproduce byte orders seen from miner firmware that echoes
/// Stratum's big-endian hex words into the header unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HeaderVariant {
    Canonical,
    /// Nonce bytes in submitted order
    NonceRaw,
    /// ntime and nonce bytes in submitted order
    NtimeNonceRaw,
    /// Version, ntime, nbits and nonce in submitted order
    AllRaw,
    /// Rolled version bits byte-swapped before masking
    VersionBitsSwapped,
}

impl HeaderVariant {
    /// Evaluation order. The first entry is always tried first.
    pub const ORDER: [HeaderVariant; 5] = [
        HeaderVariant::Canonical,
        HeaderVariant::NonceRaw,
        HeaderVariant::NtimeNonceRaw,
        HeaderVariant::AllRaw,
        HeaderVariant::VersionBitsSwapped,
    ];
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFields {
    pub version: u32,
    /// Internal byte order
    pub prev_hash: [u8; 32],
    /// Internal byte order
    pub merkle_root: [u8; 32],
    pub ntime: u32,
    pub nbits: u32,
    pub nonce: u32,
}

impl HeaderFields {
    /// Consensus serialization.
    pub fn serialize(&self) -> [u8; 80] {
        self.layout(false, false, false, false)
    }

    fn layout(
        &self,
        version_raw: bool,
        ntime_raw: bool,
        nbits_raw: bool,
        nonce_raw: bool,
    ) -> [u8; 80] {
        fn word(value: u32, raw: bool) -> [u8; 4] {
            if raw {
                value.to_be_bytes()
            } else {
                value.to_le_bytes()
            }
        }
        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&word(self.version, version_raw));
        header[4..36].copy_from_slice(&self.prev_hash);
        header[36..68].copy_from_slice(&self.merkle_root);
        header[68..72].copy_from_slice(&word(self.ntime, ntime_raw));
        header[72..76].copy_from_slice(&word(self.nbits, nbits_raw));
        header[76..80].copy_from_slice(&word(self.nonce, nonce_raw));
        header
    }

    /// Header for one variant.
    ///
    /// `swapped_version` is the version obtained by byte-swapping the rolled
    /// bits; `VersionBitsSwapped` is skipped (`None`) when there is no such
    /// alternative or it equals the canonical version.
    pub fn assemble(
        &self,
        variant: HeaderVariant,
        swapped_version: Option<u32>,
    ) -> Option<[u8; 80]> {
        match variant {
            HeaderVariant::Canonical => Some(self.serialize()),
            HeaderVariant::NonceRaw => Some(self.layout(false, false, false, true)),
            HeaderVariant::NtimeNonceRaw => Some(self.layout(false, true, false, true)),
            HeaderVariant::AllRaw => Some(self.layout(true, true, true, true)),
            HeaderVariant::VersionBitsSwapped => {
                let version = swapped_version.filter(|v| *v != self.version)?;
                Some(HeaderFields { version, ..*self }.serialize())
            }
        }
    }
}

/// Double-SHA256 of a header, internal byte order.
pub fn hash_header(header: &[u8; 80]) -> [u8; 32] {
    sha256d::Hash::hash(header).to_byte_array()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::SHA256D_DIFF1;
    use crate::pow::meets_target;
    use bitcoin::block::Header;
    use bitcoin::consensus::deserialize;

    fn genesis() -> HeaderFields {
        let mut merkle_root =
            hex::decode("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .unwrap();
        merkle_root.reverse();
        HeaderFields {
            version: 1,
            prev_hash: [0u8; 32],
            merkle_root: merkle_root.try_into().unwrap(),
            ntime: 0x495f_ab29,
            nbits: 0x1d00_ffff,
            nonce: 2_083_236_893,
        }
    }

    #[test]
    fn test_genesis_block_hash() {
        let header = genesis().serialize();
        let mut hash = hash_header(&header);
        assert!(meets_target(&hash, SHA256D_DIFF1));
        hash.reverse();
        assert_eq!(
            hex::encode(hash),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_canonical_matches_library_encoding() {
        let header = genesis().serialize();
        let parsed: Header = deserialize(&header).unwrap();
        assert_eq!(parsed.version.to_consensus(), 1);
        assert_eq!(parsed.time, 0x495f_ab29);
        assert_eq!(parsed.bits.to_consensus(), 0x1d00_ffff);
        assert_eq!(parsed.nonce, 2_083_236_893);
    }

    #[test]
    fn test_raw_variants_only_reorder_words() {
        let fields = genesis();
        let canonical = fields.serialize();
        let nonce_raw = fields.assemble(HeaderVariant::NonceRaw, None).unwrap();
        assert_eq!(canonical[..76], nonce_raw[..76]);
        assert_eq!(nonce_raw[76..80], fields.nonce.to_be_bytes());

        let all_raw = fields.assemble(HeaderVariant::AllRaw, None).unwrap();
        assert_eq!(all_raw[0..4], 1u32.to_be_bytes());
        assert_eq!(all_raw[4..68], canonical[4..68]);
    }

    #[test]
    fn test_swapped_version_skipped_when_absent_or_equal() {
        let fields = genesis();
        assert!(fields.assemble(HeaderVariant::VersionBitsSwapped, None).is_none());
        assert!(fields
            .assemble(HeaderVariant::VersionBitsSwapped, Some(fields.version))
            .is_none());
        let header = fields
            .assemble(HeaderVariant::VersionBitsSwapped, Some(0x2000_6000))
            .unwrap();
        assert_eq!(header[0..4], 0x2000_6000u32.to_le_bytes());
    }
}
