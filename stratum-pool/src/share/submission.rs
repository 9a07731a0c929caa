//! Structural checks on `mining.submit` fields.

use serde::{Deserialize, Serialize};

use super::RejectReason;

/// Seconds a share's ntime may lag the job's.
pub const NTIME_PAST_LIMIT: i64 = 600;

/// Seconds a share's ntime may lead the job's.
pub const NTIME_FUTURE_LIMIT: i64 = 7200;

/// `mining.submit` parameters as they arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    /// Sixth parameter, sent only with version rolling
    pub version_bits: Option<String>,
}

/// Submission fields decoded from hex.
///
/// `ntime`, `nonce` and `version_bits` hold the big-endian reading of the
/// eight hex digits, which is how Stratum writes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedShare {
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    pub version_bits: Option<u32>,
}

fn parse_word(hex_str: &str, reason: RejectReason) -> Result<u32, RejectReason> {
    if hex_str.len() != 8 || !hex_str.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(reason);
    }
    u32::from_str_radix(hex_str, 16).map_err(|_| reason)
}

impl Submission {
    /// Decode and length-check every field, stopping at the first bad one.
    pub fn parse(&self, extranonce2_size: usize) -> Result<ParsedShare, RejectReason> {
        let extranonce2 =
            hex::decode(&self.extranonce2).map_err(|_| RejectReason::BadExtranonce2Size)?;
        if extranonce2.len() != extranonce2_size {
            return Err(RejectReason::BadExtranonce2Size);
        }
        let ntime = parse_word(&self.ntime, RejectReason::InvalidNtime)?;
        let nonce = parse_word(&self.nonce, RejectReason::InvalidNonce)?;
        let version_bits = self
            .version_bits
            .as_deref()
            .map(|v| parse_word(v, RejectReason::InvalidVersion))
            .transpose()?;
        Ok(ParsedShare {
            extranonce2,
            ntime,
            nonce,
            version_bits,
        })
    }
}

/// Enforce `job_ntime - 600 <= ntime <= job_ntime + 7200`.
pub fn check_ntime(ntime: u32, job_ntime: u32) -> Result<(), RejectReason> {
    let delta = ntime as i64 - job_ntime as i64;
    if (-NTIME_PAST_LIMIT..=NTIME_FUTURE_LIMIT).contains(&delta) {
        Ok(())
    } else {
        Err(RejectReason::InvalidNtime)
    }
}

/// Header version for a submission.
///
/// Without a negotiated mask the miner may only echo the job version. With a
/// mask, bits outside it must be zero, or match the job version for firmware
/// that sends the full rolled version instead of just the rolled bits.
pub fn resolve_version(
    job_version: u32,
    mask: Option<u32>,
    version_bits: Option<u32>,
) -> Result<u32, RejectReason> {
    let Some(bits) = version_bits else {
        return Ok(job_version);
    };
    match mask {
        None | Some(0) => {
            if bits == job_version {
                Ok(job_version)
            } else {
                Err(RejectReason::InvalidVersion)
            }
        }
        Some(mask) => {
            let outside = bits & !mask;
            if outside != 0 && outside != job_version & !mask {
                return Err(RejectReason::InvalidVersion);
            }
            Ok(apply_mask(job_version, mask, bits))
        }
    }
}

pub fn apply_mask(job_version: u32, mask: u32, bits: u32) -> u32 {
    (job_version & !mask) | (bits & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn submission() -> Submission {
        Submission {
            worker: "alice.rig1".into(),
            job_id: "1".into(),
            extranonce2: "00000001".into(),
            ntime: "6553f100".into(),
            nonce: "deadbeef".into(),
            version_bits: None,
        }
    }

    #[test]
    fn test_parse_valid() {
        let parsed = submission().parse(4).unwrap();
        assert_eq!(parsed.extranonce2, vec![0, 0, 0, 1]);
        assert_eq!(parsed.ntime, 0x6553f100);
        assert_eq!(parsed.nonce, 0xdeadbeef);
        assert_eq!(parsed.version_bits, None);
    }

    #[test_case("000001", RejectReason::BadExtranonce2Size ; "short extranonce2")]
    #[test_case("zz000001", RejectReason::BadExtranonce2Size ; "extranonce2 not hex")]
    fn test_bad_extranonce2(value: &str, reason: RejectReason) {
        let mut s = submission();
        s.extranonce2 = value.into();
        assert_eq!(s.parse(4), Err(reason));
    }

    #[test]
    fn test_first_failure_wins() {
        let mut s = submission();
        s.ntime = "123".into();
        s.nonce = "xyz".into();
        assert_eq!(s.parse(4), Err(RejectReason::InvalidNtime));

        let mut s = submission();
        s.nonce = "deadbeef00".into();
        assert_eq!(s.parse(4), Err(RejectReason::InvalidNonce));

        let mut s = submission();
        s.version_bits = Some("1fffe00".into());
        assert_eq!(s.parse(4), Err(RejectReason::InvalidVersion));
    }

    #[test_case(1000, 400, true ; "lower bound")]
    #[test_case(1000, 399, false ; "below lower bound")]
    #[test_case(1000, 8200, true ; "upper bound")]
    #[test_case(1000, 8201, false ; "above upper bound")]
    #[test_case(100, 0, true ; "no underflow near zero")]
    fn test_ntime_window(job: u32, share: u32, ok: bool) {
        assert_eq!(check_ntime(share, job).is_ok(), ok);
    }

    const JOB: u32 = 0x2000_0000;
    const MASK: u32 = 0x1fff_e000;

    #[test]
    fn test_version_without_bits_is_job_version() {
        assert_eq!(resolve_version(JOB, Some(MASK), None), Ok(JOB));
    }

    #[test]
    fn test_version_without_mask_must_match() {
        assert_eq!(resolve_version(JOB, None, Some(JOB)), Ok(JOB));
        assert_eq!(
            resolve_version(JOB, None, Some(JOB | 0x2000)),
            Err(RejectReason::InvalidVersion)
        );
    }

    #[test]
    fn test_version_bits_inside_mask() {
        assert_eq!(resolve_version(JOB, Some(MASK), Some(0x0000_6000)), Ok(0x2000_6000));
    }

    #[test]
    fn test_full_version_agreeing_outside_mask() {
        assert_eq!(resolve_version(JOB, Some(MASK), Some(0x2000_6000)), Ok(0x2000_6000));
    }

    #[test]
    fn test_bits_outside_mask_rejected() {
        assert_eq!(
            resolve_version(JOB, Some(MASK), Some(0x4000_0000)),
            Err(RejectReason::InvalidVersion)
        );
    }
}
