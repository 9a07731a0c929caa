//! Proof-of-work check for one submission.
//!
//! The canonical header is tried first. If it misses the share target, the
//! remaining [`HeaderVariant`]s are tried in order and the first that meets it
//! is accepted and marked ambiguous. Every variant is held to the same
//! targets; only the byte layout differs.

use ruint::aliases::U256;

use super::header::{hash_header, HeaderFields, HeaderVariant};
use super::submission::{apply_mask, ParsedShare};
use super::{RejectReason, Verdict};
use crate::job::builder::join_coinbase;
use crate::job::merkle::{fold_branch, txid};
use crate::job::ActiveJob;
use crate::pow::{difficulty_of_hash, meets_target};

/// Everything needed to evaluate a structurally valid share.
#[derive(Debug, Clone, Copy)]
pub struct ShareInput<'a> {
    pub job: &'a ActiveJob,
    pub extranonce1: &'a [u8],
    pub share: &'a ParsedShare,
    /// Version after mask resolution
    pub version: u32,
    /// Negotiated version-rolling mask
    pub mask: Option<u32>,
    pub share_target: U256,
}

/// Outcome of [`evaluate`] with the values that produced it.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Variant that met the target, or `Canonical` on rejection
    pub variant: HeaderVariant,
    /// Accepted only through a non-canonical variant
    pub ambiguous: bool,
    pub header: [u8; 80],
    pub hash: [u8; 32],
    /// `diff1 / hash`, for reporting
    pub share_difficulty: f64,
    /// Non-witness coinbase as rebuilt for this share
    pub coinbase: Vec<u8>,
    pub merkle_root: [u8; 32],
}

/// Assemble, hash and compare.
pub fn evaluate(input: &ShareInput<'_>) -> Evaluation {
    let job = input.job;
    let coinbase = join_coinbase(
        &job.coinb1,
        input.extranonce1,
        &input.share.extranonce2,
        &job.coinb2,
    );
    let merkle_root = fold_branch(txid(&coinbase), &job.merkle_branch);

    let fields = HeaderFields {
        version: input.version,
        prev_hash: job.prev_hash,
        merkle_root,
        ntime: input.share.ntime,
        nbits: job.nbits,
        nonce: input.share.nonce,
    };
    let swapped_version = match (input.mask, input.share.version_bits) {
        (Some(mask), Some(bits)) if mask != 0 => {
            Some(apply_mask(job.version, mask, bits.swap_bytes()))
        }
        _ => None,
    };

    let mut canonical = None;
    for variant in HeaderVariant::ORDER {
        let Some(header) = fields.assemble(variant, swapped_version) else {
            continue;
        };
        let hash = hash_header(&header);
        let meets_share = meets_target(&hash, input.share_target);
        let meets_network = meets_target(&hash, job.network_target);

        if meets_share || meets_network {
            return Evaluation {
                verdict: Verdict::Accept {
                    block_candidate: meets_network,
                },
                variant,
                ambiguous: variant != HeaderVariant::Canonical,
                header,
                hash,
                share_difficulty: difficulty_of_hash(&hash, job.diff1),
                coinbase,
                merkle_root,
            };
        }
        if variant == HeaderVariant::Canonical {
            canonical = Some((header, hash));
        }
    }

    let (header, hash) = canonical.unwrap_or_else(|| {
        let header = fields.serialize();
        (header, hash_header(&header))
    });
    Evaluation {
        verdict: Verdict::Reject(RejectReason::LowDifficultyShare),
        variant: HeaderVariant::Canonical,
        ambiguous: false,
        header,
        hash,
        share_difficulty: difficulty_of_hash(&hash, job.diff1),
        coinbase,
        merkle_root,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::build_job;
    use crate::job::builder::tests::{params, template};
    use crate::pow::target_from_difficulty;

    fn job(bits: &str) -> ActiveJob {
        build_job("1".into(), &template(bits), &params(), None).unwrap()
    }

    fn share(nonce: u32) -> ParsedShare {
        ParsedShare {
            extranonce2: vec![0, 0, 0, 7],
            ntime: 1_700_000_000,
            nonce,
            version_bits: None,
        }
    }

    fn input<'a>(job: &'a ActiveJob, share: &'a ParsedShare, target: U256) -> ShareInput<'a> {
        ShareInput {
            job,
            extranonce1: &[0, 0, 0, 1],
            share,
            version: job.version,
            mask: None,
            share_target: target,
        }
    }

    #[test]
    fn test_accept_below_share_target_without_block() {
        // Easy share target, diff1 network target
        let job = job("1d00ffff");
        let target = target_from_difficulty(1e-12, job.diff1).unwrap();
        let share = share(0);
        let eval = evaluate(&input(&job, &share, target));

        assert_eq!(
            eval.verdict,
            Verdict::Accept {
                block_candidate: false
            }
        );
        assert_eq!(eval.variant, HeaderVariant::Canonical);
        assert!(!eval.ambiguous);
        assert!(!meets_target(&eval.hash, job.network_target));
    }

    #[test]
    fn test_low_difficulty_rejected() {
        let job = job("1d00ffff");
        let target = target_from_difficulty(1e15, job.diff1).unwrap();
        let share = share(0);
        let eval = evaluate(&input(&job, &share, target));
        assert_eq!(
            eval.verdict,
            Verdict::Reject(RejectReason::LowDifficultyShare)
        );
        assert_eq!(eval.variant, HeaderVariant::Canonical);
    }

    #[test]
    fn test_network_target_makes_block_candidate() {
        // Regtest-style bits accept about half of all hashes
        let job = job("207fffff");
        let hard = target_from_difficulty(1e15, job.diff1).unwrap();
        let nonce = (0..64u32)
            .find(|n| {
                let s = share(*n);
                let eval = evaluate(&input(&job, &s, hard));
                eval.verdict.is_accept() && eval.variant == HeaderVariant::Canonical
            })
            .expect("no block-meeting nonce in range");

        let s = share(nonce);
        let eval = evaluate(&input(&job, &s, hard));
        assert_eq!(
            eval.verdict,
            Verdict::Accept {
                block_candidate: true
            }
        );
        assert!(meets_target(&eval.hash, job.network_target));
    }

    #[test]
    fn test_fallback_variant_is_flagged_and_still_meets_target() {
        let job = job("1d00ffff");
        let half = U256::MAX >> 1usize;

        let found = (0..256u32).find_map(|n| {
            let s = share(n);
            let eval = evaluate(&input(&job, &s, half));
            (eval.variant == HeaderVariant::NonceRaw).then_some(eval)
        });
        let eval = found.expect("no nonce where only the raw layout passes");

        assert!(eval.ambiguous);
        assert!(eval.verdict.is_accept());
        assert!(meets_target(&eval.hash, half));
        // The canonical layout of the same share missed
        let mut fields_nonce = eval.header;
        fields_nonce[76..80].reverse();
        assert!(!meets_target(&hash_header(&fields_nonce), half));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let job = job("1d00ffff");
        let target = target_from_difficulty(1.0, job.diff1).unwrap();
        let s = share(0);
        let a = evaluate(&input(&job, &s, target));
        let b = evaluate(&input(&job, &s, target));
        assert_eq!(a.header, b.header);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.coinbase, b.coinbase);
    }

    #[test]
    fn test_extranonce_changes_merkle_root() {
        let job = job("1d00ffff");
        let s1 = share(0);
        let mut s2 = share(0);
        s2.extranonce2 = vec![0, 0, 0, 8];
        let a = evaluate(&input(&job, &s1, U256::MAX));
        let b = evaluate(&input(&job, &s2, U256::MAX));
        assert_ne!(a.merkle_root, b.merkle_root);
        assert_ne!(a.merkle_root, job.placeholder_merkle_root);
    }
}
