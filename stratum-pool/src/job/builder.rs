//! Block template to Stratum job.
//!
//! The coinbase is serialized by hand rather than through
//! `bitcoin::Transaction` because it has to be cut in two around the
//! extranonce bytes, and the cut must fall inside the scriptSig.

use std::sync::Arc;

use bitcoin::consensus::encode::{serialize, VarInt};
use bitcoin::script::Builder;
use sha2::{Digest, Sha256};

use super::merkle::{fold_branch, merkle_branch, txid};
use super::{ActiveJob, JobError};
use crate::coin::CoinProfile;
use crate::config::MAX_COINBASE_TAG_LEN;
use crate::pow::target_from_nbits;
use crate::rpc::BlockTemplate;

/// Consensus limit on coinbase scriptSig length.
const MAX_SCRIPT_SIG_LEN: usize = 100;

/// Per-coin settings that shape every job.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub profile: CoinProfile,
    pub payout_script: Vec<u8>,
    pub coinbase_tag: Vec<u8>,
    pub extranonce1_size: usize,
    pub extranonce2_size: usize,
}

/// Coinbase serialized without witness, split around the extranonces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseParts {
    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,
}

impl CoinbaseParts {
    /// Reassemble the full coinbase for the given extranonces.
    pub fn join(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        join_coinbase(&self.coinb1, extranonce1, extranonce2, &self.coinb2)
    }
}

pub fn join_coinbase(
    coinb1: &[u8],
    extranonce1: &[u8],
    extranonce2: &[u8],
    coinb2: &[u8],
) -> Vec<u8> {
    let mut tx =
        Vec::with_capacity(coinb1.len() + extranonce1.len() + extranonce2.len() + coinb2.len());
    tx.extend_from_slice(coinb1);
    tx.extend_from_slice(extranonce1);
    tx.extend_from_slice(extranonce2);
    tx.extend_from_slice(coinb2);
    tx
}

/// Change detector for templates.
///
/// Two templates with the same signature would produce the same header
/// fields, so no new job is built for them.
pub fn template_signature(template: &BlockTemplate, profile: &CoinProfile) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.previous_block_hash.as_bytes());
    hasher.update(template.curtime.to_le_bytes());
    hasher.update(template.bits.as_bytes());
    hasher.update(profile.algorithm.as_ref().as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the coinbase and split it right after the BIP34 height push.
pub fn build_coinbase(
    height: u64,
    value: u64,
    params: &JobParams,
    witness_commitment: Option<&[u8]>,
) -> Result<CoinbaseParts, JobError> {
    if params.coinbase_tag.len() > MAX_COINBASE_TAG_LEN {
        return Err(JobError::TagTooLong(params.coinbase_tag.len()));
    }

    let height = i64::try_from(height).map_err(|_| JobError::InvalidHeight(height))?;
    let height_push = Builder::new().push_int(height).into_script().into_bytes();

    let mut tag_push = Vec::with_capacity(params.coinbase_tag.len() + 1);
    if !params.coinbase_tag.is_empty() {
        tag_push.push(params.coinbase_tag.len() as u8);
        tag_push.extend_from_slice(&params.coinbase_tag);
    }

    let script_sig_len = height_push.len()
        + params.extranonce1_size
        + params.extranonce2_size
        + tag_push.len();
    if script_sig_len > MAX_SCRIPT_SIG_LEN {
        return Err(JobError::ScriptSigTooLong(script_sig_len));
    }

    let mut coinb1 = Vec::new();
    coinb1.extend_from_slice(&1u32.to_le_bytes());
    coinb1.extend(serialize(&VarInt(1)));
    coinb1.extend_from_slice(&[0u8; 32]);
    coinb1.extend_from_slice(&u32::MAX.to_le_bytes());
    coinb1.extend(serialize(&VarInt(script_sig_len as u64)));
    coinb1.extend_from_slice(&height_push);

    let mut coinb2 = tag_push;
    coinb2.extend_from_slice(&u32::MAX.to_le_bytes());

    let output_count = if witness_commitment.is_some() { 2 } else { 1 };
    coinb2.extend(serialize(&VarInt(output_count)));
    coinb2.extend_from_slice(&value.to_le_bytes());
    coinb2.extend(serialize(&VarInt(params.payout_script.len() as u64)));
    coinb2.extend_from_slice(&params.payout_script);
    if let Some(commitment) = witness_commitment {
        coinb2.extend_from_slice(&0u64.to_le_bytes());
        coinb2.extend(serialize(&VarInt(commitment.len() as u64)));
        coinb2.extend_from_slice(commitment);
    }
    coinb2.extend_from_slice(&0u32.to_le_bytes());

    Ok(CoinbaseParts { coinb1, coinb2 })
}

/// Node display-order hash to internal byte order.
pub fn parse_display_hash(hex_str: &str, field: &'static str) -> Result<[u8; 32], JobError> {
    let mut bytes: [u8; 32] = hex::decode(hex_str)
        .map_err(|_| JobError::InvalidHex(field))?
        .try_into()
        .map_err(|_| JobError::InvalidLength(field))?;
    bytes.reverse();
    Ok(bytes)
}

/// Stratum's word-swapped previous-hash encoding.
pub fn notify_prev_hash(internal: &[u8; 32]) -> String {
    let mut bytes = *internal;
    for word in bytes.chunks_mut(4) {
        word.reverse();
    }
    hex::encode(bytes)
}

/// Turn a template into a job.
///
/// `previous` is the job this one replaces; it decides `clean_jobs`.
pub fn build_job(
    job_id: String,
    template: &BlockTemplate,
    params: &JobParams,
    previous: Option<&ActiveJob>,
) -> Result<ActiveJob, JobError> {
    let prev_hash = parse_display_hash(&template.previous_block_hash, "previousblockhash")?;
    let nbits =
        u32::from_str_radix(&template.bits, 16).map_err(|_| JobError::InvalidHex("bits"))?;

    let witness_commitment = template
        .default_witness_commitment
        .as_deref()
        .map(|c| hex::decode(c).map_err(|_| JobError::InvalidHex("default_witness_commitment")))
        .transpose()?;

    let mut txids = Vec::with_capacity(template.transactions.len());
    let mut transactions = Vec::with_capacity(template.transactions.len());
    for (index, tx) in template.transactions.iter().enumerate() {
        let id = tx.id().ok_or(JobError::MissingTxid(index))?;
        txids.push(parse_display_hash(id, "txid")?);
        transactions.push(hex::decode(&tx.data).map_err(|_| JobError::InvalidHex("data"))?);
    }

    let coinbase = build_coinbase(
        template.height,
        template.coinbase_value,
        params,
        witness_commitment.as_deref(),
    )?;
    let branch = merkle_branch(&txids);

    let placeholder = coinbase.join(
        &vec![0u8; params.extranonce1_size],
        &vec![0u8; params.extranonce2_size],
    );
    let placeholder_merkle_root = fold_branch(txid(&placeholder), &branch);

    let clean_jobs = previous.map_or(true, |p| p.prev_hash != prev_hash);

    Ok(ActiveJob {
        job_id,
        prev_hash,
        prev_hash_display: template.previous_block_hash.to_lowercase(),
        prev_hash_notify: notify_prev_hash(&prev_hash),
        coinb1: coinbase.coinb1,
        coinb2: coinbase.coinb2,
        merkle_branch: branch,
        version: template.version,
        nbits,
        ntime: template.curtime,
        clean_jobs,
        height: template.height,
        diff1: params.profile.diff1,
        network_target: target_from_nbits(nbits),
        transactions: Arc::new(transactions),
        segwit: witness_commitment.is_some(),
        placeholder_merkle_root,
        signature: template_signature(template, &params.profile),
        extranonce2_size: params.extranonce2_size,
    })
}

/// Re-encode a non-witness coinbase with the BIP141 marker, flag and the
/// 32-byte zero witness reserved value.
fn witness_coinbase(coinbase: &[u8]) -> Vec<u8> {
    let (version, rest) = coinbase.split_at(4);
    let (body, locktime) = rest.split_at(rest.len() - 4);
    let mut tx = Vec::with_capacity(coinbase.len() + 36);
    tx.extend_from_slice(version);
    tx.extend_from_slice(&[0x00, 0x01]);
    tx.extend_from_slice(body);
    tx.push(0x01);
    tx.push(0x20);
    tx.extend_from_slice(&[0u8; 32]);
    tx.extend_from_slice(locktime);
    tx
}

/// Serialize a full block for `submitblock`.
pub fn assemble_block(job: &ActiveJob, header: &[u8; 80], coinbase: &[u8]) -> Vec<u8> {
    let tx_data: usize = job.transactions.iter().map(Vec::len).sum();
    let mut block = Vec::with_capacity(80 + 9 + coinbase.len() + 38 + tx_data);
    block.extend_from_slice(header);
    block.extend(serialize(&VarInt(1 + job.transactions.len() as u64)));
    if job.segwit {
        block.extend(witness_coinbase(coinbase));
    } else {
        block.extend_from_slice(coinbase);
    }
    for tx in job.transactions.iter() {
        block.extend_from_slice(tx);
    }
    block
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coin::{Algorithm, CoinFamily};
    use crate::rpc::TemplateTransaction;
    use bitcoin::consensus::deserialize;
    use bitcoin::hashes::Hash;
    use bitcoin::Transaction;

    pub(crate) fn params() -> JobParams {
        JobParams {
            profile: CoinProfile::resolve(CoinFamily::Bitcoin, Algorithm::Sha256d),
            payout_script: hex::decode("76a914000102030405060708090a0b0c0d0e0f1011121388ac")
                .unwrap(),
            coinbase_tag: b"/stratum-pool/".to_vec(),
            extranonce1_size: 4,
            extranonce2_size: 4,
        }
    }

    pub(crate) fn template(bits: &str) -> BlockTemplate {
        BlockTemplate {
            version: 0x2000_0000,
            previous_block_hash: "00000000000000000001a2b3c4d5e6f708090a0b0c0d0e0f1011121314151617"
                .into(),
            curtime: 1_700_000_000,
            bits: bits.into(),
            height: 820_000,
            coinbase_value: 625_000_000,
            transactions: vec![],
            default_witness_commitment: None,
        }
    }

    #[test]
    fn test_coinbase_parses_as_transaction() {
        let parts = build_coinbase(820_000, 625_000_000, &params(), None).unwrap();
        let raw = parts.join(&[1, 2, 3, 4], &[5, 6, 7, 8]);
        let tx: Transaction = deserialize(&raw).unwrap();

        assert!(tx.is_coinbase());
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value.to_sat(), 625_000_000);
        assert_eq!(tx.output[0].script_pubkey.as_bytes(), &params().payout_script[..]);
        assert_eq!(tx.input[0].sequence.0, u32::MAX);

        // scriptSig: height push, extranonces, tag push
        let script = tx.input[0].script_sig.as_bytes();
        let height_push = Builder::new().push_int(820_000).into_script().into_bytes();
        assert!(script.starts_with(&height_push));
        assert_eq!(&script[height_push.len()..height_push.len() + 8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(script.ends_with(b"/stratum-pool/"));

        // Our txid matches the library's
        assert_eq!(txid(&raw), tx.compute_txid().to_byte_array());
    }

    #[test]
    fn test_witness_commitment_output() {
        let commitment =
            hex::decode("6a24aa21a9ede2f61c3f71d1defd3fa999dfa36953755c690689799962b48bebd836974e8cf9")
                .unwrap();
        let parts = build_coinbase(820_000, 625_000_000, &params(), Some(&commitment)).unwrap();
        let tx: Transaction = deserialize(&parts.join(&[0; 4], &[0; 4])).unwrap();
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[1].value.to_sat(), 0);
        assert_eq!(tx.output[1].script_pubkey.as_bytes(), &commitment[..]);
    }

    #[test]
    fn test_long_tag_rejected() {
        let mut p = params();
        p.coinbase_tag = vec![b'x'; 41];
        assert!(matches!(
            build_coinbase(1, 0, &p, None),
            Err(JobError::TagTooLong(41))
        ));
    }

    #[test]
    fn test_prev_hash_orders() {
        let job = build_job("1".into(), &template("1d00ffff"), &params(), None).unwrap();
        // Internal order is the display order reversed
        assert_eq!(job.prev_hash[0], 0x17);
        assert_eq!(job.prev_hash[31], 0x00);
        // Notify order swaps bytes within each word of the internal order
        assert_eq!(&job.prev_hash_notify[..8], "14151617");
        assert_eq!(job.prev_hash_display, template("1d00ffff").previous_block_hash);
    }

    #[test]
    fn test_clean_jobs_follows_prev_hash() {
        let first = build_job("1".into(), &template("1d00ffff"), &params(), None).unwrap();
        assert!(first.clean_jobs);

        let mut same_tip = template("1d00ffff");
        same_tip.curtime += 30;
        let second = build_job("2".into(), &same_tip, &params(), Some(&first)).unwrap();
        assert!(!second.clean_jobs);

        let mut new_tip = template("1d00ffff");
        new_tip.previous_block_hash =
            "0000000000000000000000000000000000000000000000000000000000000042".into();
        let third = build_job("3".into(), &new_tip, &params(), Some(&second)).unwrap();
        assert!(third.clean_jobs);
    }

    #[test]
    fn test_signature_ignores_transactions_but_not_time() {
        let profile = params().profile;
        let base = template("1d00ffff");
        let mut with_tx = base.clone();
        with_tx.transactions.push(TemplateTransaction {
            data: "00".into(),
            txid: Some("11".repeat(32)),
            hash: None,
        });
        assert_eq!(
            template_signature(&base, &profile),
            template_signature(&with_tx, &profile)
        );

        let mut later = base.clone();
        later.curtime += 1;
        assert_ne!(
            template_signature(&base, &profile),
            template_signature(&later, &profile)
        );
    }

    #[test]
    fn test_missing_txid_rejected() {
        let mut t = template("1d00ffff");
        t.transactions.push(TemplateTransaction {
            data: "00".into(),
            txid: None,
            hash: None,
        });
        assert!(matches!(
            build_job("1".into(), &t, &params(), None),
            Err(JobError::MissingTxid(0))
        ));
    }

    #[test]
    fn test_segwit_block_deserializes() {
        let mut t = template("207fffff");
        t.default_witness_commitment = Some(
            "6a24aa21a9ede2f61c3f71d1defd3fa999dfa36953755c690689799962b48bebd836974e8cf9".into(),
        );
        let job = build_job("1".into(), &t, &params(), None).unwrap();
        let coinbase = join_coinbase(&job.coinb1, &[0; 4], &[0; 4], &job.coinb2);
        let header = [0u8; 80];
        let raw = assemble_block(&job, &header, &coinbase);
        let block: bitcoin::Block = deserialize(&raw).unwrap();
        assert_eq!(block.txdata.len(), 1);
        assert_eq!(block.txdata[0].input[0].witness.len(), 1);
        // Witness does not change the txid
        assert_eq!(
            block.txdata[0].compute_txid().to_byte_array(),
            txid(&coinbase)
        );
    }
}
