//! Coinbase merkle branch.
//!
//! All hashes here are in internal byte order (the order `sha256d` produces),
//! which is also the order Stratum puts them on the wire.

use bitcoin::hashes::{sha256d, Hash};

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left);
    combined[32..].copy_from_slice(right);
    sha256d::Hash::hash(&combined).to_byte_array()
}

/// Sibling hashes needed to fold the coinbase (leaf 0) up to the root.
///
/// `txids` are the template's non-coinbase transactions in block order. The
/// branch does not depend on the coinbase itself, so it is computed once per
/// job and reused for every extranonce.
pub fn merkle_branch(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut level = txids.to_vec();
    let mut branch = Vec::new();
    while !level.is_empty() {
        branch.push(level[0]);
        // The coinbase slot sits before level[0]; pair up what follows it.
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        let mut i = 1;
        while i < level.len() {
            let right = level.get(i + 1).unwrap_or(&level[i]);
            next.push(hash_pair(&level[i], right));
            i += 2;
        }
        level = next;
    }
    branch
}

/// Fold a coinbase txid through a branch to the merkle root.
pub fn fold_branch(coinbase_txid: [u8; 32], branch: &[[u8; 32]]) -> [u8; 32] {
    branch
        .iter()
        .fold(coinbase_txid, |current, sibling| hash_pair(&current, sibling))
}

/// Double-SHA256 of a serialized (non-witness) transaction.
pub fn txid(tx: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(tx).to_byte_array()
}
