use log::{debug, info};
use thiserror::Error;

use std::sync::atomic::{AtomicBool, Ordering};

use super::block::Block;
use super::codec::{concat, int_to_be_bytes, sha256, Hash, HASH_LEN};

/// Number of leading zero bits a block hash must have
pub const TARGET_BITS: u32 = 16;

const PROGRESS_INTERVAL: i64 = 1 << 20;

/// Errors that can occur while searching for a nonce
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MiningError {
    #[error("Mining cancelled after {attempts} attempts")]
    Cancelled { attempts: i64 },

    #[error("Nonce space exhausted without meeting the target")]
    NonceExhausted,
}

/// Big-endian bytes of `1 << (256 - bits)`, or `None` unless `bits` is in `1..=255`
///
/// Comparing two big-endian 32-byte arrays lexicographically is the same
/// as comparing the 256-bit integers they encode.
pub const fn target_for(bits: u32) -> Option<[u8; HASH_LEN]> {
    if bits == 0 || bits > 255 {
        return None;
    }
    let shift = 256 - bits as usize;
    let mut target = [0u8; HASH_LEN];
    target[HASH_LEN - 1 - shift / 8] = 1 << (shift % 8);
    Some(target)
}

/// Target for [`TARGET_BITS`], checked at compile time
const TARGET: [u8; HASH_LEN] = match target_for(TARGET_BITS) {
    Some(target) => target,
    None => panic!("TARGET_BITS out of range"),
};

/// Proof-of-work over a single block
pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: [u8; HASH_LEN],
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> Self {
        ProofOfWork {
            block,
            target: TARGET,
        }
    }

    pub fn target(&self) -> &[u8; HASH_LEN] {
        &self.target
    }

    /// prevHash || txHash || timestamp || nonce || targetBits
    pub fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        concat(&[
            self.block.prev_hash_bytes(),
            self.block.hash_transactions().as_bytes(),
            &int_to_be_bytes(self.block.timestamp),
            &int_to_be_bytes(nonce),
            &int_to_be_bytes(i64::from(TARGET_BITS)),
        ])
    }

    pub fn hash_for(&self, nonce: i64) -> Hash {
        sha256(&self.prepare_data(nonce))
    }

    /// Strictly-less-than comparison of the hash against the target
    pub fn meets_target(&self, hash: &Hash) -> bool {
        hash.as_bytes() < &self.target
    }

    /// Searches nonces from zero upward until the hash meets the target
    pub fn run(&self) -> Result<(i64, Hash), MiningError> {
        self.run_cancellable(&AtomicBool::new(false))
    }

    /// Like [`run`](Self::run), checking `cancel` before every attempt
    pub fn run_cancellable(&self, cancel: &AtomicBool) -> Result<(i64, Hash), MiningError> {
        // The transaction commitment is fixed for the whole search.
        let tx_hash = self.block.hash_transactions();
        let timestamp = int_to_be_bytes(self.block.timestamp);
        let bits = int_to_be_bytes(i64::from(TARGET_BITS));

        let mut nonce: i64 = 0;
        while nonce < i64::MAX {
            if cancel.load(Ordering::Relaxed) {
                info!("Mining cancelled at nonce {}", nonce);
                return Err(MiningError::Cancelled { attempts: nonce });
            }

            let data = concat(&[
                self.block.prev_hash_bytes(),
                tx_hash.as_bytes(),
                &timestamp,
                &int_to_be_bytes(nonce),
                &bits,
            ]);
            let hash = sha256(&data);

            if self.meets_target(&hash) {
                info!("Found nonce {} with hash {}", nonce, hash);
                return Ok((nonce, hash));
            }

            if nonce > 0 && nonce % PROGRESS_INTERVAL == 0 {
                debug!("Still mining, {} nonces tried", nonce);
            }
            nonce += 1;
        }

        Err(MiningError::NonceExhausted)
    }

    /// Re-checks the block's stored nonce against the target
    pub fn validate(&self) -> bool {
        self.meets_target(&self.hash_for(self.block.nonce))
    }
}
