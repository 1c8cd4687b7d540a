use chrono::Utc;
use serde::{Deserialize, Serialize};

use std::sync::atomic::AtomicBool;

use super::codec::{concat, sha256, Hash};
use super::pow::{MiningError, ProofOfWork};
use super::transaction::Transaction;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Hash of the previous block; `None` only for genesis
    pub prev_hash: Option<Hash>,

    /// Proof-of-work hash of this block
    pub hash: Hash,

    /// Unix timestamp (seconds) when the block was created
    pub timestamp: i64,

    /// List of transactions included in this block
    pub transactions: Vec<Transaction>,

    /// Proof of work (nonce)
    pub nonce: i64,
}

impl Block {
    /// Creates and mines a new block
    ///
    /// # Arguments
    ///
    /// * `transactions` - The list of transactions to include in the block
    /// * `prev_hash` - The hash of the previous block, `None` for genesis
    ///
    /// # Returns
    ///
    /// The mined block, with `nonce` and `hash` set
    pub fn new(
        transactions: Vec<Transaction>,
        prev_hash: Option<Hash>,
    ) -> Result<Self, MiningError> {
        Self::mine(transactions, prev_hash, &AtomicBool::new(false))
    }

    /// Creates and mines a new block, giving up once `cancel` is set
    pub fn mine(
        transactions: Vec<Transaction>,
        prev_hash: Option<Hash>,
        cancel: &AtomicBool,
    ) -> Result<Self, MiningError> {
        let mut block = Block {
            prev_hash,
            hash: Hash::default(),
            timestamp: Utc::now().timestamp(),
            transactions,
            nonce: 0,
        };

        let (nonce, hash) = ProofOfWork::new(&block).run_cancellable(cancel)?;
        block.nonce = nonce;
        block.hash = hash;

        Ok(block)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_none()
    }

    /// Previous hash as raw bytes, empty for genesis
    pub fn prev_hash_bytes(&self) -> &[u8] {
        match &self.prev_hash {
            Some(hash) => hash.as_bytes(),
            None => &[],
        }
    }

    /// SHA-256 over the concatenated ids of all transactions in order
    pub fn hash_transactions(&self) -> Hash {
        let ids: Vec<&[u8]> = self
            .transactions
            .iter()
            .map(|tx| tx.id.as_bytes().as_slice())
            .collect();
        sha256(&concat(&ids))
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
