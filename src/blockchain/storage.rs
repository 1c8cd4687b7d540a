use std::path::Path;

use log::debug;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::codec::Hash;

/// Tree holding every block plus the tip pointer
const BLOCKS_TREE: &str = "blocks";

/// Reserved key under which the current tip hash is stored
const TIP_KEY: &[u8] = b"l";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Cannot open store: {0}")]
    Unavailable(sled::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Tip moved: expected {expected:?}, found {found:?}")]
    TipMismatch {
        expected: Option<Hash>,
        found: Option<Hash>,
    },
}

/// Storage for blockchain data
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks and the tip pointer
    blocks: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

fn decode_hash(bytes: &[u8]) -> Result<Hash, StorageError> {
    Hash::from_slice(bytes).ok_or_else(|| {
        StorageError::DeserializationError(format!(
            "stored hash has {} bytes, expected 32",
            bytes.len()
        ))
    })
}

impl BlockchainStorage {
    /// Opens (creating if needed) the store at `path`
    ///
    /// Background flushing is disabled; every commit flushes explicitly.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::Config::default()
            .path(path.as_ref())
            .flush_every_ms(None)
            .open()
            .map_err(StorageError::Unavailable)?;

        let blocks = db.open_tree(BLOCKS_TREE).map_err(StorageError::Unavailable)?;

        Ok(Self { db, blocks })
    }

    /// Reads the tip pointer, `None` if no chain has been written yet
    pub fn tip(&self) -> Result<Option<Hash>, StorageError> {
        match self.blocks.get(TIP_KEY)? {
            Some(value) => Ok(Some(decode_hash(&value)?)),
            None => Ok(None),
        }
    }

    /// Gets a block by its hash
    pub fn get_block(&self, hash: &Hash) -> Result<Block, StorageError> {
        match self.blocks.get(hash.as_bytes())? {
            Some(value) => Block::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string())),
            None => Err(StorageError::NotFound(format!(
                "Block with hash {} not found",
                hash
            ))),
        }
    }

    /// Writes `block` and moves the tip to it in one transaction
    ///
    /// The write is refused with [`StorageError::TipMismatch`] unless the
    /// stored tip still equals `expected_tip` (`None` for a fresh store).
    pub fn commit_block(
        &self,
        block: &Block,
        expected_tip: Option<Hash>,
    ) -> Result<(), StorageError> {
        let value = block
            .serialize()
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let key = block.hash;

        let result = self.blocks.transaction(|tx| {
            let found = match tx.get(TIP_KEY)? {
                Some(value) => Hash::from_slice(&value),
                None => None,
            };
            if found != expected_tip {
                return Err(ConflictableTransactionError::Abort(StorageError::TipMismatch {
                    expected: expected_tip,
                    found,
                }));
            }

            tx.insert(key.as_bytes().as_slice(), value.as_slice())?;
            tx.insert(TIP_KEY, key.as_bytes().as_slice())?;
            Ok(())
        });

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(err)) => return Err(err),
            Err(TransactionError::Storage(err)) => return Err(err.into()),
        }

        self.flush()?;
        debug!("Committed block {} ({} bytes)", key, value.len());
        Ok(())
    }

    /// Overwrites a stored block in place, leaving the tip alone
    #[cfg(test)]
    pub(crate) fn overwrite_block(&self, hash: &Hash, block: &Block) -> Result<(), StorageError> {
        let value = block
            .serialize()
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.blocks.insert(hash.as_bytes(), value)?;
        Ok(())
    }

    /// Writes raw bytes under a block key
    #[cfg(test)]
    pub(crate) fn overwrite_raw(&self, hash: &Hash, bytes: &[u8]) -> Result<(), StorageError> {
        self.blocks.insert(hash.as_bytes(), bytes)?;
        Ok(())
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
