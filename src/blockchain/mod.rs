// Blockchain module
//
// This module contains the core ledger implementation:
// - Hashing and byte encoding helpers
// - Keys, public key hashes and address encoding
// - UTXO transactions and their signing protocol
// - Proof of work
// - Block structure
// - Persistent block store and the ledger built on it

pub mod block;
pub mod chain;
pub mod codec;
pub mod crypto;
pub mod pow;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Ledger, LedgerError, UnspentOutput};
pub use codec::Hash;
pub use crypto::{Address, PubKeyHash, Wallet};
pub use pow::{MiningError, ProofOfWork};
pub use transaction::{Transaction, TxInput, TxOutput};
