//! A single-node, append-only proof-of-work ledger with UTXO transactions.

pub mod blockchain;
pub mod cli;
pub mod config;
pub mod keystore;
