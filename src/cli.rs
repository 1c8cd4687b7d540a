//! Command-line surface: one subcommand per ledger or key-store operation

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use log::debug;

use crate::blockchain::{Address, Ledger, ProofOfWork};
use crate::config::{load_config, Config};
use crate::keystore::KeyStore;

#[derive(Debug, Parser)]
#[command(name = "pow-ledger", version, about = "Single-node proof-of-work UTXO ledger")]
pub struct Cli {
    /// Path to a TOML config file (default: ./ledger.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides the block store directory from the config
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a new ledger whose genesis block pays ADDRESS
    New {
        #[arg(long)]
        address: String,
    },

    /// Send VALUE from one wallet address to another and mine a block for it
    Send {
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        value: u64,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },

    /// Print the balance of ADDRESS
    #[command(name = "getbalance")]
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Generate a new wallet and print its address
    #[command(name = "newwallet")]
    NewWallet,

    /// List addresses held in the key store
    Wallets,

    /// Print every block from tip to genesis
    List,

    /// Re-check links and proof of work for the whole chain
    Verify,
}

/// Executes the parsed command line
pub fn run(cli: Cli) -> Result<()> {
    let mut config: Config = load_config(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.path = dir;
    }
    debug!("Using configuration {:?}", config);

    match cli.command {
        Command::New { address } => {
            let address: Address = address.parse().context("invalid genesis address")?;
            let ledger = Ledger::create(&config.storage.path, &address)?;
            println!("Created ledger with genesis block {}", ledger.tip());
        }
        Command::Send { value, from, to } => {
            let keystore = KeyStore::load(&config.keystore.path)?;
            let wallet = keystore.get_wallet(&from)?;
            let ledger = Ledger::open(&config.storage.path)?;

            let tx = ledger.build_spend(value, wallet, &to)?;
            let block = ledger.append_block(vec![tx])?;
            println!("Sent {} from {} to {} in block {}", value, from, to, block.hash);
        }
        Command::GetBalance { address } => {
            let ledger = Ledger::open(&config.storage.path)?;
            let balance = ledger.get_balance(&address)?;
            println!("Balance of '{}': {}", address, balance);
        }
        Command::NewWallet => {
            let mut keystore = KeyStore::load(&config.keystore.path)?;
            let wallet = keystore.create_wallet()?;
            println!("Address: {}", wallet.address());
        }
        Command::Wallets => {
            let keystore = KeyStore::load(&config.keystore.path)?;
            for address in keystore.addresses() {
                println!("{}", address);
            }
        }
        Command::List => {
            let ledger = Ledger::open(&config.storage.path)?;
            let blocks = ledger.blocks()?;
            let count = blocks.len();
            for (index, block) in blocks.iter().enumerate() {
                let prev = block.prev_hash.map(|h| h.to_hex()).unwrap_or_default();
                let time = DateTime::from_timestamp(block.timestamp, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| block.timestamp.to_string());

                println!("Height: {}", count - 1 - index);
                println!("PrevBlockHash: {}", prev);
                println!("Hash: {}", block.hash);
                println!("Timestamp: {}", time);
                println!("Nonce: {}", block.nonce);
                for tx in &block.transactions {
                    println!("  Transaction: {}", tx.id);
                }
                println!("pow: {}", ProofOfWork::new(block).validate());
                println!();
            }
        }
        Command::Verify => {
            let ledger = Ledger::open(&config.storage.path)?;
            let count = ledger.verify_chain()?;
            println!("Chain OK: {} blocks", count);
        }
    }

    Ok(())
}
