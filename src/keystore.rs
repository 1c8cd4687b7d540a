//! File-backed store of wallets, keyed by address

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::crypto::{CryptoError, Wallet};

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key store file is malformed: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Invalid key material for {address}: {source}")]
    InvalidKey {
        address: String,
        source: CryptoError,
    },

    #[error("Invalid hex in key store: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("No wallet for address {0}")]
    UnknownAddress(String),
}

/// On-disk layout: address -> hex secret scalar
#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyFile {
    wallets: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct KeyStore {
    path: PathBuf,
    wallets: BTreeMap<String, Wallet>,
}

impl KeyStore {
    /// Loads the store at `path`; a missing file is an empty store
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, KeyStoreError> {
        let path = path.as_ref().to_path_buf();
        let mut wallets = BTreeMap::new();

        if path.exists() {
            let file: KeyFile = serde_json::from_str(&fs::read_to_string(&path)?)?;
            for (address, secret_hex) in file.wallets {
                let secret = hex::decode(&secret_hex)?;
                let wallet = Wallet::from_secret_key(&secret).map_err(|source| {
                    KeyStoreError::InvalidKey {
                        address: address.clone(),
                        source,
                    }
                })?;
                wallets.insert(address, wallet);
            }
        }

        Ok(KeyStore { path, wallets })
    }

    /// Generates a wallet, persists it, and returns it
    pub fn create_wallet(&mut self) -> Result<Wallet, KeyStoreError> {
        let wallet = Wallet::new();
        self.wallets
            .insert(wallet.address().0.clone(), wallet.clone());
        self.save()?;

        info!("Created wallet {}", wallet.address());
        Ok(wallet)
    }

    pub fn get_wallet(&self, address: &str) -> Result<&Wallet, KeyStoreError> {
        self.wallets
            .get(address)
            .ok_or_else(|| KeyStoreError::UnknownAddress(address.to_string()))
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.wallets.keys().map(String::as_str)
    }

    fn save(&self) -> Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = KeyFile {
            wallets: self
                .wallets
                .iter()
                .map(|(address, wallet)| (address.clone(), hex::encode(wallet.export_secret_key())))
                .collect(),
        };
        let tmp = self.path.with_extension("json.tmp");
        let result = write_then_rename(&tmp, &self.path, |writer| {
            serde_json::to_writer_pretty(&mut *writer, &file)?;
            Ok(())
        });
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

/// Writes through `tmp`, syncs it, then renames it over `dst`
///
/// Readers of `dst` see either the previous contents or the new ones.
fn write_then_rename<F>(tmp: &Path, dst: &Path, action: F) -> Result<(), KeyStoreError>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<(), KeyStoreError>,
{
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    {
        let mut writer = BufWriter::new(&file);
        action(&mut writer)?;
        writer.flush()?;
    }
    file.sync_all()?;
    fs::rename(tmp, dst)?;
    Ok(())
}
