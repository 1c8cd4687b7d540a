use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, PoisonError, RwLock};

use log::{info, warn};
use thiserror::Error;

use super::block::Block;
use super::codec::Hash;
use super::crypto::{Address, CryptoError, PubKeyHash, Wallet};
use super::pow::{MiningError, ProofOfWork};
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{PreviousTransactions, Transaction, TransactionError, TxInput, TxOutput};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("A ledger already exists at {0}")]
    LedgerAlreadyExists(PathBuf),

    #[error("No ledger found at {0}")]
    LedgerNotFound(PathBuf),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Malformed encoding: {0}")]
    MalformedEncoding(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    #[error("Mining error: {0}")]
    Mining(#[from] MiningError),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(e) => LedgerError::StoreUnavailable(e.to_string()),
            StorageError::DeserializationError(msg) | StorageError::SerializationError(msg) => {
                LedgerError::MalformedEncoding(msg)
            }
            other => LedgerError::Storage(other),
        }
    }
}

impl From<CryptoError> for LedgerError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidAddress(msg) => LedgerError::InvalidAddress(msg),
            other => LedgerError::Crypto(other),
        }
    }
}

impl From<TransactionError> for LedgerError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::EncodingError(msg) => LedgerError::MalformedEncoding(msg),
            TransactionError::CryptoError(e) => e.into(),
            other => LedgerError::InvalidTransaction(other.to_string()),
        }
    }
}

/// An output that no later input has spent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub txid: Hash,
    pub index: i32,
    pub output: TxOutput,
}

/// Walks the chain from a starting hash back to genesis
///
/// Iteration ends after the first error. A hash seen twice yields
/// [`LedgerError::InvalidChain`].
pub struct ChainIter<'a> {
    storage: &'a BlockchainStorage,
    next: Option<Hash>,
    seen: HashSet<Hash>,
}

impl Iterator for ChainIter<'_> {
    type Item = Result<Block, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        if !self.seen.insert(hash) {
            warn!("Chain loops back to block {}", hash);
            return Some(Err(LedgerError::InvalidChain(format!(
                "cycle at block {}",
                hash
            ))));
        }
        match self.storage.get_block(&hash) {
            Ok(block) => {
                self.next = block.prev_hash;
                Some(Ok(block))
            }
            Err(err) => Some(Err(err.into())),
        }
    }
}

/// A persistent, append-only chain of mined blocks
///
/// The tip is owned by this value. Appends are serialised through an
/// internal lock; reads take a snapshot of the tip and never see a block
/// whose tip update has not been committed.
#[derive(Debug)]
pub struct Ledger {
    storage: BlockchainStorage,
    path: PathBuf,
    tip: RwLock<Hash>,
    append_lock: Mutex<()>,
}

impl Ledger {
    /// Creates a new ledger whose genesis block pays the subsidy to `genesis_address`
    ///
    /// # Arguments
    ///
    /// * `path` - Directory of the persistent store
    /// * `genesis_address` - The address receiving the genesis coinbase
    ///
    /// # Returns
    ///
    /// The opened ledger, or [`LedgerError::LedgerAlreadyExists`] if the
    /// store already holds a chain
    pub fn create<P: AsRef<Path>>(path: P, genesis_address: &Address) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let storage = BlockchainStorage::open(&path)?;

        if storage.tip()?.is_some() {
            return Err(LedgerError::LedgerAlreadyExists(path));
        }

        let coinbase = Transaction::new_coinbase("", genesis_address)?;
        let genesis = Block::new(vec![coinbase], None)?;

        match storage.commit_block(&genesis, None) {
            Ok(()) => {}
            Err(StorageError::TipMismatch { .. }) => {
                return Err(LedgerError::LedgerAlreadyExists(path))
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            "Created ledger at {} with genesis block {}",
            path.display(),
            genesis.hash
        );

        Ok(Ledger {
            storage,
            path,
            tip: RwLock::new(genesis.hash),
            append_lock: Mutex::new(()),
        })
    }

    /// Opens an existing ledger
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(LedgerError::LedgerNotFound(path));
        }

        let storage = BlockchainStorage::open(&path)?;
        let tip = match storage.tip()? {
            Some(tip) => tip,
            None => return Err(LedgerError::LedgerNotFound(path)),
        };

        info!("Opened ledger at {} with tip {}", path.display(), tip);

        Ok(Ledger {
            storage,
            path,
            tip: RwLock::new(tip),
            append_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hash of the newest block
    pub fn tip(&self) -> Hash {
        *self.tip.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Iterates blocks from the current tip back to genesis
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            storage: &self.storage,
            next: Some(self.tip()),
            seen: HashSet::new(),
        }
    }

    /// All blocks, newest first
    pub fn blocks(&self) -> Result<Vec<Block>, LedgerError> {
        self.iter().collect()
    }

    /// Finds a transaction by id, searching from the tip backward
    pub fn find_transaction(&self, txid: &Hash) -> Result<Option<Transaction>, LedgerError> {
        for block in self.iter() {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == *txid) {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    /// Resolves every transaction `transaction`'s inputs refer to
    fn previous_transactions(
        &self,
        transaction: &Transaction,
    ) -> Result<PreviousTransactions, LedgerError> {
        let mut previous = PreviousTransactions::new();

        for input in &transaction.inputs {
            let Some(txid) = input.txid else {
                continue;
            };
            if previous.contains_key(&txid) {
                continue;
            }
            let found = self.find_transaction(&txid)?.ok_or_else(|| {
                LedgerError::InvalidTransaction(format!(
                    "input references unknown transaction {}",
                    txid
                ))
            })?;
            previous.insert(txid, found);
        }

        Ok(previous)
    }

    /// Signs `transaction` against the outputs it spends on this chain
    pub fn sign_transaction(
        &self,
        transaction: &mut Transaction,
        wallet: &Wallet,
    ) -> Result<(), LedgerError> {
        let previous = self.previous_transactions(transaction)?;
        transaction.sign(wallet.private_key(), &previous)?;
        Ok(())
    }

    /// Verifies `transaction`'s signatures against the outputs it spends on this chain
    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<bool, LedgerError> {
        let previous = self.previous_transactions(transaction)?;
        Ok(transaction.verify(&previous)?)
    }

    /// Outputs locked to `pub_key_hash` that no input on the chain has spent
    ///
    /// Newest-to-oldest scan: inputs seen in newer transactions mark the
    /// outputs they spend before the older transaction defining them is
    /// reached.
    pub fn find_unspent_outputs(
        &self,
        pub_key_hash: &PubKeyHash,
    ) -> Result<Vec<UnspentOutput>, LedgerError> {
        let mut spent: HashMap<Hash, HashSet<i32>> = HashMap::new();
        let mut unspent = Vec::new();

        for block in self.iter() {
            let block = block?;
            for tx in &block.transactions {
                let spent_here = spent.get(&tx.id);

                for (index, output) in (0..).zip(&tx.outputs) {
                    if spent_here.is_some_and(|indices| indices.contains(&index)) {
                        continue;
                    }
                    if output.is_locked_with(pub_key_hash) {
                        unspent.push(UnspentOutput {
                            txid: tx.id,
                            index,
                            output: output.clone(),
                        });
                    }
                }

                if tx.is_coinbase() {
                    continue;
                }
                for input in tx.inputs.iter().filter(|input| input.uses_key(pub_key_hash)) {
                    if let Some(txid) = input.txid {
                        spent.entry(txid).or_default().insert(input.vout);
                    }
                }
            }
        }

        Ok(unspent)
    }

    /// Transactions holding at least one unspent output for `pub_key_hash`
    pub fn find_unspent_transactions(
        &self,
        pub_key_hash: &PubKeyHash,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let wanted: HashSet<Hash> = self
            .find_unspent_outputs(pub_key_hash)?
            .into_iter()
            .map(|utxo| utxo.txid)
            .collect();

        let mut found = Vec::with_capacity(wanted.len());
        let mut seen = HashSet::new();
        for block in self.iter() {
            for tx in block?.transactions {
                if wanted.contains(&tx.id) && seen.insert(tx.id) {
                    found.push(tx);
                }
            }
        }

        Ok(found)
    }

    /// Unspent outputs locked to `pub_key_hash`
    pub fn find_utxo(&self, pub_key_hash: &PubKeyHash) -> Result<Vec<TxOutput>, LedgerError> {
        Ok(self
            .find_unspent_outputs(pub_key_hash)?
            .into_iter()
            .map(|utxo| utxo.output)
            .collect())
    }

    /// Sum of unspent outputs owned by `address`
    pub fn get_balance(&self, address: &str) -> Result<u64, LedgerError> {
        let address: Address = address.parse()?;
        let pub_key_hash = address.pub_key_hash()?;

        self.find_utxo(&pub_key_hash)?
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.value))
            .ok_or_else(|| LedgerError::InvalidChain("balance overflows u64".to_string()))
    }

    /// Builds and signs a transaction moving `value` from `from` to `to`
    ///
    /// Unspent outputs are taken greedily in scan order until they cover
    /// `value`; any excess returns to the sender as a change output.
    pub fn build_spend(
        &self,
        value: u64,
        from: &Wallet,
        to: &str,
    ) -> Result<Transaction, LedgerError> {
        if value == 0 {
            return Err(LedgerError::InvalidTransaction(
                "spend value must be positive".to_string(),
            ));
        }
        let to: Address = to.parse()?;

        let mut accumulated: u64 = 0;
        let mut inputs = Vec::new();
        for utxo in self.find_unspent_outputs(&from.pub_key_hash())? {
            if accumulated >= value {
                break;
            }
            accumulated = accumulated.saturating_add(utxo.output.value);
            inputs.push(TxInput::new(utxo.txid, utxo.index, from.public_key().to_vec()));
        }

        if accumulated < value {
            return Err(LedgerError::InsufficientFunds {
                required: value,
                available: accumulated,
            });
        }

        let mut outputs = vec![TxOutput::new(value, &to)?];
        if accumulated > value {
            outputs.push(TxOutput::new(accumulated - value, from.address())?);
        }

        let mut transaction = Transaction::new(inputs, outputs)?;
        self.sign_transaction(&mut transaction, from)?;

        Ok(transaction)
    }

    /// Every (txid, output index) spent by some input on the chain
    fn spent_outpoints(&self) -> Result<HashSet<(Hash, i32)>, LedgerError> {
        let mut spent = HashSet::new();
        for block in self.iter() {
            for tx in block?.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                spent.extend(
                    tx.inputs
                        .iter()
                        .filter_map(|input| input.txid.map(|txid| (txid, input.vout))),
                );
            }
        }
        Ok(spent)
    }

    /// Checks a candidate block body against the current chain
    fn validate_transactions(&self, transactions: &[Transaction]) -> Result<(), LedgerError> {
        let spent = self.spent_outpoints()?;
        let mut claimed = HashSet::new();

        for tx in transactions {
            let reject = |reason: String| {
                warn!("Rejecting transaction {}: {}", tx.id, reason);
                Err(LedgerError::InvalidTransaction(format!("{}: {}", tx.id, reason)))
            };

            if tx.is_coinbase() {
                return reject("coinbase transactions are only minted in the genesis block".into());
            }
            if tx.inputs.is_empty() {
                return reject("transaction has no inputs".into());
            }
            if tx.hash()? != tx.id {
                return reject("id does not match transaction contents".into());
            }

            let previous = self.previous_transactions(tx)?;

            let mut input_total: u64 = 0;
            for input in &tx.inputs {
                let Some(txid) = input.txid else {
                    return reject("input does not reference a transaction".into());
                };
                let outpoint = (txid, input.vout);
                if spent.contains(&outpoint) || !claimed.insert(outpoint) {
                    return reject(format!("output {}:{} is already spent", txid, input.vout));
                }

                let output = usize::try_from(input.vout)
                    .ok()
                    .and_then(|vout| previous.get(&txid)?.outputs.get(vout));
                let Some(output) = output else {
                    return reject(format!("output {}:{} does not exist", txid, input.vout));
                };
                input_total = input_total.saturating_add(output.value);
            }

            let output_total = tx
                .outputs
                .iter()
                .try_fold(0u64, |total, output| total.checked_add(output.value));
            match output_total {
                Some(total) if total <= input_total => {}
                _ => return reject("outputs exceed inputs".into()),
            }

            if !tx.verify(&previous)? {
                return reject("signature verification failed".into());
            }
        }

        Ok(())
    }

    /// Verifies `transactions`, mines a block on top of the tip and persists it
    ///
    /// Nothing is written unless every transaction verifies.
    pub fn append_block(&self, transactions: Vec<Transaction>) -> Result<Block, LedgerError> {
        self.append_block_cancellable(transactions, &AtomicBool::new(false))
    }

    /// Like [`append_block`](Self::append_block), abandoning the search once `cancel` is set
    pub fn append_block_cancellable(
        &self,
        transactions: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Result<Block, LedgerError> {
        let _writer = self
            .append_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.validate_transactions(&transactions)?;

        let tip = self.tip();
        let block = Block::mine(transactions, Some(tip), cancel)?;
        self.storage.commit_block(&block, Some(tip))?;

        *self.tip.write().unwrap_or_else(PoisonError::into_inner) = block.hash;
        info!(
            "Appended block {} with {} transactions",
            block.hash,
            block.transactions.len()
        );

        Ok(block)
    }

    /// Walks tip to genesis re-checking every block
    ///
    /// # Returns
    ///
    /// The number of blocks, or [`LedgerError::InvalidChain`] naming the
    /// first cycle, dangling link, hash mismatch or failed proof-of-work.
    pub fn verify_chain(&self) -> Result<usize, LedgerError> {
        let mut seen = HashSet::new();
        let mut cursor = Some(self.tip());

        while let Some(hash) = cursor {
            if !seen.insert(hash) {
                return Err(LedgerError::InvalidChain(format!("cycle at block {}", hash)));
            }

            let block = match self.storage.get_block(&hash) {
                Ok(block) => block,
                Err(StorageError::NotFound(_)) => {
                    return Err(LedgerError::InvalidChain(format!(
                        "dangling reference to block {}",
                        hash
                    )))
                }
                Err(err) => return Err(err.into()),
            };

            if block.hash != hash {
                return Err(LedgerError::InvalidChain(format!(
                    "block stored under {} claims hash {}",
                    hash, block.hash
                )));
            }

            let pow = ProofOfWork::new(&block);
            if !pow.validate() || pow.hash_for(block.nonce) != block.hash {
                return Err(LedgerError::InvalidChain(format!(
                    "proof of work fails for block {}",
                    hash
                )));
            }

            cursor = block.prev_hash;
        }

        Ok(seen.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::SUBSIDY;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn new_ledger(dir: &TempDir, owner: &Wallet) -> Ledger {
        Ledger::create(dir.path().join("chain"), owner.address()).unwrap()
    }

    #[test]
    fn test_create_ledger() {
        let dir = TempDir::new().unwrap();
        let owner = Wallet::new();
        let ledger = new_ledger(&dir, &owner);

        let blocks = ledger.blocks().unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());
        assert!(blocks[0].transactions[0].is_coinbase());
        assert_eq!(ledger.tip(), blocks[0].hash);
        assert_eq!(ledger.get_balance(&owner.address().0).unwrap(), SUBSIDY);
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let owner = Wallet::new();
        drop(new_ledger(&dir, &owner));

        let err = Ledger::create(dir.path().join("chain"), owner.address()).unwrap_err();
        assert!(matches!(err, LedgerError::LedgerAlreadyExists(_)));
    }

    #[test]
    fn test_open_missing_ledger_fails() {
        let dir = TempDir::new().unwrap();
        let err = Ledger::open(dir.path().join("nothing-here")).unwrap_err();
        assert!(matches!(err, LedgerError::LedgerNotFound(_)));
        assert!(!dir.path().join("nothing-here").exists());

        // A store that exists but never received a genesis block.
        drop(BlockchainStorage::open(dir.path().join("empty")).unwrap());
        let err = Ledger::open(dir.path().join("empty")).unwrap_err();
        assert!(matches!(err, LedgerError::LedgerNotFound(_)));
    }

    #[test]
    fn test_send_updates_balances() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        let tx = ledger.build_spend(4, &alice, &bob.address().0).unwrap();
        assert_eq!(tx.outputs.len(), 2);
        ledger.append_block(vec![tx]).unwrap();

        let alice_balance = ledger.get_balance(&alice.address().0).unwrap();
        let bob_balance = ledger.get_balance(&bob.address().0).unwrap();
        assert_eq!(alice_balance, 6);
        assert_eq!(bob_balance, 4);
        assert_eq!(alice_balance + bob_balance, SUBSIDY);
        assert_eq!(ledger.verify_chain().unwrap(), 2);
    }

    #[test]
    fn test_exact_spend_has_no_change() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        let tx = ledger.build_spend(SUBSIDY, &alice, &bob.address().0).unwrap();
        assert_eq!(tx.outputs.len(), 1);
        ledger.append_block(vec![tx]).unwrap();

        assert_eq!(ledger.get_balance(&alice.address().0).unwrap(), 0);
        assert_eq!(ledger.get_balance(&bob.address().0).unwrap(), SUBSIDY);
        assert!(ledger.find_utxo(&alice.pub_key_hash()).unwrap().is_empty());
    }

    #[test]
    fn test_chained_spends() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let carol = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        let tx = ledger.build_spend(4, &alice, &bob.address().0).unwrap();
        ledger.append_block(vec![tx]).unwrap();
        let tx = ledger.build_spend(3, &bob, &carol.address().0).unwrap();
        ledger.append_block(vec![tx]).unwrap();
        let tx = ledger.build_spend(5, &alice, &carol.address().0).unwrap();
        ledger.append_block(vec![tx]).unwrap();

        assert_eq!(ledger.get_balance(&alice.address().0).unwrap(), 1);
        assert_eq!(ledger.get_balance(&bob.address().0).unwrap(), 1);
        assert_eq!(ledger.get_balance(&carol.address().0).unwrap(), 8);
        assert_eq!(ledger.verify_chain().unwrap(), 4);

        let unspent = ledger.find_unspent_transactions(&carol.pub_key_hash()).unwrap();
        assert_eq!(unspent.len(), 2);
    }

    #[test]
    fn test_insufficient_funds() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        let err = ledger
            .build_spend(SUBSIDY + 1, &alice, &bob.address().0)
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                required: 11,
                available: 10
            }
        ));

        let err = ledger.build_spend(1, &bob, &alice.address().0).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { available: 0, .. }
        ));
    }

    #[test]
    fn test_invalid_addresses() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        assert!(matches!(
            ledger.get_balance("garbage"),
            Err(LedgerError::InvalidAddress(_))
        ));
        assert!(matches!(
            ledger.build_spend(1, &alice, "1111111111"),
            Err(LedgerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_double_spend_rejected() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        let first = ledger.build_spend(4, &alice, &bob.address().0).unwrap();
        let second = ledger.build_spend(5, &alice, &bob.address().0).unwrap();

        // Both spend the genesis output: rejected together ...
        let tip = ledger.tip();
        let err = ledger
            .append_block(vec![first.clone(), second.clone()])
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransaction(_)));
        assert_eq!(ledger.tip(), tip);

        // ... and the second is rejected once the first is on chain.
        ledger.append_block(vec![first]).unwrap();
        let err = ledger.append_block(vec![second]).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransaction(_)));
        assert_eq!(ledger.get_balance(&bob.address().0).unwrap(), 4);
    }

    #[test]
    fn test_tampered_transaction_rejected_atomically() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = new_ledger(&dir, &alice);
        let tip = ledger.tip();

        let mut tx = ledger.build_spend(4, &alice, &bob.address().0).unwrap();
        tx.inputs[0].signature[5] ^= 0x01;
        tx.id = tx.hash().unwrap();
        assert!(!ledger.verify_transaction(&tx).unwrap());

        let err = ledger.append_block(vec![tx]).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransaction(_)));
        assert_eq!(ledger.tip(), tip);
        assert_eq!(ledger.blocks().unwrap().len(), 1);
    }

    #[test]
    fn test_inflated_outputs_rejected() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let ledger = new_ledger(&dir, &alice);
        let genesis_tx = ledger.blocks().unwrap()[0].transactions[0].clone();

        let input = TxInput::new(genesis_tx.id, 0, alice.public_key().to_vec());
        let output = TxOutput::new(SUBSIDY * 2, alice.address()).unwrap();
        let mut tx = Transaction::new(vec![input], vec![output]).unwrap();
        ledger.sign_transaction(&mut tx, &alice).unwrap();
        assert!(ledger.verify_transaction(&tx).unwrap());

        let err = ledger.append_block(vec![tx]).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransaction(_)));
    }

    #[test]
    fn test_unknown_previous_transaction_rejected() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        let input = TxInput::new(Hash([3u8; 32]), 0, alice.public_key().to_vec());
        let output = TxOutput::new(1, alice.address()).unwrap();
        let tx = Transaction::new(vec![input], vec![output]).unwrap();

        assert!(matches!(
            ledger.append_block(vec![tx]),
            Err(LedgerError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_coinbase_append_rejected() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        let coinbase = Transaction::new_coinbase("more", alice.address()).unwrap();
        assert!(matches!(
            ledger.append_block(vec![coinbase]),
            Err(LedgerError::InvalidTransaction(_))
        ));
        assert_eq!(ledger.get_balance(&alice.address().0).unwrap(), SUBSIDY);
    }

    #[test]
    fn test_find_transaction() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        let tx = ledger.build_spend(2, &alice, &bob.address().0).unwrap();
        ledger.append_block(vec![tx.clone()]).unwrap();

        assert_eq!(ledger.find_transaction(&tx.id).unwrap(), Some(tx));
        let genesis_tx = ledger.blocks().unwrap()[1].transactions[0].clone();
        assert_eq!(
            ledger.find_transaction(&genesis_tx.id).unwrap(),
            Some(genesis_tx)
        );
        assert_eq!(ledger.find_transaction(&Hash([0xaa; 32])).unwrap(), None);
    }

    #[test]
    fn test_cancelled_append_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = new_ledger(&dir, &alice);
        let tip = ledger.tip();

        let tx = ledger.build_spend(4, &alice, &bob.address().0).unwrap();
        let cancel = AtomicBool::new(true);
        let err = ledger.append_block_cancellable(vec![tx], &cancel).unwrap_err();

        assert!(matches!(err, LedgerError::Mining(MiningError::Cancelled { .. })));
        assert_eq!(ledger.tip(), tip);
        assert_eq!(ledger.get_balance(&bob.address().0).unwrap(), 0);
    }

    #[test]
    fn test_reopen_ledger() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let tip = {
            let ledger = new_ledger(&dir, &alice);
            let tx = ledger.build_spend(4, &alice, &bob.address().0).unwrap();
            ledger.append_block(vec![tx]).unwrap().hash
        };

        let ledger = Ledger::open(dir.path().join("chain")).unwrap();
        assert_eq!(ledger.tip(), tip);
        assert_eq!(ledger.get_balance(&alice.address().0).unwrap(), 6);
        assert_eq!(ledger.get_balance(&bob.address().0).unwrap(), 4);
    }

    #[test]
    fn test_concurrent_appends_are_serialised() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let ledger = Arc::new(new_ledger(&dir, &alice));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || ledger.append_block(Vec::new()).map(|b| b.hash))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(ledger.verify_chain().unwrap(), 3);
        assert_eq!(ledger.get_balance(&alice.address().0).unwrap(), SUBSIDY);
    }

    #[test]
    fn test_tampered_nonce_detected() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let ledger = new_ledger(&dir, &alice);
        let tip = ledger.tip();

        let mut block = ledger.storage.get_block(&tip).unwrap();
        block.nonce += 1;
        while ProofOfWork::new(&block).validate() {
            block.nonce += 1;
        }
        ledger.storage.overwrite_block(&tip, &block).unwrap();

        let reread = ledger.storage.get_block(&tip).unwrap();
        assert!(!ProofOfWork::new(&reread).validate());
        assert!(matches!(
            ledger.verify_chain(),
            Err(LedgerError::InvalidChain(_))
        ));
    }

    #[test]
    fn test_dangling_prev_hash_detected() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let ledger = new_ledger(&dir, &alice);
        let block = ledger.append_block(Vec::new()).unwrap();

        let mut tampered = block.clone();
        tampered.prev_hash = Some(Hash([0x42; 32]));
        ledger.storage.overwrite_block(&block.hash, &tampered).unwrap();

        let err = ledger.verify_chain().unwrap_err();
        assert!(matches!(err, LedgerError::InvalidChain(_)));
    }

    #[test]
    fn test_cycle_detected() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let ledger = new_ledger(&dir, &alice);
        let genesis = ledger.tip();
        let block = ledger.append_block(Vec::new()).unwrap();

        // Point genesis back at the tip.
        let mut looped = ledger.storage.get_block(&genesis).unwrap();
        looped.prev_hash = Some(block.hash);
        ledger.storage.overwrite_block(&genesis, &looped).unwrap();

        let err = ledger.verify_chain().unwrap_err();
        assert!(matches!(err, LedgerError::InvalidChain(_)));
    }

    #[test]
    fn test_reads_stop_on_cycle() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = new_ledger(&dir, &alice);
        let genesis = ledger.tip();
        let block = ledger.append_block(Vec::new()).unwrap();

        let mut looped = ledger.storage.get_block(&genesis).unwrap();
        looped.prev_hash = Some(block.hash);
        ledger.storage.overwrite_block(&genesis, &looped).unwrap();

        assert_eq!(ledger.iter().count(), 3);
        assert!(matches!(ledger.blocks(), Err(LedgerError::InvalidChain(_))));
        assert!(matches!(
            ledger.get_balance(&alice.address().0),
            Err(LedgerError::InvalidChain(_))
        ));
        assert!(matches!(
            ledger.find_transaction(&Hash([1; 32])),
            Err(LedgerError::InvalidChain(_))
        ));
        assert!(matches!(
            ledger.build_spend(1, &alice, &bob.address().0),
            Err(LedgerError::InvalidChain(_))
        ));
    }

    #[test]
    fn test_malformed_block_surfaces_as_encoding_error() {
        let dir = TempDir::new().unwrap();
        let alice = Wallet::new();
        let ledger = new_ledger(&dir, &alice);

        ledger.storage.overwrite_raw(&ledger.tip(), &[0xde, 0xad]).unwrap();
        assert!(matches!(
            ledger.blocks(),
            Err(LedgerError::MalformedEncoding(_))
        ));
    }
}
