use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashMap;

use super::codec::{sha256, Hash};
use super::crypto::{
    hash_pub_key, sign_digest, verify_digest, Address, CryptoError, PrivateKey, PubKeyHash,
};

/// Value minted by a coinbase transaction
pub const SUBSIDY: u64 = 10;

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_VOUT: i32 = -1;

/// Previous transactions an input set refers to, keyed by transaction id
pub type PreviousTransactions = HashMap<Hash, Transaction>;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Previous transaction {0} was not supplied")]
    MissingPreviousTransaction(Hash),

    #[error("Output index {vout} out of range for transaction {txid}")]
    OutputIndexOutOfRange { txid: Hash, vout: i32 },

    #[error("Input {0} does not reference a previous transaction")]
    DetachedInput(usize),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Reference to a previous output plus the proof of the right to spend it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction holding the spent output; `None` for coinbase
    pub txid: Option<Hash>,

    /// Index of the spent output, or [`COINBASE_VOUT`]
    pub vout: i32,

    /// r || s over the per-input signing payload
    pub signature: Vec<u8>,

    /// Spender's X || Y public key (arbitrary data for coinbase)
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Creates an unsigned input spending `txid:vout` with the given public key
    pub fn new(txid: Hash, vout: i32, pub_key: Vec<u8>) -> Self {
        TxInput {
            txid: Some(txid),
            vout,
            signature: Vec::new(),
            pub_key,
        }
    }

    /// Whether this input was created by the owner of `pub_key_hash`
    pub fn uses_key(&self, pub_key_hash: &PubKeyHash) -> bool {
        hash_pub_key(&self.pub_key) == *pub_key_hash
    }
}

/// An amount locked to a public key hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: PubKeyHash,
}

impl TxOutput {
    /// Creates an output locked to `address`
    pub fn new(value: u64, address: &Address) -> Result<Self, CryptoError> {
        Ok(TxOutput {
            value,
            pub_key_hash: address.pub_key_hash()?,
        })
    }

    pub fn is_locked_with(&self, pub_key_hash: &PubKeyHash) -> bool {
        self.pub_key_hash == *pub_key_hash
    }
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 of the encoded inputs and outputs
    pub id: Hash,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// The hashed part of a transaction. The id itself never feeds its own hash.
#[derive(Serialize)]
struct TransactionBody<'a> {
    inputs: &'a [TxInput],
    outputs: &'a [TxOutput],
}

impl Transaction {
    /// Creates a transaction and computes its id from the fields as given
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Result<Self, TransactionError> {
        let mut transaction = Transaction {
            id: Hash::default(),
            inputs,
            outputs,
        };
        transaction.id = transaction.hash()?;
        Ok(transaction)
    }

    /// Creates a coinbase transaction paying [`SUBSIDY`] to `to`
    ///
    /// # Arguments
    ///
    /// * `data` - Arbitrary data stored in the input; an empty string is
    ///   replaced by a reward note naming the recipient
    /// * `to` - The address receiving the subsidy
    pub fn new_coinbase(data: &str, to: &Address) -> Result<Self, TransactionError> {
        let data = if data.is_empty() {
            format!("Reward to '{}'", to)
        } else {
            data.to_string()
        };

        let input = TxInput {
            txid: None,
            vout: COINBASE_VOUT,
            signature: Vec::new(),
            pub_key: data.into_bytes(),
        };
        let output = TxOutput::new(SUBSIDY, to)?;

        Self::new(vec![input], vec![output])
    }

    /// Recomputes the identity hash from the current inputs and outputs
    pub fn hash(&self) -> Result<Hash, TransactionError> {
        let body = TransactionBody {
            inputs: &self.inputs,
            outputs: &self.outputs,
        };
        let encoded =
            bincode::serialize(&body).map_err(|e| TransactionError::EncodingError(e.to_string()))?;
        Ok(sha256(&encoded))
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].txid.is_none()
            && self.inputs[0].vout == COINBASE_VOUT
    }

    /// A fresh copy with every signature and public key cleared and no id
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                txid: input.txid,
                vout: input.vout,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: Hash::default(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Bytes that get signed for input `index`: the hash of the trimmed copy
    /// with that input's public key slot holding the spent output's lock.
    fn signing_payload(
        &self,
        index: usize,
        locking_hash: &PubKeyHash,
    ) -> Result<Hash, TransactionError> {
        let mut view = self.trimmed_copy();
        view.inputs[index].pub_key = locking_hash.as_bytes().to_vec();
        view.hash()
    }

    /// Looks up the output that input `index` spends
    fn spent_output<'a>(
        &self,
        index: usize,
        previous: &'a PreviousTransactions,
    ) -> Result<&'a TxOutput, TransactionError> {
        let input = &self.inputs[index];
        let txid = input.txid.ok_or(TransactionError::DetachedInput(index))?;
        let previous_tx = previous
            .get(&txid)
            .ok_or(TransactionError::MissingPreviousTransaction(txid))?;

        usize::try_from(input.vout)
            .ok()
            .and_then(|vout| previous_tx.outputs.get(vout))
            .ok_or(TransactionError::OutputIndexOutOfRange {
                txid,
                vout: input.vout,
            })
    }

    /// Signs every input with `private_key`
    ///
    /// `previous` must contain every transaction an input refers to. The id is
    /// recomputed once all signatures are attached. Coinbase transactions are
    /// left untouched.
    pub fn sign(
        &mut self,
        private_key: &PrivateKey,
        previous: &PreviousTransactions,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut signatures = Vec::with_capacity(self.inputs.len());
        for index in 0..self.inputs.len() {
            let spent = self.spent_output(index, previous)?;
            let payload = self.signing_payload(index, &spent.pub_key_hash)?;
            signatures.push(sign_digest(private_key, &payload)?);
        }

        for (input, signature) in self.inputs.iter_mut().zip(signatures) {
            input.signature = signature;
        }
        self.id = self.hash()?;

        Ok(())
    }

    /// Verifies every input's signature against the outputs it spends
    ///
    /// # Returns
    ///
    /// `Ok(false)` if any input fails; an error if `previous` is missing a
    /// referenced transaction or output.
    pub fn verify(&self, previous: &PreviousTransactions) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        for (index, input) in self.inputs.iter().enumerate() {
            let spent = self.spent_output(index, previous)?;

            if !input.uses_key(&spent.pub_key_hash) {
                return Ok(false);
            }

            let payload = self.signing_payload(index, &spent.pub_key_hash)?;
            if !verify_digest(&input.pub_key, &payload, &input.signature) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
