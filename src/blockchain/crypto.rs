use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

use super::codec::Hash;

/// Version byte prefixed to every address payload
pub const ADDRESS_VERSION: u8 = 0x00;

/// Size of one P-256 field element / scalar in bytes
pub const COORDINATE_LEN: usize = 32;

/// Raw public key: X || Y, each zero padded to 32 bytes
pub const PUBLIC_KEY_LEN: usize = 2 * COORDINATE_LEN;

/// Raw signature: r || s, each zero padded to 32 bytes
pub const SIGNATURE_LEN: usize = 2 * COORDINATE_LEN;

pub const PUB_KEY_HASH_LEN: usize = 20;

const CHECKSUM_LEN: usize = 4;

/// Private signing key on the P-256 curve
pub type PrivateKey = SigningKey;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Failed to sign message: {0}")]
    SigningError(String),
}

/// RIPEMD-160 of the SHA-256 of a public key; locks an output to its owner
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKeyHash(pub [u8; PUB_KEY_HASH_LEN]);

impl PubKeyHash {
    pub fn as_bytes(&self) -> &[u8; PUB_KEY_HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for PubKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKeyHash({})", hex::encode(self.0))
    }
}

/// Hashes a raw public key into the form used to lock outputs
pub fn hash_pub_key(public_key: &[u8]) -> PubKeyHash {
    let sha = Sha256::digest(public_key);
    PubKeyHash(Ripemd160::digest(sha).into())
}

fn checksum(versioned_payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let first = Sha256::digest(versioned_payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

/// Base58Check encoding: base58(version || payload || checksum)
pub fn check_encode(payload: &[u8], version: u8) -> String {
    let mut bytes = Vec::with_capacity(1 + payload.len() + CHECKSUM_LEN);
    bytes.push(version);
    bytes.extend_from_slice(payload);
    let sum = checksum(&bytes);
    bytes.extend_from_slice(&sum);
    bs58::encode(bytes).into_string()
}

/// Inverse of [`check_encode`]. Returns the payload and its version byte.
///
/// Fails on invalid base58 characters, on input too short to carry a
/// version and checksum, and on checksum mismatch.
pub fn check_decode(encoded: &str) -> Result<(Vec<u8>, u8), CryptoError> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;

    if bytes.len() < 1 + CHECKSUM_LEN {
        return Err(CryptoError::InvalidAddress(format!(
            "decoded address is only {} bytes",
            bytes.len()
        )));
    }

    let (body, sum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if checksum(body) != sum {
        return Err(CryptoError::InvalidAddress("checksum mismatch".to_string()));
    }

    Ok((body[1..].to_vec(), body[0]))
}

/// Represents a wallet address (base58check of a public key hash)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Creates a new address from a public key hash
    pub fn from_pub_key_hash(pub_key_hash: &PubKeyHash) -> Self {
        Address(check_encode(pub_key_hash.as_bytes(), ADDRESS_VERSION))
    }

    /// Creates a new address from a raw public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self::from_pub_key_hash(&hash_pub_key(public_key))
    }

    /// Decodes the address back into the public key hash it encodes
    pub fn pub_key_hash(&self) -> Result<PubKeyHash, CryptoError> {
        let (payload, version) = check_decode(&self.0)?;

        if version != ADDRESS_VERSION {
            return Err(CryptoError::InvalidAddress(format!(
                "unexpected version byte {:#04x}",
                version
            )));
        }

        let hash: [u8; PUB_KEY_HASH_LEN] = payload.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidAddress(format!(
                "payload must be {} bytes, got {}",
                PUB_KEY_HASH_LEN,
                payload.len()
            ))
        })?;

        Ok(PubKeyHash(hash))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_string());
        address.pub_key_hash()?;
        Ok(address)
    }
}

/// Serializes a verifying key as fixed-width X || Y
pub fn encode_public_key(verifying_key: &VerifyingKey) -> Vec<u8> {
    let point = p256::PublicKey::from(verifying_key).to_encoded_point(false);
    // Uncompressed SEC1 is 0x04 || X || Y with both coordinates padded.
    point.as_bytes()[1..].to_vec()
}

fn decode_public_key(public_key: &[u8]) -> Option<VerifyingKey> {
    if public_key.len() != PUBLIC_KEY_LEN {
        return None;
    }
    let mut sec1 = Vec::with_capacity(1 + PUBLIC_KEY_LEN);
    sec1.push(0x04);
    sec1.extend_from_slice(public_key);
    VerifyingKey::from_sec1_bytes(&sec1).ok()
}

/// Signs a 32-byte digest directly (no further hashing); returns r || s
pub fn sign_digest(private_key: &PrivateKey, digest: &Hash) -> Result<Vec<u8>, CryptoError> {
    let signature: Signature = private_key
        .sign_prehash(digest.as_bytes())
        .map_err(|e| CryptoError::SigningError(e.to_string()))?;
    Ok(signature.to_bytes().to_vec())
}

/// Verifies an r || s signature over a digest against an X || Y public key.
///
/// Anything that is not exactly 64 bytes is rejected rather than split.
pub fn verify_digest(public_key: &[u8], digest: &Hash, signature: &[u8]) -> bool {
    if signature.len() != SIGNATURE_LEN {
        return false;
    }
    let Some(verifying_key) = decode_public_key(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key
        .verify_prehash(digest.as_bytes(), &signature)
        .is_ok()
}

/// Represents a wallet with a keypair
#[derive(Debug, Clone)]
pub struct Wallet {
    private_key: PrivateKey,
    public_key: Vec<u8>,
    address: Address,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        Self::from_private_key(SigningKey::random(&mut OsRng))
    }

    fn from_private_key(private_key: PrivateKey) -> Self {
        let public_key = encode_public_key(private_key.verifying_key());
        let address = Address::from_public_key(&public_key);

        Wallet {
            private_key,
            public_key,
            address,
        }
    }

    /// Creates a wallet from an existing 32-byte secret scalar
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let private_key = SigningKey::from_slice(secret_key_bytes)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self::from_private_key(private_key))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Raw X || Y public key bytes
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn pub_key_hash(&self) -> PubKeyHash {
        hash_pub_key(&self.public_key)
    }

    /// Exports the wallet's secret scalar as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.private_key.to_bytes().to_vec()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}
