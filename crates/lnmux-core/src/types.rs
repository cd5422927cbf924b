use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use crate::error::CoreError;

/// Decode a 64-character hex string into 32 bytes.
fn decode_32(s: &str) -> Result<[u8; 32], CoreError> {
    let bytes = hex::decode(s).map_err(|e| CoreError::InvalidHex(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| CoreError::InvalidLength {
        expected: 32,
        actual: bytes.len(),
    })
}

/// Amount in millisatoshis.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MilliSatoshi(pub u64);

impl MilliSatoshi {
    pub const ZERO: MilliSatoshi = MilliSatoshi(0);

    pub fn new(msat: u64) -> Self {
        Self(msat)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for MilliSatoshi {
    type Output = MilliSatoshi;

    fn add(self, rhs: Self) -> Self::Output {
        MilliSatoshi(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for MilliSatoshi {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl fmt::Display for MilliSatoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} msat", self.0)
    }
}

/// SHA-256 hash of a payment preimage; the public identity of an invoice.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PaymentHash(pub [u8; 32]);

impl PaymentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", self.to_hex())
    }
}

impl FromStr for PaymentHash {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s).map(Self)
    }
}

/// The secret whose hash identifies an invoice.
///
/// Revealing it settles every HTLC paying the invoice, so `Debug` never
/// prints the bytes.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
    /// Generate a fresh random preimage.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Compute the payment hash, `sha256(preimage)`.
    pub fn hash(&self) -> PaymentHash {
        let digest = Sha256::digest(self.0);
        PaymentHash(digest.into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check whether this preimage hashes to `hash`.
    pub fn matches(&self, hash: &PaymentHash) -> bool {
        self.hash() == *hash
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Preimage(..)")
    }
}

impl FromStr for Preimage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s).map(Self)
    }
}

/// Per-invoice payment address (payment secret) carried in the MPP record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentAddr(pub [u8; 32]);

impl PaymentAddr {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PaymentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentAddr(..)")
    }
}

impl FromStr for PaymentAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s).map(Self)
    }
}
