//! Invoice-side types. The payment node owns invoices; the proxy only ever
//! sees the `(payment_hash, preimage)` pair and the settlement state.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::Error;

/// SHA-256 hash of the invoice preimage. Revealed in the invoice itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentHash(pub [u8; 32]);

impl PaymentHash {
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes: [u8; 32] = hex::decode(s)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| Error::Decode("payment hash must be 32 hex-encoded bytes".into()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// The 32-byte secret whose SHA-256 is the payment hash. Knowledge of the
/// preimage proves the invoice was paid.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes: [u8; 32] = hex::decode(s)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| Error::Decode("preimage must be 32 hex-encoded bytes".into()))?;
        Ok(Self(bytes))
    }

    pub fn payment_hash(&self) -> PaymentHash {
        let digest = Sha256::digest(self.0);
        PaymentHash(digest.into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// Never print the preimage itself.
impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Preimage([REDACTED])")
    }
}

/// Settlement state of an invoice as reported by the payment node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    Open,
    Settled,
    Canceled,
}

/// An invoice issued by the backing payment node.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub payment_hash: PaymentHash,
    /// The encoded invoice handed to the client (opaque to the proxy).
    pub payment_request: String,
    pub amount_msat: u64,
    pub state: InvoiceState,
}
