//! L402 capability credentials.
//!
//! A token is a macaroon-style bearer credential funded by a payment-node
//! invoice: the proxy challenges an unauthenticated client with an invoice
//! and an unpaid token, and the client redeems both by presenting the token
//! together with the invoice preimage.
//!
//! # Modules
//!
//! - [`token`] — wire format, chain-HMAC signature, attenuation
//! - [`caveat`] — `key=value` restrictions and their evaluation
//! - [`mint`] — minting against a [`Challenger`] and verification
//! - [`secrets`] — the signing-secret store and its backends
//! - [`invoice`] / [`challenge`] — payment-side and header-side types

pub mod caveat;
pub mod challenge;
pub mod error;
pub mod invoice;
pub mod mint;
pub mod secrets;
pub mod token;

pub use caveat::{Caveat, Context};
pub use challenge::{parse_authorization, Challenge, Credentials, AUTH_SCHEME};
pub use error::Error;
pub use invoice::{Invoice, InvoiceState, PaymentHash, Preimage};
pub use mint::{Challenger, Mint, ServiceLimiter};
pub use secrets::{MemSecretStore, SecretStore, SqliteSecretStore};
pub use token::{Token, TokenId, TOKEN_VERSION};
