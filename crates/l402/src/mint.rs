//! The mint creates tokens bound to a fresh invoice and validates presented
//! tokens end to end: signature chain, preimage, settlement, caveats.

use std::sync::Arc;

use async_trait::async_trait;

use crate::caveat::{self, Caveat, Context, COND_PAYMENT_HASH, COND_PRICE_MSAT};
use crate::error::Error;
use crate::invoice::{Invoice, InvoiceState, PaymentHash, Preimage};
use crate::secrets::SecretStore;
use crate::token::{Token, TokenId};

/// Issues invoices and reports their settlement state.
///
/// `verify_invoice_status` must be a local read: the mint calls it on the
/// hot verification path and expects it never to block on network I/O.
#[async_trait]
pub trait Challenger: Send + Sync {
    /// Ask the payment node for a new invoice over `price_msat`.
    async fn new_challenge(&self, price_msat: u64) -> Result<Invoice, Error>;

    /// Current cached settlement state for the hash.
    fn verify_invoice_status(&self, hash: &PaymentHash) -> Result<InvoiceState, Error>;

    /// The encoded payment request for a known invoice, used to re-send an
    /// unpaid challenge without minting a new one.
    fn payment_request(&self, hash: &PaymentHash) -> Option<String>;
}

/// Resolves a service name to the caveats that scope a token for it.
/// An empty list means the service is unknown.
pub trait ServiceLimiter: Send + Sync {
    fn caveats_for(&self, service: &str) -> Vec<Caveat>;
}

/// Token mint. Stateless apart from its collaborators.
pub struct Mint {
    challenger: Arc<dyn Challenger>,
    secrets: Arc<dyn SecretStore>,
    limiter: Arc<dyn ServiceLimiter>,
}

impl Mint {
    pub fn new(
        challenger: Arc<dyn Challenger>,
        secrets: Arc<dyn SecretStore>,
        limiter: Arc<dyn ServiceLimiter>,
    ) -> Self {
        Self {
            challenger,
            secrets,
            limiter,
        }
    }

    /// Mint a fresh token for `service` together with the invoice that funds
    /// it. The returned token is unpaid: it only verifies once the invoice
    /// settles.
    pub async fn mint_with_challenge(&self, service: &str) -> Result<(Token, Invoice), Error> {
        let scoped = self.limiter.caveats_for(service);
        if scoped.is_empty() {
            return Err(Error::UnknownService(service.to_string()));
        }
        let price_msat = scoped
            .iter()
            .find(|c| c.key == COND_PRICE_MSAT)
            .and_then(|c| c.value.parse().ok())
            .unwrap_or(0);

        let invoice = self.challenger.new_challenge(price_msat).await?;

        // Fresh random id; retry exactly once if we lose the create race.
        let mut id = TokenId::random()?;
        let secret = match self.secrets.new_secret(&id) {
            Ok(secret) => secret,
            Err(Error::AlreadyExists) => {
                id = TokenId::random()?;
                self.secrets.new_secret(&id)?
            }
            Err(e) => return Err(e),
        };

        // The payment hash is the first caveat: it binds the invoice into
        // the very first signature link.
        let mut caveats =
            vec![Caveat::new(COND_PAYMENT_HASH, invoice.payment_hash.to_string())?];
        caveats.extend(scoped);

        let token = Token::mint(id, &secret, caveats);
        tracing::debug!(token_id = %id, payment_hash = %invoice.payment_hash,
            service, "minted token");
        Ok((token, invoice))
    }

    /// Validate a presented token and preimage against the request context.
    ///
    /// Verification is read-only: calling it twice with the same inputs is
    /// indistinguishable from calling it once.
    pub fn verify(
        &self,
        token: &Token,
        preimage: &Preimage,
        ctx: &Context,
    ) -> Result<(), Error> {
        let secret = match self.secrets.reveal_secret(token.id()) {
            Ok(secret) => secret,
            Err(Error::NotFound) => return Err(Error::InvalidToken),
            Err(e) => return Err(e),
        };

        if !token.verify_signature(&secret) {
            return Err(Error::InvalidToken);
        }

        let payment_hash = token.payment_hash().ok_or(Error::InvalidToken)?;
        if preimage.payment_hash() != payment_hash {
            return Err(Error::InvalidPreimage);
        }

        match self.challenger.verify_invoice_status(&payment_hash)? {
            InvoiceState::Settled => {}
            InvoiceState::Open => return Err(Error::PaymentPending),
            InvoiceState::Canceled => return Err(Error::PaymentCanceled),
        }

        caveat::evaluate(token.caveats(), ctx)
    }
}
