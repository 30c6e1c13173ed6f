//! Wire forms of the challenge-response exchange: the `WWW-Authenticate`
//! challenge emitted with a 402 and the `Authorization` credentials a client
//! presents after paying.

use crate::error::Error;
use crate::invoice::Preimage;
use crate::token::Token;

/// The authentication scheme name used on both headers.
pub const AUTH_SCHEME: &str = "LSAT";

/// A fresh challenge: an unpaid token plus the invoice that funds it.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub token: Token,
    pub payment_request: String,
}

impl Challenge {
    /// Render the `WWW-Authenticate` header value:
    /// `LSAT macaroon="<b64>", invoice="<payment request>"`.
    pub fn header_value(&self) -> String {
        format!(
            "{AUTH_SCHEME} macaroon=\"{}\", invoice=\"{}\"",
            self.token.encode(),
            self.payment_request
        )
    }
}

/// Parsed client credentials from `Authorization: LSAT <b64token>:<hexpreimage>`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: Token,
    pub preimage: Preimage,
}

/// Parse an `Authorization` header value. Any deviation from the expected
/// shape is [`Error::MalformedHeader`]; the caller turns that into a fresh
/// challenge rather than reporting what exactly was wrong.
pub fn parse_authorization(value: &str) -> Result<Credentials, Error> {
    let rest = value
        .strip_prefix(AUTH_SCHEME)
        .ok_or(Error::MalformedHeader)?
        .strip_prefix(' ')
        .ok_or(Error::MalformedHeader)?;

    let (token_b64, preimage_hex) = rest.rsplit_once(':').ok_or(Error::MalformedHeader)?;
    let token = Token::decode(token_b64.trim()).map_err(|_| Error::MalformedHeader)?;
    let preimage = Preimage::from_hex(preimage_hex.trim()).map_err(|_| Error::MalformedHeader)?;

    Ok(Credentials { token, preimage })
}
