//! The capability credential: a macaroon-style bearer token.
//!
//! A token is a 32-byte identifier, an ordered caveat list and a chained
//! HMAC-SHA256 signature. The chain is what makes holder-side attenuation
//! work: each caveat's HMAC seeds the next, so a holder can append a caveat
//! and re-derive the signature from the last link without the root secret,
//! but can never remove or reorder caveats without invalidating the chain.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::caveat::{Caveat, COND_PAYMENT_HASH};
use crate::error::Error;
use crate::invoice::PaymentHash;

type HmacSha256 = Hmac<Sha256>;

/// Current wire format version.
pub const TOKEN_VERSION: u8 = 0;

// Decode hardening. Tokens come straight off the wire from untrusted
// clients, so bound everything before allocating.
const MAX_CAVEATS: u64 = 256;
const MAX_CAVEAT_LEN: u64 = 4096;

/// Opaque 32-byte token identifier, uniformly random.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(pub [u8; 32]);

impl TokenId {
    pub fn random() -> Result<Self, Error> {
        let mut id = [0u8; 32];
        getrandom::fill(&mut id).map_err(|e| Error::Rng(e.to_string()))?;
        Ok(Self(id))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A minted (or attenuated) token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    id: TokenId,
    caveats: Vec<Caveat>,
    signature: [u8; 32],
}

/// Build the unfinalized HMAC chain over `secret` and the caveat list.
/// `sig0 = HMAC(secret, "")`, `sig[i+1] = HMAC(sig[i], caveat[i])`; the
/// returned mac finalizes to the last link.
fn chain_mac(secret: &[u8; 32], caveats: &[Caveat]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    for caveat in caveats {
        let key = mac.finalize().into_bytes();
        mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
        mac.update(&caveat.encode());
    }
    mac
}

impl Token {
    /// Mint a token over the full caveat list with the root secret.
    pub fn mint(id: TokenId, secret: &[u8; 32], caveats: Vec<Caveat>) -> Self {
        let signature = chain_mac(secret, &caveats).finalize().into_bytes().into();
        Self {
            id,
            caveats,
            signature,
        }
    }

    pub fn id(&self) -> &TokenId {
        &self.id
    }

    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    /// Append a caveat, narrowing the capability. Re-derives the signature
    /// from the current last link only; no secret required.
    pub fn attenuate(&self, caveat: Caveat) -> Self {
        let mut mac =
            HmacSha256::new_from_slice(&self.signature).expect("HMAC accepts any key length");
        mac.update(&caveat.encode());
        let signature = mac.finalize().into_bytes().into();

        let mut caveats = self.caveats.clone();
        caveats.push(caveat);
        Self {
            id: self.id,
            caveats,
            signature,
        }
    }

    /// Recompute the chain from the root secret and compare in constant time.
    pub fn verify_signature(&self, secret: &[u8; 32]) -> bool {
        chain_mac(secret, &self.caveats)
            .verify_slice(&self.signature)
            .is_ok()
    }

    /// The payment hash bound by the first `payment_hash` caveat, if any.
    pub fn payment_hash(&self) -> Option<PaymentHash> {
        self.caveats
            .iter()
            .find(|c| c.key == COND_PAYMENT_HASH)
            .and_then(|c| PaymentHash::from_hex(&c.value).ok())
    }

    /// Serialize to the wire encoding: base64-URL (no padding) over
    /// `version ‖ id ‖ caveat_count ‖ (len ‖ bytes)* ‖ signature`.
    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(128);
        buf.push(TOKEN_VERSION);
        buf.extend_from_slice(&self.id.0);
        write_varint(&mut buf, self.caveats.len() as u64);
        for caveat in &self.caveats {
            let bytes = caveat.encode();
            write_varint(&mut buf, bytes.len() as u64);
            buf.extend_from_slice(&bytes);
        }
        buf.extend_from_slice(&self.signature);
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Parse the wire encoding. Rejects unknown versions, truncated input,
    /// oversized fields and trailing bytes.
    pub fn decode(encoded: &str) -> Result<Self, Error> {
        let buf = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::Decode(format!("invalid base64: {e}")))?;
        let mut cursor = Cursor::new(&buf);

        let version = cursor.read_u8()?;
        if version != TOKEN_VERSION {
            return Err(Error::Decode(format!("unsupported version {version}")));
        }

        let id = TokenId(cursor.read_array()?);

        let count = cursor.read_varint()?;
        if count > MAX_CAVEATS {
            return Err(Error::Decode("too many caveats".into()));
        }
        let mut caveats = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = cursor.read_varint()?;
            if len > MAX_CAVEAT_LEN {
                return Err(Error::Decode("caveat too long".into()));
            }
            let bytes = cursor.read_slice(len as usize)?;
            caveats.push(Caveat::parse(bytes)?);
        }

        let signature = cursor.read_array()?;
        if !cursor.is_empty() {
            return Err(Error::Decode("trailing bytes after signature".into()));
        }

        Ok(Self {
            id,
            caveats,
            signature,
        })
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::Decode("unexpected end of token".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::Decode("unexpected end of token".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        Ok(self.read_slice(N)?.try_into().expect("length checked"))
    }

    fn read_varint(&mut self) -> Result<u64, Error> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::Decode("varint too long".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caveat::COND_SERVICES;

    fn secret() -> [u8; 32] {
        [0x5a; 32]
    }

    fn sample_token() -> Token {
        let caveats = vec![
            Caveat::new(COND_PAYMENT_HASH, hex::encode([9u8; 32])).unwrap(),
            Caveat::new(COND_SERVICES, "echo:0").unwrap(),
            Caveat::new("price_msat", "1000").unwrap(),
        ];
        Token::mint(TokenId([1u8; 32]), &secret(), caveats)
    }

    #[test]
    fn encode_decode_is_identity() {
        let token = sample_token();
        let encoded = token.encode();
        let decoded = Token::decode(&encoded).unwrap();
        assert_eq!(decoded, token);
        // Byte-exact round trip.
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn signature_verifies_with_root_secret_only() {
        let token = sample_token();
        assert!(token.verify_signature(&secret()));
        assert!(!token.verify_signature(&[0u8; 32]));
    }

    #[test]
    fn attenuated_token_still_verifies() {
        let token = sample_token();
        let narrowed = token.attenuate(Caveat::new("valid_until", "1700000000").unwrap());
        assert!(narrowed.verify_signature(&secret()));
        assert_eq!(narrowed.caveats().len(), 4);
    }

    #[test]
    fn removing_a_caveat_invalidates() {
        let token = sample_token();
        let narrowed = token.attenuate(Caveat::new("valid_until", "1700000000").unwrap());

        // Strip the last caveat but keep the narrowed signature.
        let stripped = Token {
            id: *narrowed.id(),
            caveats: token.caveats().to_vec(),
            signature: narrowed.signature,
        };
        assert!(!stripped.verify_signature(&secret()));
    }

    #[test]
    fn reordering_caveats_invalidates() {
        let token = sample_token();
        let mut caveats = token.caveats().to_vec();
        caveats.swap(1, 2);
        let reordered = Token {
            id: *token.id(),
            caveats,
            signature: token.signature,
        };
        assert!(!reordered.verify_signature(&secret()));
    }

    #[test]
    fn decode_rejects_malformed_input() {
        let token = sample_token();
        let encoded = token.encode();

        // Unknown version byte.
        let mut raw = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        raw[0] = 9;
        assert!(Token::decode(&URL_SAFE_NO_PAD.encode(&raw)).is_err());

        // Truncated.
        let raw = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        let truncated = &raw[..raw.len() - 5];
        assert!(Token::decode(&URL_SAFE_NO_PAD.encode(truncated)).is_err());

        // Trailing garbage.
        let mut raw = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        raw.push(0);
        assert!(Token::decode(&URL_SAFE_NO_PAD.encode(&raw)).is_err());

        // Not base64 at all.
        assert!(Token::decode("!!!not-base64!!!").is_err());
    }

    #[test]
    fn payment_hash_is_read_from_first_caveat() {
        let token = sample_token();
        assert_eq!(token.payment_hash().unwrap(), PaymentHash([9u8; 32]));
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut cursor = Cursor::new(&buf);
            assert_eq!(cursor.read_varint().unwrap(), value);
            assert!(cursor.is_empty());
        }
    }
}
