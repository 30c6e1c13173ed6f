//! Caveats are `key=value` restrictions attached to a token. Adding a caveat
//! can only ever narrow what the token authorizes: every caveat in a token is
//! evaluated independently, so duplicate keys AND together.

use std::fmt;

use crate::error::Error;

/// Condition binding the token to the services it may access, as a
/// comma-separated list of `name:tier` entries. Always present.
pub const COND_SERVICES: &str = "services";

/// Condition binding the token to the payment hash of the invoice that funds
/// it. Structural: checked against the presented preimage by the mint, not
/// evaluated against the request context.
pub const COND_PAYMENT_HASH: &str = "payment_hash";

/// Condition restricting the capabilities the token grants, as a
/// comma-separated list.
pub const COND_CAPABILITIES: &str = "capabilities";

/// Condition bounding the token lifetime, as unix seconds.
pub const COND_VALID_UNTIL: &str = "valid_until";

/// The price that was quoted when the token was minted, in millisatoshis.
pub const COND_PRICE_MSAT: &str = "price_msat";

/// A single `key=value` assertion. Keys are lowercase ASCII and must not
/// contain `=`; the value is free-form UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caveat {
    pub key: String,
    pub value: String,
}

impl Caveat {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self, Error> {
        let key = key.into();
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if !valid {
            return Err(Error::Decode(format!("invalid caveat key: {key:?}")));
        }
        Ok(Self {
            key,
            value: value.into(),
        })
    }

    /// The exact bytes that enter the signature chain.
    pub fn encode(&self) -> Vec<u8> {
        format!("{}={}", self.key, self.value).into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::Decode("caveat is not valid UTF-8".into()))?;
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| Error::Decode(format!("caveat without '=': {s:?}")))?;
        Self::new(key, value)
    }
}

impl fmt::Display for Caveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The request-side facts caveats are evaluated against.
#[derive(Debug, Clone)]
pub struct Context {
    /// Name of the service the request was dispatched to.
    pub service: String,
    /// Capabilities the matched operation requires.
    pub required_capabilities: Vec<String>,
    /// Current time, unix seconds.
    pub now: u64,
}

/// Evaluate all caveats of a token against the request context.
///
/// Every caveat must pass. A caveat with an unrecognized key rejects the
/// token: a verifier must never silently widen capability by skipping
/// conditions it does not understand.
pub fn evaluate(caveats: &[Caveat], ctx: &Context) -> Result<(), Error> {
    for caveat in caveats {
        match caveat.key.as_str() {
            // Bound at mint time and checked against the preimage there.
            COND_PAYMENT_HASH => continue,

            COND_SERVICES => {
                let permitted = caveat.value.split(',').any(|entry| {
                    let name = entry.split(':').next().unwrap_or(entry);
                    name == ctx.service
                });
                if !permitted {
                    return Err(Error::CaveatNotSatisfied(format!(
                        "token not valid for service {}",
                        ctx.service
                    )));
                }
            }

            COND_CAPABILITIES => {
                let granted: Vec<&str> = caveat.value.split(',').collect();
                for required in &ctx.required_capabilities {
                    if !granted.iter().any(|g| g == required) {
                        return Err(Error::CaveatNotSatisfied(format!(
                            "missing capability {required}"
                        )));
                    }
                }
            }

            COND_VALID_UNTIL => {
                let until: u64 = caveat.value.parse().map_err(|_| {
                    Error::CaveatNotSatisfied("unparsable valid_until".into())
                })?;
                if ctx.now > until {
                    return Err(Error::CaveatNotSatisfied("token expired".into()));
                }
            }

            COND_PRICE_MSAT => {
                caveat.value.parse::<u64>().map_err(|_| {
                    Error::CaveatNotSatisfied("unparsable price_msat".into())
                })?;
            }

            other => {
                return Err(Error::CaveatNotSatisfied(format!(
                    "unrecognized condition {other}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(service: &str) -> Context {
        Context {
            service: service.to_string(),
            required_capabilities: vec![],
            now: 1_700_000_000,
        }
    }

    #[test]
    fn rejects_invalid_keys() {
        assert!(Caveat::new("Services", "x").is_err());
        assert!(Caveat::new("", "x").is_err());
        assert!(Caveat::new("a=b", "x").is_err());
        assert!(Caveat::new("valid_until", "123").is_ok());
    }

    #[test]
    fn parse_splits_on_first_equals() {
        let c = Caveat::parse(b"services=a:0,b:1").unwrap();
        assert_eq!(c.key, "services");
        assert_eq!(c.value, "a:0,b:1");

        // Values may themselves contain '='.
        let c = Caveat::parse(b"capabilities=read=ish").unwrap();
        assert_eq!(c.value, "read=ish");
    }

    #[test]
    fn unknown_condition_rejects() {
        let caveats = vec![Caveat::new("frobnicate", "yes").unwrap()];
        let err = evaluate(&caveats, &ctx("echo")).unwrap_err();
        assert!(matches!(err, Error::CaveatNotSatisfied(_)));
    }

    #[test]
    fn services_condition_matches_by_name() {
        let caveats = vec![Caveat::new(COND_SERVICES, "echo:0,paid:1").unwrap()];
        assert!(evaluate(&caveats, &ctx("paid")).is_ok());
        assert!(evaluate(&caveats, &ctx("other")).is_err());
    }

    #[test]
    fn duplicate_keys_narrow() {
        // First grants echo and paid, a later attenuation narrows to echo only.
        let caveats = vec![
            Caveat::new(COND_SERVICES, "echo:0,paid:0").unwrap(),
            Caveat::new(COND_SERVICES, "echo:0").unwrap(),
        ];
        assert!(evaluate(&caveats, &ctx("echo")).is_ok());
        assert!(evaluate(&caveats, &ctx("paid")).is_err());
    }

    #[test]
    fn expiry_is_enforced() {
        let caveats = vec![Caveat::new(COND_VALID_UNTIL, "1600000000").unwrap()];
        let err = evaluate(&caveats, &ctx("echo")).unwrap_err();
        assert!(matches!(err, Error::CaveatNotSatisfied(_)));

        let caveats = vec![Caveat::new(COND_VALID_UNTIL, "1800000000").unwrap()];
        assert!(evaluate(&caveats, &ctx("echo")).is_ok());
    }

    #[test]
    fn capabilities_must_cover_required() {
        let caveats = vec![Caveat::new(COND_CAPABILITIES, "read,write").unwrap()];
        let mut c = ctx("echo");
        c.required_capabilities = vec!["read".into()];
        assert!(evaluate(&caveats, &c).is_ok());

        c.required_capabilities = vec!["admin".into()];
        assert!(evaluate(&caveats, &c).is_err());
    }
}
