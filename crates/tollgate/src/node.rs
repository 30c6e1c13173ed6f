//! REST client for the backing payment node's invoice API.
//!
//! Only the capability contract matters to the rest of the proxy; this
//! module keeps the wire details (endpoints, field encodings, the macaroon
//! header) in one place.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use url::Url;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine;

use l402::{Error, Invoice, InvoiceState, PaymentHash};

use crate::challenger::InvoiceNode;
use crate::config::{AuthenticatorConfig, ConfigError};

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

/// Invoice API client speaking the node's REST surface.
pub struct RestNode {
    client: reqwest::Client,
    base: Url,
    macaroon_hex: String,
}

#[derive(Debug, Deserialize)]
struct RestInvoice {
    r_hash: String,
    payment_request: String,
    #[serde(default)]
    value_msat: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct RestInvoiceList {
    #[serde(default)]
    invoices: Vec<RestInvoice>,
}

#[derive(Debug, Deserialize)]
struct RestSubscriptionEvent {
    result: RestInvoice,
}

fn parse_invoice(raw: &RestInvoice) -> Result<Invoice, Error> {
    let hash: [u8; 32] = BASE64_STD
        .decode(&raw.r_hash)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| Error::Decode("r_hash is not 32 base64 bytes".into()))?;

    let state = match raw.state.as_str() {
        "SETTLED" => InvoiceState::Settled,
        "CANCELED" => InvoiceState::Canceled,
        // ACCEPTED (hold invoice) and anything newer count as not yet paid.
        _ => InvoiceState::Open,
    };

    Ok(Invoice {
        payment_hash: PaymentHash(hash),
        payment_request: raw.payment_request.clone(),
        amount_msat: raw.value_msat.parse().unwrap_or(0),
        state,
    })
}

fn unreachable_err(e: impl std::fmt::Display) -> Error {
    Error::ChallengerUnavailable(e.to_string())
}

impl RestNode {
    pub fn new(cfg: &AuthenticatorConfig) -> Result<Self, ConfigError> {
        let raw = std::fs::read(&cfg.macaroon_path).map_err(|e| {
            ConfigError::Io(format!("macaroon file {}: {e}", cfg.macaroon_path))
        })?;
        let macaroon_hex = macaroon_to_hex(&raw);

        let base = Url::parse(&cfg.node_host)
            .map_err(|e| ConfigError::Invalid(format!("authenticator.node_host: {e}")))?;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.tls_insecure)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("node http client: {e}")))?;

        Ok(Self {
            client,
            base,
            macaroon_hex,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }
}

/// Macaroon files come either raw or already hex-encoded.
fn macaroon_to_hex(raw: &[u8]) -> String {
    let trimmed: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if !trimmed.is_empty() && trimmed.iter().all(u8::is_ascii_hexdigit) {
        String::from_utf8(trimmed).expect("hex digits are UTF-8")
    } else {
        hex::encode(raw)
    }
}

#[async_trait]
impl InvoiceNode for RestNode {
    async fn create_invoice(&self, amount_msat: u64, memo: &str) -> Result<Invoice, Error> {
        let resp = self
            .client
            .post(self.endpoint("/v1/invoices"))
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .json(&serde_json::json!({
                "memo": memo,
                "value_msat": amount_msat.to_string(),
            }))
            .send()
            .await
            .map_err(unreachable_err)?;

        if !resp.status().is_success() {
            return Err(unreachable_err(format!(
                "invoice creation failed with status {}",
                resp.status()
            )));
        }

        let raw: RestInvoice = resp.json().await.map_err(unreachable_err)?;
        let mut invoice = parse_invoice(&raw)?;
        // The create response omits amount and state.
        invoice.amount_msat = amount_msat;
        invoice.state = InvoiceState::Open;
        Ok(invoice)
    }

    async fn list_open_invoices(&self) -> Result<Vec<Invoice>, Error> {
        let resp = self
            .client
            .get(self.endpoint("/v1/invoices"))
            .query(&[("pending_only", "true")])
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .send()
            .await
            .map_err(unreachable_err)?;

        if !resp.status().is_success() {
            return Err(unreachable_err(format!(
                "invoice listing failed with status {}",
                resp.status()
            )));
        }

        let list: RestInvoiceList = resp.json().await.map_err(unreachable_err)?;
        Ok(list
            .invoices
            .iter()
            .filter_map(|raw| parse_invoice(raw).ok())
            .collect())
    }

    async fn subscribe_invoices(&self) -> Result<mpsc::Receiver<Invoice>, Error> {
        let resp = self
            .client
            .get(self.endpoint("/v1/invoices/subscribe"))
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .send()
            .await
            .map_err(unreachable_err)?;

        if !resp.status().is_success() {
            return Err(unreachable_err(format!(
                "invoice subscription failed with status {}",
                resp.status()
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        let mut stream = resp.bytes_stream();

        // Line-delimited JSON: one event per line. Dropping the sender ends
        // the subscription, which the challenger treats as a disconnect.
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::debug!("invoice stream error: {e}");
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<RestSubscriptionEvent>(&line) {
                        Ok(event) => match parse_invoice(&event.result) {
                            Ok(invoice) => {
                                if tx.send(invoice).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => tracing::debug!("skipping invoice update: {e}"),
                        },
                        Err(e) => tracing::debug!("unparsable invoice event: {e}"),
                    }
                }
            }
        });

        Ok(rx)
    }
}
