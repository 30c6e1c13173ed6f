//! The authenticator fronts every dispatched request that requires payment:
//! it either admits the request with its verified caveat set or answers for
//! the dispatcher with a 402 challenge (or a 503 while the challenger is
//! down).
//!
//! A failed verification always produces a *fresh* token. The response never
//! says why verification failed: a bad signature and a bad preimage look
//! identical to the client, which keeps the endpoint from acting as an
//! oracle.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse, ResponseError};

use l402::{
    parse_authorization, Caveat, Challenge, Challenger, Context, Credentials, Error, Mint,
};

use crate::error::ProxyError;
use crate::metrics;
use crate::services::Service;

pub struct Authenticator {
    mint: Arc<Mint>,
    challenger: Arc<dyn Challenger>,
}

/// The capability a request needs, by method. Only enforced for services
/// that grant capabilities at all.
fn required_capability(method: &str) -> &'static str {
    match method {
        "GET" | "HEAD" | "OPTIONS" => "read",
        _ => "write",
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_secs()
}

impl Authenticator {
    pub fn new(mint: Arc<Mint>, challenger: Arc<dyn Challenger>) -> Self {
        Self { mint, challenger }
    }

    /// Admit or answer a request for `service`. `Ok` carries the verified
    /// caveat set; `Err` is the complete HTTP response to send instead.
    pub async fn authorize(
        &self,
        req: &HttpRequest,
        service: &Service,
    ) -> Result<Vec<Caveat>, HttpResponse> {
        let creds = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(parse_authorization);

        let creds = match creds {
            Some(Ok(creds)) => creds,
            // Absent or malformed: challenge. No distinction in the answer.
            _ => return Err(self.challenge(service).await),
        };

        let ctx = Context {
            service: service.name.clone(),
            required_capabilities: if service.capabilities.is_empty() {
                vec![]
            } else {
                vec![required_capability(req.method().as_str()).to_string()]
            },
            now: unix_now(),
        };

        match self.mint.verify(&creds.token, &creds.preimage, &ctx) {
            Ok(()) => {
                metrics::TOKENS_VERIFIED.with_label_values(&["ok"]).inc();
                Ok(creds.token.caveats().to_vec())
            }
            Err(Error::PaymentPending) => {
                metrics::TOKENS_VERIFIED
                    .with_label_values(&["pending"])
                    .inc();
                Err(self.pending_challenge(&creds, service).await)
            }
            Err(Error::ChallengerUnavailable(msg)) | Err(Error::StorageUnavailable(msg)) => {
                metrics::TOKENS_VERIFIED
                    .with_label_values(&["unavailable"])
                    .inc();
                Err(ProxyError::Unavailable(msg).error_response())
            }
            Err(e) => {
                metrics::TOKENS_VERIFIED
                    .with_label_values(&["rejected"])
                    .inc();
                tracing::debug!(service = %service.name, "token rejected: {e}");
                Err(self.challenge(service).await)
            }
        }
    }

    /// Mint a fresh token and invoice and wrap them in a 402.
    async fn challenge(&self, service: &Service) -> HttpResponse {
        match self.mint.mint_with_challenge(&service.name).await {
            Ok((token, invoice)) => payment_required(&Challenge {
                token,
                payment_request: invoice.payment_request,
            }),
            Err(Error::ChallengerUnavailable(msg)) | Err(Error::StorageUnavailable(msg)) => {
                ProxyError::Unavailable(msg).error_response()
            }
            Err(Error::UnknownService(_)) => ProxyError::NoRoute.error_response(),
            Err(e) => ProxyError::Internal(e.to_string()).error_response(),
        }
    }

    /// The presented token is fine, the invoice just has not settled yet:
    /// re-send the same invoice instead of minting a new one.
    async fn pending_challenge(&self, creds: &Credentials, service: &Service) -> HttpResponse {
        if let Some(hash) = creds.token.payment_hash() {
            if let Some(payment_request) = self.challenger.payment_request(&hash) {
                return payment_required(&Challenge {
                    token: creds.token.clone(),
                    payment_request,
                });
            }
        }
        self.challenge(service).await
    }
}

/// Build the 402 response. Exactly one `WWW-Authenticate` header.
fn payment_required(challenge: &Challenge) -> HttpResponse {
    HttpResponse::PaymentRequired()
        .insert_header((header::WWW_AUTHENTICATE, challenge.header_value()))
        .content_type("text/plain; charset=utf-8")
        .body(
            "payment required: settle the attached invoice, then retry with \
             Authorization: LSAT <token>:<preimage>\n",
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use l402::{
        Invoice, InvoiceState, MemSecretStore, PaymentHash, Preimage, ServiceLimiter,
    };
    use regex::Regex;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct FakeChallenger {
        invoices: DashMap<PaymentHash, Invoice>,
        counter: AtomicU64,
        down: AtomicBool,
    }

    impl FakeChallenger {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                invoices: DashMap::new(),
                counter: AtomicU64::new(1),
                down: AtomicBool::new(false),
            })
        }

        fn preimage(n: u64) -> Preimage {
            let mut raw = [0u8; 32];
            raw[..8].copy_from_slice(&n.to_be_bytes());
            Preimage(raw)
        }

        fn settle(&self, hash: &PaymentHash) {
            self.invoices.get_mut(hash).unwrap().state = InvoiceState::Settled;
        }
    }

    #[async_trait]
    impl Challenger for FakeChallenger {
        async fn new_challenge(&self, price_msat: u64) -> Result<Invoice, Error> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::ChallengerUnavailable("down".into()));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let hash = PaymentHash(Sha256::digest(Self::preimage(n).0).into());
            let invoice = Invoice {
                payment_hash: hash,
                payment_request: format!("lnbc-auth-{n}"),
                amount_msat: price_msat,
                state: InvoiceState::Open,
            };
            self.invoices.insert(hash, invoice.clone());
            Ok(invoice)
        }

        fn verify_invoice_status(&self, hash: &PaymentHash) -> Result<InvoiceState, Error> {
            self.invoices
                .get(hash)
                .map(|i| i.state)
                .ok_or(Error::InvalidToken)
        }

        fn payment_request(&self, hash: &PaymentHash) -> Option<String> {
            self.invoices.get(hash).map(|i| i.payment_request.clone())
        }
    }

    struct FakeLimiter;

    impl ServiceLimiter for FakeLimiter {
        fn caveats_for(&self, service: &str) -> Vec<Caveat> {
            if service != "paid" {
                return vec![];
            }
            vec![
                Caveat::new("services", "paid:0").unwrap(),
                Caveat::new("price_msat", "1000").unwrap(),
            ]
        }
    }

    fn paid_service() -> Service {
        Service {
            name: "paid".into(),
            host: Regex::new(".*").unwrap(),
            path: Regex::new("").unwrap(),
            backend: url::Url::parse("http://127.0.0.1:9001").unwrap(),
            price_msat: 1000,
            auth_required: true,
            capabilities: vec![],
            tier: 0,
            timeout: std::time::Duration::from_secs(5),
            token_lifetime: None,
        }
    }

    fn authenticator(challenger: Arc<FakeChallenger>) -> Authenticator {
        let mint = Arc::new(Mint::new(
            challenger.clone(),
            Arc::new(MemSecretStore::new()),
            Arc::new(FakeLimiter),
        ));
        Authenticator::new(mint, challenger)
    }

    fn www_authenticate_headers(resp: &HttpResponse) -> Vec<String> {
        resp.headers()
            .get_all(header::WWW_AUTHENTICATE)
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[actix_rt::test]
    async fn missing_header_produces_one_challenge() {
        let auth = authenticator(FakeChallenger::new());
        let req = TestRequest::default().to_http_request();

        let resp = auth.authorize(&req, &paid_service()).await.unwrap_err();
        assert_eq!(resp.status(), 402);

        let headers = www_authenticate_headers(&resp);
        assert_eq!(headers.len(), 1);
        assert!(headers[0].starts_with("LSAT macaroon=\""));
        assert!(headers[0].contains("invoice=\"lnbc-auth-"));
    }

    #[actix_rt::test]
    async fn garbage_header_is_treated_like_no_header() {
        let auth = authenticator(FakeChallenger::new());
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer what"))
            .to_http_request();

        let resp = auth.authorize(&req, &paid_service()).await.unwrap_err();
        assert_eq!(resp.status(), 402);
    }

    #[actix_rt::test]
    async fn settled_token_is_admitted() {
        let challenger = FakeChallenger::new();
        let auth = authenticator(challenger.clone());

        // First request: challenged.
        let req = TestRequest::default().to_http_request();
        let resp = auth.authorize(&req, &paid_service()).await.unwrap_err();
        let header_value = www_authenticate_headers(&resp).remove(0);

        // Extract the token, pay the invoice.
        let token_b64 = header_value
            .split("macaroon=\"")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap()
            .to_string();
        let token = l402::Token::decode(&token_b64).unwrap();
        let hash = token.payment_hash().unwrap();
        challenger.settle(&hash);
        let preimage = FakeChallenger::preimage(1);

        let req = TestRequest::default()
            .insert_header((
                header::AUTHORIZATION,
                format!("LSAT {}:{}", token_b64, preimage.to_hex()),
            ))
            .to_http_request();

        let caveats = auth.authorize(&req, &paid_service()).await.unwrap();
        assert_eq!(caveats[0].key, "payment_hash");
    }

    #[actix_rt::test]
    async fn pending_payment_resends_same_invoice() {
        let challenger = FakeChallenger::new();
        let auth = authenticator(challenger.clone());

        let req = TestRequest::default().to_http_request();
        let resp = auth.authorize(&req, &paid_service()).await.unwrap_err();
        let first = www_authenticate_headers(&resp).remove(0);
        let token_b64 = first
            .split("macaroon=\"")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap()
            .to_string();

        // Retry with the token before paying: same invoice comes back.
        let preimage = FakeChallenger::preimage(1);
        let req = TestRequest::default()
            .insert_header((
                header::AUTHORIZATION,
                format!("LSAT {}:{}", token_b64, preimage.to_hex()),
            ))
            .to_http_request();
        let resp = auth.authorize(&req, &paid_service()).await.unwrap_err();
        assert_eq!(resp.status(), 402);

        let second = www_authenticate_headers(&resp).remove(0);
        assert!(second.contains("invoice=\"lnbc-auth-1\""));
        assert!(second.contains(&token_b64));
    }

    #[actix_rt::test]
    async fn challenger_down_yields_503() {
        let challenger = FakeChallenger::new();
        challenger.down.store(true, Ordering::SeqCst);
        let auth = authenticator(challenger);

        let req = TestRequest::default().to_http_request();
        let resp = auth.authorize(&req, &paid_service()).await.unwrap_err();
        assert_eq!(resp.status(), 503);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
    }
}
