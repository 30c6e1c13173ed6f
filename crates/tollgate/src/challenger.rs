//! The challenger issues invoices through the backing payment node and
//! tracks their settlement in memory.
//!
//! A supervised background task owns the node's invoice-update stream and is
//! the sole writer to the state map; request tasks only ever read it. That
//! keeps `verify_invoice_status` a local lookup on the hot verification
//! path, and it keeps already-settled tokens verifiable while the node is
//! down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use l402::{Challenger, Error, Invoice, InvoiceState, PaymentHash};

use crate::metrics;

/// Memo attached to every invoice we create.
pub const INVOICE_MEMO: &str = "L402";

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Capability contract of the backing payment node.
#[async_trait]
pub trait InvoiceNode: Send + Sync {
    /// Create an invoice over the given amount.
    async fn create_invoice(&self, amount_msat: u64, memo: &str) -> Result<Invoice, Error>;

    /// All invoices that are currently open.
    async fn list_open_invoices(&self) -> Result<Vec<Invoice>, Error>;

    /// Open a stream of invoice state changes, including newly created
    /// invoices. The stream ends when the node connection drops.
    async fn subscribe_invoices(&self) -> Result<mpsc::Receiver<Invoice>, Error>;
}

/// Challenger backed by an [`InvoiceNode`].
pub struct NodeChallenger {
    node: Arc<dyn InvoiceNode>,
    invoices: DashMap<PaymentHash, Invoice>,
    connected: AtomicBool,
    disconnected_at: Mutex<Option<Instant>>,
    challenge_timeout: Duration,
    unhealthy_threshold: Duration,
    shutdown: watch::Sender<bool>,
}

impl NodeChallenger {
    pub fn new(
        node: Arc<dyn InvoiceNode>,
        challenge_timeout: Duration,
        unhealthy_threshold: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            node,
            invoices: DashMap::new(),
            connected: AtomicBool::new(false),
            disconnected_at: Mutex::new(Some(Instant::now())),
            challenge_timeout,
            unhealthy_threshold,
            shutdown,
        })
    }

    /// Seed the state map with the currently open invoices and start the
    /// subscription task.
    pub async fn start(self: Arc<Self>) -> Result<(), Error> {
        let open = self.node.list_open_invoices().await?;
        for invoice in open {
            self.invoices.insert(invoice.payment_hash, invoice);
        }
        metrics::INVOICE_CACHE_SIZE.set(self.invoices.len() as i64);

        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(self.subscription_loop(shutdown_rx));
        Ok(())
    }

    /// Terminate the subscription task.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// False once the node has been unreachable for longer than the
    /// configured threshold. Challenge-producing paths refuse while
    /// unhealthy; validation of known invoices keeps working.
    pub fn healthy(&self) -> bool {
        if self.connected.load(Ordering::Acquire) {
            return true;
        }
        match *self.disconnected_at.lock().expect("health lock poisoned") {
            Some(since) => since.elapsed() < self.unhealthy_threshold,
            None => true,
        }
    }

    fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        *self.disconnected_at.lock().expect("health lock poisoned") = None;
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        let mut at = self.disconnected_at.lock().expect("health lock poisoned");
        if at.is_none() {
            *at = Some(Instant::now());
        }
    }

    async fn subscription_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = BACKOFF_BASE;
        loop {
            match self.node.subscribe_invoices().await {
                Ok(mut updates) => {
                    // Re-fetch open invoices to cover anything that changed
                    // while we were away.
                    match self.node.list_open_invoices().await {
                        Ok(open) => {
                            for invoice in open {
                                self.invoices.insert(invoice.payment_hash, invoice);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("unable to refresh open invoices: {e}");
                        }
                    }

                    self.mark_connected();
                    backoff = BACKOFF_BASE;
                    tracing::info!("invoice subscription established");

                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            update = updates.recv() => match update {
                                Some(invoice) => {
                                    tracing::debug!(
                                        payment_hash = %invoice.payment_hash,
                                        state = ?invoice.state,
                                        "invoice update",
                                    );
                                    self.invoices.insert(invoice.payment_hash, invoice);
                                    metrics::INVOICE_CACHE_SIZE
                                        .set(self.invoices.len() as i64);
                                }
                                None => break,
                            },
                        }
                    }

                    self.mark_disconnected();
                    tracing::warn!("invoice subscription dropped, reconnecting");
                }
                Err(e) => {
                    self.mark_disconnected();
                    tracing::warn!("unable to subscribe to invoice updates: {e}");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(jitter(backoff)) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }
}

/// Scale a delay by a random factor in [0.8, 1.2].
fn jitter(d: Duration) -> Duration {
    let mut raw = [0u8; 4];
    if getrandom::fill(&mut raw).is_err() {
        return d;
    }
    let unit = u32::from_le_bytes(raw) as f64 / u32::MAX as f64;
    d.mul_f64(0.8 + 0.4 * unit)
}

#[async_trait]
impl Challenger for NodeChallenger {
    async fn new_challenge(&self, price_msat: u64) -> Result<Invoice, Error> {
        if !self.healthy() {
            return Err(Error::ChallengerUnavailable(
                "payment node unreachable".into(),
            ));
        }
        let create = self.node.create_invoice(price_msat, INVOICE_MEMO);
        match tokio::time::timeout(self.challenge_timeout, create).await {
            Ok(Ok(invoice)) => {
                metrics::CHALLENGES_TOTAL.inc();
                Ok(invoice)
            }
            Ok(Err(e)) => Err(Error::ChallengerUnavailable(e.to_string())),
            Err(_) => Err(Error::ChallengerUnavailable(
                "invoice creation timed out".into(),
            )),
        }
    }

    fn verify_invoice_status(&self, hash: &PaymentHash) -> Result<InvoiceState, Error> {
        if let Some(invoice) = self.invoices.get(hash) {
            return Ok(invoice.state);
        }
        if self.connected.load(Ordering::Acquire) {
            // Connected but the invoice is not ours (or long expired).
            Err(Error::InvalidToken)
        } else {
            Err(Error::ChallengerUnavailable(
                "unknown invoice while payment node is unreachable".into(),
            ))
        }
    }

    fn payment_request(&self, hash: &PaymentHash) -> Option<String> {
        self.invoices.get(hash).map(|i| i.payment_request.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::AtomicU64;

    /// In-process payment node. Invoices settle when the test says so, and
    /// every change is pushed down the subscription like the real node does.
    pub(crate) struct MockNode {
        invoices: Mutex<Vec<Invoice>>,
        subscribers: Mutex<Vec<mpsc::Sender<Invoice>>>,
        counter: AtomicU64,
        pub reachable: AtomicBool,
    }

    impl MockNode {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                invoices: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                counter: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
            })
        }

        fn push(&self, invoice: Invoice) {
            let subscribers = self.subscribers.lock().unwrap();
            for tx in subscribers.iter() {
                let _ = tx.try_send(invoice.clone());
            }
        }

        pub fn settle(&self, hash: &PaymentHash) {
            self.transition(hash, InvoiceState::Settled);
        }

        pub fn cancel(&self, hash: &PaymentHash) {
            self.transition(hash, InvoiceState::Canceled);
        }

        fn transition(&self, hash: &PaymentHash, state: InvoiceState) {
            let mut invoices = self.invoices.lock().unwrap();
            let invoice = invoices
                .iter_mut()
                .find(|i| i.payment_hash == *hash)
                .expect("unknown invoice");
            invoice.state = state;
            let updated = invoice.clone();
            drop(invoices);
            self.push(updated);
        }

        pub fn preimage_for(&self, n: u64) -> l402::Preimage {
            let mut raw = [0u8; 32];
            raw[..8].copy_from_slice(&n.to_be_bytes());
            l402::Preimage(raw)
        }

        /// Drop all live subscriptions, simulating a node restart.
        pub fn drop_subscribers(&self) {
            self.subscribers.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl InvoiceNode for MockNode {
        async fn create_invoice(&self, amount_msat: u64, memo: &str) -> Result<Invoice, Error> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(Error::ChallengerUnavailable("node offline".into()));
            }
            assert_eq!(memo, INVOICE_MEMO);
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let preimage = self.preimage_for(n);
            let invoice = Invoice {
                payment_hash: PaymentHash(Sha256::digest(preimage.0).into()),
                payment_request: format!("lnbc10n1mock{n}"),
                amount_msat,
                state: InvoiceState::Open,
            };
            self.invoices.lock().unwrap().push(invoice.clone());
            self.push(invoice.clone());
            Ok(invoice)
        }

        async fn list_open_invoices(&self) -> Result<Vec<Invoice>, Error> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(Error::ChallengerUnavailable("node offline".into()));
            }
            Ok(self
                .invoices
                .lock()
                .unwrap()
                .iter()
                .filter(|i| i.state == InvoiceState::Open)
                .cloned()
                .collect())
        }

        async fn subscribe_invoices(&self) -> Result<mpsc::Receiver<Invoice>, Error> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(Error::ChallengerUnavailable("node offline".into()));
            }
            let (tx, rx) = mpsc::channel(64);
            self.subscribers.lock().unwrap().push(tx);
            Ok(rx)
        }
    }

    fn challenger(node: Arc<MockNode>) -> Arc<NodeChallenger> {
        NodeChallenger::new(node, Duration::from_secs(1), Duration::from_millis(100))
    }

    async fn settle_and_wait(
        node: &MockNode,
        challenger: &NodeChallenger,
        hash: &PaymentHash,
    ) {
        node.settle(hash);
        for _ in 0..50 {
            if matches!(
                challenger.verify_invoice_status(hash),
                Ok(InvoiceState::Settled)
            ) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("settlement never became visible");
    }

    #[tokio::test]
    async fn settlement_updates_become_visible() {
        let node = MockNode::new();
        let challenger = challenger(node.clone());
        challenger.clone().start().await.unwrap();

        let invoice = challenger.new_challenge(1000).await.unwrap();
        assert_eq!(invoice.amount_msat, 1000);

        // The subscription delivers the new invoice as open first.
        for _ in 0..50 {
            if challenger.verify_invoice_status(&invoice.payment_hash).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            challenger.verify_invoice_status(&invoice.payment_hash),
            Ok(InvoiceState::Open)
        ));

        settle_and_wait(&node, &challenger, &invoice.payment_hash).await;
        challenger.stop();
    }

    #[tokio::test]
    async fn unknown_hash_is_rejected_while_connected() {
        let node = MockNode::new();
        let challenger = challenger(node.clone());
        challenger.clone().start().await.unwrap();

        // Wait for the subscription to come up.
        for _ in 0..50 {
            if challenger.connected.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let unknown = PaymentHash([0xde; 32]);
        assert!(matches!(
            challenger.verify_invoice_status(&unknown),
            Err(Error::InvalidToken)
        ));
        challenger.stop();
    }

    #[tokio::test]
    async fn node_outage_marks_unhealthy_but_keeps_cached_state() {
        let node = MockNode::new();
        let challenger = challenger(node.clone());
        challenger.clone().start().await.unwrap();

        let invoice = challenger.new_challenge(500).await.unwrap();
        settle_and_wait(&node, &challenger, &invoice.payment_hash).await;

        // Kill the node: subscription drops and reconnects keep failing.
        node.reachable.store(false, Ordering::SeqCst);
        node.drop_subscribers();

        for _ in 0..100 {
            if !challenger.healthy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!challenger.healthy());

        // Challenges refuse...
        assert!(matches!(
            challenger.new_challenge(500).await,
            Err(Error::ChallengerUnavailable(_))
        ));
        // ...but the settled invoice still verifies from cache,
        assert!(matches!(
            challenger.verify_invoice_status(&invoice.payment_hash),
            Ok(InvoiceState::Settled)
        ));
        // while unknown hashes cannot be decided.
        assert!(matches!(
            challenger.verify_invoice_status(&PaymentHash([0xaa; 32])),
            Err(Error::ChallengerUnavailable(_))
        ));
        challenger.stop();
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let j = jitter(base);
            assert!(j >= Duration::from_secs(8), "{j:?}");
            assert!(j <= Duration::from_secs(12), "{j:?}");
        }
    }
}
