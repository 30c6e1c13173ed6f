use std::sync::Arc;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::proxy::LocalService;
use crate::services::Registry;

/// Shared application state, cloned into every server worker.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    /// None only when the authenticator is disabled by configuration (which
    /// is rejected unless no service requires auth).
    pub authenticator: Option<Arc<Authenticator>>,
    pub local_services: Arc<Vec<LocalService>>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<Registry>,
        authenticator: Option<Arc<Authenticator>>,
        local_services: Vec<LocalService>,
    ) -> Self {
        // Redirects are never followed: the backend's answer is relayed
        // as-is, redirects included.
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to create HTTP client");

        Self {
            config,
            registry,
            authenticator,
            local_services: Arc::new(local_services),
            http_client,
        }
    }
}
