//! Configured backend services, the immutable snapshot they are matched
//! against, and the registry that swaps snapshots for hot reconfiguration.

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use url::Url;

use l402::caveat::{
    Caveat, COND_CAPABILITIES, COND_PRICE_MSAT, COND_SERVICES, COND_VALID_UNTIL,
};
use l402::ServiceLimiter;

use crate::config::{ConfigError, ServiceConfig};

/// A service with its matchers compiled. Built once per snapshot.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub host: Regex,
    pub path: Regex,
    pub backend: Url,
    pub price_msat: u64,
    pub auth_required: bool,
    pub capabilities: Vec<String>,
    pub tier: u8,
    pub timeout: Duration,
    pub token_lifetime: Option<Duration>,
}

impl Service {
    fn compile(cfg: &ServiceConfig) -> Result<Self, ConfigError> {
        let host = Regex::new(&cfg.host_regexp).map_err(|e| {
            ConfigError::Invalid(format!("service {}: host_regexp: {e}", cfg.name))
        })?;
        let path = Regex::new(&cfg.path_regexp).map_err(|e| {
            ConfigError::Invalid(format!("service {}: path_regexp: {e}", cfg.name))
        })?;
        let backend = Url::parse(&cfg.backend)
            .map_err(|e| ConfigError::Invalid(format!("service {}: backend: {e}", cfg.name)))?;
        Ok(Self {
            name: cfg.name.clone(),
            host,
            path,
            backend,
            price_msat: cfg.price_msat,
            auth_required: cfg.auth_required,
            capabilities: cfg.capabilities.clone(),
            tier: cfg.tier,
            timeout: Duration::from_secs(cfg.timeout_secs),
            token_lifetime: cfg.token_lifetime_secs.map(Duration::from_secs),
        })
    }

    pub fn matches(&self, host: &str, path: &str) -> bool {
        self.host.is_match(host) && self.path.is_match(path)
    }
}

/// An immutable view of the configured services. Requests dispatch against
/// the snapshot they started with, even while a swap is in flight.
#[derive(Debug, Default)]
pub struct Snapshot {
    services: Vec<Service>,
}

impl Snapshot {
    /// Validate and compile a service list. Fails on duplicate names or
    /// malformed matchers; a failed build leaves the registry untouched.
    pub fn build(configs: &[ServiceConfig]) -> Result<Self, ConfigError> {
        let mut seen = std::collections::HashSet::new();
        let mut services = Vec::with_capacity(configs.len());
        for cfg in configs {
            if cfg.name.is_empty() {
                return Err(ConfigError::Invalid("service with empty name".into()));
            }
            if !seen.insert(cfg.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service name: {}",
                    cfg.name
                )));
            }
            services.push(Service::compile(cfg)?);
        }
        Ok(Self { services })
    }

    /// First configured service whose matchers accept the request.
    pub fn match_request(&self, host: &str, path: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.matches(host, path))
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Holds the current snapshot behind an atomically swapped `Arc`. Readers
/// clone the `Arc` once per dispatch and never block the writer for longer
/// than the pointer exchange; superseded snapshots stay alive until the last
/// in-flight request drops its reference.
pub struct Registry {
    current: RwLock<Arc<Snapshot>>,
}

impl Registry {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().expect("registry lock poisoned"))
    }

    /// Validate the new list, then publish it. Dispatches that begin after
    /// this returns see the new set; in-flight ones keep the old.
    pub fn update_services(&self, configs: &[ServiceConfig]) -> Result<(), ConfigError> {
        let snapshot = Snapshot::build(configs)?;
        let count = snapshot.len();
        *self.current.write().expect("registry lock poisoned") = Arc::new(snapshot);
        tracing::info!(services = count, "service configuration updated");
        Ok(())
    }
}

/// Resolves the caveat set scoping a token for a named service, from the
/// current snapshot.
pub struct StaticServiceLimiter {
    registry: Arc<Registry>,
}

impl StaticServiceLimiter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl ServiceLimiter for StaticServiceLimiter {
    fn caveats_for(&self, service: &str) -> Vec<Caveat> {
        let snapshot = self.registry.snapshot();
        let Some(service) = snapshot.get(service) else {
            return Vec::new();
        };

        let mut caveats = vec![
            Caveat::new(COND_SERVICES, format!("{}:{}", service.name, service.tier))
                .expect("services is a valid key"),
            Caveat::new(COND_PRICE_MSAT, service.price_msat.to_string())
                .expect("price_msat is a valid key"),
        ];
        if !service.capabilities.is_empty() {
            caveats.push(
                Caveat::new(COND_CAPABILITIES, service.capabilities.join(","))
                    .expect("capabilities is a valid key"),
            );
        }
        if let Some(lifetime) = service.token_lifetime {
            let until = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock before unix epoch")
                .as_secs()
                + lifetime.as_secs();
            caveats.push(
                Caveat::new(COND_VALID_UNTIL, until.to_string())
                    .expect("valid_until is a valid key"),
            );
        }
        caveats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, host: &str, path: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            host_regexp: host.into(),
            path_regexp: path.into(),
            backend: "http://127.0.0.1:9001".into(),
            price_msat: 1000,
            auth_required: true,
            capabilities: vec![],
            tier: 0,
            timeout_secs: 30,
            token_lifetime_secs: None,
        }
    }

    #[test]
    fn first_match_wins() {
        let snapshot = Snapshot::build(&[
            svc("wide", ".*", "^/api/.*"),
            svc("narrow", ".*", "^/api/v2/.*"),
        ])
        .unwrap();

        let hit = snapshot.match_request("proxy", "/api/v2/x").unwrap();
        assert_eq!(hit.name, "wide");
        assert!(snapshot.match_request("proxy", "/other").is_none());
    }

    #[test]
    fn build_rejects_duplicates() {
        let err = Snapshot::build(&[svc("a", ".*", ""), svc("a", ".*", "")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn update_swaps_atomically_and_keeps_old_readers() {
        let registry = Registry::new(Snapshot::build(&[svc("a", ".*", "^/a/.*")]).unwrap());

        let before = registry.snapshot();
        registry
            .update_services(&[svc("a", ".*", "^/a/.*"), svc("b", ".*", "^/b/.*")])
            .unwrap();

        // The earlier reader still sees its own snapshot.
        assert!(before.match_request("h", "/b/x").is_none());
        // New dispatches see the updated set.
        assert!(registry.snapshot().match_request("h", "/b/x").is_some());
    }

    #[test]
    fn failed_update_leaves_registry_untouched() {
        let registry = Registry::new(Snapshot::build(&[svc("a", ".*", "")]).unwrap());
        let mut bad = svc("b", "[", "");
        bad.host_regexp = "[".into();
        assert!(registry.update_services(&[bad]).is_err());
        assert!(registry.snapshot().get("a").is_some());
    }

    #[test]
    fn limiter_resolves_caveats() {
        let mut cfg = svc("paid", ".*", "");
        cfg.capabilities = vec!["read".into(), "write".into()];
        let registry = Arc::new(Registry::new(Snapshot::build(&[cfg]).unwrap()));
        let limiter = StaticServiceLimiter::new(registry);

        let caveats = limiter.caveats_for("paid");
        assert_eq!(caveats[0].key, COND_SERVICES);
        assert_eq!(caveats[0].value, "paid:0");
        assert_eq!(caveats[1].key, COND_PRICE_MSAT);
        assert_eq!(caveats[1].value, "1000");
        assert_eq!(caveats[2].key, COND_CAPABILITIES);
        assert_eq!(caveats[2].value, "read,write");

        assert!(limiter.caveats_for("unknown").is_empty());
    }
}
