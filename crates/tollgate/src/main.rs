use std::sync::Arc;
use std::time::Duration;

use actix_web::middleware::Condition;
use actix_web::{web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use l402::{Challenger, Mint, SqliteSecretStore};

use tollgate::auth::Authenticator;
use tollgate::challenger::NodeChallenger;
use tollgate::config::Config;
use tollgate::cors::build_cors;
use tollgate::metrics;
use tollgate::node::RestNode;
use tollgate::proxy::{dispatch, LocalService, MetricsHandler, TerminalHandler};
use tollgate::services::{Registry, Snapshot, StaticServiceLimiter};
use tollgate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env file if present.
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(Config::load()?);

    let registry = Arc::new(Registry::new(Snapshot::build(&config.services)?));
    tracing::info!(services = config.services.len(), "service table loaded");

    // Wire the payment side unless the authenticator is disabled (config
    // validation guarantees no service requires auth in that case).
    let (authenticator, challenger) = if config.authenticator.disable {
        tracing::warn!("authenticator disabled, all configured services are public");
        (None, None)
    } else {
        let db_path = config.resolved_db_path();
        let db_path = db_path
            .to_str()
            .ok_or("database path is not valid UTF-8")?;
        let secrets = Arc::new(SqliteSecretStore::open(db_path)?);
        tracing::info!(path = db_path, "secret store opened");

        let node = Arc::new(RestNode::new(&config.authenticator)?);
        let challenger = NodeChallenger::new(
            node,
            Duration::from_secs(config.challenge_timeout_secs),
            Duration::from_secs(config.unhealthy_threshold_secs),
        );
        challenger.clone().start().await?;
        tracing::info!(node = %config.authenticator.node_host, "challenger started");

        let limiter = Arc::new(StaticServiceLimiter::new(registry.clone()));
        let mint = Arc::new(Mint::new(
            challenger.clone() as Arc<dyn Challenger>,
            secrets,
            limiter,
        ));
        let authenticator = Arc::new(Authenticator::new(
            mint,
            challenger.clone() as Arc<dyn Challenger>,
        ));
        (Some(authenticator), Some(challenger))
    };

    metrics::register_metrics();

    // Local services run in-process and are consulted after the remote
    // service table, in registration order. The terminal handler is last
    // and matches everything.
    let mut local_services = vec![LocalService::new(
        "metrics",
        MetricsHandler::matches,
        MetricsHandler::new(config.metrics_token.clone()),
    )];
    let terminal = if config.serve_static {
        let root = config.static_root.clone().expect("validated at startup");
        tracing::info!(root, "serving static files for unmatched requests");
        TerminalHandler::static_files(root)
    } else {
        TerminalHandler::not_found()
    };
    local_services.push(LocalService::new("terminal", |_| true, terminal));

    let state = AppState::new(
        config.clone(),
        registry.clone(),
        authenticator,
        local_services,
    );
    let state_data = web::Data::new(state);

    let cors_origins = config.cors_origins.clone();
    let cors_enabled = !cors_origins.is_empty();

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(state_data.clone())
            .app_data(web::PayloadConfig::new(10 * 1024 * 1024)) // 10MB body limit
            .wrap(Condition::new(cors_enabled, build_cors(&cors_origins)))
            .default_service(web::to(dispatch))
    })
    .shutdown_timeout(config.drain_timeout_secs)
    .bind(&config.listen_addr)?;

    // Optional second plaintext ingress, e.g. behind a privacy overlay that
    // brings its own transport encryption.
    if let Some(addr) = &config.insecure_listen_addr {
        server = server.bind(addr)?;
        tracing::info!("also listening on {addr} (plaintext)");
    }

    tracing::info!("listening on {}", config.listen_addr);
    server.run().await?;

    if let Some(challenger) = challenger {
        challenger.stop();
    }
    tracing::info!("shutdown complete");
    Ok(())
}
