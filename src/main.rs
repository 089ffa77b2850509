use anyhow::{Context, Result};
use keyrelay::api::{self, AppState};
use keyrelay::broker::SessionKeyBroker;
use keyrelay::config::{self, Secrets};
use keyrelay::store::KeyStore;
use keyrelay::sweep::KeySweeper;
use keyrelay::trust::TokenVerifier;
use keyrelay::upstream::ProvisioningClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyrelay=info".into()),
        )
        .init();

    let config_path =
        std::env::var("KEYRELAY_CONFIG").unwrap_or_else(|_| "keyrelay.toml".to_string());
    let config = config::load_config(&config_path)?;
    config.validate()?;
    let secrets = Secrets::from_env()?;

    // One process-wide client; proxied streams rely on the connect timeout
    // only, control-plane calls add their own per-request timeout
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .build()
        .context("failed to build HTTP client")?;

    let store = Arc::new(KeyStore::open(&config.store.path)?);
    let upstream = Arc::new(ProvisioningClient::new(
        http.clone(),
        &config.upstream.base_url,
        secrets.provisioning_key.clone(),
    ));
    let broker = Arc::new(SessionKeyBroker::new(
        store,
        upstream.clone(),
        secrets.key_password.clone(),
        &config.lifecycle,
    ));
    let verifier = Arc::new(TokenVerifier::new(
        http.clone(),
        &config.auth.team_domain,
        config.auth.audience.clone(),
    ));
    let targets = Arc::new(config::resolve_targets(&config.proxy.targets));

    // Keys left over from a crashed run are revoked before serving
    broker.remove_all().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = KeySweeper::new(
        broker.clone(),
        Duration::from_secs(config.lifecycle.sweep_interval_seconds),
    );
    let sweep_task = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    let state = AppState {
        broker: broker.clone(),
        verifier,
        upstream,
        targets,
        http,
        auth_disabled: config.auth.disabled,
    };
    let app = api::create_router(state, &config.cors);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "keyrelay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down, revoking tracked session keys");
    shutdown_tx.send(true).ok();
    sweep_task.await.ok();
    broker.remove_all().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}
