use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use webhook_pipeline::{
    init_tracing, router, ApiKey, AppState, Endpoint, EndpointId, HttpTransport, InMemoryStorage,
    Ingestor, PipelineConfig, Scheduler, ServerConfig, SignatureMode, Storage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Arc::new(PipelineConfig::from_env().context("invalid pipeline configuration")?);
    let server = ServerConfig::from_env().context("invalid server configuration")?;

    if config.signature_mode == SignatureMode::RawSecret {
        warn!("WEBHOOK_SIGNATURE_MODE=raw sends endpoint secrets in plain text");
    }
    let timeout_ms = config.attempt_timeout_ms(None);
    if timeout_ms < config.default_timeout_ms {
        warn!(
            timeout_ms,
            claim_ttl_ms = config.claim_ttl_ms,
            "default timeout cut to stay inside the claim ttl"
        );
    }

    let storage = open_storage(&server).await?;
    seed_dev_fixtures(storage.as_ref()).await?;

    let scheduler = Arc::new(Scheduler::new(
        storage.clone(),
        Arc::new(HttpTransport::new()),
        config.clone(),
    ));
    let state = AppState {
        storage: storage.clone(),
        ingestor: Arc::new(Ingestor::new(storage, config.clone())),
        scheduler: scheduler.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = server.scheduler_interval.map(|every| {
        info!(interval_ms = every.as_millis() as u64, "running in-process scheduler");
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(every, shutdown_rx).await })
    });

    let listener = tokio::net::TcpListener::bind(server.bind_addr)
        .await
        .context("Failed to bind to address")?;
    info!("webhook pipeline listening on {}", server.bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("Failed to start server")?;

    let _ = shutdown_tx.send(true);
    if let Some(task) = scheduler_task {
        task.await.context("scheduler task panicked")?;
    }
    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_storage(server: &ServerConfig) -> anyhow::Result<Arc<dyn Storage>> {
    if let Some(url) = &server.database_url {
        let storage = webhook_pipeline::PostgresStorage::connect(url)
            .await
            .context("Failed to connect to postgres")?;
        info!("using postgres storage");
        return Ok(Arc::new(storage));
    }
    warn!("DATABASE_URL not set; deliveries are kept in memory");
    Ok(Arc::new(InMemoryStorage::new()))
}

#[cfg(not(feature = "postgres"))]
async fn open_storage(server: &ServerConfig) -> anyhow::Result<Arc<dyn Storage>> {
    if server.database_url.is_some() {
        warn!("DATABASE_URL ignored: built without the `postgres` feature");
    }
    Ok(Arc::new(InMemoryStorage::new()))
}

/// Register one key and endpoint from `WEBHOOK_DEV_*` so a fresh in-memory
/// server can be exercised without a provisioning surface.
async fn seed_dev_fixtures(storage: &dyn Storage) -> anyhow::Result<()> {
    let Ok(raw_key) = std::env::var("WEBHOOK_DEV_API_KEY") else {
        return Ok(());
    };
    let owner = std::env::var("WEBHOOK_DEV_OWNER").unwrap_or_else(|_| "dev".to_string());

    let key = ApiKey::issue(owner.clone(), &raw_key);
    info!(owner = %owner, key_prefix = %key.key_prefix, "seeding dev api key");
    storage.put_api_key(key).await.context("Failed to seed api key")?;

    if let Ok(url) = std::env::var("WEBHOOK_DEV_ENDPOINT_URL") {
        let mut endpoint = Endpoint::new(EndpointId::generate().0, owner, url);
        if let Ok(secret) = std::env::var("WEBHOOK_DEV_ENDPOINT_SECRET") {
            endpoint = endpoint.with_secret(secret);
        }
        info!(endpoint_id = %endpoint.id, url = %endpoint.url, "seeding dev endpoint");
        storage.put_endpoint(endpoint).await.context("Failed to seed endpoint")?;
    }
    Ok(())
}
