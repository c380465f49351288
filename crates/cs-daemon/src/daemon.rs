use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cs_bridge::http_api::{api_router_with_auth, ApiState};
use cs_channel::{ChannelApi, ChannelClient, Mapper};
use cs_core::config::{Config, CredentialProvider};
use cs_core::store::Store;
use cs_harness::shutdown::ShutdownSignal;
use cs_sync::{RestoreReport, RunReport, SyncEngine};
use tracing::{info, warn};

/// How long workers and an in-flight scheduled run get to finish after
/// shutdown is triggered.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The channel-sync background service.
///
/// Owns the sync engine and serves the HTTP surface while webhook workers
/// and the reconciliation schedule run beside it. Shuts down when the
/// `ShutdownSignal` is triggered (e.g. via ctrl-c).
pub struct Daemon {
    config: Config,
    engine: SyncEngine,
    shutdown: ShutdownSignal,
    api_key: Option<String>,
}

impl Daemon {
    /// Open the store and build the channel client from config and
    /// environment credentials.
    pub async fn new(config: Config) -> Result<Self> {
        let path = config.resolved_store_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let store = Store::new(&path)
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        let client = ChannelClient::from_config(&config).context("failed to build channel client")?;
        Self::with_api(config, store, Arc::new(client))
    }

    /// Build around an already opened store and channel API.
    pub fn with_api(config: Config, store: Store, api: Arc<dyn ChannelApi>) -> Result<Self> {
        let mapper = Mapper::from_config(&config.mapping).context("invalid status mapping")?;
        let webhook_secret = if config.webhook.verify_signature {
            match CredentialProvider::webhook_secret(&config.webhook) {
                Some(secret) => Some(secret),
                None => bail!(
                    "webhook.verify_signature is set but {} is empty",
                    config.webhook.secret_env
                ),
            }
        } else {
            None
        };
        let api_key = CredentialProvider::daemon_api_key(&config.daemon);
        if api_key.is_none() {
            warn!(
                env = %config.daemon.api_key_env,
                "no API key configured, trigger endpoints are open"
            );
        }

        let shutdown = ShutdownSignal::new();
        let engine = SyncEngine::new(
            &config,
            store,
            api,
            Arc::new(mapper),
            webhook_secret,
            shutdown.clone(),
        );
        Ok(Self {
            config,
            engine,
            shutdown,
            api_key,
        })
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // One-shot commands
    // ------------------------------------------------------------------

    /// A single reconciliation pass. Apply runs fail with the report still
    /// logged when records failed or were left unverified.
    pub async fn reconcile_once(&self, preview: bool) -> Result<RunReport> {
        let report = if preview {
            self.engine.preview().await?
        } else {
            self.engine.import(None).await?
        };
        info!(
            run_id = %report.run_id,
            status = ?report.status,
            created = report.reservations.created,
            updated = report.reservations.updated,
            cancelled = report.reservations.cancelled,
            unverified = report.reservations.skipped_as_unverified,
            "reconciliation finished"
        );
        Ok(report)
    }

    pub async fn restore_once(&self) -> Result<RestoreReport> {
        let report = self.engine.restore().await?;
        info!(
            job_id = %report.job_id,
            restored = report.stats.restored,
            still_cancelled = report.stats.still_cancelled,
            skipped = report.stats.skipped,
            "restore finished"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Server mode
    // ------------------------------------------------------------------

    /// Serve on the configured `host:port` until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on a pre-bound listener until shutdown, then drain the
    /// webhook workers and the schedule.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let workers = self.engine.start_workers(self.config.webhook.workers);
        let interval_secs = self.config.reconcile.interval_secs;
        let schedule = (interval_secs > 0)
            .then(|| self.engine.spawn_schedule(Duration::from_secs(interval_secs)));

        let state = Arc::new(ApiState::new(self.engine.clone()));
        let router = api_router_with_auth(state, self.api_key.clone());
        let bind_addr = listener.local_addr()?;
        info!(
            %bind_addr,
            workers = workers.len(),
            interval_secs,
            "API server listening"
        );

        let mut stop = self.shutdown.subscribe();
        let signal = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                if !signal.is_shutting_down() {
                    let _ = stop.recv().await;
                }
            })
            .await
            .context("API server error")?;
        info!("API server stopped, draining");

        let mut signal = self.shutdown.clone();
        let drained = signal.wait_for_drain(workers.len(), DRAIN_TIMEOUT).await;
        if let Some(handle) = schedule {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("scheduled reconciliation did not stop in time");
            }
        }
        info!(complete = drained.is_complete(), "daemon stopped");
        Ok(())
    }
}
