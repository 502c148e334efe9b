use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use state_store::{file::JsonFileBackend, prepared_claims::PreparedClaimsFile, StateStore};
use tokio::{
    net::UnixListener,
    signal,
    sync::watch,
};
use tracing::{error, info, warn};

use crate::{
    cdi::{store::JsonDirRegistry, RegistrySynchronizer, SyncReport},
    claims::{ClaimHandler, VfProvisioning},
    config::AgentConfig,
    discovery::{models::ModelNames, sysfs::FsSysfs, DiscoveryEngine},
    provisioning::SysfsProvisioner,
    registration::Registrar,
    routes::{create_routes, RouteState},
    vf_sizing::builtin_catalog,
};

const STATE_IO_TIMEOUT: Duration = Duration::from_secs(5);
const PREPARED_CLAIMS_FILE: &str = "prepared_claims.json";

#[derive(Clone)]
pub struct Service {
    pub config: AgentConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub discovery: DiscoveryEngine,
    pub registry: Arc<RegistrySynchronizer>,
    pub handler: Arc<ClaimHandler>,
}

impl Service {
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let models = ModelNames::builtin();
        let memory_defaults = config
            .vf_memory_defaults(&models)
            .context("error loading VF memory defaults")?;
        let catalog = Arc::new(builtin_catalog().with_default_memory_overrides(memory_defaults));
        let discovery = DiscoveryEngine::new(
            Arc::new(FsSysfs::new(&config.sysfs_root)),
            Arc::new(models),
            catalog.clone(),
            config.discovery_timeout(),
        );

        let backend = JsonFileBackend::new(&config.state_dir)
            .await
            .context("error initializing allocation state store")?;
        let store = StateStore::new(Arc::new(backend), config.node_name.clone(), STATE_IO_TIMEOUT);
        let prepared = PreparedClaimsFile::new(Path::new(&config.state_dir).join(PREPARED_CLAIMS_FILE))
            .await
            .context("error loading prepared claims")?;

        let registry = Arc::new(RegistrySynchronizer::new(
            Arc::new(JsonDirRegistry::new(&config.cdi_root)),
            &config.dev_root,
        ));
        let mut handler = ClaimHandler::new(
            store,
            Arc::new(prepared),
            registry.clone(),
            catalog.clone(),
            config.handler_settings(),
        );
        if config.provision_vfs {
            handler = handler.with_provisioning(VfProvisioning {
                provisioner: Arc::new(SysfsProvisioner::new(&config.sysfs_root, catalog)),
                discovery: discovery.clone(),
                naming_style: config.naming_style,
            });
        }
        let handler = Arc::new(handler);

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            discovery,
            registry,
            handler,
        })
    }

    /// One discovery pass: publish the devices found into the allocation
    /// state, then bring the exposure registry in line.
    pub async fn refresh(&self) -> Result<SyncReport> {
        let snapshot = self.discovery.discover(self.config.naming_style).await?;
        self.handler.reconcile(&snapshot).await?;
        let report = self
            .registry
            .sync(snapshot.values(), self.config.cleanup_registry)
            .await?;
        Ok(report)
    }

    pub async fn start(&mut self) -> Result<()> {
        self.refresh().await.context("initial discovery failed")?;

        let service = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.discovery_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.refresh().await {
                            warn!(error = %e, "rediscovery failed, keeping previous state");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("rediscovery stopped");
                        return;
                    }
                }
            }
        });

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down agent gracefully");
        });

        let listener = bind_socket(&self.config.socket_path).await?;
        info!("agent api listening on {}", self.config.socket_path);

        let registrar = Registrar::new(
            &self.config.registration_dir,
            &self.config.driver_name,
            &self.config.socket_path,
        );
        registrar.register().await?;

        let routes = create_routes(RouteState {
            handler: self.handler.clone(),
        });
        let mut shutdown_rx = self.shutdown_rx.clone();
        let served = axum::serve(listener, routes)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await;

        registrar.deregister().await;
        if let Err(e) = tokio::fs::remove_file(&self.config.socket_path).await {
            warn!(error = %e, "failed to remove socket");
        }
        served.context("agent api server failed")?;
        Ok(())
    }
}

async fn bind_socket(socket_path: &str) -> Result<UnixListener> {
    let path = Path::new(socket_path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = socket_path, "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to remove stale socket {socket_path}")),
    }
    UnixListener::bind(path).with_context(|| format!("failed to bind {socket_path}"))
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    if shutdown_tx.send(()).is_err() {
        warn!("no receivers for shutdown signal");
    }
    info!("signal received, shutting down agent gracefully");
}
