//! # virtrigaud Controller Manager
//!
//! Hosts the reconcilers that drive hypervisor providers toward the
//! declared state of the cluster's VM resources, plus the cold-migration
//! engine and the health endpoint.
//!
//! ## Usage
//! ```bash
//! virtrigaud-controller --config /etc/virtrigaud/controller.yaml
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use virtrigaud_controller::cli::Args;
use virtrigaud_controller::config::Config;
use virtrigaud_controller::context::{Ctx, MockClientFactory};
use virtrigaud_controller::{http_server, ControllerManager};
use virtrigaud_provider::{ClientFactory, HttpClientFactory, ProviderResolver};
use virtrigaud_store::{MemoryStore, RawStore, Recorder};
use virtrigaud_storage::StagingFactory;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.json_logs {
        virtrigaud_common::init_logging_json(&args.log_level)?;
    } else {
        virtrigaud_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting virtrigaud controller manager"
    );

    let config = match Config::load(&args.config) {
        Ok(cfg) => {
            info!(config_path = %args.config, "configuration loaded");
            cfg
        }
        Err(_) if args.config == "/etc/virtrigaud/controller.yaml" => {
            info!("no config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            error!(error = %e, path = %args.config, "failed to load configuration");
            return Err(e);
        }
    };
    let config = config.with_cli_overrides(&args);

    let staging = StagingFactory::new(
        config.staging.pvc_mount_base.clone(),
        config.staging.nfs_mount_base.clone(),
    );

    let factory: Arc<dyn ClientFactory> = if config.manager.dev_mode {
        info!("development mode: providers are in-memory mock workers");
        Arc::new(MockClientFactory::new(staging.clone()))
    } else {
        Arc::new(HttpClientFactory)
    };

    let store: Arc<dyn RawStore> = Arc::new(MemoryStore::new());
    let ctx = Ctx::new(
        store,
        Arc::new(ProviderResolver::new(factory)),
        Recorder::new(),
        staging,
    );

    let manager = Arc::new(
        ControllerManager::new(ctx).with_workers_per_kind(config.manager.workers_per_kind),
    );

    {
        let listen = config.health.listen_address.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = http_server::run(&listen, manager).await {
                error!(error = %e, "health endpoint failed");
            }
        });
    }

    info!(
        workers_per_kind = config.manager.workers_per_kind,
        health = %config.health.listen_address,
        "controller manager configured"
    );

    if let Err(e) = manager.run().await {
        error!(error = %e, "controller manager failed");
        return Err(e);
    }

    Ok(())
}
