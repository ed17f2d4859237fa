use std::sync::Arc;

use envconfig::Envconfig;
use eyre::WrapErr;
use lifecycle::{BackgroundTasks, OsSignals};
use tracing::error;

use catalog_api::config::ServiceConfig;
use catalog_api::logging::init_tracing;
use catalog_api::notify::LogNotifier;
use catalog_api::router::{router, AppState};
use catalog_api::supervisor::Supervisor;

async fn run(config: ServiceConfig) -> eyre::Result<()> {
    let store = common_database::open_pool(&config.store.to_store_config())
        .wrap_err("failed to configure store pool")?;

    let config = Arc::new(config);
    let tasks = BackgroundTasks::new();
    let app = router(AppState {
        config: config.clone(),
        tasks: tasks.clone(),
        notifier: Arc::new(LogNotifier::new(config.notify_sender.clone())),
    })
    .wrap_err("failed to build request pipeline")?;

    Supervisor::new(config, store, app, tasks)
        .run(OsSignals::install)
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    // The log format depends on the configuration, so this error goes to stderr as is.
    let config = match ServiceConfig::init_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(config.env);

    if let Err(e) = run(config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
