use std::convert::identity;
use std::net::SocketAddr;
use std::sync::Arc;

use structopt::StructOpt;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use pontoon::{
    cli::{Configure, Pontoon, Run},
    config::Config,
    defaults,
    manager::PipeManager,
    pool::BackendPool,
    server::Server,
    transport::WebSocketDialer,
};

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Pontoon::from_args() {
        Pontoon::Configure(Configure { config }) => {
            let config_path = config.ok_or_else(defaults::config_path).or_else(identity)?;
            tokio::task::spawn_blocking(|| Ok(edit::edit_file(config_path)?)).await?
        }
        Pontoon::Run(run) => run_proxy(run).await,
    }
}

async fn run_proxy(run: Run) -> Result<(), anyhow::Error> {
    let config_path = run
        .config
        .ok_or_else(defaults::config_path)
        .or_else(identity)?;
    let config = if config_path.exists() {
        Config::load(&config_path).await?
    } else {
        Config::default()
    };

    let pool = BackendPool::new(
        config.max_idle_connections,
        config.max_allowed_error_count,
        Arc::new(WebSocketDialer::default()),
    );
    let manager = Arc::new(PipeManager::new(
        pool.clone(),
        config.interrupt_memory_limit_per_conn_bytes,
    ));
    for backend in config.backends.iter().cloned().chain(run.backends) {
        if let Err(error) = manager.register_backend(backend) {
            warn!("{}", error);
        }
    }

    let mut server = Server::new(manager);
    server.handshake_timeout(config.handshake_timeout);
    let address = SocketAddr::new(config.address, config.port);
    server
        .serve(address, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    pool.shutdown();
    Ok(())
}
