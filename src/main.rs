mod backend;
mod classifier;
mod config;
mod filter;
mod health;
mod metrics;
mod protocol;
mod router;
mod session;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::Config;
use health::{Monitor, ServerDirectory};
use router::RouterInstance;
use session::Session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_or_default_config();

    let directory = Arc::new(ServerDirectory::new(&config.servers, &config.health));
    let monitor = Monitor::new(directory.clone(), config.health.clone(), config.backend.clone());
    monitor.start();

    let router = Arc::new(RouterInstance::new(&config, directory)?);

    if config.metrics.enabled {
        let addr = config.metrics.listen_addr.clone();
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&addr, router).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;

    info!(
        addr = %addr,
        servers = config.servers.len(),
        failure_mode = ?config.router.master_failure_mode,
        "Read/write split proxy listening"
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        stream.set_nodelay(true).ok();

        let session_id = router.next_session_id();
        let router = router.clone();
        let auth = config.auth.clone();

        info!(session_id = session_id, peer = %peer_addr, "New connection");

        tokio::spawn(async move {
            let session = Session::new(session_id, router, auth);
            if let Err(e) = session.run(stream, peer_addr.ip().to_string()).await {
                warn!(session_id = session_id, error = %e, "Session ended with error");
            } else {
                info!(session_id = session_id, "Session ended");
            }
        });
    }
}

fn load_or_default_config() -> Config {
    let mut config_paths = vec!["config/rwsplit.toml".to_string(), "rwsplit.toml".to_string()];
    if let Ok(path) = std::env::var("RWSPLIT_CONFIG") {
        config_paths.insert(0, path);
    }

    for path in &config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = %path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
