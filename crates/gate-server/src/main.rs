use anyhow::Context;
use clap::Parser;
use gate_config::ConfigLoader;
use gate_logging::{init_logging, LogFormat};
use gate_server::{create_router, AppState, Collaborators, SharedBackends};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ConfigLoader::new(args.config.as_ref()).load()?;

    let format: LogFormat = config.logging.format.parse()?;
    init_logging(&config.logging.level, format)?;
    tracing::info!(config = ?args.config, "Starting gateway");

    if config.metrics.enabled {
        let addr: SocketAddr = config
            .metrics
            .listen
            .parse()
            .with_context(|| format!("invalid metrics.listen: {}", config.metrics.listen))?;
        gate_server::metrics::init_metrics(addr)?;
    }

    let collaborators = Collaborators::http(&config)?;
    let backends = SharedBackends::from_config(&config.redis)?;
    let state = Arc::new(AppState::build(config, collaborators, backends)?);

    // 首次拉取失败时保持空快照（全部拒绝），由后台任务继续重试
    if let Err(e) = state.policy.refresh().await {
        tracing::warn!(error = %e, "Initial policy load failed, denying all gated requests until it succeeds");
    }
    let _tasks = state.start_background_tasks();

    let addr: SocketAddr = state
        .config
        .listen_addr()
        .parse()
        .with_context(|| format!("invalid listen address: {}", state.config.listen_addr()))?;
    let app = create_router(state);

    tracing::info!("Gateway listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
