use anyhow::Result;
use clap::Parser;
use tracing::info;

#[derive(Parser)]
#[command(name = "switchyard", about = "Rule-based TCP/UDP traffic router")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = switchyard::config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone())),
        )
        .init();

    info!(config = cli.config, "switchyard starting");
    let app = switchyard::app::App::new(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    app.shutdown().await;
    Ok(())
}
