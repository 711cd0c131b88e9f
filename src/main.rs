mod config;
mod gemini;
mod pipeline;
mod server;
mod storage;
mod tasks;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use config::AppConfig;
use storage::Database;
use utils::logger;

#[derive(Parser)]
#[command(name = "studyfellow")]
#[command(about = "AI家庭教師バックエンド", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 設定とデータベースを初期化
    Init,
    /// APIサーバを起動
    Serve {
        /// 待ち受けポート（設定ファイルより優先）
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logger();
    info!("studyfellow 起動");

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_command().await?;
        }
        Commands::Serve { port } => {
            serve_command(port).await?;
        }
    }

    Ok(())
}

async fn init_command() -> Result<()> {
    info!("初期化中...");

    tokio::fs::create_dir_all("data").await?;
    tokio::fs::create_dir_all("config").await?;

    let config = AppConfig::load()?;
    if !std::path::Path::new("config/settings.toml").exists() {
        config.save("config/settings.toml")?;
        info!("設定ファイルを作成しました: config/settings.toml");
    }

    let db = Database::new(&config.storage.database_url).await?;
    db.init_schema().await?;

    info!("初期化完了");
    Ok(())
}

async fn serve_command(port: Option<u16>) -> Result<()> {
    let mut config = AppConfig::load()?;
    if let Some(port) = port {
        config.server.port = port;
    }

    server::run(config).await
}
