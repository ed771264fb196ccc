use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process;
use syncline::adapters::dialect::create_adapter;
use syncline::cli::{Cli, Commands};
use syncline::core::config::{Config, TableFilters, CONFIG_FILE};
use syncline::services::schema_server::SchemaServer;
use syncline::services::sync_orchestrator::{SnapshotRole, SyncOrchestrator};
use syncline::services::wire::CommandStream;

fn main() {
    // CLIをパースして実行
    let cli = Cli::parse();

    // 非同期ランタイムを作成して実行
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    let result = runtime.block_on(run_command(cli));

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

/// コマンドを実行する
async fn run_command(cli: Cli) -> Result<String> {
    let config = load_config(cli.config.as_deref())?;
    config.validate()?;

    match cli.command {
        Commands::Sync {
            env,
            ignore,
            only,
            snapshot,
        } => {
            let db_config = config.get_database_config(&env)?;
            let filters = merge_filters(&config.filters, ignore, only);
            let adapter = create_adapter(config.dialect, &db_config).await?;

            // プロトコルは標準入出力パイプの上で話す
            let stream = CommandStream::new(tokio::io::stdin(), tokio::io::stdout());
            let mut orchestrator = SyncOrchestrator::new(stream, adapter, filters);

            let role = match snapshot {
                Some(token) => SnapshotRole::Join(token),
                None => SnapshotRole::Establish,
            };
            orchestrator.run(role).await?;

            let version = orchestrator
                .version()
                .map(|v| v.to_string())
                .unwrap_or_default();
            Ok(format!("Schemas match (protocol version {}).", version))
        }

        Commands::Serve { env } => {
            let db_config = config.get_database_config(&env)?;
            let adapter = create_adapter(config.dialect, &db_config).await?;

            let stream = CommandStream::new(tokio::io::stdin(), tokio::io::stdout());
            let mut server = SchemaServer::new(stream, adapter);
            server.serve().await?;

            Ok(String::new())
        }
    }
}

/// 設定ファイルを読み込む
fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    let yaml = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    yaml.parse()
}

/// 設定ファイルのフィルターとコマンドライン引数のフィルターを統合する
fn merge_filters(base: &TableFilters, ignore: Vec<String>, only: Vec<String>) -> TableFilters {
    let mut filters = base.clone();
    filters.ignore_tables.extend(ignore);
    filters.only_tables.extend(only);
    filters
}
