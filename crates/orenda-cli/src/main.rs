use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orenda_etl::EtlConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "orenda")]
#[command(about = "Rental listing ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extract-transform-load pass against DomRia.
    Run {
        #[arg(long)]
        max_pages: Option<u32>,
        /// Persist canonical listings only, skipping raw payloads.
        #[arg(long)]
        skip_raw: bool,
    },
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = EtlConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        max_pages: None,
        skip_raw: false,
    }) {
        Commands::Run {
            max_pages,
            skip_raw,
        } => {
            if max_pages.is_some() {
                config.max_pages = max_pages;
            }
            if skip_raw {
                config.save_raw = false;
            }

            let result = orenda_etl::run_domria_once(&config).await?;
            println!(
                "run complete: fetched={} normalized={} loaded={} failed={}",
                result.total_fetched,
                result.total_normalized,
                result.total_loaded,
                result.total_failed
            );
            for error in &result.errors {
                eprintln!("error: {error}");
            }
        }
        Commands::Migrate => {
            let pool = sqlx::PgPool::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            sqlx::migrate!("../../migrations")
                .run(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
