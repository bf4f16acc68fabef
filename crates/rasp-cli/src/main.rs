use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rasp_core::Industry;
use rasp_pipeline::{PipelineConfig, RunRequest, TracingSink, DEFAULT_APPLE_COUNTRY};
use rasp_store::PgReviewStore;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rasp-cli")]
#[command(about = "Review analysis and sync pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape-classify-sync pass for a single app.
    Run {
        /// Taxonomy to classify against (grocery or games).
        #[arg(long)]
        industry: Industry,
        /// Google Play package id, e.g. com.example.app.
        #[arg(long)]
        google_app_id: Option<String>,
        /// App Store app name as it appears in the store URL slug.
        #[arg(long)]
        apple_app_name: Option<String>,
        /// App Store storefront country code.
        #[arg(long, default_value = DEFAULT_APPLE_COUNTRY)]
        country: String,
    },
    /// Apply pending datastore migrations.
    Migrate,
    /// Serve the run-dashboard web UI.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            industry,
            google_app_id,
            apple_app_name,
            country,
        } => {
            let mut request = RunRequest::new(industry);
            if let Some(app_id) = google_app_id {
                request = request.with_google_app_id(app_id);
            }
            if let Some(app_name) = apple_app_name {
                request = request.with_apple_app(app_name, country);
            }
            let summary = rasp_pipeline::run_from_env(&request, Arc::new(TracingSink)).await?;
            println!(
                "run complete: run_id={} industry={} status={:?} scraped={} novel={} synced={}",
                summary.run_id,
                summary.industry,
                summary.status,
                summary.scraped,
                summary.novel,
                summary.synced
            );
        }
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            let store = PgReviewStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            rasp_web::serve_from_env().await?;
        }
    }

    Ok(())
}
