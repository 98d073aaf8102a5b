use anyhow::Result;
use bmh_core::{BusinessDescriptor, Source};
use bmh_engine::{EngineConfig, Orchestrator};
use bmh_fetchers::{FetchMode, SourceRegistry};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bmh-cli")]
#[command(about = "Business Mention Harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the HTTP API (default).
    Serve,
    /// Run one job in-process and print its results as JSON.
    Run {
        name: String,
        #[arg(long)]
        business_url: Option<String>,
        #[arg(long)]
        google_maps_url: Option<String>,
        #[arg(long)]
        trustpilot_url: Option<String>,
    },
    /// Show how each source is configured in sources.yaml.
    Sources,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("bmh=info".parse()?)
        .add_directive("tower_http=info".parse()?);
    let json = std::env::var("BMH_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => bmh_web::serve_from_env().await?,
        Commands::Run {
            name,
            business_url,
            google_maps_url,
            trustpilot_url,
        } => {
            let config = EngineConfig::from_env();
            let orchestrator = Orchestrator::from_config(&config)?;
            let descriptor = BusinessDescriptor {
                name,
                business_url,
                google_maps_url,
                trustpilot_url,
            };
            let receipt = orchestrator.submit(descriptor).await?;
            let state = orchestrator.wait_for_terminal(receipt.job_id).await?;
            let results = orchestrator.get_results(receipt.job_id).await?;
            info!(job_id = %receipt.job_id, %state, total = results.total_reviews, "run complete");
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Sources => {
            let config = EngineConfig::from_env();
            let registry = SourceRegistry::load(config.workspace_root.join("sources.yaml"))?;
            let budgets = registry.budgets(config.fetch_budget());
            for source in Source::ALL {
                let budget = budgets.for_source(source);
                match registry.config_for(source) {
                    Some(entry) => {
                        let mode = match entry.mode {
                            FetchMode::Fixture => "fixture",
                            FetchMode::Remote => "remote",
                        };
                        println!(
                            "{:<11} enabled={} mode={} endpoint={} max_items={} timeout={}s",
                            source.display_name(),
                            entry.enabled,
                            mode,
                            entry.endpoint.as_deref().unwrap_or("-"),
                            budget.max_items,
                            budget.timeout.as_secs()
                        );
                    }
                    None => println!("{:<11} not configured", source.display_name()),
                }
            }
        }
    }

    Ok(())
}
