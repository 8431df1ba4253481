mod agent_client;
mod api;
mod architect;
mod config;
mod council;
mod critic;
mod error;
mod fingerprint;
mod forge;
mod gate;
mod git;
mod git_ops;
mod harvester;
mod heart;
mod llm_gateway;
mod sandbox;
mod sanitizer;
mod staging;
mod state;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use error::RecordedOutcome;
use forge::Mission;
use state::OrchestratorContext;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "forge", about = "Orchestrate an autonomous coding agent through a nightly proposal-to-PR loop")]
struct Cli {
    /// Project directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    /// GitHub repo slug the orchestrator opens PRs against (owner/repo)
    #[arg(long)]
    repo: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default orchestrator.toml in the project directory
    Init,
    /// Run the nightly council once: collect, validate, dedup, dispatch
    Council,
    /// Forge a single ad-hoc mission from a title/description
    Mission {
        title: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Start the watchdog (Heart) and the reactive Architect heartbeat
    Serve {
        /// Bind address for the HTTP API; overrides orchestrator.toml
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print counts from the staging store
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init(&cli.project),
        Commands::Council => cmd_council(&cli.project, cli.repo),
        Commands::Mission { title, description } => cmd_mission(&cli.project, cli.repo, title, description),
        Commands::Serve { bind } => cmd_serve(&cli.project, cli.repo, bind),
        Commands::Status => cmd_status(&cli.project),
    }
}

fn load_config(project_dir: &PathBuf) -> config::OrchestratorConfig {
    config::OrchestratorConfig::load(project_dir).unwrap_or_else(|_| config::OrchestratorConfig::scaffold())
}

fn cmd_init(project_dir: &PathBuf) -> Result<()> {
    let config = config::OrchestratorConfig::scaffold();
    config.save(project_dir).context("writing orchestrator.toml")?;
    println!("Wrote {}/orchestrator.toml", project_dir.display());
    Ok(())
}

fn build_context(project_dir: &PathBuf, repo: Option<String>) -> Result<Arc<OrchestratorContext>> {
    let config = load_config(project_dir);
    let repo_slug = repo.unwrap_or_else(|| "owner/repo".to_string());
    let ctx = OrchestratorContext::new(config, project_dir.clone(), repo_slug)
        .context("initializing orchestrator context")?;
    Ok(Arc::new(ctx))
}

fn cmd_council(project_dir: &PathBuf, repo: Option<String>) -> Result<()> {
    let ctx = build_context(project_dir, repo)?;
    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(async {
        let forge = ctx.forge();
        let council = ctx.council(&forge);
        match council.convene().await {
            Some(report) => {
                println!(
                    "Council run complete: {}/{} missions succeeded ({} batches, pool {})",
                    report.achieved, report.target, report.batches, report.pool_size
                );
                for record in &report.results {
                    let recorded: RecordedOutcome = (&record.outcome).into();
                    println!("  {} — {recorded}", record.title);
                }
            }
            None => println!("Council run produced no ideas this cycle."),
        }
    });
    Ok(())
}

fn cmd_mission(project_dir: &PathBuf, repo: Option<String>, title: String, description: String) -> Result<()> {
    let ctx = build_context(project_dir, repo)?;
    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    let recorded = rt.block_on(async {
        let forge = ctx.forge();
        let mission = Mission {
            title,
            description,
            rationale: "dispatched via CLI".into(),
            requires_repo: true,
            confidence: 100,
            source: "CLI".to_string(),
        };
        let outcome = forge.forge_mission(&mission).await;
        RecordedOutcome::from(&outcome)
    });

    println!("{recorded}");
    if !recorded.is_success() {
        anyhow::bail!("mission did not succeed");
    }
    Ok(())
}

fn cmd_serve(project_dir: &PathBuf, repo: Option<String>, bind: Option<String>) -> Result<()> {
    let ctx = build_context(project_dir, repo)?;
    let bind_addr = bind.unwrap_or_else(|| ctx.config.http.bind_addr.clone());

    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(async {
        let stop = Arc::new(AtomicBool::new(false));
        ctx.start_background_loops(stop.clone());

        let api_state = api::ApiState::new(ctx.clone());
        let app = api::router(api_state);

        info!(%bind_addr, "starting HTTP API");
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding {bind_addr}"))?;
        axum::serve(listener, app).await.context("HTTP server stopped")
    })
}

fn cmd_status(project_dir: &PathBuf) -> Result<()> {
    let config = load_config(project_dir);
    let staging = staging::StagingStore::new(&config.storage.memory_root).context("opening staging store")?;

    let staged = staging.list_staged_projects();
    let rejected = staging.list_rejected();
    let merged = staging.merge_history();

    println!("Staged: {}", staged.len());
    for project in &staged {
        println!("  {} [{:?}] {}", project.id, project.status, project.title);
    }
    println!("Rejected: {}", rejected.len());
    println!("Merged: {}", merged.len());
    Ok(())
}
