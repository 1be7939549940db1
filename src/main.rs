use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relstash::{config, GitHubClient, RepoOutcome, RunSummary, StashEngine};

#[derive(Parser)]
#[command(name = "relstash")]
#[command(about = "Retains a bounded set of GitHub release artifacts locally")]
#[command(version)]
struct Cli {
    /// Base directory for stashed releases
    #[arg(long)]
    home_folder: String,

    /// Retention config file: one `owner/repo, keep_count, release_type`
    /// rule per line, `#` starts a comment
    #[arg(long)]
    config: PathBuf,

    /// Seconds to wait between repositories
    #[arg(long, default_value_t = 5)]
    sleep_between_repos: u64,

    /// Remove local releases that fall outside the retention policy
    #[arg(long)]
    prune: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    info!("Starting relstash v{}", env!("CARGO_PKG_VERSION"));

    let rules = config::load_rules(&cli.config)?;
    if rules.is_empty() {
        println!("No retention rules configured, nothing to do");
        return Ok(());
    }

    let home = shellexpand::full(&cli.home_folder)
        .context("Failed to expand --home-folder path")?
        .into_owned();
    let home = PathBuf::from(home);
    std::fs::create_dir_all(&home)
        .with_context(|| format!("Failed to create home folder: {}", home.display()))?;

    let client = GitHubClient::new().context("Failed to create GitHub client")?;
    let engine = StashEngine::new(home, client, cli.prune);

    let summary = engine
        .run(&rules, Duration::from_secs(cli.sleep_between_repos))
        .await;

    print_summary(&summary);

    if !summary.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Print the end-of-run report to stdout
fn print_summary(summary: &RunSummary) {
    println!("\n📦 Stash run complete");
    println!("   Repositories: {}", summary.total_repositories);
    println!("   ✅ Succeeded: {}", summary.successful);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    for outcome in &summary.outcomes {
        match outcome {
            RepoOutcome::Synced { repo, stats } => {
                println!(
                    "   ✅ {repo}: {} downloaded, {} pruned",
                    stats.downloaded, stats.pruned
                );
            }
            RepoOutcome::Partial { repo, stats } => {
                println!(
                    "   ⚠️  {repo}: {} downloaded, {} asset(s) failed",
                    stats.downloaded, stats.failed_assets
                );
            }
            RepoOutcome::Empty { repo } => {
                println!("   ⏭️  {repo}: no matching releases");
            }
            RepoOutcome::Failed { repo, error } => {
                println!("   ❌ {repo}: {error}");
            }
        }
    }
}
