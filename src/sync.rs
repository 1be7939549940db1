//! Sync Engine - reconciles selected releases against local storage.
//!
//! Local state is never cached: every decision starts from a fresh
//! directory listing. Assets are compared by filename and size, downloaded
//! through a temporary name and renamed on completion, so a re-run with an
//! unchanged selection performs no downloads.

use crate::config::RetentionRule;
use crate::github::{FetchError, GitHubClient, Release};
use crate::select::select_releases;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Files the engine writes itself; excluded from asset reconciliation.
const MANAGED_FILES: [&str; 3] = ["README.md", "source.tar.gz", "source.zip"];

/// Per-repository sync counters
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    /// Assets (and source archives) downloaded this run
    pub downloaded: usize,
    /// Assets that failed to download and were skipped
    pub failed_assets: usize,
    /// Stale release directories removed
    pub pruned: usize,
}

/// Outcome of processing one configured repository
#[derive(Debug)]
pub enum RepoOutcome {
    /// Selection fully reconciled
    Synced { repo: String, stats: SyncStats },
    /// Reconciled, but some asset downloads failed and were skipped
    Partial { repo: String, stats: SyncStats },
    /// No release matched the retention rule
    Empty { repo: String },
    /// Fetch or filesystem failure; the run continues with the next repo
    Failed { repo: String, error: String },
}

impl RepoOutcome {
    pub fn repo(&self) -> &str {
        match self {
            RepoOutcome::Synced { repo, .. }
            | RepoOutcome::Partial { repo, .. }
            | RepoOutcome::Empty { repo }
            | RepoOutcome::Failed { repo, .. } => repo,
        }
    }

    /// Whether this outcome should fail the overall run.
    pub fn is_failure(&self) -> bool {
        matches!(self, RepoOutcome::Partial { .. } | RepoOutcome::Failed { .. })
    }
}

/// Results from a complete run over all configured repositories
#[derive(Debug)]
pub struct RunSummary {
    pub total_repositories: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration: Duration,
    pub outcomes: Vec<RepoOutcome>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// The stash engine: fetches, selects and reconciles releases under the
/// home folder, one repository at a time.
pub struct StashEngine {
    home: PathBuf,
    client: GitHubClient,
    prune: bool,
    // Serializes writes beneath a repository's directory tree.
    sync_guard: Mutex<()>,
}

impl StashEngine {
    pub fn new(home: PathBuf, client: GitHubClient, prune: bool) -> Self {
        Self {
            home,
            client,
            prune,
            sync_guard: Mutex::new(()),
        }
    }

    /// Process every rule in file order with a pacing delay in between.
    /// Per-repository failures never abort the run.
    pub async fn run(&self, rules: &[RetentionRule], sleep_between: Duration) -> RunSummary {
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(rules.len());

        for (i, rule) in rules.iter().enumerate() {
            outcomes.push(self.process_repository(rule).await);

            if i + 1 != rules.len() && !sleep_between.is_zero() {
                debug!(
                    "sleeping {}s before next repository",
                    sleep_between.as_secs()
                );
                tokio::time::sleep(sleep_between).await;
            }
        }

        let duration = start.elapsed();
        let failed = outcomes.iter().filter(|o| o.is_failure()).count();
        let summary = RunSummary {
            total_repositories: outcomes.len(),
            successful: outcomes.len() - failed,
            failed,
            duration,
            outcomes,
        };

        info!(
            "Run completed in {:.2}s: {} succeeded, {} failed",
            summary.duration.as_secs_f64(),
            summary.successful,
            summary.failed
        );
        summary
    }

    /// Fetch -> Select -> Sync for a single repository.
    pub async fn process_repository(&self, rule: &RetentionRule) -> RepoOutcome {
        let repo = rule.full_name();
        info!("Processing {repo} (keep {})", rule.keep_count);

        let releases = match self.client.fetch_releases(&rule.owner, &rule.repo).await {
            Ok(releases) => releases,
            Err(FetchError::NotFound) => {
                warn!("Repository {repo} not found, skipping");
                return RepoOutcome::Failed {
                    repo,
                    error: "repository not found".to_string(),
                };
            }
            Err(err) => {
                warn!("Failed to fetch releases for {repo}: {err}");
                return RepoOutcome::Failed {
                    repo,
                    error: err.to_string(),
                };
            }
        };

        let selection = select_releases(&releases, rule);
        if selection.is_empty() {
            info!("No matching releases for {repo}");
            return RepoOutcome::Empty { repo };
        }

        debug!(
            "Retaining for {repo}: {:?}",
            selection.iter().map(Release::directory_name).collect::<Vec<_>>()
        );

        match self.sync_repository(rule, &selection).await {
            Ok(stats) if stats.failed_assets > 0 => RepoOutcome::Partial { repo, stats },
            Ok(stats) => RepoOutcome::Synced { repo, stats },
            Err(err) => RepoOutcome::Failed {
                repo,
                error: format!("{err:#}"),
            },
        }
    }

    /// Reconcile the selected releases against local storage. Holds the
    /// repository sync guard for the duration.
    pub async fn sync_repository(
        &self,
        rule: &RetentionRule,
        selection: &[Release],
    ) -> Result<SyncStats> {
        let _guard = self.sync_guard.lock().await;

        let mut stats = SyncStats::default();
        for release in selection {
            self.sync_release(rule, release, &mut stats).await?;
        }

        if self.prune {
            stats.pruned = self.prune_stale(rule, selection)?;
        }

        Ok(stats)
    }

    /// List the release directories already present for a repository.
    /// Always a fresh directory listing, never cached.
    pub fn local_releases(&self, rule: &RetentionRule) -> Result<Vec<String>> {
        let dir = self.repo_dir(rule);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut tags = Vec::new();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                tags.push(name);
            }
        }
        tags.sort();
        Ok(tags)
    }

    fn repo_dir(&self, rule: &RetentionRule) -> PathBuf {
        self.home.join(&rule.owner).join(&rule.repo)
    }

    async fn sync_release(
        &self,
        rule: &RetentionRule,
        release: &Release,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let release_dir = self.repo_dir(rule).join(release.directory_name());
        if !release_dir.exists() {
            std::fs::create_dir_all(&release_dir)
                .with_context(|| format!("Failed to create {}", release_dir.display()))?;
            debug!("Created release dir {}", release_dir.display());
        }

        let existing = existing_asset_sizes(&release_dir)?;

        for asset in &release.assets {
            if existing.get(&asset.name) == Some(&asset.size) {
                debug!("Asset {} already present, skipping", asset.name);
                continue;
            }

            let dest = release_dir.join(&asset.name);
            info!("Downloading {} -> {}", asset.name, dest.display());
            match self.client.download(&asset.browser_download_url, &dest).await {
                Ok(()) => stats.downloaded += 1,
                Err(err) => {
                    warn!(
                        "Skipping asset {} for {}: {err}",
                        asset.name,
                        rule.full_name()
                    );
                    stats.failed_assets += 1;
                }
            }
        }

        // Source archives and release notes are fetched once, not refreshed.
        if let Some(url) = &release.tarball_url {
            self.fetch_source(url, &release_dir.join("source.tar.gz"), stats)
                .await;
        }
        if let Some(url) = &release.zipball_url {
            self.fetch_source(url, &release_dir.join("source.zip"), stats)
                .await;
        }

        let readme = release_dir.join("README.md");
        if !readme.exists() {
            std::fs::write(&readme, release.render_notes())
                .with_context(|| format!("Failed to write {}", readme.display()))?;
        }

        Ok(())
    }

    async fn fetch_source(&self, url: &str, dest: &Path, stats: &mut SyncStats) {
        if dest.exists() {
            return;
        }
        info!("Downloading source archive -> {}", dest.display());
        match self.client.download(url, dest).await {
            Ok(()) => stats.downloaded += 1,
            Err(err) => {
                warn!("Skipping source archive {}: {err}", dest.display());
                stats.failed_assets += 1;
            }
        }
    }

    /// Remove local release directories that fell out of the selection.
    fn prune_stale(&self, rule: &RetentionRule, selection: &[Release]) -> Result<usize> {
        let keep: HashSet<String> = selection.iter().map(Release::directory_name).collect();
        let mut pruned = 0;

        for tag in self.local_releases(rule)? {
            if keep.contains(&tag) {
                continue;
            }
            let stale = self.repo_dir(rule).join(&tag);
            info!("Removing stale release {}:{tag}", rule.full_name());
            std::fs::remove_dir_all(&stale)
                .with_context(|| format!("Failed to remove {}", stale.display()))?;
            pruned += 1;
        }

        Ok(pruned)
    }
}

fn existing_asset_sizes(dir: &Path) -> Result<HashMap<String, u64>> {
    let mut sizes = HashMap::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name.ends_with(".part") || MANAGED_FILES.contains(&name.as_str())
        {
            continue;
        }
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            sizes.insert(name, metadata.len());
        }
    }

    Ok(sizes)
}
