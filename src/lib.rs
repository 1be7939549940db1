//! relstash - Bounded Local Retention of GitHub Release Artifacts
//!
//! relstash keeps a configurable number of releases per repository on local
//! disk, downloading their assets from the public GitHub API and optionally
//! pruning releases that fall out of the retention policy.
//!
//! ## Core Features
//!
//! - **Retention Rules**: per-repository keep count and release-type filter
//! - **Latest Pinning**: the host-designated latest release always survives
//! - **Idempotent Sync**: assets compared by name and size, never re-downloaded
//! - **Rate-Limit Awareness**: paced requests with retry and backoff
//!
//! ## Modules
//!
//! - [`config`]: retention rule parsing
//! - [`github`]: GitHub API client and asset downloads
//! - [`select`]: retention selection logic
//! - [`sync`]: filesystem reconciliation and run orchestration

pub mod config;
pub mod github;
pub mod select;
pub mod sync;

pub use config::{ReleaseType, RetentionRule};
pub use github::{DownloadError, FetchError, GitHubClient, Release, ReleaseAsset};
pub use select::select_releases;
pub use sync::{RepoOutcome, RunSummary, StashEngine, SyncStats};
