//! Retention selection - decides which releases stay on disk.
//!
//! Pure logic, no I/O: given the releases the host reports and a
//! [`RetentionRule`], produce the ordered set to retain locally. The
//! host-designated "latest" release always survives retention, provided it
//! passes the release-type filter on its own.

use crate::config::{ReleaseType, RetentionRule};
use crate::github::Release;

/// Select at most `keep_count` releases to retain.
///
/// The prerelease filter runs before the latest/remainder split, so a
/// prerelease marked latest is excluded under a `stable` policy. The
/// remainder is ordered most-recent-first by publish timestamp.
pub fn select_releases(releases: &[Release], rule: &RetentionRule) -> Vec<Release> {
    let mut candidates: Vec<Release> = releases
        .iter()
        .filter(|r| rule.release_type == ReleaseType::All || !r.prerelease)
        .cloned()
        .collect();

    let latest = candidates
        .iter()
        .position(|r| r.latest)
        .map(|i| candidates.remove(i));

    candidates.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));

    let mut selection = Vec::with_capacity(rule.keep_count.min(candidates.len() + 1));
    if let Some(latest) = latest {
        selection.push(latest);
    }
    let remaining = rule.keep_count.saturating_sub(selection.len());
    selection.extend(candidates.into_iter().take(remaining));
    selection
}
