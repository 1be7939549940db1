use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::str::FromStr;

/// Which releases of a repository qualify for retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseType {
    /// Keep stable releases and prereleases alike.
    All,
    /// Keep stable releases only.
    Stable,
}

impl FromStr for ReleaseType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("all") {
            Ok(ReleaseType::All)
        } else if s.eq_ignore_ascii_case("stable") {
            Ok(ReleaseType::Stable)
        } else {
            Err(anyhow!(
                "unknown release type `{}`, expected `all` or `stable`",
                s
            ))
        }
    }
}

/// Per-repository retention policy, one per configured line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionRule {
    pub owner: String,
    pub repo: String,
    /// How many releases to keep locally, always positive
    pub keep_count: usize,
    pub release_type: ReleaseType,
}

impl RetentionRule {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Load retention rules from a config file.
///
/// The file is line-oriented: `owner/repo, keep_count, release_type` per
/// line, where `release_type` is `all` or `stable`. Blank lines and lines
/// starting with `#` are ignored. Any malformed line aborts the load.
pub fn load_rules(path: &Path) -> Result<Vec<RetentionRule>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_rules(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse the config file body into retention rules.
pub fn parse_rules(content: &str) -> Result<Vec<RetentionRule>> {
    let mut rules = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let rule = parse_line(line).with_context(|| format!("line {}: `{}`", idx + 1, line))?;
        rules.push(rule);
    }

    Ok(rules)
}

fn parse_line(line: &str) -> Result<RetentionRule> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        bail!(
            "expected `owner/repo, keep_count, release_type`, got {} field(s)",
            fields.len()
        );
    }

    let repo_field = fields[0].trim_matches('/');
    let (owner, repo) = repo_field
        .split_once('/')
        .ok_or_else(|| anyhow!("repository `{}` must be in `owner/name` form", fields[0]))?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        bail!("repository `{}` must be in `owner/name` form", fields[0]);
    }

    let keep_count: usize = fields[1]
        .parse()
        .with_context(|| format!("keep count `{}` is not a number", fields[1]))?;
    if keep_count == 0 {
        bail!("keep count must be positive");
    }

    let release_type = fields[2].parse::<ReleaseType>()?;

    Ok(RetentionRule {
        owner: owner.to_string(),
        repo: repo.to_string(),
        keep_count,
        release_type,
    })
}
