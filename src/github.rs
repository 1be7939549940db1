use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Base URL of the GitHub REST API.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const PER_PAGE: usize = 100;
const MAX_ATTEMPTS: u32 = 3;
const MAX_RETRY_AFTER_SECS: u64 = 120;

/// A downloadable file attached to a release
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub size: u64,
    pub browser_download_url: String,
}

/// A published release as returned by the releases listing endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    pub name: Option<String>,
    pub html_url: String,
    pub body: Option<String>,
    pub prerelease: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub tarball_url: Option<String>,
    pub zipball_url: Option<String>,
    pub assets: Vec<ReleaseAsset>,

    /// Set after fetching when this release is the host's designated latest.
    #[serde(skip)]
    pub latest: bool,
}

impl Release {
    /// Publish timestamp, falling back to creation time for unpublished tags.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.created_at)
    }

    /// Directory name for this release under the repository folder.
    /// Tags may contain path separators (e.g. `releases/v1.0`).
    pub fn directory_name(&self) -> String {
        let name = self.tag_name.replace(['/', '\\'], "_");
        if name.is_empty() || name == "." || name == ".." {
            "_".to_string()
        } else {
            name
        }
    }

    /// Render the generated README placed next to the downloaded assets.
    pub fn render_notes(&self) -> String {
        let title = self.name.as_deref().unwrap_or(&self.tag_name);
        let published = self
            .published_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unpublished".to_string());
        let body = self
            .body
            .as_deref()
            .unwrap_or("No release notes were provided by developers");

        format!(
            "# {title}\n\n\
             Github Release link: {link}\n\n\
             created_at = {created}\n\n\
             published_at = {published}\n\n\
             # Release notes\n{body}\n",
            link = self.html_url,
            created = self.created_at.to_rfc3339(),
        )
    }
}

/// Failure talking to the GitHub API.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("repository not found")]
    NotFound,

    #[error("rate limited by the GitHub API")]
    RateLimited { retry_after: Option<u64> },

    #[error("unexpected HTTP status {0}")]
    Status(StatusCode),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl FetchError {
    /// Transient failures are worth another attempt; 404 and client
    /// errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::NotFound => false,
            FetchError::RateLimited { .. } => true,
            FetchError::Status(status) => status.is_server_error(),
            FetchError::Http(err) => !err.is_decode(),
        }
    }
}

/// Failure downloading a single asset.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to write download to disk: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Fetch(err) => err.is_retryable(),
            DownloadError::Io(_) => false,
        }
    }
}

/// GitHub API client for the unauthenticated releases endpoints.
///
/// Holds the shared HTTP session and paces outgoing requests so that
/// unauthenticated rate limits are respected even on the happy path.
pub struct GitHubClient {
    http: Client,
    api_base: String,
    min_interval: Duration,
    retry_base: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl GitHubClient {
    /// Create a client against the public GitHub API.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    /// Create a client against a custom API base URL.
    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );

        // No overall request timeout: asset downloads can legitimately
        // take minutes on slow links.
        let http = Client::builder()
            .user_agent(concat!("relstash/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let api_base = api_base.into().trim_end_matches('/').to_string();

        Ok(Self {
            http,
            api_base,
            min_interval: Duration::from_secs(1),
            retry_base: Duration::from_secs(2),
            last_request: Mutex::new(None),
        })
    }

    /// Override request pacing and retry backoff base.
    pub fn pacing(mut self, min_interval: Duration, retry_base: Duration) -> Self {
        self.min_interval = min_interval;
        self.retry_base = retry_base;
        self
    }

    /// Fetch every release of `owner/repo` and mark the host-designated
    /// latest one, merging it in if the listing missed it.
    pub async fn fetch_releases(&self, owner: &str, repo: &str) -> Result<Vec<Release>, FetchError> {
        let mut releases = self.list_releases(owner, repo).await?;

        if let Some(mut latest) = self.latest_release(owner, repo).await? {
            if let Some(existing) = releases.iter_mut().find(|r| r.tag_name == latest.tag_name) {
                existing.latest = true;
            } else {
                latest.latest = true;
                releases.push(latest);
            }
        }

        Ok(releases)
    }

    /// List all releases visible via the listing endpoint, following
    /// pagination until a short page.
    pub async fn list_releases(&self, owner: &str, repo: &str) -> Result<Vec<Release>, FetchError> {
        let mut releases = Vec::new();
        let mut page = 1u32;

        loop {
            let url = format!(
                "{}/repos/{}/{}/releases?per_page={}&page={}",
                self.api_base, owner, repo, PER_PAGE, page
            );
            let batch: Vec<Release> = self.get_json_with_retry(&url).await?;
            let last_page = batch.len() < PER_PAGE;
            releases.extend(batch);

            if last_page {
                break;
            }
            page += 1;
        }

        debug!("found {} releases for {}/{}", releases.len(), owner, repo);
        Ok(releases)
    }

    /// The release the host designates as latest, if any. A 404 here means
    /// the repository has no latest release, not that it is missing.
    pub async fn latest_release(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Option<Release>, FetchError> {
        let url = format!("{}/repos/{}/{}/releases/latest", self.api_base, owner, repo);
        match self.get_json_with_retry(&url).await {
            Ok(release) => Ok(Some(release)),
            Err(FetchError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Download `url` to `dest`, streaming through a temporary `.part`
    /// file and renaming on completion so an interrupted download never
    /// leaves a partial file behind.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        let tmp = partial_path(dest);
        let mut delay = self.retry_base;
        let mut attempt = 1;

        loop {
            match self.try_download(url, &tmp, dest).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if tmp.exists() {
                        let _ = tokio::fs::remove_file(&tmp).await;
                    }
                    if err.is_retryable() && attempt < MAX_ATTEMPTS {
                        warn!(
                            "download attempt {attempt}/{MAX_ATTEMPTS} failed for {url}: {err}; \
                             retrying in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        attempt += 1;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn try_download(&self, url: &str, tmp: &Path, dest: &Path) -> Result<(), DownloadError> {
        self.pace().await;
        debug!("GET {url}");

        let response = self.http.get(url).send().await.map_err(FetchError::from)?;
        classify(&response)?;

        let mut file = tokio::fs::File::create(tmp).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FetchError::from)?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(tmp, dest).await?;
        Ok(())
    }

    async fn get_json_with_retry<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let mut delay = self.retry_base;
        let mut attempt = 1;

        loop {
            match self.get_json(url).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    if let FetchError::RateLimited {
                        retry_after: Some(secs),
                    } = &err
                    {
                        delay = delay.max(Duration::from_secs((*secs).min(MAX_RETRY_AFTER_SECS)));
                    }
                    warn!(
                        "attempt {attempt}/{MAX_ATTEMPTS} failed for {url}: {err}; \
                         retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        self.pace().await;
        debug!("GET {url}");

        let response = self.http.get(url).send().await?;
        classify(&response)?;
        Ok(response.json().await?)
    }

    /// Enforce the minimum interval between outgoing requests.
    async fn pace(&self) {
        if self.min_interval.is_zero() {
            return;
        }

        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

fn classify(response: &Response) -> Result<(), FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound);
    }
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && rate_limit_exhausted(response))
    {
        return Err(FetchError::RateLimited {
            retry_after: retry_after_secs(response),
        });
    }
    Err(FetchError::Status(status))
}

fn rate_limit_exhausted(response: &Response) -> bool {
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "0")
        .unwrap_or(false)
}

fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> GitHubClient {
        GitHubClient::with_api_base(server.uri())
            .unwrap()
            .pacing(Duration::ZERO, Duration::from_millis(1))
    }

    fn release_json(tag: &str, prerelease: bool, ts: &str) -> serde_json::Value {
        serde_json::json!({
            "tag_name": tag,
            "name": tag,
            "html_url": format!("https://github.com/foo/bar/releases/tag/{tag}"),
            "prerelease": prerelease,
            "created_at": ts,
            "published_at": ts,
            "assets": [],
        })
    }

    #[tokio::test]
    async fn test_list_releases_single_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                release_json("v2", false, "2024-02-01T00:00:00Z"),
                release_json("v1", false, "2024-01-01T00:00:00Z"),
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let releases = client.list_releases("foo", "bar").await.unwrap();
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].tag_name, "v2");
        assert!(!releases[0].latest);
    }

    #[tokio::test]
    async fn test_list_releases_follows_pagination() {
        let server = MockServer::start().await;

        let full_page: Vec<serde_json::Value> = (0..PER_PAGE)
            .map(|i| release_json(&format!("v{i}"), false, "2024-01-01T00:00:00Z"))
            .collect();

        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(full_page)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                release_json("v100", false, "2023-01-01T00:00:00Z"),
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let releases = client.list_releases("foo", "bar").await.unwrap();
        assert_eq!(releases.len(), PER_PAGE + 1);
        assert_eq!(releases.last().unwrap().tag_name, "v100");
    }

    #[tokio::test]
    async fn test_list_releases_missing_repo_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/gone/releases"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.list_releases("foo", "gone").await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                release_json("v1", false, "2024-01-01T00:00:00Z"),
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let releases = client.list_releases("foo", "bar").await.unwrap();
        assert_eq!(releases.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .respond_with(
                ResponseTemplate::new(403).insert_header("x-ratelimit-remaining", "0"),
            )
            .expect(MAX_ATTEMPTS as u64)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.list_releases("foo", "bar").await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_plain_forbidden_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.list_releases("foo", "bar").await.unwrap_err();
        assert!(matches!(err, FetchError::Status(StatusCode::FORBIDDEN)));
    }

    #[tokio::test]
    async fn test_fetch_releases_marks_latest_in_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                release_json("v2", false, "2024-02-01T00:00:00Z"),
                release_json("v1", false, "2024-01-01T00:00:00Z"),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases/latest"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(release_json("v2", false, "2024-02-01T00:00:00Z")),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        let releases = client.fetch_releases("foo", "bar").await.unwrap();
        assert_eq!(releases.len(), 2);
        assert!(releases.iter().find(|r| r.tag_name == "v2").unwrap().latest);
        assert!(!releases.iter().find(|r| r.tag_name == "v1").unwrap().latest);
    }

    #[tokio::test]
    async fn test_fetch_releases_merges_latest_missing_from_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                release_json("v1", false, "2024-01-01T00:00:00Z"),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases/latest"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(release_json("v2", false, "2024-02-01T00:00:00Z")),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        let releases = client.fetch_releases("foo", "bar").await.unwrap();
        assert_eq!(releases.len(), 2);
        assert!(releases.iter().any(|r| r.tag_name == "v2" && r.latest));
    }

    #[tokio::test]
    async fn test_fetch_releases_without_latest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                release_json("v1-rc1", true, "2024-01-01T00:00:00Z"),
            ])))
            .mount(&server)
            .await;
        // Prerelease-only repositories have no "latest" release.
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar/releases/latest"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let releases = client.fetch_releases("foo", "bar").await.unwrap();
        assert_eq!(releases.len(), 1);
        assert!(releases.iter().all(|r| !r.latest));
    }

    #[tokio::test]
    async fn test_download_streams_to_temp_then_renames() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/asset.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("asset.bin");

        let client = test_client(&server);
        client
            .download(&format!("{}/asset.bin", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/asset.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("asset.bin");

        let client = test_client(&server);
        let err = client
            .download(&format!("{}/asset.bin", server.uri()), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Fetch(FetchError::NotFound)));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_directory_name_sanitizes_tag() {
        let mut release = Release {
            tag_name: "releases/v1.0".to_string(),
            name: None,
            html_url: "https://example.com".to_string(),
            body: None,
            prerelease: false,
            created_at: Utc::now(),
            published_at: None,
            tarball_url: None,
            zipball_url: None,
            assets: Vec::new(),
            latest: false,
        };
        assert_eq!(release.directory_name(), "releases_v1.0");

        release.tag_name = "..".to_string();
        assert_eq!(release.directory_name(), "_");
    }

    #[test]
    fn test_render_notes_contains_metadata() {
        let release = Release {
            tag_name: "v1".to_string(),
            name: Some("First release".to_string()),
            html_url: "https://github.com/foo/bar/releases/tag/v1".to_string(),
            body: Some("Bug fixes".to_string()),
            prerelease: false,
            created_at: Utc::now(),
            published_at: Some(Utc::now()),
            tarball_url: None,
            zipball_url: None,
            assets: Vec::new(),
            latest: true,
        };

        let notes = release.render_notes();
        assert!(notes.contains("# First release"));
        assert!(notes.contains("https://github.com/foo/bar/releases/tag/v1"));
        assert!(notes.contains("Bug fixes"));
    }
}
