//! Feed payload fetching.
//!
//! Two transports: authenticated HTTP pull and push-file delivery (the
//! feed owner drops files into a directory we scan). Both carry a
//! bounded timeout; the distinction between "could not fetch" and
//! "took too long" is preserved because it drives different error
//! codes on the run.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use feedmill_core::{ErrorCode, FeedSource, FetchConfig};

/// Failure of one fetch attempt.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("payload not found: {0}")]
    NotFound(String),
}

impl FetchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::TimeoutError,
            Self::Transport(_) | Self::NotFound(_) => ErrorCode::FetchError,
        }
    }
}

/// Fetch capability: (locator, transport) → bytes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, feed: &FeedSource) -> Result<Vec<u8>, FetchError>;
}

/// Eligibility check, an external collaborator (billing/subscription
/// status). Ineligible feeds are skipped, never failed.
#[async_trait]
pub trait EligibilityCheck: Send + Sync {
    async fn is_eligible(&self, feed: &FeedSource) -> bool;
}

/// Default eligibility: everyone runs.
pub struct AlwaysEligible;

#[async_trait]
impl EligibilityCheck for AlwaysEligible {
    async fn is_eligible(&self, _feed: &FeedSource) -> bool {
        true
    }
}

// ── HTTP transport ────────────────────────────────────────────

/// Pull transport over HTTP(S) with a bounded per-request timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Transport(format!("building http client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, feed: &FeedSource) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(&feed.locator).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Transport(format!("GET {}: {e}", feed.locator))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(feed.locator.clone()));
        }
        if !status.is_success() {
            return Err(FetchError::Transport(format!(
                "GET {} returned {status}",
                feed.locator
            )));
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Transport(format!("reading body from {}: {e}", feed.locator))
            }
        })?;

        debug!(feed_id = %feed.id, bytes = bytes.len(), "http fetch complete");
        Ok(bytes.to_vec())
    }
}

// ── Push-file transport ───────────────────────────────────────

/// Push transport: the feed owner delivers files into a drop
/// directory; the locator is the file-name prefix. The newest matching
/// file wins.
pub struct DropDirFetcher {
    root: PathBuf,
    timeout: Duration,
}

impl DropDirFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            root: config.drop_dir.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn newest_matching(&self, prefix: &str) -> Result<PathBuf, FetchError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| FetchError::Transport(format!("reading {}: {e}", self.root.display())))?;

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FetchError::Transport(format!("scanning drop dir: {e}")))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(prefix) {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| FetchError::Transport(format!("stat {name}: {e}")))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map_err(|e| FetchError::Transport(format!("mtime of {name}: {e}")))?;
            if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
                newest = Some((modified, entry.path()));
            }
        }

        newest
            .map(|(_, path)| path)
            .ok_or_else(|| FetchError::NotFound(format!("{}/{prefix}*", self.root.display())))
    }
}

#[async_trait]
impl Fetcher for DropDirFetcher {
    async fn fetch(&self, feed: &FeedSource) -> Result<Vec<u8>, FetchError> {
        let read = async {
            let path = self.newest_matching(&feed.locator).await?;
            debug!(feed_id = %feed.id, path = %path.display(), "reading drop file");
            tokio::fs::read(&path)
                .await
                .map_err(|e| FetchError::Transport(format!("reading {}: {e}", path.display())))
        };
        tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
    }
}

/// Fetcher that dispatches on each feed's transport kind. The worker
/// holds one of these; per-feed transports stay a data question.
pub struct TransportFetcher {
    http: HttpFetcher,
    drop_dir: DropDirFetcher,
}

impl TransportFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            drop_dir: DropDirFetcher::new(config),
        })
    }
}

#[async_trait]
impl Fetcher for TransportFetcher {
    async fn fetch(&self, feed: &FeedSource) -> Result<Vec<u8>, FetchError> {
        match feed.transport.as_str() {
            "http" => self.http.fetch(feed).await,
            "drop_dir" => self.drop_dir.fetch(feed).await,
            other => Err(FetchError::Transport(format!(
                "unknown transport kind: {other}"
            ))),
        }
    }
}

/// Pick the fetcher for a feed's transport kind.
pub fn fetcher_for(
    transport: &str,
    config: &FetchConfig,
) -> Result<Box<dyn Fetcher>, FetchError> {
    match transport {
        "http" => Ok(Box::new(HttpFetcher::new(config)?)),
        "drop_dir" => Ok(Box::new(DropDirFetcher::new(config))),
        other => Err(FetchError::Transport(format!(
            "unknown transport kind: {other}"
        ))),
    }
}
