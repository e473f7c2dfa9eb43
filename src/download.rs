//! Asynchronous script downloads into the staging slot.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PluginConfig;
use crate::error::{StoreError, StoreResult};
use crate::store::{ScriptStore, StagingFile};

pub struct Downloader {
    client: reqwest::Client,
    store: Arc<ScriptStore>,
    max_size: u64,
    handle: Handle,
}

impl Downloader {
    pub fn new(config: &PluginConfig, store: Arc<ScriptStore>, handle: Handle) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.download_timeout())
            .user_agent(concat!("levelscript/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            store,
            max_size: config.max_script_size,
            handle,
        })
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Runs the download on the runtime and hands the outcome to `on_done`.
    /// Returns immediately.
    pub fn spawn<F>(self: &Arc<Self>, staging: StagingFile, url: Url, on_done: F) -> JoinHandle<()>
    where
        F: FnOnce(StoreResult<PathBuf>) + Send + 'static,
    {
        let this = Arc::clone(self);
        self.handle.spawn(async move {
            let outcome = this.fetch(staging, url).await;
            on_done(outcome);
        })
    }

    /// Downloads into the staging file, then promotes it to live. Any failure,
    /// or dropping the future before it finishes, deletes the staging file.
    pub async fn fetch(&self, mut staging: StagingFile, url: Url) -> StoreResult<PathBuf> {
        let map = staging.map_id.clone();
        info!("[Lua download] Fetching script for '{map}' from {url}");
        let bytes = match self.transfer(&mut staging, &url).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("[Lua download] Download for '{map}' failed: {err}");
                drop(staging);
                return Err(err);
            }
        };
        match self.store.complete_download(staging) {
            Ok(live) => {
                info!("[Lua download] Promoted {bytes} byte script for '{map}'");
                Ok(live)
            }
            Err(e) => {
                warn!("[Lua download] Could not promote script for '{map}': {e}");
                Err(StoreError::Io(e))
            }
        }
    }

    async fn transfer(&self, staging: &mut StagingFile, url: &Url) -> StoreResult<u64> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::HttpStatus(response.status().as_u16()));
        }

        if let Some(total) = response.content_length() {
            if total > self.max_size {
                return Err(StoreError::TooLarge {
                    limit: self.max_size,
                    reported: total,
                });
            }
        }

        let file = staging.take_file().ok_or_else(|| {
            StoreError::Io(std::io::Error::other("staging file handle already taken"))
        })?;
        let mut file = tokio::fs::File::from_std(file);
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            // Servers may omit or understate Content-Length.
            if downloaded > self.max_size {
                return Err(StoreError::TooLarge {
                    limit: self.max_size,
                    reported: downloaded,
                });
            }
            file.write_all(&chunk).await?;
            debug!("[Lua download] {} bytes received for '{}'", downloaded, staging.map_id);
        }
        file.flush().await?;
        Ok(downloaded)
    }
}

/// Normalizes a user-supplied script URL.
///
/// Adds a scheme when missing and rewrites share-page links of common paste
/// hosts to their raw-content form.
pub fn filter_url(raw: &str) -> StoreResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidUrl("empty URL".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let mut url =
        Url::parse(&with_scheme).map_err(|e| StoreError::InvalidUrl(format!("{trimmed}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(StoreError::InvalidUrl(format!(
            "unsupported scheme `{}`",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| StoreError::InvalidUrl(format!("{trimmed}: missing host")))?;

    let segments: Vec<String> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();

    if host == "pastebin.com" || host == "www.pastebin.com" {
        if let [id] = segments.as_slice() {
            url.set_path(&format!("/raw/{id}"));
        }
    } else if host == "github.com" || host == "www.github.com" {
        if segments.len() > 3 && segments[2] == "blob" {
            let path = format!(
                "/{}/{}/{}",
                segments[0],
                segments[1],
                segments[3..].join("/")
            );
            url.set_host(Some("raw.githubusercontent.com"))
                .map_err(|e| StoreError::InvalidUrl(e.to_string()))?;
            url.set_path(&path);
        }
    } else if host.ends_with("dropbox.com") {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "dl")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(pairs)
            .append_pair("dl", "1");
    }
    Ok(url)
}
