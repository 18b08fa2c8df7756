use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};

use crate::backoff::RetryPolicy;
use crate::clock::Sleeper;
use crate::config::DownloadCfg;
use crate::error::RunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTag {
    #[serde(rename = "generated")]
    Generated,
    #[serde(rename = "fallback-asset")]
    FallbackAsset,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Generated => "generated",
            SourceTag::FallbackAsset => "fallback-asset",
        }
    }
}

/// `meta.json`: describes the most recent run only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub date: String,
    pub prompt: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub source: SourceTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Date plus optional per-day run counter; names one output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKey {
    pub date: String,
    pub run: Option<u32>,
}

impl RunKey {
    pub fn file_name(&self) -> String {
        match self.run {
            Some(n) => format!("{}-{}.jpg", self.date, n),
            None => format!("{}.jpg", self.date),
        }
    }
}

/// Next key for `date`: 1 + the number of `{date}-*.jpg` files already in `out_dir`.
pub async fn next_run_key(out_dir: &Path, date: &str, numbered: bool) -> Result<RunKey, RunError> {
    if !numbered {
        return Ok(RunKey { date: date.to_string(), run: None });
    }
    let prefix = format!("{date}-");
    let mut existing = 0u32;
    let mut rd = fs::read_dir(out_dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".jpg") {
            existing += 1;
        }
    }
    Ok(RunKey { date: date.to_string(), run: Some(existing + 1) })
}

/// Writes through a sibling temp file and renames it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let res = async {
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(bytes).await?;
        let _ = f.sync_all().await; // best-effort
        drop(f);
        fs::rename(&tmp, path).await
    }
    .await;
    if res.is_err() {
        fs::remove_file(&tmp).await.ok();
    }
    res
}

pub async fn write_meta(path: &Path, meta: &MetaRecord) -> Result<(), RunError> {
    let bytes = serde_json::to_vec_pretty(meta)
        .map_err(|e| RunError::Fatal(format!("cannot encode meta: {e}")))?;
    write_atomic(path, &bytes).await?;
    Ok(())
}

pub enum ImageSource {
    Remote(String),
    Local(PathBuf),
}

/// Fetches result images and publishes them as the run file plus `latest.jpg`.
pub struct Materializer {
    client: reqwest::Client,
    out_dir: PathBuf,
    policy: RetryPolicy,
    timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl Materializer {
    pub fn new(out_dir: PathBuf, cfg: &DownloadCfg, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            client: reqwest::Client::new(),
            out_dir,
            policy: RetryPolicy::linear(cfg.attempts, Duration::from_secs(cfg.step_secs)),
            timeout: Duration::from_secs(cfg.timeout_secs),
            sleeper,
        }
    }

    pub async fn fetch(&self, src: &ImageSource) -> Result<Vec<u8>, RunError> {
        match src {
            ImageSource::Remote(url) => self.download(url).await,
            ImageSource::Local(path) => fs::read(path).await.map_err(|e| {
                RunError::Fatal(format!("cannot read fallback asset {}: {e}", path.display()))
            }),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, RunError> {
        for attempt in 1..=self.policy.attempts {
            match self.download_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!("download attempt {attempt} failed: {e}");
                    self.sleeper.sleep(self.policy.delay_after(attempt)).await;
                }
            }
        }
        Err(RunError::Download(format!(
            "failed to download image after {} attempts",
            self.policy.attempts
        )))
    }

    async fn download_once(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let resp = self.client.get(url).timeout(self.timeout).send().await?.error_for_status()?;
        let bytes = resp.bytes().await?.to_vec();
        image::guess_format(&bytes)
            .map_err(|_| anyhow::anyhow!("response body is not a recognised image ({} bytes)", bytes.len()))?;
        Ok(bytes)
    }

    /// Writes the run file, then refreshes `latest.jpg` with the same bytes.
    pub async fn publish(&self, key: &RunKey, bytes: &[u8]) -> Result<PathBuf, RunError> {
        let run_path = self.out_dir.join(key.file_name());
        write_atomic(&run_path, bytes).await?;
        write_atomic(&self.out_dir.join("latest.jpg"), bytes).await?;
        info!(path = %run_path.display(), bytes = bytes.len(), "image published");
        Ok(run_path)
    }

    pub async fn materialize(&self, src: &ImageSource, key: &RunKey) -> Result<PathBuf, RunError> {
        let bytes = self.fetch(src).await?;
        self.publish(key, &bytes).await
    }
}
