use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{debug, info};

use crate::backoff::RetryPolicy;
use crate::clock::Sleeper;
use crate::config::ProviderCfg;
use crate::error::RunError;

const SEED_BOUND: i64 = 2_147_483_647;

/// Reference image inlined into the request body.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ReferenceImage {
    pub async fn load(path: &Path) -> Result<Self, RunError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            RunError::Config(format!("cannot read reference {}: {e}", path.display()))
        })?;
        let mime = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("image/jpeg")
            .to_string();
        Ok(Self { mime, bytes })
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}

pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub reference: Option<&'a ReferenceImage>,
    pub seed: u64,
}

/// Time-derived seed, kept under the 31-bit bound providers accept.
pub fn seed_from(now: DateTime<Utc>) -> u64 {
    now.timestamp().rem_euclid(SEED_BOUND) as u64
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Runs one generation to completion and returns the URL of the result image.
    async fn generate(&self, req: &GenerationRequest<'_>) -> Result<String, RunError>;
}

#[derive(Serialize)]
struct PredictionReq<'a> {
    version: &'a str,
    input: PredictionInput<'a>,
}

#[derive(Serialize)]
struct PredictionInput<'a> {
    prompt: String,
    negative_prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    width: u32,
    height: u32,
    num_inference_steps: u32,
    guidance_scale: f64,
    ip_adapter_scale: f64,
    controlnet_conditioning_scale: f64,
    seed: u64,
}

#[derive(Deserialize)]
struct VersionList {
    #[serde(default)]
    results: Vec<VersionItem>,
}

#[derive(Deserialize)]
struct VersionItem {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: String,
}

/// Replicate predictions API client.
pub struct ReplicateProvider {
    client: reqwest::Client,
    cfg: ProviderCfg,
    token: Option<String>,
    sleeper: Arc<dyn Sleeper>,
}

impl ReplicateProvider {
    pub fn new(cfg: ProviderCfg, token: Option<String>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { client: reqwest::Client::new(), cfg, token, sleeper }
    }

    /// Reads the credential from `cfg.token_env`; an unset or blank variable is kept as `None`
    /// and surfaces as a config error on the first call.
    pub fn from_env(cfg: ProviderCfg, sleeper: Arc<dyn Sleeper>) -> Self {
        let token = std::env::var(&cfg.token_env).ok().filter(|t| !t.trim().is_empty());
        Self::new(cfg, token, sleeper)
    }

    fn token(&self) -> Result<&str, RunError> {
        self.token.as_deref().ok_or_else(|| {
            RunError::Config(format!("{} not set (add it as a repo secret)", self.cfg.token_env))
        })
    }

    fn auth(&self) -> Result<String, RunError> {
        Ok(format!("Token {}", self.token()?))
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), tail)
    }

    /// Newest version id of the configured model.
    pub async fn latest_version(&self) -> Result<String, RunError> {
        let resp = self
            .client
            .get(self.url(&format!("models/{}/versions", self.cfg.model)))
            .header("Authorization", self.auth()?)
            .timeout(Duration::from_secs(self.cfg.request_timeout_secs))
            .send()
            .await?;
        let list: VersionList = ensure_success(resp, "version lookup").await?.json().await?;
        list.results
            .into_iter()
            .next()
            .map(|v| v.id)
            .ok_or_else(|| RunError::Provider(format!("no versions returned for model {}", self.cfg.model)))
    }

    pub async fn resolve_version(&self) -> Result<String, RunError> {
        match &self.cfg.version {
            Some(v) => Ok(v.clone()),
            None => {
                info!(model = %self.cfg.model, "fetching latest model version");
                let v = self.latest_version().await?;
                info!("using {}@{}", self.cfg.model, v);
                Ok(v)
            }
        }
    }

    fn payload<'a>(&'a self, version: &'a str, req: &GenerationRequest<'_>) -> PredictionReq<'a> {
        let prompt = if self.cfg.prompt_suffix.is_empty() {
            req.prompt.to_string()
        } else {
            format!("{}, {}", req.prompt, self.cfg.prompt_suffix)
        };
        PredictionReq {
            version,
            input: PredictionInput {
                prompt,
                negative_prompt: &self.cfg.negative_prompt,
                image: req.reference.map(ReferenceImage::data_uri),
                width: self.cfg.width,
                height: self.cfg.height,
                num_inference_steps: self.cfg.steps,
                guidance_scale: self.cfg.guidance,
                ip_adapter_scale: self.cfg.ip_adapter_scale,
                controlnet_conditioning_scale: self.cfg.controlnet_conditioning_scale,
                seed: req.seed,
            },
        }
    }

    async fn submit(&self, body: &PredictionReq<'_>) -> Result<String, RunError> {
        let resp = self
            .client
            .post(self.url("predictions"))
            .header("Authorization", self.auth()?)
            .json(body)
            .timeout(Duration::from_secs(self.cfg.submit_timeout_secs))
            .send()
            .await?;
        let p: Prediction = ensure_success(resp, "submission").await?.json().await?;
        p.urls
            .map(|u| u.get)
            .ok_or_else(|| RunError::Provider("submission response has no poll url".into()))
    }

    async fn poll(&self, poll_url: &str) -> Result<String, RunError> {
        let policy = RetryPolicy::fixed(
            self.cfg.max_polls,
            Duration::from_secs(self.cfg.poll_interval_secs),
        );
        for attempt in 1..=policy.attempts {
            let resp = self
                .client
                .get(poll_url)
                .header("Authorization", self.auth()?)
                .timeout(Duration::from_secs(self.cfg.request_timeout_secs))
                .send()
                .await?;
            let p: Prediction = ensure_success(resp, "poll").await?.json().await?;
            match p.status.as_deref() {
                Some("succeeded") => return extract_output(p.output.as_ref()),
                Some(status @ ("failed" | "canceled")) => {
                    let reason = p.error.as_ref().and_then(error_text).unwrap_or_else(|| status.to_string());
                    return Err(RunError::Provider(format!("replicate failed: {reason}")));
                }
                other => debug!(attempt, status = ?other, "prediction pending"),
            }
            self.sleeper.sleep(policy.delay_after(attempt)).await;
        }
        Err(RunError::Provider(format!("replicate timed out after {} polls", policy.attempts)))
    }
}

#[async_trait]
impl ImageProvider for ReplicateProvider {
    fn name(&self) -> &'static str { "replicate" }

    async fn generate(&self, req: &GenerationRequest<'_>) -> Result<String, RunError> {
        self.token()?;
        let version = self.resolve_version().await?;
        let body = self.payload(&version, req);
        let poll_url = self.submit(&body).await?;
        debug!(%poll_url, "prediction submitted");
        self.poll(&poll_url).await
    }
}

async fn ensure_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, RunError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(RunError::Provider(format!("{what} returned {status}: {text}")))
}

fn error_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// A single URL, or the last element when the model returns several.
fn extract_output(out: Option<&Value>) -> Result<String, RunError> {
    match out {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Array(items)) => match items.last() {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(RunError::Provider(format!("unexpected output format: {}", Value::Array(items.clone())))),
        },
        other => Err(RunError::Provider(format!(
            "unexpected output format: {}",
            other.cloned().unwrap_or(Value::Null)
        ))),
    }
}
