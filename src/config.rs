use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::RunError;

/// Which day-of-year drives the fallback asset rotation.
///
/// `Local` shares the offset-adjusted "today" used for the prompt and file name.
/// `Utc` reproduces the older behaviour of rotating on the raw UTC day, which can
/// pick a different asset than the reference around midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationDay {
    #[default]
    Local,
    Utc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCfg {
    pub base_url: String,
    pub model: String,
    /// Pinned model version. When unset the newest version is looked up every run.
    pub version: Option<String>,
    pub token_env: String,
    /// Send the rotated reference image along with the prompt.
    pub use_reference: bool,
    pub prompt_suffix: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f64,
    pub ip_adapter_scale: f64,
    pub controlnet_conditioning_scale: f64,
    pub poll_interval_secs: u64,
    pub max_polls: u32,
    pub request_timeout_secs: u64,
    pub submit_timeout_secs: u64,
}

impl Default for ProviderCfg {
    fn default() -> Self {
        Self {
            base_url: "https://api.replicate.com/v1".into(),
            model: "zsxkib/instant-id".into(),
            version: None,
            token_env: "REPLICATE_API_TOKEN".into(),
            use_reference: true,
            prompt_suffix: "ultra-detailed, photorealistic, natural skin tones, high dynamic range".into(),
            negative_prompt: "blurry, deformed, extra limbs, double face, watermark, text, low quality".into(),
            width: 896,
            height: 1152,
            steps: 28,
            guidance: 6.5,
            ip_adapter_scale: 0.85,
            controlnet_conditioning_scale: 0.85,
            poll_interval_secs: 2,
            max_polls: 120,
            request_timeout_secs: 30,
            submit_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadCfg {
    pub attempts: u32,
    /// Linear backoff step; attempt `n` waits `n * step_secs` after failing.
    pub step_secs: u64,
    pub timeout_secs: u64,
}

impl Default for DownloadCfg {
    fn default() -> Self {
        Self { attempts: 5, step_secs: 1, timeout_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCfg {
    pub prompts_file: PathBuf,
    pub assets_dir: PathBuf,
    pub asset_prefix: String,
    pub out_dir: PathBuf,
    pub tz_offset_hours: i32,
    /// Suffix per-day files with a run counter (`2024-05-01-2.jpg`) and key the manifest by file.
    pub run_numbering: bool,
    pub fallback_rotation: RotationDay,
    pub provider: ProviderCfg,
    pub download: DownloadCfg,
}

impl Default for RunCfg {
    fn default() -> Self {
        Self {
            prompts_file: PathBuf::from("prompts.txt"),
            assets_dir: PathBuf::from("assets"),
            asset_prefix: "jay".into(),
            out_dir: PathBuf::from("daily"),
            tz_offset_hours: -4,
            run_numbering: true,
            fallback_rotation: RotationDay::Local,
            provider: ProviderCfg::default(),
            download: DownloadCfg::default(),
        }
    }
}

impl RunCfg {
    pub fn from_yaml(txt: &str) -> Result<Self, RunError> {
        let cfg: RunCfg = serde_yaml::from_str(txt)
            .map_err(|e| RunError::Config(format!("invalid config YAML: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads the YAML file when given, falls back to defaults otherwise, then
    /// applies `DAILYGEN_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, RunError> {
        let mut cfg = match path {
            Some(p) => {
                let txt = std::fs::read_to_string(p).map_err(|e| {
                    RunError::Config(format!("failed to read config {}: {e}", p.display()))
                })?;
                Self::from_yaml(&txt)?
            }
            None => RunCfg::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), RunError> {
        if let Some(v) = var("DAILYGEN_OUT_DIR") { self.out_dir = PathBuf::from(v); }
        if let Some(v) = var("DAILYGEN_PROMPTS_FILE") { self.prompts_file = PathBuf::from(v); }
        if let Some(v) = var("DAILYGEN_ASSETS_DIR") { self.assets_dir = PathBuf::from(v); }
        if let Some(v) = var("DAILYGEN_TZ_OFFSET_HOURS") {
            self.tz_offset_hours = v.trim().parse().map_err(|_| {
                RunError::Config(format!("DAILYGEN_TZ_OFFSET_HOURS is not an integer: {v:?}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RunError> {
        if self.provider.max_polls == 0 {
            return Err(RunError::Config("provider.max_polls must be at least 1".into()));
        }
        if self.download.attempts == 0 {
            return Err(RunError::Config("download.attempts must be at least 1".into()));
        }
        if !(-14..=14).contains(&self.tz_offset_hours) {
            return Err(RunError::Config(format!(
                "tz_offset_hours {} is outside -14..=14",
                self.tz_offset_hours
            )));
        }
        Ok(())
    }

    pub fn latest_path(&self) -> PathBuf { self.out_dir.join("latest.jpg") }
    pub fn meta_path(&self) -> PathBuf { self.out_dir.join("meta.json") }
    pub fn manifest_path(&self) -> PathBuf { self.out_dir.join("manifest.json") }
}
