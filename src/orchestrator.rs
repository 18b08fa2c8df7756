use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::RunCfg;
use crate::error::RunError;
use crate::io::{next_run_key, write_meta, ImageSource, Materializer, MetaRecord, RunKey, SourceTag};
use crate::manifest::{reconcile, KeyMode, ManifestEntry};
use crate::prompts::{fallback_asset, file_name, load_prompts, scan_assets, select, Selection};
use crate::providers::{seed_from, GenerationRequest, ImageProvider, ReferenceImage};

#[derive(Debug)]
pub struct RunOutcome {
    pub key: RunKey,
    pub path: PathBuf,
    pub source: SourceTag,
    pub error: Option<String>,
}

pub struct Orchestrator<'a> {
    pub cfg: &'a RunCfg,
    pub provider: &'a dyn ImageProvider,
    pub materializer: &'a Materializer,
    pub clock: &'a dyn Clock,
}

impl Orchestrator<'_> {
    /// select -> generate (or fallback copy) -> publish -> meta -> manifest.
    pub async fn run_once(&self) -> Result<RunOutcome, RunError> {
        let cfg = self.cfg;
        let now = self.clock.now();

        let prompts = load_prompts(&cfg.prompts_file).await?;
        let assets = scan_assets(&cfg.assets_dir, &cfg.asset_prefix).await?;
        let sel = select(&prompts, &assets, now, cfg.tz_offset_hours)?;
        info!(date = %sel.date_str(), reference = %sel.reference_name(), prompt = %sel.prompt, "selected");

        tokio::fs::create_dir_all(&cfg.out_dir).await?;
        let key = next_run_key(&cfg.out_dir, &sel.date_str(), cfg.run_numbering).await?;

        let attempt = async {
            let url = self.generate(&sel, now).await?;
            self.materializer.materialize(&ImageSource::Remote(url), &key).await
        };
        let (path, source, error) = match attempt.await {
            Ok(path) => (path, SourceTag::Generated, None),
            Err(e) => {
                warn!("generation failed, using fallback asset: {e}");
                let fb = fallback_asset(&assets, now, cfg.tz_offset_hours, cfg.fallback_rotation)
                    .ok_or_else(|| RunError::Fatal(format!("no fallback asset available after: {e}")))?;
                info!(asset = %file_name(&fb), "copying fallback asset");
                let path = self.materializer.materialize(&ImageSource::Local(fb), &key).await?;
                (path, SourceTag::FallbackAsset, Some(e.to_string()))
            }
        };

        let meta = MetaRecord {
            date: sel.date_str(),
            prompt: sel.prompt.clone(),
            reference: sel.reference_name(),
            source,
            error: error.clone(),
        };
        write_meta(&cfg.meta_path(), &meta).await?;

        let mode = if cfg.run_numbering { KeyMode::Src } else { KeyMode::Date };
        let entry = ManifestEntry {
            date: meta.date.clone(),
            src: key.file_name(),
            prompt: meta.prompt.clone(),
            reference: Some(meta.reference.clone()),
            source: source.as_str().to_string(),
        };
        let items = reconcile(&cfg.manifest_path(), entry, mode).await?;
        info!(entries = items.len(), "manifest updated");

        Ok(RunOutcome { key, path, source, error })
    }

    async fn generate(&self, sel: &Selection, now: DateTime<Utc>) -> Result<String, RunError> {
        let reference = if self.cfg.provider.use_reference {
            Some(ReferenceImage::load(&sel.reference).await?)
        } else {
            None
        };
        let req = GenerationRequest {
            prompt: &sel.prompt,
            reference: reference.as_ref(),
            seed: seed_from(now),
        };
        let url = self.provider.generate(&req).await?;
        info!(provider = self.provider.name(), %url, "image generated");
        Ok(url)
    }
}
