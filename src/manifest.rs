use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::RunError;
use crate::io::write_atomic;

/// One gallery item in `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub date: String,
    pub src: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default = "unknown_source")]
    pub source: String,
}

fn unknown_source() -> String {
    "unknown".into()
}

/// What identifies an entry for replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Run-numbered output: one entry per file.
    Src,
    /// One entry per day.
    Date,
}

impl ManifestEntry {
    pub fn key(&self, mode: KeyMode) -> &str {
        match mode {
            KeyMode::Src => &self.src,
            KeyMode::Date => &self.date,
        }
    }
}

/// Missing or corrupt history reads as empty.
pub async fn load_manifest(path: &Path) -> Vec<ManifestEntry> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) => {
            debug!(path = %path.display(), "no manifest yet: {e}");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(items) => items,
        Err(e) => {
            warn!(path = %path.display(), "manifest unreadable, starting fresh: {e}");
            Vec::new()
        }
    }
}

/// Newest first by (date, key).
pub fn sort_newest_first(items: &mut [ManifestEntry], mode: KeyMode) {
    items.sort_by(|a, b| (b.date.as_str(), b.key(mode)).cmp(&(a.date.as_str(), a.key(mode))));
}

pub async fn save_manifest(path: &Path, items: &[ManifestEntry]) -> Result<(), RunError> {
    let bytes = serde_json::to_vec_pretty(items)
        .map_err(|e| RunError::Fatal(format!("cannot encode manifest: {e}")))?;
    write_atomic(path, &bytes).await?;
    Ok(())
}

/// Drops any entry sharing the new entry's key, appends it, and returns the sorted collection.
pub fn merge(mut items: Vec<ManifestEntry>, entry: ManifestEntry, mode: KeyMode) -> Vec<ManifestEntry> {
    items.retain(|m| m.key(mode) != entry.key(mode));
    items.push(entry);
    sort_newest_first(&mut items, mode);
    items
}

pub async fn reconcile(path: &Path, entry: ManifestEntry, mode: KeyMode) -> Result<Vec<ManifestEntry>, RunError> {
    let items = merge(load_manifest(path).await, entry, mode);
    save_manifest(path, &items).await?;
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(date: &str, src: &str, prompt: &str) -> ManifestEntry {
        ManifestEntry {
            date: date.into(),
            src: src.into(),
            prompt: prompt.into(),
            reference: Some("jay1.jpg".into()),
            source: "generated".into(),
        }
    }

    #[tokio::test]
    async fn replaces_entry_with_same_src() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let seed = vec![ManifestEntry { source: "fallback-asset".into(), ..entry("2024-01-01", "a.jpg", "old") }];
        save_manifest(&path, &seed).await.unwrap();

        let items = reconcile(&path, entry("2024-01-01", "a.jpg", "X"), KeyMode::Src).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].prompt, "X");
        assert_eq!(items[0].source, "generated");
        assert_eq!(load_manifest(&path).await, items);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        reconcile(&path, entry("2024-01-02", "2024-01-02-1.jpg", "p"), KeyMode::Src).await.unwrap();
        let first = std::fs::read(&path).unwrap();
        reconcile(&path, entry("2024-01-02", "2024-01-02-1.jpg", "p"), KeyMode::Src).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
        assert_eq!(load_manifest(&path).await.len(), 1);
    }

    #[tokio::test]
    async fn keeps_newest_first_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        for (d, s) in [
            ("2024-01-02", "2024-01-02-1.jpg"),
            ("2024-01-10", "2024-01-10-1.jpg"),
            ("2024-01-02", "2024-01-02-2.jpg"),
            ("2023-12-31", "2023-12-31-1.jpg"),
        ] {
            reconcile(&path, entry(d, s, "p"), KeyMode::Src).await.unwrap();
        }
        let srcs: Vec<String> = load_manifest(&path).await.into_iter().map(|e| e.src).collect();
        assert_eq!(srcs, vec!["2024-01-10-1.jpg", "2024-01-02-2.jpg", "2024-01-02-1.jpg", "2023-12-31-1.jpg"]);
    }

    #[test]
    fn date_mode_keeps_one_entry_per_day() {
        let items = merge(vec![entry("2024-03-01", "2024-03-01.jpg", "a")], entry("2024-03-01", "other.jpg", "b"), KeyMode::Date);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].prompt, "b");
    }

    #[tokio::test]
    async fn corrupt_or_missing_manifest_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        assert!(load_manifest(&path).await.is_empty());
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(load_manifest(&path).await.is_empty());

        let items = reconcile(&path, entry("2024-01-01", "a.jpg", "p"), KeyMode::Src).await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn legacy_entries_without_ref_or_source_parse() {
        let items: Vec<ManifestEntry> = serde_json::from_str(
            r#"[{"date":"2023-09-01","src":"2023-09-01.jpg","prompt":"old"}]"#,
        )
        .unwrap();
        assert_eq!(items[0].source, "unknown");
        assert_eq!(items[0].reference, None);
        let out = serde_json::to_value(&items[0]).unwrap();
        assert!(out.get("ref").is_none());
    }
}
