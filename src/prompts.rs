use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use std::path::{Path, PathBuf};

use crate::config::RotationDay;
use crate::error::RunError;

const IMAGE_EXTS: [&str; 3] = [".jpg", ".jpeg", ".png"];

/// Today's pick: one prompt, one reference image, one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub prompt: String,
    pub reference: PathBuf,
    pub date: NaiveDate,
}

impl Selection {
    pub fn date_str(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    pub fn reference_name(&self) -> String {
        file_name(&self.reference)
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// One prompt per line, trimmed, blank lines dropped. Order is the rotation order.
pub async fn load_prompts(path: &Path) -> Result<Vec<String>, RunError> {
    let txt = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunError::Config(format!("missing {}: {e}", path.display())))?;
    Ok(parse_prompts(&txt))
}

pub fn parse_prompts(txt: &str) -> Vec<String> {
    txt.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect()
}

/// Reference images under `dir` whose lowercased name starts with `prefix` and ends
/// with a known image extension, sorted by file name.
pub async fn scan_assets(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, RunError> {
    let mut rd = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| RunError::Config(format!("missing {}/ directory: {e}", dir.display())))?;
    let prefix = prefix.to_lowercase();
    let mut names = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let lower = name.to_lowercase();
        if lower.starts_with(&prefix) && IMAGE_EXTS.iter().any(|ext| lower.ends_with(ext)) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names.into_iter().map(|n| dir.join(n)).collect())
}

/// Calendar date at a fixed offset from UTC. No DST.
pub fn local_today(now: DateTime<Utc>, tz_offset_hours: i32) -> NaiveDate {
    (now + Duration::hours(i64::from(tz_offset_hours))).date_naive()
}

/// `items[day_of_year % len]`, `None` for an empty list.
pub fn rotate<T>(items: &[T], date: NaiveDate) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    items.get(date.ordinal() as usize % items.len())
}

pub fn select(
    prompts: &[String],
    assets: &[PathBuf],
    now: DateTime<Utc>,
    tz_offset_hours: i32,
) -> Result<Selection, RunError> {
    let date = local_today(now, tz_offset_hours);
    let prompt = rotate(prompts, date)
        .ok_or_else(|| RunError::Config("prompt list is empty".into()))?;
    let reference = rotate(assets, date).ok_or_else(|| {
        RunError::Config("no reference images found (expected jay1.jpg, jay2.jpg, ...)".into())
    })?;
    Ok(Selection { prompt: prompt.clone(), reference: reference.clone(), date })
}

/// Recomputes the asset rotation for the fallback copy, independently of the selection.
pub fn fallback_asset(
    assets: &[PathBuf],
    now: DateTime<Utc>,
    tz_offset_hours: i32,
    rotation: RotationDay,
) -> Option<PathBuf> {
    let date = match rotation {
        RotationDay::Local => local_today(now, tz_offset_hours),
        RotationDay::Utc => now.date_naive(),
    };
    rotate(assets, date).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{testing::FixedClock, Clock};

    fn prompts(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    fn jays() -> Vec<PathBuf> {
        ["jay1.jpg", "jay2.jpg", "jay3.jpg"].iter().map(|n| Path::new("assets").join(n)).collect()
    }

    #[test]
    fn day_five_picks_third_prompt_and_asset() {
        let now = FixedClock::at("2024-01-05T12:00:00Z").now();
        let sel = select(&prompts(&["A", "B", "C"]), &jays(), now, -4).unwrap();
        assert_eq!(sel.prompt, "C");
        assert_eq!(sel.reference_name(), "jay3.jpg");
        assert_eq!(sel.date_str(), "2024-01-05");
    }

    #[test]
    fn equal_day_mod_n_gives_same_prompt() {
        let ps = prompts(&["a", "b", "c", "d"]);
        // ordinals 10 and 14 differ by 4
        let d10 = FixedClock::at("2024-01-10T12:00:00Z").now();
        let d14 = FixedClock::at("2024-01-14T12:00:00Z").now();
        let s10 = select(&ps, &jays(), d10, 0).unwrap();
        let s14 = select(&ps, &jays(), d14, 0).unwrap();
        assert_eq!(s10.prompt, s14.prompt);
    }

    #[test]
    fn reference_index_ignores_prompt_count() {
        let now = FixedClock::at("2024-02-01T12:00:00Z").now(); // ordinal 32
        for n in 1..=7 {
            let ps: Vec<String> = (0..n).map(|i| format!("p{i}")).collect();
            let sel = select(&ps, &jays(), now, 0).unwrap();
            assert_eq!(sel.reference, jays()[32 % 3]);
        }
    }

    #[test]
    fn offset_moves_the_date_back() {
        let now = FixedClock::at("2024-03-01T02:30:00Z").now();
        assert_eq!(local_today(now, -4).to_string(), "2024-02-29");
        assert_eq!(local_today(now, 0).to_string(), "2024-03-01");
    }

    #[test]
    fn empty_inputs_are_config_errors() {
        let now = FixedClock::at("2024-01-05T12:00:00Z").now();
        assert!(matches!(select(&[], &jays(), now, 0), Err(RunError::Config(_))));
        assert!(matches!(select(&prompts(&["A"]), &[], now, 0), Err(RunError::Config(_))));
    }

    #[test]
    fn fallback_rotation_local_matches_reference() {
        // 02:00 UTC on Jan 6 is still Jan 5 at -4h.
        let now = FixedClock::at("2024-01-06T02:00:00Z").now();
        let sel = select(&prompts(&["A"]), &jays(), now, -4).unwrap();
        let fb = fallback_asset(&jays(), now, -4, RotationDay::Local).unwrap();
        assert_eq!(fb, sel.reference);
        assert_eq!(file_name(&fb), "jay3.jpg");
    }

    #[test]
    fn fallback_rotation_utc_uses_raw_day() {
        let now = FixedClock::at("2024-01-06T02:00:00Z").now();
        let fb = fallback_asset(&jays(), now, -4, RotationDay::Utc).unwrap();
        assert_eq!(file_name(&fb), "jay1.jpg");
        assert!(fallback_asset(&[], now, -4, RotationDay::Utc).is_none());
    }

    #[test]
    fn parse_prompts_skips_blank_lines() {
        assert_eq!(parse_prompts("  A \n\n\tB\n   \nC"), prompts(&["A", "B", "C"]));
    }

    #[tokio::test]
    async fn scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["jay3.jpg", "Jay1.PNG", "jay2.jpeg", "other.jpg", "jay4.gif", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let found: Vec<String> = scan_assets(dir.path(), "jay")
            .await
            .unwrap()
            .iter()
            .map(|p| file_name(p))
            .collect();
        assert_eq!(found, vec!["Jay1.PNG", "jay2.jpeg", "jay3.jpg"]);
    }

    #[tokio::test]
    async fn missing_inputs_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_assets(&dir.path().join("nope"), "jay").await.unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
        let err = load_prompts(&dir.path().join("prompts.txt")).await.unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
    }
}
