//! Remote object keys.
//!
//! Artifacts land under `[prefix/]YYYY-MM-DD/<file name>`. The day comes
//! from the parent directory when it is a daily capture folder (optionally
//! `YYYY-MM-DD_<tag>`), otherwise from the capture time.

use chrono::{DateTime, NaiveDate, Utc};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKey {
    pub key: String,
    /// Session tag taken from a `YYYY-MM-DD_<tag>` folder.
    pub tag: Option<String>,
}

pub fn remote_key_for(path: &Path, prefix: Option<&str>, captured_at: DateTime<Utc>) -> RemoteKey {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let folder = path
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned());
    let (day, tag) = folder
        .as_deref()
        .and_then(parse_day_folder)
        .unwrap_or_else(|| (captured_at.date_naive(), None));

    let mut key = String::new();
    if let Some(prefix) = prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        key.push_str(prefix);
        key.push('/');
    }
    key.push_str(&day.format("%Y-%m-%d").to_string());
    key.push('/');
    key.push_str(&file_name);

    RemoteKey { key, tag }
}

fn parse_day_folder(name: &str) -> Option<(NaiveDate, Option<String>)> {
    let date_part = name.get(..10)?;
    let day = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    match &name[10..] {
        "" => Some((day, None)),
        rest => {
            let tag = rest.strip_prefix('_')?;
            (!tag.is_empty()).then(|| (day, Some(tag.to_string())))
        }
    }
}
