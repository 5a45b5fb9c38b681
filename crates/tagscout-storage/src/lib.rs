//! Tabular state files for the tag registry and media inventory, written atomically.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tagscout_core::{MediaInventory, MediaRecord, TagRegistry};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tagscout-storage";

pub const INVENTORY_HEADER: [&str; 2] = ["identifier", "popularity_count"];
pub const TAGS_HEADER: [&str; 1] = ["tag"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsvError {
    #[error("unterminated quoted field starting on line {line}")]
    UnterminatedQuote { line: usize },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("{}: {}", path.display(), source)]
    Csv {
        path: PathBuf,
        #[source]
        source: CsvError,
    },
    #[error("{}:{}: {}", path.display(), line, reason)]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// One parsed row plus the line it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvRow {
    pub line: usize,
    pub fields: Vec<String>,
}

pub fn encode_csv_row<S: AsRef<str>>(fields: &[S]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let field = field.as_ref();
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
    out
}

/// Parse comma-separated text with RFC 4180 quoting. Blank lines are skipped.
pub fn parse_csv(text: &str) -> Result<Vec<CsvRow>, CsvError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut rows = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted_row = false;
    let mut line = 1usize;
    let mut row_line = 1usize;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(ch);
                }
                _ => field.push(ch),
            }
            continue;
        }

        match ch {
            '"' => {
                in_quotes = true;
                quoted_row = true;
            }
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                fields.push(std::mem::take(&mut field));
                push_row(&mut rows, std::mem::take(&mut fields), row_line, quoted_row);
                quoted_row = false;
                line += 1;
                row_line = line;
            }
            _ => field.push(ch),
        }
    }

    if in_quotes {
        return Err(CsvError::UnterminatedQuote { line: row_line });
    }
    if !field.is_empty() || !fields.is_empty() || quoted_row {
        fields.push(field);
        push_row(&mut rows, fields, row_line, quoted_row);
    }
    Ok(rows)
}

fn push_row(rows: &mut Vec<CsvRow>, fields: Vec<String>, line: usize, quoted: bool) {
    let blank = !quoted && fields.len() == 1 && fields[0].is_empty();
    if !blank {
        rows.push(CsvRow { line, fields });
    }
}

fn parse_popularity(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(count) = raw.parse::<u64>() {
        return Some(count);
    }
    // Older exports wrote counts as floats ("12.0").
    let value = raw.parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        Some(value as u64)
    } else {
        None
    }
}

/// Owns the pair of state files a single discovery loop checkpoints into.
#[derive(Debug, Clone)]
pub struct StateStore {
    tags_path: PathBuf,
    inventory_path: PathBuf,
}

impl StateStore {
    pub fn new(tags_path: impl Into<PathBuf>, inventory_path: impl Into<PathBuf>) -> Self {
        Self {
            tags_path: tags_path.into(),
            inventory_path: inventory_path.into(),
        }
    }

    pub fn tags_path(&self) -> &Path {
        &self.tags_path
    }

    pub fn inventory_path(&self) -> &Path {
        &self.inventory_path
    }

    /// Missing file loads as an empty registry. The first row is a header whatever its name.
    pub async fn load_tags(&self) -> anyhow::Result<TagRegistry> {
        let Some(rows) = read_rows(&self.tags_path).await? else {
            return Ok(TagRegistry::new());
        };
        let mut registry = TagRegistry::new();
        for row in rows.into_iter().skip(1) {
            if row.fields.len() != 1 {
                return Err(StateError::Malformed {
                    path: self.tags_path.clone(),
                    line: row.line,
                    reason: format!("expected 1 column, found {}", row.fields.len()),
                }
                .into());
            }
            registry.insert(&row.fields[0]);
        }
        debug!(path = %self.tags_path.display(), tags = registry.len(), "loaded tag registry");
        Ok(registry)
    }

    /// Missing file loads as an empty inventory. Repeated identifiers collapse, last row wins.
    pub async fn load_inventory(&self) -> anyhow::Result<MediaInventory> {
        let Some(rows) = read_rows(&self.inventory_path).await? else {
            return Ok(MediaInventory::new());
        };
        let mut records = Vec::with_capacity(rows.len().saturating_sub(1));
        for row in rows.into_iter().skip(1) {
            let malformed = |reason: String| StateError::Malformed {
                path: self.inventory_path.clone(),
                line: row.line,
                reason,
            };
            let [identifier, count] = row.fields.as_slice() else {
                return Err(malformed(format!(
                    "expected 2 columns, found {}",
                    row.fields.len()
                ))
                .into());
            };
            let popularity_count = parse_popularity(count)
                .ok_or_else(|| malformed(format!("invalid popularity count {count:?}")))?;
            records.push(MediaRecord::new(identifier.clone(), popularity_count));
        }
        let inventory = MediaInventory::from_records(records);
        debug!(
            path = %self.inventory_path.display(),
            records = inventory.len(),
            "loaded media inventory"
        );
        Ok(inventory)
    }

    pub async fn save_tags(&self, registry: &TagRegistry) -> anyhow::Result<()> {
        let mut body = encode_csv_row(&TAGS_HEADER);
        for tag in registry.iter() {
            body.push_str(&encode_csv_row(&[tag]));
        }
        write_atomically(&self.tags_path, body.as_bytes()).await
    }

    pub async fn save_inventory(&self, inventory: &MediaInventory) -> anyhow::Result<()> {
        let mut body = encode_csv_row(&INVENTORY_HEADER);
        for record in inventory.iter() {
            let count = record.popularity_count.to_string();
            body.push_str(&encode_csv_row(&[record.identifier.as_str(), count.as_str()]));
        }
        write_atomically(&self.inventory_path, body.as_bytes()).await
    }
}

async fn read_rows(path: &Path) -> anyhow::Result<Option<Vec<CsvRow>>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading state file {}", path.display()))
        }
    };
    let rows = parse_csv(&text).map_err(|source| StateError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(rows))
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so a crash never
/// leaves a half-written state file behind.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating state directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp state file {}", temp_path.display()))?;
        fs::rename(&temp_path, path).await.with_context(|| {
            format!(
                "atomically renaming temp state file {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> StateStore {
        StateStore::new(dir.join("tags.csv"), dir.join("image_data.csv"))
    }

    #[test]
    fn csv_quoting_survives_commas_quotes_and_newlines() {
        let row = encode_csv_row(&["plain", "a,b", "say \"hi\"", "two\nlines"]);
        assert_eq!(row, "plain,\"a,b\",\"say \"\"hi\"\"\",\"two\nlines\"\n");
        let parsed = parse_csv(&row).expect("parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].fields, ["plain", "a,b", "say \"hi\"", "two\nlines"]);
    }

    #[test]
    fn csv_parser_tracks_lines_and_skips_blank_lines() {
        let parsed = parse_csv("tag\r\nbike\r\n\r\nroad").expect("parse");
        let lines = parsed.iter().map(|r| r.line).collect::<Vec<_>>();
        assert_eq!(lines, [1, 2, 4]);
        assert_eq!(parsed[2].fields, ["road"]);
    }

    #[test]
    fn csv_parser_keeps_quoted_empty_field() {
        let parsed = parse_csv("tag\n\"\"\n").expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].fields, [""]);
    }

    #[test]
    fn csv_parser_rejects_unterminated_quote() {
        assert_eq!(
            parse_csv("tag\n\"open\n"),
            Err(CsvError::UnterminatedQuote { line: 2 })
        );
    }

    #[tokio::test]
    async fn missing_state_files_load_empty() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        assert!(store.load_tags().await.expect("tags").is_empty());
        assert!(store.load_inventory().await.expect("inventory").is_empty());
    }

    #[tokio::test]
    async fn state_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let registry = TagRegistry::from_tags(["bike", "road, gravel", "\"quoted\""]);
        let inventory = MediaInventory::from_records([
            MediaRecord::new("x123", 42),
            MediaRecord::new("y456", 0),
        ]);

        store.save_tags(&registry).await.expect("save tags");
        store.save_inventory(&inventory).await.expect("save inventory");

        assert_eq!(store.load_tags().await.expect("load tags"), registry);
        assert_eq!(store.load_inventory().await.expect("load inventory"), inventory);

        let written = std::fs::read_to_string(store.inventory_path()).expect("read");
        assert!(written.starts_with("identifier,popularity_count\n"));
    }

    #[tokio::test]
    async fn save_overwrites_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        store
            .save_tags(&TagRegistry::from_tags(["a", "b", "c"]))
            .await
            .expect("first save");
        store
            .save_tags(&TagRegistry::from_tags(["z"]))
            .await
            .expect("second save");

        let loaded = store.load_tags().await.expect("load");
        assert_eq!(loaded.as_slice(), ["z"]);

        let leftovers = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn legacy_headers_and_float_counts_load() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        std::fs::write(store.tags_path(), "cycling_tags\ncycling\nbike\ncycling\n").expect("write");
        std::fs::write(store.inventory_path(), "image,likes\nx123,12.0\ny456,3\nx123,15\n")
            .expect("write");

        let tags = store.load_tags().await.expect("tags");
        assert_eq!(tags.as_slice(), ["cycling", "bike"]);

        let inventory = store.load_inventory().await.expect("inventory");
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory.get("x123").map(|r| r.popularity_count), Some(15));
        assert_eq!(inventory.get("y456").map(|r| r.popularity_count), Some(3));
    }

    #[tokio::test]
    async fn malformed_inventory_row_reports_file_and_line() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        std::fs::write(store.inventory_path(), "identifier,popularity_count\nx123,lots\n")
            .expect("write");

        let err = store.load_inventory().await.expect_err("malformed");
        let message = err.to_string();
        assert!(message.contains("image_data.csv:2"), "{message}");
        assert!(message.contains("lots"), "{message}");
    }
}
