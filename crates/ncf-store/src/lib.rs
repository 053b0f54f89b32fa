//! Archive persistence for filings data: a small CSV codec, atomic
//! write-then-rename saves, and the run lock that serializes writers.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use ncf_core::{normalize_cell, SchemaError, Table};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "ncf-store";

/// Relative archive locations under the data directory.
pub const LATEST_BATCH_PATH: &str = "raw/latest-data.csv";
pub const FILINGS_PATH: &str = "processed/filings-historical.csv";
pub const ENRICHMENT_PATH: &str = "processed/enrichment-historical.csv";

const LOCK_FILE: &str = ".ncf-update.lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("renaming {from} into place: {source}")]
    Rename {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("another update run holds the lock at {path}")]
    Locked { path: PathBuf },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/* ---------------- CSV codec ---------------- */

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

fn write_record<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    let mut first = true;
    for cell in cells {
        if !first {
            out.push(',');
        }
        first = false;
        if needs_quotes(cell) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push('\n');
}

/// Render a table as CSV text: header first, null cells as empty fields,
/// quoting only where the content demands it.
pub fn table_to_csv(table: &Table) -> String {
    let mut out = String::new();
    write_record(&mut out, table.columns().iter().map(String::as_str));
    for row in table.rows() {
        write_record(&mut out, row.iter().map(|cell| cell.as_deref().unwrap_or("")));
    }
    out
}

/// Minimal CSV record parser, quote and CRLF tolerant.
fn parse_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut field = String::new();
    let mut record = Vec::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes {
                    if matches!(chars.peek(), Some('"')) {
                        chars.next(); // double-quote escape
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                } else {
                    in_quotes = true;
                }
            }
            ',' if !in_quotes => {
                record.push(std::mem::take(&mut field));
            }
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(ch),
        }
    }

    // Flush a trailing record even if the final newline is missing.
    record.push(field);
    if !(record.len() == 1 && record[0].is_empty()) {
        records.push(record);
    }

    records
}

/// Decode CSV text into a table. The first record is the header; data
/// records shorter than the header are padded with nulls, wider ones are
/// refused. Cells are null-normalized, so empty fields and legacy `"None"`
/// markers both come back as nulls.
pub fn table_from_csv(path: &Path, text: &str) -> Result<Table, StoreError> {
    let mut records = parse_records(text).into_iter();
    let Some(header) = records.next() else {
        return Err(StoreError::Malformed {
            path: path.to_path_buf(),
            reason: "no header record".to_string(),
        });
    };
    let width = header.len();
    let mut table = Table::new(header);
    for (ix, record) in records.enumerate() {
        if record.len() > width {
            return Err(StoreError::Malformed {
                path: path.to_path_buf(),
                reason: format!(
                    "record {} has {} fields, header has {}",
                    ix + 2,
                    record.len(),
                    width
                ),
            });
        }
        let mut row: Vec<Option<String>> =
            record.iter().map(|cell| normalize_cell(cell)).collect();
        row.resize(width, None);
        table.push_row(row);
    }
    Ok(table)
}

/* ---------------- Archives ---------------- */

/// The archives the pipeline reads and writes, addressed by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Archive {
    /// Most recent scraped batch, kept verbatim for resume and debugging.
    LatestBatch,
    /// Cumulative deduplicated filings table.
    Filings,
    /// Cumulative enrichment table, one record per docket number.
    Enrichment,
}

impl Archive {
    pub fn relative_path(self) -> &'static str {
        match self {
            Archive::LatestBatch => LATEST_BATCH_PATH,
            Archive::Filings => FILINGS_PATH,
            Archive::Enrichment => ENRICHMENT_PATH,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Archive::LatestBatch => "latest-batch",
            Archive::Filings => "filings",
            Archive::Enrichment => "enrichment",
        }
    }
}

/// Checksum record for one file written during a run.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveManifestEntry {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write a table as CSV to `path` via a temp file in the target directory
/// followed by a rename. Readers never observe a half-written archive.
pub async fn write_table_atomic(path: &Path, table: &Table) -> Result<ArchiveManifestEntry, StoreError> {
    let bytes = table_to_csv(table).into_bytes();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive.csv".to_string());
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    fs::write(&temp_path, &bytes).await.map_err(|source| StoreError::Write {
        path: temp_path.clone(),
        source,
    })?;
    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Rename {
            from: temp_path,
            source,
        });
    }

    Ok(ArchiveManifestEntry {
        name: file_name,
        path: path.display().to_string(),
        sha256: ArchiveStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, archive: Archive) -> PathBuf {
        self.root.join(archive.relative_path())
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Load an archive if it exists, rewriting the named date columns to
    /// canonical ISO form. A date that parses as none of the known forms
    /// fails the load rather than passing through as text.
    pub async fn load(
        &self,
        archive: Archive,
        date_columns: &[String],
    ) -> Result<Option<Table>, StoreError> {
        let path = self.path_of(archive);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        let mut table = table_from_csv(&path, &text)?;
        for column in date_columns {
            let rewritten = table.normalize_date_column(column)?;
            if rewritten > 0 {
                debug!(
                    archive = archive.name(),
                    column = column.as_str(),
                    rewritten,
                    "canonicalized date column on load"
                );
            }
        }
        Ok(Some(table))
    }

    /// Persist an archive atomically and return its checksum entry.
    pub async fn save(&self, archive: Archive, table: &Table) -> Result<ArchiveManifestEntry, StoreError> {
        let path = self.path_of(archive);
        let mut entry = write_table_atomic(&path, table).await?;
        entry.name = archive.name().to_string();
        debug!(archive = archive.name(), rows = table.len(), sha256 = entry.sha256.as_str(), "saved archive");
        Ok(entry)
    }
}

/* ---------------- Run lock ---------------- */

/// Exclusive-writer lock for a data directory, backed by a lock file
/// created with `create_new`. Dropping the guard removes the file; a stale
/// file left by a crashed run must be removed by hand.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock for `data_dir`, failing fast if another run holds it.
    pub fn acquire(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(|source| StoreError::Write {
            path: data_dir.to_path_buf(),
            source,
        })?;
        let path = data_dir.join(LOCK_FILE);
        let contents = format!(
            "pid={}\nacquired_at={}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        match std::fs::OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(mut file) => {
                file.write_all(contents.as_bytes())
                    .map_err(|source| StoreError::Write {
                        path: path.clone(),
                        source,
                    })?;
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::Locked { path })
            }
            Err(source) => Err(StoreError::Write { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
