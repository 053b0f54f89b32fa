//! Core domain model for the New Criminal Filings tracker.
//!
//! Scraped filings arrive as loose label/value mappings whose key sets vary
//! by page and scraper version, so the canonical representation is a dynamic
//! [`Table`]: an ordered list of column names plus rows of nullable string
//! cells. Date columns are normalized to ISO form on the way in so that
//! chronological and lexical order agree.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ncf-core";

/// Column carrying the filing's calendar date.
pub const FILING_DATE: &str = "filing_date";
/// Column carrying the docket number, the join key between filings and
/// enrichment records. Not unique across re-filings of the same case.
pub const DOCKET_NUMBER: &str = "docket_number";
/// Column carrying the defendant's name as listed by the court.
pub const DEFENDANT_NAME: &str = "defendant_name";

/// One scraped or fetched record before it enters a [`Table`]: raw label →
/// raw value, no null normalization applied yet.
pub type RawRecord = BTreeMap<String, String>;

/// Schema drift: a column or value does not look the way the declared
/// schema says it should. Missing join keys and unparseable dates are
/// fatal; callers may downgrade missing optional columns to a warning.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("required column `{0}` is missing")]
    MissingColumn(String),
    #[error("column `{column}` holds unparseable date `{value}`")]
    BadDate { column: String, value: String },
    #[error("join key `{column}` is not unique: `{value}` appears more than once")]
    NonUniqueKey { column: String, value: String },
    #[error("column `{0}` exists on both sides of the join")]
    ColumnCollision(String),
}

/// Normalize a scraped label into a snake_case column name:
/// `"Filing Date"` → `"filing_date"`.
pub fn normalize_label(label: &str) -> String {
    label
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Null-normalize raw cell text. The court site emits the literal string
/// `"None"` for absent values; empty and whitespace-only cells mean the
/// same thing.
pub fn normalize_cell(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "None" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Date forms seen across scraper versions: canonical ISO, ISO with the
/// midnight suffix older exports wrote, and the US form the site renders.
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y-%m-%d %H:%M:%S", "%m/%d/%Y"];

/// Strictly parse a date cell. Anything outside the known forms is schema
/// drift, not a value to be compared as text.
pub fn parse_filing_date(column: &str, value: &str) -> Result<NaiveDate, SchemaError> {
    let value = value.trim();
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, format) {
            return Ok(parsed);
        }
    }
    Err(SchemaError::BadDate {
        column: column.to_string(),
        value: value.to_string(),
    })
}

/// How two rows are judged duplicates during an archive merge.
#[derive(Debug, Clone, Copy)]
pub enum DedupKey<'a> {
    /// Identical across every present column.
    FullRow,
    /// Identical across a declared subset of columns (the "filing columns"
    /// produced at extraction time), so enrichment columns merged into the
    /// same table do not defeat deduplication. Columns a row does not have
    /// compare as null.
    Columns(&'a [String]),
}

/// Dynamic table: ordered column names plus rows of nullable cells.
///
/// Missing values are `None`, never the literal string "None"; that marker
/// is normalized away at the boundaries. Cells are otherwise untyped; date
/// columns are canonicalized via [`Table::normalize_date_column`] so that
/// sorting on them is chronological.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from raw records, unioning key sets in first-seen
    /// order and null-normalizing every cell. Key sets may vary across
    /// records; keys a record lacks become null cells.
    pub fn from_records(records: &[RawRecord]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|column| record.get(column).and_then(|raw| normalize_cell(raw)))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of a column that must exist; absence is schema drift.
    pub fn require_column(&self, name: &str) -> Result<usize, SchemaError> {
        self.column_index(name)
            .ok_or_else(|| SchemaError::MissingColumn(name.to_string()))
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let ix = self.column_index(column)?;
        self.rows.get(row)?.get(ix)?.as_deref()
    }

    /// Append a row already aligned to this table's columns.
    pub fn push_row(&mut self, row: Vec<Option<String>>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Non-null values of one column, row order preserved.
    pub fn column_values(&self, column: &str) -> Result<Vec<&str>, SchemaError> {
        let ix = self.require_column(column)?;
        Ok(self.rows.iter().filter_map(|row| row[ix].as_deref()).collect())
    }

    /// Concatenate another table onto this one, keeping self's rows first
    /// and unioning columns by name. Cells a side lacks become null.
    pub fn concat(&mut self, other: Table) {
        for column in &other.columns {
            if self.column_index(column).is_none() {
                self.columns.push(column.clone());
                for row in &mut self.rows {
                    row.push(None);
                }
            }
        }
        let mapping: Vec<Option<usize>> = self
            .columns
            .iter()
            .map(|column| other.column_index(column))
            .collect();
        for other_row in other.rows {
            let row = mapping
                .iter()
                .map(|source| source.and_then(|ix| other_row.get(ix).cloned().flatten()))
                .collect();
            self.rows.push(row);
        }
    }

    /// Remove duplicate rows, keeping the first occurrence. Returns how
    /// many rows were dropped.
    pub fn dedup(&mut self, key: DedupKey<'_>) -> usize {
        let before = self.rows.len();
        let key_indices: Option<Vec<Option<usize>>> = match key {
            DedupKey::FullRow => None,
            DedupKey::Columns(columns) => Some(
                columns
                    .iter()
                    .map(|column| self.column_index(column))
                    .collect(),
            ),
        };
        let mut seen: HashSet<Vec<Option<String>>> = HashSet::new();
        let rows = std::mem::take(&mut self.rows);
        for row in rows {
            let key_cells: Vec<Option<String>> = match &key_indices {
                None => row.clone(),
                Some(indices) => indices
                    .iter()
                    .map(|ix| ix.and_then(|i| row.get(i).cloned().flatten()))
                    .collect(),
            };
            if seen.insert(key_cells) {
                self.rows.push(row);
            }
        }
        before - self.rows.len()
    }

    /// Stable ascending sort by the given columns. Null cells sort last;
    /// sort columns the table lacks are skipped. Date columns must already
    /// be in canonical ISO form so this lexical comparison is
    /// chronological.
    pub fn sort_by_columns(&mut self, sort_columns: &[String]) {
        let indices: Vec<usize> = sort_columns
            .iter()
            .filter_map(|column| self.column_index(column))
            .collect();
        if indices.is_empty() {
            return;
        }
        self.rows.sort_by(|a, b| {
            for &ix in &indices {
                let ordering = match (&a[ix], &b[ix]) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (Some(x), Some(y)) => x.cmp(y),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    /// Re-parse every value in a date column and rewrite it canonically.
    /// Archives written by older scraper versions carried `06/01/2021` or
    /// `2021-06-01 00:00:00`; left as text those sort lexically, not
    /// chronologically. Returns the number of cells rewritten. A table
    /// without the column is left untouched; callers decide whether that
    /// is fatal.
    pub fn normalize_date_column(&mut self, column: &str) -> Result<usize, SchemaError> {
        let Some(ix) = self.column_index(column) else {
            return Ok(0);
        };
        let mut rewritten = 0;
        for row in &mut self.rows {
            if let Some(value) = &row[ix] {
                let canonical = parse_filing_date(column, value)?
                    .format("%Y-%m-%d")
                    .to_string();
                if *value != canonical {
                    row[ix] = Some(canonical);
                    rewritten += 1;
                }
            }
        }
        Ok(rewritten)
    }

    /// Project to the named columns, in the order given. A requested column
    /// the table lacks becomes an all-null column.
    pub fn project(&self, columns: &[String]) -> Table {
        let indices: Vec<Option<usize>> = columns
            .iter()
            .map(|column| self.column_index(column))
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|ix| ix.and_then(|i| row.get(i).cloned().flatten()))
                    .collect()
            })
            .collect();
        Table {
            columns: columns.to_vec(),
            rows,
        }
    }
}

/// Left outer join of `left` to `right` on `key`, validated many-to-one:
/// the right side must be unique on the key or the join refuses to run.
/// Output columns are the left columns followed by the right columns minus
/// the key; left rows without a match keep null cells on the right side.
pub fn join_many_to_one(left: &Table, right: &Table, key: &str) -> Result<Table, SchemaError> {
    let left_key = left.require_column(key)?;
    let right_key = right.require_column(key)?;

    let mut right_columns: Vec<(usize, &String)> = Vec::new();
    for (ix, column) in right.columns.iter().enumerate() {
        if ix == right_key {
            continue;
        }
        if left.column_index(column).is_some() {
            return Err(SchemaError::ColumnCollision(column.clone()));
        }
        right_columns.push((ix, column));
    }

    let mut by_key: HashMap<&str, &Vec<Option<String>>> = HashMap::new();
    for row in &right.rows {
        if let Some(value) = row[right_key].as_deref() {
            if by_key.insert(value, row).is_some() {
                return Err(SchemaError::NonUniqueKey {
                    column: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    let mut columns = left.columns.clone();
    columns.extend(right_columns.iter().map(|(_, column)| (*column).clone()));

    let mut joined = Table::new(columns);
    for row in &left.rows {
        let mut out = row.clone();
        let matched = row[left_key].as_deref().and_then(|value| by_key.get(value));
        for (ix, _) in &right_columns {
            out.push(matched.and_then(|m| m[*ix].clone()));
        }
        joined.push_row(out);
    }
    Ok(joined)
}
