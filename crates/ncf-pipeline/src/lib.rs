//! Update pipeline for the filings tracker.
//!
//! One run walks a fixed sequence of stages: scrape the court listing for
//! the rolling window, merge the batch into the historical archive, detect
//! which dockets still lack enrichment, fetch those from the docket portal,
//! and reconcile the results into the enrichment archive. Every stage that
//! changes data persists through [`ncf_store`] so a crash leaves either the
//! old file or the new one, never a torn write.
//!
//! The stage functions ([`merge_historical`], [`detect_gaps`],
//! [`merge_enrichment`]) are pure and separately testable; [`Pipeline`]
//! strings them together over a [`FilingSource`] and a [`DocketLookup`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use ncf_core::{
    join_many_to_one, DedupKey, SchemaError, Table, DEFENDANT_NAME, DOCKET_NUMBER, FILING_DATE,
};
use ncf_portal::{DocketLookup, PortalClient, PortalConfig, PortalError};
use ncf_scrape::{rolling_window, CourtsSource, FilingSource, ScrapeError};
use ncf_store::{Archive, ArchiveManifestEntry, ArchiveStore, RunLock, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ncf-pipeline";

/// Errors surfaced by a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed for {context}: {source}")]
    Extraction {
        context: String,
        #[source]
        source: ScrapeError,
    },

    /// The scraped batch is structurally unusable: a required column is
    /// absent or a date cell failed to parse.
    #[error("scraped batch rejected: {0}")]
    BatchSchema(#[source] SchemaError),

    /// The enrichment archive would end up holding a docket number more
    /// than once. This means the gap set and the archive disagreed, which
    /// is a logic error upstream, so the run stops instead of guessing
    /// which record to keep.
    #[error("merge invariant violated: {0}")]
    MergeInvariant(String),

    #[error("enrichment fetch failed: {0}")]
    Fetch(#[from] PortalError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("writing run report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("reading config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("archive not found: {0}")]
    ArchiveMissing(String),
}

impl PipelineError {
    /// Stage label for log lines, so a failed run names where it died.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Extraction { .. } | PipelineError::BatchSchema(_) => "extract",
            PipelineError::MergeInvariant(_) => "reconcile",
            PipelineError::Fetch(_) => "fetch",
            PipelineError::Schema(_) => "load",
            PipelineError::Store(_) | PipelineError::Report(_) => "persist",
            PipelineError::ConfigRead { .. }
            | PipelineError::ConfigParse { .. }
            | PipelineError::Config(_) => "config",
            PipelineError::ArchiveMissing(_) => "resume",
        }
    }
}

/// Progress marker for one update run. Ordered so resume logic can ask
/// "has this stage already happened" instead of probing which files exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    NotStarted,
    Extracted,
    Merged,
    GapDetected,
    Fetched,
    Reconciled,
}

/// Duplicate-detection policy for the historical merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    /// Rows identical across every column are duplicates.
    FullRow,
    /// Rows identical across the declared filing columns are duplicates,
    /// whatever their other cells hold.
    FilingColumns,
}

/// Where enrichment data lives relative to the filings archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnrichmentMode {
    /// Enrichment stays in its own archive. The joined view is derived on
    /// demand and never persisted as a source of truth.
    SeparateArchive,
    /// The joined view is persisted back over the filings archive, so
    /// enrichment columns ride along in the one table.
    MergedTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub mode: EnrichmentMode,
    /// Column whose null cells mark a filing as not yet enriched in
    /// merged-table deployments.
    pub identifier_column: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            mode: EnrichmentMode::SeparateArchive,
            identifier_column: "otn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub base_url: String,
    /// Rolling window width in days. Filings appear on the listing with a
    /// lag, so each run re-reads the last week and change.
    pub window_days: u32,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.courts.phila.gov/NewCriminalFilings/date/default.aspx"
                .to_string(),
            window_days: 8,
            timeout_secs: 20,
            user_agent: "ncf-tracker/0.1".to_string(),
        }
    }
}

/// Tracker configuration, loaded from YAML with every field defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Canonical archive order.
    pub sort_columns: Vec<String>,
    /// Columns the scraper produces. Doubles as the subset dedup key and
    /// as the contamination filter for portal results.
    pub filing_columns: Vec<String>,
    /// Columns parsed as dates on every load and kept in ISO form.
    pub date_columns: Vec<String>,
    pub dedup: DedupPolicy,
    pub enrichment: EnrichmentConfig,
    pub scrape: ScrapeConfig,
    pub portal: PortalConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sort_columns: vec![
                FILING_DATE.to_string(),
                DOCKET_NUMBER.to_string(),
                DEFENDANT_NAME.to_string(),
            ],
            filing_columns: [
                FILING_DATE,
                DOCKET_NUMBER,
                DEFENDANT_NAME,
                "address",
                "age",
                "charge",
                "represented",
                "bail_status",
                "bail_amount",
                "bail_date",
                "in_custody",
            ]
            .iter()
            .map(|column| column.to_string())
            .collect(),
            date_columns: vec![FILING_DATE.to_string()],
            dedup: DedupPolicy::FullRow,
            enrichment: EnrichmentConfig::default(),
            scrape: ScrapeConfig::default(),
            portal: PortalConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a YAML config file. Missing fields fall back to defaults, so a
    /// deployment only writes down what it overrides.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&text).map_err(|source| PipelineError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work. Merged-table deployments
    /// re-persist enrichment cells into the filings archive, so a full-row
    /// dedup would treat an enriched row and its fresh re-scrape as
    /// distinct forever and the archive would grow without bound.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.enrichment.mode == EnrichmentMode::MergedTable
            && self.dedup == DedupPolicy::FullRow
        {
            return Err(PipelineError::Config(
                "merged-table enrichment requires the filing-columns dedup policy".to_string(),
            ));
        }
        if self.sort_columns.is_empty() {
            return Err(PipelineError::Config(
                "sort_columns must not be empty".to_string(),
            ));
        }
        if !self.filing_columns.iter().any(|c| c == DOCKET_NUMBER) {
            return Err(PipelineError::Config(format!(
                "filing_columns must include `{DOCKET_NUMBER}`"
            )));
        }
        Ok(())
    }

    pub fn dedup_key(&self) -> DedupKey<'_> {
        match self.dedup {
            DedupPolicy::FullRow => DedupKey::FullRow,
            DedupPolicy::FilingColumns => DedupKey::Columns(&self.filing_columns),
        }
    }
}

/// Outcome of the historical merge.
#[derive(Debug)]
pub struct MergeOutcome {
    pub table: Table,
    pub duplicates_removed: usize,
}

/// Merge a scraped batch into the historical archive: new rows first, drop
/// duplicates keeping the first occurrence, then apply the canonical sort.
/// The dedup runs even when no archive exists yet, so a batch that read the
/// same listing page twice cannot seed the archive with duplicates.
pub fn merge_historical(
    new_batch: Table,
    existing: Option<Table>,
    key: DedupKey<'_>,
    sort_columns: &[String],
) -> MergeOutcome {
    let mut combined = new_batch;
    if let Some(existing) = existing {
        combined.concat(existing);
    }
    let duplicates_removed = combined.dedup(key);
    combined.sort_by_columns(sort_columns);
    MergeOutcome {
        table: combined,
        duplicates_removed,
    }
}

/// Dockets in the filings table with no record in the enrichment archive.
/// Order-stable and deduplicated. A missing docket column in the filings
/// table is fatal: without the join key nothing downstream can work.
pub fn gaps_by_archive(
    filings: &Table,
    enrichment: Option<&Table>,
) -> Result<Vec<String>, PipelineError> {
    let filed = filings.column_values(DOCKET_NUMBER)?;
    let enriched: HashSet<&str> = match enrichment {
        Some(table) => table.column_values(DOCKET_NUMBER)?.into_iter().collect(),
        None => HashSet::new(),
    };
    let mut gaps: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for docket in filed {
        if !enriched.contains(docket) && seen.insert(docket) {
            gaps.push(docket.to_string());
        }
    }
    Ok(gaps)
}

/// Dockets whose enrichment identifier column is still null in a
/// merged-table archive. A table without the column at all means nothing
/// has been enriched yet; every docket is a gap and the drift gets logged.
pub fn gaps_by_identifier(
    filings: &Table,
    identifier_column: &str,
) -> Result<Vec<String>, PipelineError> {
    let docket_ix = filings.require_column(DOCKET_NUMBER)?;
    let identifier_ix = filings.column_index(identifier_column);
    if identifier_ix.is_none() && !filings.is_empty() {
        warn!(
            column = identifier_column,
            "enrichment identifier column absent; treating every docket as a gap"
        );
    }
    let mut gaps: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for row in filings.rows() {
        let enriched = identifier_ix.map(|ix| row[ix].is_some()).unwrap_or(false);
        if enriched {
            continue;
        }
        if let Some(docket) = row[docket_ix].as_deref() {
            if seen.insert(docket) {
                gaps.push(docket.to_string());
            }
        }
    }
    Ok(gaps)
}

/// Gap detection result for one run.
#[derive(Debug, Default)]
pub struct GapOutcome {
    /// Dockets that need a portal lookup.
    pub needs_fetch: Vec<String>,
    /// Dockets whose enrichment already sits in the archive and only needs
    /// re-joining into the filings table. Nonzero only in merged-table
    /// deployments, after a re-filed docket re-enters the batch.
    pub fillable_from_archive: usize,
}

/// Apply the completeness test for the configured deployment mode. In
/// merged-table mode dockets already present in the enrichment archive are
/// excluded from the fetch set; an enriched docket is never fetched twice.
pub fn detect_gaps(
    config: &PipelineConfig,
    filings: &Table,
    enrichment: Option<&Table>,
) -> Result<GapOutcome, PipelineError> {
    match config.enrichment.mode {
        EnrichmentMode::SeparateArchive => Ok(GapOutcome {
            needs_fetch: gaps_by_archive(filings, enrichment)?,
            fillable_from_archive: 0,
        }),
        EnrichmentMode::MergedTable => {
            let unfilled = gaps_by_identifier(filings, &config.enrichment.identifier_column)?;
            let total = unfilled.len();
            let mut needs_fetch = unfilled;
            if let Some(table) = enrichment {
                let enriched: HashSet<&str> =
                    table.column_values(DOCKET_NUMBER)?.into_iter().collect();
                needs_fetch.retain(|docket| !enriched.contains(docket.as_str()));
            }
            Ok(GapOutcome {
                fillable_from_archive: total - needs_fetch.len(),
                needs_fetch,
            })
        }
    }
}

/// Outcome of merging fetched records into the enrichment archive.
#[derive(Debug)]
pub struct EnrichOutcome {
    pub table: Table,
    pub rows_added: usize,
}

/// Append fetched enrichment records to the archive, existing rows first,
/// and assert that every docket number appears exactly once afterwards.
pub fn merge_enrichment(
    existing: Option<Table>,
    new_records: Table,
) -> Result<EnrichOutcome, PipelineError> {
    let rows_added = new_records.len();
    let combined = match existing {
        Some(mut table) => {
            table.concat(new_records);
            table
        }
        None => new_records,
    };

    let docket_ix = combined.require_column(DOCKET_NUMBER)?;
    let mut seen: HashSet<&str> = HashSet::new();
    let mut reported: HashSet<&str> = HashSet::new();
    let mut offenders: Vec<String> = Vec::new();
    for row in combined.rows() {
        if let Some(docket) = row[docket_ix].as_deref() {
            if !seen.insert(docket) && reported.insert(docket) {
                offenders.push(docket.to_string());
            }
        }
    }
    if !offenders.is_empty() {
        return Err(PipelineError::MergeInvariant(format!(
            "enrichment archive would hold {} docket number(s) more than once: {}",
            offenders.len(),
            offenders.join(", ")
        )));
    }

    Ok(EnrichOutcome {
        table: combined,
        rows_added,
    })
}

/// Per-run options resolved from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stop after the historical merge; no portal traffic.
    pub skip_enrichment: bool,
}

/// What one run did, persisted as `runs/<run_id>.json` under the data dir.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed_stage: Stage,
    pub scraped_rows: usize,
    pub duplicates_removed: usize,
    pub archive_rows: usize,
    pub gap_size: usize,
    pub enrichment_rows_added: usize,
    pub archives: Vec<ArchiveManifestEntry>,
}

/// The update pipeline over a filing source and a docket lookup.
pub struct Pipeline {
    config: PipelineConfig,
    store: ArchiveStore,
    source: Box<dyn FilingSource>,
    lookup: Box<dyn DocketLookup>,
}

impl Pipeline {
    /// Production wiring: the court listing scraper and the docket portal
    /// client from the config.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let source = CourtsSource::new(
            config.scrape.base_url.clone(),
            &config.scrape.user_agent,
            Duration::from_secs(config.scrape.timeout_secs),
        )
        .map_err(|source| PipelineError::Extraction {
            context: "building http client".to_string(),
            source,
        })?;
        let lookup = PortalClient::new(config.portal.clone(), config.filing_columns.clone())?;
        let store = ArchiveStore::new(config.data_dir.clone());
        Ok(Self {
            config,
            store,
            source: Box::new(source),
            lookup: Box::new(lookup),
        })
    }

    /// Custom collaborators, for fixtures and alternative sources.
    pub fn with_collaborators(
        config: PipelineConfig,
        source: Box<dyn FilingSource>,
        lookup: Box<dyn DocketLookup>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let store = ArchiveStore::new(config.data_dir.clone());
        Ok(Self {
            config,
            store,
            source,
            lookup,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the whole pipeline from the top.
    pub async fn run(&self, options: RunOptions) -> Result<RunSummary, PipelineError> {
        self.run_from(Stage::NotStarted, options).await
    }

    /// Run the pipeline, skipping stages at or before `resume_at`.
    /// Resuming from `Extracted` reuses the persisted latest-batch snapshot
    /// instead of scraping again; from `Merged` onward the filings archive
    /// is taken as already merged. Gap detection is recomputed on every
    /// run, so resuming after a failed fetch retries the same gap set.
    pub async fn run_from(
        &self,
        resume_at: Stage,
        options: RunOptions,
    ) -> Result<RunSummary, PipelineError> {
        let _lock = RunLock::acquire(&self.config.data_dir)?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, ?resume_at, "starting update run");

        match self.stages(run_id, started_at, resume_at, options).await {
            Ok(summary) => {
                info!(
                    %run_id,
                    stage = ?summary.completed_stage,
                    archive_rows = summary.archive_rows,
                    "update run complete"
                );
                Ok(summary)
            }
            Err(err) => {
                error!(%run_id, stage = err.stage(), error = %err, "update run failed");
                Err(err)
            }
        }
    }

    async fn stages(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        resume_at: Stage,
        options: RunOptions,
    ) -> Result<RunSummary, PipelineError> {
        let mut archives: Vec<ArchiveManifestEntry> = Vec::new();

        let (scraped_rows, merged, duplicates_removed) = if resume_at >= Stage::Merged {
            let table = self
                .store
                .load(Archive::Filings, &self.config.date_columns)
                .await?
                .ok_or_else(|| {
                    PipelineError::ArchiveMissing(format!(
                        "filings archive required to resume from {resume_at:?}"
                    ))
                })?;
            (0, table, 0)
        } else {
            let batch = if resume_at >= Stage::Extracted {
                let snapshot = self
                    .store
                    .load(Archive::LatestBatch, &self.config.date_columns)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::ArchiveMissing(
                            "latest-batch snapshot required to resume from Extracted".to_string(),
                        )
                    })?;
                info!(rows = snapshot.len(), "resuming from persisted batch");
                snapshot
            } else {
                let batch = self.extract(run_id).await?;
                archives.push(self.store.save(Archive::LatestBatch, &batch).await?);
                batch
            };
            let scraped_rows = batch.len();

            let existing = self
                .store
                .load(Archive::Filings, &self.config.date_columns)
                .await?;
            let outcome = merge_historical(
                batch,
                existing,
                self.config.dedup_key(),
                &self.config.sort_columns,
            );
            info!("removed {} duplicate filings", outcome.duplicates_removed);
            archives.push(self.store.save(Archive::Filings, &outcome.table).await?);
            (scraped_rows, outcome.table, outcome.duplicates_removed)
        };

        let existing_enrichment = self.store.load(Archive::Enrichment, &[]).await?;
        let gap = detect_gaps(&self.config, &merged, existing_enrichment.as_ref())?;
        info!(
            needs_fetch = gap.needs_fetch.len(),
            fillable = gap.fillable_from_archive,
            "gap detection complete"
        );

        let completed_stage;
        let mut enrichment_rows_added = 0usize;
        let mut archive_rows = merged.len();

        if options.skip_enrichment {
            info!("enrichment skipped by request");
            completed_stage = Stage::Merged;
        } else if gap.needs_fetch.is_empty() && gap.fillable_from_archive == 0 {
            // Nothing to fetch and nothing to re-join. The remote round
            // trip is skipped entirely.
            info!("no dockets need enrichment");
            completed_stage = Stage::Reconciled;
        } else {
            let mut enrichment = existing_enrichment;
            if !gap.needs_fetch.is_empty() {
                let fetched = self.lookup.lookup(&gap.needs_fetch).await?;
                if fetched.is_empty() {
                    // Some dockets legitimately resolve to nothing; they
                    // stay in the gap set for the next run.
                    info!("lookup resolved none of the gap dockets");
                } else {
                    let outcome =
                        merge_enrichment(enrichment.take(), Table::from_records(&fetched))?;
                    enrichment_rows_added = outcome.rows_added;
                    archives.push(self.store.save(Archive::Enrichment, &outcome.table).await?);
                    enrichment = Some(outcome.table);
                }
            }
            if self.config.enrichment.mode == EnrichmentMode::MergedTable {
                if let Some(enrichment_table) = &enrichment {
                    // Re-derive the merged table from scratch: project the
                    // archive down to the filing columns, then join the
                    // enrichment archive back on. Stale or missing cells
                    // from the dedup both come out filled.
                    let filings_only = merged.project(&self.config.filing_columns);
                    let mut joined =
                        join_many_to_one(&filings_only, enrichment_table, DOCKET_NUMBER)?;
                    joined.sort_by_columns(&self.config.sort_columns);
                    archive_rows = joined.len();
                    archives.push(self.store.save(Archive::Filings, &joined).await?);
                }
            }
            completed_stage = Stage::Reconciled;
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            completed_stage,
            scraped_rows,
            duplicates_removed,
            archive_rows,
            gap_size: gap.needs_fetch.len(),
            enrichment_rows_added,
            archives,
        };
        self.write_report(&summary).await?;
        Ok(summary)
    }

    async fn extract(&self, run_id: Uuid) -> Result<Table, PipelineError> {
        let today = Local::now().date_naive();
        let window = rolling_window(today, self.config.scrape.window_days);
        let records = self.source.fetch_window(&window).await.map_err(|source| {
            PipelineError::Extraction {
                context: format!("window of {} day(s) ending {}", window.len(), today),
                source,
            }
        })?;
        info!(
            %run_id,
            records = records.len(),
            source = self.source.source_id(),
            "scraped new filings"
        );

        let mut batch = Table::from_records(&records);
        if !batch.is_empty() {
            batch
                .require_column(FILING_DATE)
                .map_err(PipelineError::BatchSchema)?;
            batch
                .require_column(DOCKET_NUMBER)
                .map_err(PipelineError::BatchSchema)?;
            if batch.column_index(DEFENDANT_NAME).is_none() {
                warn!("scraped batch carries no defendant name column");
            }
        }
        for column in &self.config.date_columns {
            batch
                .normalize_date_column(column)
                .map_err(PipelineError::BatchSchema)?;
        }
        batch.sort_by_columns(&self.config.sort_columns);
        Ok(batch)
    }

    async fn write_report(&self, summary: &RunSummary) -> Result<(), PipelineError> {
        let runs_dir = self.config.data_dir.join("runs");
        fs::create_dir_all(&runs_dir)
            .await
            .map_err(|source| StoreError::Write {
                path: runs_dir.clone(),
                source,
            })?;
        let path = runs_dir.join(format!("{}.json", summary.run_id));
        let bytes = serde_json::to_vec_pretty(summary)?;
        fs::write(&path, bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "wrote run report");
        Ok(())
    }
}

/// Row counts and the open gap, for the status command.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub data_dir: String,
    pub mode: EnrichmentMode,
    pub filings_rows: usize,
    pub enrichment_rows: usize,
    pub latest_batch_rows: usize,
    pub gap_size: usize,
}

pub async fn archive_status(config: &PipelineConfig) -> Result<StatusReport, PipelineError> {
    config.validate()?;
    let store = ArchiveStore::new(config.data_dir.clone());
    let filings = store.load(Archive::Filings, &config.date_columns).await?;
    let enrichment = store.load(Archive::Enrichment, &[]).await?;
    let latest = store
        .load(Archive::LatestBatch, &config.date_columns)
        .await?;
    let gap_size = match &filings {
        Some(filings) => {
            detect_gaps(config, filings, enrichment.as_ref())?
                .needs_fetch
                .len()
        }
        None => 0,
    };
    Ok(StatusReport {
        data_dir: config.data_dir.display().to_string(),
        mode: config.enrichment.mode,
        filings_rows: filings.map(|t| t.len()).unwrap_or(0),
        enrichment_rows: enrichment.map(|t| t.len()).unwrap_or(0),
        latest_batch_rows: latest.map(|t| t.len()).unwrap_or(0),
        gap_size,
    })
}

/// The filings archive joined to the enrichment archive, sorted by the
/// canonical key. Derived on demand; the caller decides where it goes. In
/// merged-table deployments the filings archive already carries the
/// enrichment columns and is returned as loaded.
pub async fn joined_view(config: &PipelineConfig) -> Result<Table, PipelineError> {
    config.validate()?;
    let store = ArchiveStore::new(config.data_dir.clone());
    let filings = store
        .load(Archive::Filings, &config.date_columns)
        .await?
        .ok_or_else(|| {
            PipelineError::ArchiveMissing(format!(
                "no filings archive under {}",
                config.data_dir.display()
            ))
        })?;
    let enrichment = store.load(Archive::Enrichment, &[]).await?;
    let mut joined = match (config.enrichment.mode, enrichment) {
        (EnrichmentMode::SeparateArchive, Some(enrichment)) => {
            join_many_to_one(&filings, &enrichment, DOCKET_NUMBER)?
        }
        _ => filings,
    };
    joined.sort_by_columns(&config.sort_columns);
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ncf_core::RawRecord;
    use ncf_portal::FixtureLookup;
    use ncf_scrape::FixtureSource;
    use tempfile::tempdir;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn row(cells: &[Option<&str>]) -> Vec<Option<String>> {
        cells.iter().map(|c| c.map(|s| s.to_string())).collect()
    }

    fn filings_table(rows: &[(&str, &str, &str)]) -> Table {
        let mut table = Table::new(cols(&[FILING_DATE, DOCKET_NUMBER, DEFENDANT_NAME]));
        for (date, docket, name) in rows {
            table.push_row(row(&[Some(date), Some(docket), Some(name)]));
        }
        table
    }

    fn enrichment_table(rows: &[(&str, &str)]) -> Table {
        let mut table = Table::new(cols(&[DOCKET_NUMBER, "otn"]));
        for (docket, otn) in rows {
            table.push_row(row(&[Some(docket), Some(otn)]));
        }
        table
    }

    fn sort_cols() -> Vec<String> {
        cols(&[FILING_DATE, DOCKET_NUMBER, DEFENDANT_NAME])
    }

    fn test_config(data_dir: &Path) -> PipelineConfig {
        PipelineConfig {
            data_dir: data_dir.to_path_buf(),
            filing_columns: cols(&[FILING_DATE, DOCKET_NUMBER, DEFENDANT_NAME]),
            ..PipelineConfig::default()
        }
    }

    fn filing_record(date: &str, docket: &str, name: &str) -> RawRecord {
        let mut record = RawRecord::new();
        record.insert(FILING_DATE.to_string(), date.to_string());
        record.insert(DOCKET_NUMBER.to_string(), docket.to_string());
        record.insert(DEFENDANT_NAME.to_string(), name.to_string());
        record
    }

    fn enrichment_record(docket: &str, otn: &str) -> RawRecord {
        let mut record = RawRecord::new();
        record.insert(DOCKET_NUMBER.to_string(), docket.to_string());
        record.insert("otn".to_string(), otn.to_string());
        record.insert("originating_court".to_string(), "MC".to_string());
        record
    }

    /// A lookup that must never be reached.
    struct UnreachableLookup;

    #[async_trait]
    impl DocketLookup for UnreachableLookup {
        async fn lookup(&self, _dockets: &[String]) -> Result<Vec<RawRecord>, PortalError> {
            panic!("lookup must not run when the gap set is empty");
        }
    }

    /// A source that must never be reached.
    struct UnreachableSource;

    #[async_trait]
    impl FilingSource for UnreachableSource {
        fn source_id(&self) -> &'static str {
            "unreachable"
        }

        async fn fetch_window(
            &self,
            _window: &[chrono::NaiveDate],
        ) -> Result<Vec<RawRecord>, ScrapeError> {
            panic!("source must not run when resuming from a persisted batch");
        }
    }

    #[test]
    fn first_run_keeps_every_unique_row() {
        let batch = filings_table(&[
            ("2021-06-01", "CP-0001", "DOE, JOHN"),
            ("2021-06-01", "CP-0002", "ROE, JANE"),
            ("2021-06-02", "CP-0003", "POE, DAN"),
        ]);
        let outcome = merge_historical(batch, None, DedupKey::FullRow, &sort_cols());
        assert_eq!(outcome.table.len(), 3);
        assert_eq!(outcome.duplicates_removed, 0);
    }

    #[test]
    fn first_run_still_drops_in_batch_duplicates() {
        let batch = filings_table(&[
            ("2021-06-01", "CP-0001", "DOE, JOHN"),
            ("2021-06-01", "CP-0001", "DOE, JOHN"),
            ("2021-06-02", "CP-0002", "ROE, JANE"),
        ]);
        let outcome = merge_historical(batch, None, DedupKey::FullRow, &sort_cols());
        assert_eq!(outcome.table.len(), 2);
        assert_eq!(outcome.duplicates_removed, 1);
    }

    #[test]
    fn overlapping_batch_adds_only_novel_rows() {
        let existing = filings_table(&[
            ("2021-06-01", "CP-0001", "DOE, JOHN"),
            ("2021-06-01", "CP-0002", "ROE, JANE"),
            ("2021-06-02", "CP-0003", "POE, DAN"),
            ("2021-06-02", "CP-0004", "LOE, AMY"),
            ("2021-06-03", "CP-0005", "MOE, SAM"),
        ]);
        let batch = filings_table(&[
            ("2021-06-02", "CP-0004", "LOE, AMY"),
            ("2021-06-03", "CP-0005", "MOE, SAM"),
            ("2021-06-04", "CP-0006", "NOE, KIM"),
        ]);
        let outcome = merge_historical(batch, Some(existing), DedupKey::FullRow, &sort_cols());
        assert_eq!(outcome.table.len(), 6);
        assert_eq!(outcome.duplicates_removed, 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let batch = filings_table(&[
            ("2021-06-01", "CP-0001", "DOE, JOHN"),
            ("2021-06-02", "CP-0002", "ROE, JANE"),
        ]);
        let first = merge_historical(batch.clone(), None, DedupKey::FullRow, &sort_cols());
        let second = merge_historical(
            batch,
            Some(first.table.clone()),
            DedupKey::FullRow,
            &sort_cols(),
        );
        assert_eq!(first.table, second.table);
        assert_eq!(second.duplicates_removed, 2);
    }

    #[test]
    fn merged_output_is_sorted_by_the_canonical_key() {
        let existing = filings_table(&[
            ("2021-06-03", "CP-0005", "MOE, SAM"),
            ("2021-06-01", "CP-0002", "ROE, JANE"),
        ]);
        let batch = filings_table(&[
            ("2021-06-01", "CP-0001", "DOE, JOHN"),
            ("2021-06-02", "CP-0003", "POE, DAN"),
        ]);
        let outcome = merge_historical(batch, Some(existing), DedupKey::FullRow, &sort_cols());
        let dockets: Vec<&str> = outcome
            .table
            .rows()
            .iter()
            .map(|r| r[1].as_deref().unwrap())
            .collect();
        assert_eq!(dockets, ["CP-0001", "CP-0002", "CP-0003", "CP-0005"]);
    }

    #[test]
    fn subset_dedup_ignores_enrichment_cells() {
        // The archive carries enrichment columns; the fresh batch does not.
        let mut existing = Table::new(cols(&[FILING_DATE, DOCKET_NUMBER, DEFENDANT_NAME, "otn"]));
        existing.push_row(row(&[
            Some("2021-06-01"),
            Some("CP-0001"),
            Some("DOE, JOHN"),
            Some("T123"),
        ]));
        let batch = filings_table(&[("2021-06-01", "CP-0001", "DOE, JOHN")]);

        let filing_columns = cols(&[FILING_DATE, DOCKET_NUMBER, DEFENDANT_NAME]);
        let outcome = merge_historical(
            batch,
            Some(existing),
            DedupKey::Columns(&filing_columns),
            &sort_cols(),
        );
        assert_eq!(outcome.table.len(), 1);
        assert_eq!(outcome.duplicates_removed, 1);
        // New rows come first, so the surviving row is the un-enriched one;
        // the join step fills it back in from the archive.
        assert_eq!(outcome.table.cell(0, "otn"), None);
    }

    #[test]
    fn archive_gap_is_the_unenriched_dockets_in_order() {
        let filings = filings_table(&[
            ("2021-06-01", "CP-0001", "DOE, JOHN"),
            ("2021-06-01", "CP-0002", "ROE, JANE"),
            ("2021-06-02", "CP-0002", "ROE, JANE"),
            ("2021-06-02", "CP-0003", "POE, DAN"),
        ]);
        let enrichment = enrichment_table(&[("CP-0001", "T100")]);
        let gaps = gaps_by_archive(&filings, Some(&enrichment)).unwrap();
        assert_eq!(gaps, ["CP-0002", "CP-0003"]);
    }

    #[test]
    fn missing_enrichment_archive_means_everything_is_a_gap() {
        let filings = filings_table(&[
            ("2021-06-01", "CP-0001", "DOE, JOHN"),
            ("2021-06-01", "CP-0002", "ROE, JANE"),
        ]);
        let gaps = gaps_by_archive(&filings, None).unwrap();
        assert_eq!(gaps, ["CP-0001", "CP-0002"]);
    }

    #[test]
    fn identifier_gap_reads_null_cells() {
        let mut filings = Table::new(cols(&[FILING_DATE, DOCKET_NUMBER, "otn"]));
        filings.push_row(row(&[Some("2021-06-01"), Some("CP-0001"), Some("T100")]));
        filings.push_row(row(&[Some("2021-06-01"), Some("CP-0002"), None]));
        filings.push_row(row(&[Some("2021-06-02"), Some("CP-0002"), None]));
        let gaps = gaps_by_identifier(&filings, "otn").unwrap();
        assert_eq!(gaps, ["CP-0002"]);
    }

    #[test]
    fn identifier_gap_without_the_column_lists_every_docket() {
        let filings = filings_table(&[
            ("2021-06-01", "CP-0001", "DOE, JOHN"),
            ("2021-06-01", "CP-0002", "ROE, JANE"),
        ]);
        let gaps = gaps_by_identifier(&filings, "otn").unwrap();
        assert_eq!(gaps, ["CP-0001", "CP-0002"]);
    }

    #[test]
    fn merged_mode_never_fetches_an_archived_docket() {
        let mut config = PipelineConfig::default();
        config.dedup = DedupPolicy::FilingColumns;
        config.enrichment.mode = EnrichmentMode::MergedTable;

        let mut filings = Table::new(cols(&[FILING_DATE, DOCKET_NUMBER, "otn"]));
        filings.push_row(row(&[Some("2021-06-01"), Some("CP-0001"), None]));
        filings.push_row(row(&[Some("2021-06-02"), Some("CP-0002"), None]));
        let enrichment = enrichment_table(&[("CP-0001", "T100")]);

        let gap = detect_gaps(&config, &filings, Some(&enrichment)).unwrap();
        assert_eq!(gap.needs_fetch, ["CP-0002"]);
        assert_eq!(gap.fillable_from_archive, 1);
    }

    #[test]
    fn enrichment_merge_appends_new_dockets() {
        let existing = enrichment_table(&[("CP-0001", "T100")]);
        let fetched = enrichment_table(&[("CP-0002", "T200")]);
        let outcome = merge_enrichment(Some(existing), fetched).unwrap();
        assert_eq!(outcome.table.len(), 2);
        assert_eq!(outcome.rows_added, 1);
    }

    #[test]
    fn enrichment_merge_refuses_duplicate_dockets() {
        let existing = enrichment_table(&[("CP-0001", "T100"), ("CP-0002", "T200")]);
        let fetched = enrichment_table(&[("CP-0002", "T201")]);
        let err = merge_enrichment(Some(existing), fetched).unwrap_err();
        match err {
            PipelineError::MergeInvariant(message) => {
                assert!(message.contains("CP-0002"), "message: {message}");
            }
            other => panic!("expected MergeInvariant, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_offenders_are_reported_once_each_in_first_offense_order() {
        let existing = enrichment_table(&[("CP-0001", "T100"), ("CP-0002", "T200")]);
        let fetched = enrichment_table(&[
            ("CP-0002", "T201"),
            ("CP-0001", "T101"),
            ("CP-0002", "T202"),
        ]);
        let err = merge_enrichment(Some(existing), fetched).unwrap_err();
        match err {
            PipelineError::MergeInvariant(message) => {
                assert!(message.contains("2 docket number(s)"), "message: {message}");
                assert!(message.contains("CP-0002, CP-0001"), "message: {message}");
            }
            other => panic!("expected MergeInvariant, got {other:?}"),
        }
    }

    #[test]
    fn merged_table_mode_rejects_full_row_dedup() {
        let mut config = PipelineConfig::default();
        config.enrichment.mode = EnrichmentMode::MergedTable;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Config(_))
        ));
        config.dedup = DedupPolicy::FilingColumns;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_defaults_survive_a_sparse_yaml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracker.yaml");
        std::fs::write(&path, "dedup: filing-columns\nscrape:\n  window_days: 3\n").unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.dedup, DedupPolicy::FilingColumns);
        assert_eq!(config.scrape.window_days, 3);
        assert_eq!(config.enrichment.identifier_column, "otn");
        assert_eq!(config.portal.ntasks, 5);
    }

    #[tokio::test]
    async fn full_run_scrapes_merges_and_enriches() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        // US-form dates and literal None markers, the way the listing
        // renders them.
        let mut scraped = vec![
            filing_record("06/02/2021", "CP-0002", "ROE, JANE"),
            filing_record("06/01/2021", "CP-0001", "DOE, JOHN"),
        ];
        scraped[1].insert("bail_amount".to_string(), "None".to_string());
        let source = FixtureSource::new(scraped.clone());
        let lookup = FixtureLookup::new(vec![
            enrichment_record("CP-0001", "T100"),
            enrichment_record("CP-0002", "T200"),
        ]);

        let pipeline = Pipeline::with_collaborators(
            config.clone(),
            Box::new(source),
            Box::new(lookup),
        )
        .unwrap();
        let summary = pipeline.run(RunOptions::default()).await.unwrap();

        assert_eq!(summary.completed_stage, Stage::Reconciled);
        assert_eq!(summary.scraped_rows, 2);
        assert_eq!(summary.archive_rows, 2);
        assert_eq!(summary.gap_size, 2);
        assert_eq!(summary.enrichment_rows_added, 2);

        // Dates come out ISO and the archive is sorted.
        let store = ArchiveStore::new(dir.path().to_path_buf());
        let filings = store
            .load(Archive::Filings, &config.date_columns)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filings.cell(0, FILING_DATE), Some("2021-06-01"));
        assert_eq!(filings.cell(0, DOCKET_NUMBER), Some("CP-0001"));
        assert_eq!(filings.cell(0, "bail_amount"), None);

        // The run report landed under runs/.
        let report_path = dir.path().join("runs").join(format!("{}.json", summary.run_id));
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(report["completed_stage"], "reconciled");
        assert_eq!(report["scraped_rows"], 2);

        // A second identical run changes nothing and fetches nothing.
        let pipeline = Pipeline::with_collaborators(
            config.clone(),
            Box::new(FixtureSource::new(scraped)),
            Box::new(UnreachableLookup),
        )
        .unwrap();
        let rerun = pipeline.run(RunOptions::default()).await.unwrap();
        assert_eq!(rerun.completed_stage, Stage::Reconciled);
        assert_eq!(rerun.duplicates_removed, 2);
        assert_eq!(rerun.archive_rows, 2);
        assert_eq!(rerun.gap_size, 0);
        assert_eq!(rerun.enrichment_rows_added, 0);
    }

    #[tokio::test]
    async fn skip_enrichment_stops_after_the_merge() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let source = FixtureSource::new(vec![filing_record("2021-06-01", "CP-0001", "DOE, JOHN")]);

        let pipeline =
            Pipeline::with_collaborators(config, Box::new(source), Box::new(UnreachableLookup))
                .unwrap();
        let summary = pipeline
            .run(RunOptions {
                skip_enrichment: true,
            })
            .await
            .unwrap();
        assert_eq!(summary.completed_stage, Stage::Merged);
        assert_eq!(summary.archive_rows, 1);
        assert_eq!(summary.gap_size, 1);
        assert_eq!(summary.enrichment_rows_added, 0);
    }

    #[tokio::test]
    async fn partial_lookup_results_leave_the_rest_in_the_gap() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let source = FixtureSource::new(vec![
            filing_record("2021-06-01", "CP-0001", "DOE, JOHN"),
            filing_record("2021-06-02", "CP-0002", "ROE, JANE"),
        ]);
        // The portal only knows one of the two dockets.
        let lookup = FixtureLookup::new(vec![enrichment_record("CP-0001", "T100")]);

        let pipeline =
            Pipeline::with_collaborators(config.clone(), Box::new(source), Box::new(lookup))
                .unwrap();
        let summary = pipeline.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.gap_size, 2);
        assert_eq!(summary.enrichment_rows_added, 1);

        let status = archive_status(&config).await.unwrap();
        assert_eq!(status.enrichment_rows, 1);
        assert_eq!(status.gap_size, 1);
    }

    #[tokio::test]
    async fn resuming_from_extracted_reuses_the_snapshot() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        let store = ArchiveStore::new(dir.path().to_path_buf());
        let batch = filings_table(&[("2021-06-01", "CP-0001", "DOE, JOHN")]);
        store.save(Archive::LatestBatch, &batch).await.unwrap();

        let lookup = FixtureLookup::new(vec![enrichment_record("CP-0001", "T100")]);
        let pipeline = Pipeline::with_collaborators(
            config,
            Box::new(UnreachableSource),
            Box::new(lookup),
        )
        .unwrap();
        let summary = pipeline
            .run_from(Stage::Extracted, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.scraped_rows, 1);
        assert_eq!(summary.archive_rows, 1);
        assert_eq!(summary.enrichment_rows_added, 1);
    }

    #[tokio::test]
    async fn resuming_without_a_snapshot_is_an_error() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let pipeline = Pipeline::with_collaborators(
            config,
            Box::new(UnreachableSource),
            Box::new(UnreachableLookup),
        )
        .unwrap();
        let err = pipeline
            .run_from(Stage::Extracted, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ArchiveMissing(_)));
    }

    #[tokio::test]
    async fn schema_drift_in_the_scraped_batch_fails_the_extract_stage() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        // Records without a docket column cannot join to anything.
        let mut record = RawRecord::new();
        record.insert(FILING_DATE.to_string(), "2021-06-01".to_string());
        record.insert(DEFENDANT_NAME.to_string(), "DOE, JOHN".to_string());
        let source = FixtureSource::new(vec![record]);

        let pipeline = Pipeline::with_collaborators(
            config,
            Box::new(source),
            Box::new(UnreachableLookup),
        )
        .unwrap();
        let err = pipeline.run(RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::BatchSchema(_)));
        assert_eq!(err.stage(), "extract");
    }

    #[tokio::test]
    async fn concurrent_runs_are_locked_out() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let _lock = RunLock::acquire(dir.path()).unwrap();

        let source = FixtureSource::new(vec![filing_record("2021-06-01", "CP-0001", "DOE, JOHN")]);
        let pipeline =
            Pipeline::with_collaborators(config, Box::new(source), Box::new(UnreachableLookup))
                .unwrap();
        let err = pipeline.run(RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Locked { .. })));
    }

    #[tokio::test]
    async fn merged_table_mode_persists_the_join_and_refills_after_rescrape() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.dedup = DedupPolicy::FilingColumns;
        config.enrichment.mode = EnrichmentMode::MergedTable;

        let scraped = vec![
            filing_record("2021-06-01", "CP-0001", "DOE, JOHN"),
            filing_record("2021-06-02", "CP-0002", "ROE, JANE"),
        ];
        let lookup = FixtureLookup::new(vec![
            enrichment_record("CP-0001", "T100"),
            enrichment_record("CP-0002", "T200"),
        ]);
        let pipeline = Pipeline::with_collaborators(
            config.clone(),
            Box::new(FixtureSource::new(scraped.clone())),
            Box::new(lookup),
        )
        .unwrap();
        pipeline.run(RunOptions::default()).await.unwrap();

        let store = ArchiveStore::new(dir.path().to_path_buf());
        let filings = store
            .load(Archive::Filings, &config.date_columns)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filings.cell(0, "otn"), Some("T100"));
        assert_eq!(filings.cell(1, "otn"), Some("T200"));

        // Re-scraping the same filings nulls the enrichment cells in the
        // merge, then the join refills them from the archive with no fetch.
        let pipeline = Pipeline::with_collaborators(
            config.clone(),
            Box::new(FixtureSource::new(scraped)),
            Box::new(UnreachableLookup),
        )
        .unwrap();
        let rerun = pipeline.run(RunOptions::default()).await.unwrap();
        assert_eq!(rerun.completed_stage, Stage::Reconciled);
        assert_eq!(rerun.gap_size, 0);

        let filings = store
            .load(Archive::Filings, &config.date_columns)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filings.len(), 2);
        assert_eq!(filings.cell(0, "otn"), Some("T100"));
        assert_eq!(filings.cell(1, "otn"), Some("T200"));
    }

    #[tokio::test]
    async fn joined_view_attaches_enrichment_without_touching_archives() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ArchiveStore::new(dir.path().to_path_buf());
        store
            .save(
                Archive::Filings,
                &filings_table(&[
                    ("2021-06-01", "CP-0001", "DOE, JOHN"),
                    ("2021-06-02", "CP-0002", "ROE, JANE"),
                ]),
            )
            .await
            .unwrap();
        store
            .save(Archive::Enrichment, &enrichment_table(&[("CP-0002", "T200")]))
            .await
            .unwrap();

        let joined = joined_view(&config).await.unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.cell(0, "otn"), None);
        assert_eq!(joined.cell(1, "otn"), Some("T200"));

        // The archives themselves stay narrow.
        let filings = store
            .load(Archive::Filings, &config.date_columns)
            .await
            .unwrap()
            .unwrap();
        assert!(filings.column_index("otn").is_none());
    }
}
