//! Docket lookup: the contract the pipeline fetches enrichment through,
//! plus the batch-job client for the court portal service.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ncf_core::{RawRecord, DOCKET_NUMBER};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "ncf-portal";

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("portal returned status {status}: {body}")]
    Server { status: u16, body: String },
    #[error("decoding portal response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("lookup job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },
    #[error("lookup job {job_id} did not complete within {timeout_secs}s")]
    TimedOut { job_id: String, timeout_secs: u64 },
    #[error("unexpected result shape: {0}")]
    UnexpectedShape(String),
}

/// Anything that can resolve a batch of docket numbers to enrichment
/// records. Dockets the backing service cannot resolve simply produce no
/// record; a failed lookup as a whole is fatal to the run.
#[async_trait]
pub trait DocketLookup: Send + Sync {
    async fn lookup(&self, dockets: &[String]) -> Result<Vec<RawRecord>, PortalError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub base_url: String,
    pub dataset: String,
    pub search_by: String,
    /// Worker-count hint passed through to the service.
    pub ntasks: u32,
    /// Inter-task delay hint passed through to the service, in seconds.
    pub sleep_secs: u64,
    pub poll_interval_secs: u64,
    /// Overall budget for one job, submission to completion.
    pub timeout_secs: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            dataset: "courts".to_string(),
            search_by: "Docket Number".to_string(),
            ntasks: 5,
            sleep_secs: 2,
            poll_interval_secs: 5,
            timeout_secs: 900,
        }
    }
}

#[derive(Debug, Serialize)]
struct JobRequest<'a> {
    dataset: &'a str,
    search_by: &'a str,
    ntasks: u32,
    sleep: u64,
    dockets: &'a [String],
}

#[derive(Debug, Deserialize)]
struct JobHandle {
    id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    status: String,
    #[serde(default)]
    result_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 200 {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(200).collect();
        format!("{cut}...")
    }
}

/// Normalize a raw result artifact. The artifact must be a JSON array of
/// per-docket batches, each batch an array of string-keyed objects; some
/// batches are legitimately empty (dockets the service could not resolve).
/// Flattens, drops empty rows, deduplicates exact duplicates, and strips
/// filing-schema columns other than the docket number join key. Null JSON
/// values are treated as absent keys.
pub fn clean_results(
    value: &JsonValue,
    filing_columns: &[String],
) -> Result<Vec<RawRecord>, PortalError> {
    let batches = value.as_array().ok_or_else(|| {
        PortalError::UnexpectedShape("result artifact is not an array".to_string())
    })?;

    let mut records: Vec<RawRecord> = Vec::new();
    let mut seen: HashSet<RawRecord> = HashSet::new();
    for (batch_ix, batch) in batches.iter().enumerate() {
        let rows = batch.as_array().ok_or_else(|| {
            PortalError::UnexpectedShape(format!("batch {batch_ix} is not an array"))
        })?;
        for (row_ix, row) in rows.iter().enumerate() {
            let object = row.as_object().ok_or_else(|| {
                PortalError::UnexpectedShape(format!(
                    "batch {batch_ix} row {row_ix} is not an object"
                ))
            })?;
            let mut record = RawRecord::new();
            for (key, cell) in object {
                if key != DOCKET_NUMBER && filing_columns.iter().any(|column| column == key) {
                    continue;
                }
                let text = match cell {
                    JsonValue::Null => continue,
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                record.insert(key.clone(), text);
            }
            if record.is_empty() {
                continue;
            }
            if seen.insert(record.clone()) {
                records.push(record);
            }
        }
    }
    Ok(records)
}

/// Client for the batch lookup portal: submit a job, poll it to
/// completion, download and clean the result artifact.
pub struct PortalClient {
    client: reqwest::Client,
    config: PortalConfig,
    filing_columns: Vec<String>,
}

impl PortalClient {
    pub fn new(config: PortalConfig, filing_columns: Vec<String>) -> Result<Self, PortalError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            config,
            filing_columns,
        })
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            suffix.trim_start_matches('/')
        )
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PortalError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PortalError::Server {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn submit(&self, dockets: &[String]) -> Result<String, PortalError> {
        let request = JobRequest {
            dataset: &self.config.dataset,
            search_by: &self.config.search_by,
            ntasks: self.config.ntasks,
            sleep: self.config.sleep_secs,
            dockets,
        };
        let response = self
            .client
            .post(self.endpoint("jobs"))
            .json(&request)
            .send()
            .await?;
        let handle: JobHandle = Self::decode(response).await?;
        Ok(handle.id)
    }

    async fn await_completion(&self, job_id: &str) -> Result<String, PortalError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_secs);
        loop {
            let response = self
                .client
                .get(self.endpoint(&format!("jobs/{job_id}")))
                .send()
                .await?;
            let status: JobStatus = Self::decode(response).await?;
            match status.status.as_str() {
                "completed" => {
                    return status.result_url.ok_or_else(|| {
                        PortalError::UnexpectedShape(
                            "completed job carries no result_url".to_string(),
                        )
                    });
                }
                "failed" => {
                    return Err(PortalError::JobFailed {
                        job_id: job_id.to_string(),
                        reason: status.error.unwrap_or_else(|| "unspecified".to_string()),
                    });
                }
                "queued" | "running" => {}
                other => {
                    return Err(PortalError::UnexpectedShape(format!(
                        "unknown job status `{other}`"
                    )));
                }
            }
            if Instant::now() >= deadline {
                return Err(PortalError::TimedOut {
                    job_id: job_id.to_string(),
                    timeout_secs: self.config.timeout_secs,
                });
            }
            debug!(job_id, status = status.status.as_str(), "lookup job still running");
            tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
        }
    }

    async fn download(&self, result_url: &str) -> Result<JsonValue, PortalError> {
        let url = if result_url.starts_with("http://") || result_url.starts_with("https://") {
            result_url.to_string()
        } else {
            self.endpoint(result_url)
        };
        let response = self.client.get(&url).send().await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl DocketLookup for PortalClient {
    async fn lookup(&self, dockets: &[String]) -> Result<Vec<RawRecord>, PortalError> {
        let job_id = self.submit(dockets).await?;
        info!(
            job_id = job_id.as_str(),
            dockets = dockets.len(),
            "submitted docket lookup job"
        );
        let result_url = self.await_completion(&job_id).await?;
        let artifact = self.download(&result_url).await?;
        let records = clean_results(&artifact, &self.filing_columns)?;
        info!(
            job_id = job_id.as_str(),
            records = records.len(),
            "docket lookup complete"
        );
        Ok(records)
    }
}

/// Fixed in-memory lookup for tests and offline runs. Returns only the
/// records whose docket number was actually asked for.
pub struct FixtureLookup {
    records: Vec<RawRecord>,
}

impl FixtureLookup {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl DocketLookup for FixtureLookup {
    async fn lookup(&self, dockets: &[String]) -> Result<Vec<RawRecord>, PortalError> {
        Ok(self
            .records
            .iter()
            .filter(|record| {
                record
                    .get(DOCKET_NUMBER)
                    .map(|docket| dockets.iter().any(|wanted| wanted == docket))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}
