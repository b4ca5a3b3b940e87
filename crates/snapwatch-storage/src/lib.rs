//! File-backed view tables, raw page archive and HTTP fetch utilities for snapwatch.

use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use snapwatch_core::{
    AuditRow, EntitySchema, HistoryEntry, LatestView, NaturalKey, Reconciliation, Record,
    HISTORY_FIRST_SEEN, HISTORY_LAST_SEEN,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "snapwatch-storage";

pub const LATEST_FILE: &str = "latest.csv";
pub const HISTORY_FILE: &str = "history.csv";
pub const AUDIT_FILE: &str = "audit.csv";
pub const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed table {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("writing {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn malformed(path: &Path, reason: impl ToString) -> Self {
        Self::Malformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    fn write(path: &Path, source: std::io::Error) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub history_appended: usize,
    pub history_refreshed: usize,
    pub audit_appended: usize,
    pub latest_rows: usize,
}

/// Latest / History / Audit CSV tables of one source, kept under a single directory.
///
/// Single writer only. Latest and History are replaced through a temp file + rename,
/// Audit is append-only.
#[derive(Debug, Clone)]
pub struct ViewStore {
    dir: PathBuf,
    schema: EntitySchema,
}

struct Table {
    headers: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl ViewStore {
    pub fn new(dir: impl Into<PathBuf>, schema: EntitySchema) -> Self {
        Self {
            dir: dir.into(),
            schema,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.dir.join(AUDIT_FILE)
    }

    /// A missing file is an empty view.
    pub async fn load_latest(&self) -> Result<LatestView, StoreError> {
        let path = self.latest_path();
        let Some(table) = read_table(&path).await? else {
            return Ok(LatestView::new());
        };
        let records = table
            .rows
            .iter()
            .map(|row| Record::from_pairs(table.headers.iter().cloned().zip(row.iter().map(str::to_string))));
        let (view, unkeyed) = LatestView::from_records(&self.schema, records);
        if unkeyed > 0 {
            warn!(path = %path.display(), unkeyed, "latest table has rows without a natural key");
        }
        Ok(view)
    }

    pub async fn load_history(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        let path = self.history_path();
        let Some(table) = read_table(&path).await? else {
            return Ok(Vec::new());
        };
        let first_idx = column_index(&table.headers, HISTORY_FIRST_SEEN)
            .ok_or_else(|| StoreError::malformed(&path, "missing first_seen column"))?;
        let last_idx = column_index(&table.headers, HISTORY_LAST_SEEN)
            .ok_or_else(|| StoreError::malformed(&path, "missing last_seen column"))?;

        let mut entries = Vec::with_capacity(table.rows.len());
        for (line, row) in table.rows.iter().enumerate() {
            let mut record = Record::new();
            let mut first_seen = None;
            let mut last_seen = None;
            for (idx, (header, value)) in table.headers.iter().zip(row.iter()).enumerate() {
                if idx == first_idx {
                    first_seen = Some(parse_timestamp(&path, line, value)?);
                } else if idx == last_idx {
                    last_seen = Some(parse_timestamp(&path, line, value)?);
                } else {
                    record.set(header.clone(), value);
                }
            }
            let (Some(first_seen), Some(last_seen)) = (first_seen, last_seen) else {
                return Err(StoreError::malformed(
                    &path,
                    format!("row {} is missing timestamps", line + 1),
                ));
            };
            entries.push(HistoryEntry {
                record,
                first_seen,
                last_seen,
            });
        }
        Ok(entries)
    }

    pub async fn load_history_keys(&self) -> Result<HashSet<NaturalKey>, StoreError> {
        Ok(self
            .load_history()
            .await?
            .iter()
            .filter_map(|entry| self.schema.key_of(&entry.record))
            .collect())
    }

    pub async fn load_audit(&self) -> Result<Vec<AuditRow>, StoreError> {
        let path = self.audit_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes.as_slice());
        reader
            .deserialize::<AuditRow>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::malformed(&path, err))
    }

    /// History and Audit land before Latest so a crash mid-commit only causes
    /// re-detection on the next run, never lost provenance.
    pub async fn commit(&self, reconciliation: &Reconciliation) -> Result<CommitSummary, StoreError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::write(&self.dir, source))?;

        let (history_appended, history_refreshed) = self.write_history(reconciliation).await?;
        let audit_appended = self.append_audit(&reconciliation.audit_rows).await?;
        let latest_rows = self.write_latest(&reconciliation.updated_latest).await?;

        let summary = CommitSummary {
            history_appended,
            history_refreshed,
            audit_appended,
            latest_rows,
        };
        debug!(dir = %self.dir.display(), ?summary, "committed reconciliation");
        Ok(summary)
    }

    async fn write_history(&self, reconciliation: &Reconciliation) -> Result<(usize, usize), StoreError> {
        if reconciliation.new_history_entries.is_empty() && reconciliation.refreshed_keys.is_empty() {
            return Ok((0, 0));
        }

        let mut entries = self.load_history().await?;
        let refreshed: HashSet<&NaturalKey> = reconciliation.refreshed_keys.iter().collect();
        let mut known = HashSet::new();
        let mut refreshed_count = 0usize;
        for entry in &mut entries {
            let Some(key) = self.schema.key_of(&entry.record) else {
                continue;
            };
            if refreshed.contains(&key) && entry.last_seen < reconciliation.reconciled_at {
                entry.last_seen = reconciliation.reconciled_at;
                refreshed_count += 1;
            }
            known.insert(key);
        }

        let mut appended = 0usize;
        for entry in &reconciliation.new_history_entries {
            let Some(key) = self.schema.key_of(&entry.record) else {
                continue;
            };
            // A key is recorded at most once, even if the caller's key set was stale.
            if known.insert(key) {
                entries.push(entry.clone());
                appended += 1;
            }
        }

        let payload = table_columns(&self.schema, entries.iter().map(|entry| &entry.record));
        let mut columns = payload.clone();
        columns.push(HISTORY_FIRST_SEEN.to_string());
        columns.push(HISTORY_LAST_SEEN.to_string());
        let path = self.history_path();
        let bytes = encode_rows(&path, &columns, entries.iter().map(|entry| {
            let mut row = project(&payload, &entry.record);
            row.push(entry.first_seen.to_rfc3339());
            row.push(entry.last_seen.to_rfc3339());
            row
        }))?;
        write_atomic(&path, &bytes).await?;
        Ok((appended, refreshed_count))
    }

    async fn append_audit(&self, rows: &[AuditRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let path = self.audit_path();
        let needs_header = match fs::metadata(&path).await {
            Ok(meta) => meta.len() == 0,
            Err(err) if err.kind() == ErrorKind::NotFound => true,
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(Vec::new());
        for row in rows {
            writer
                .serialize(row)
                .map_err(|err| StoreError::write(&path, std::io::Error::other(err.to_string())))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| StoreError::write(&path, std::io::Error::other(err.to_string())))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StoreError::write(&path, source))?;
        file.write_all(&bytes)
            .await
            .map_err(|source| StoreError::write(&path, source))?;
        file.flush()
            .await
            .map_err(|source| StoreError::write(&path, source))?;
        Ok(rows.len())
    }

    async fn write_latest(&self, latest: &LatestView) -> Result<usize, StoreError> {
        let path = self.latest_path();
        let columns = table_columns(&self.schema, latest.records());
        let bytes = encode_rows(
            &path,
            &columns,
            latest.records().map(|record| project(&columns, record)),
        )?;
        write_atomic(&path, &bytes).await?;
        Ok(latest.len())
    }
}

/// Writes the scrape of one day as `<dir>/snapshots/<source_id>_<YYYYMMDD>.csv`,
/// schema columns first and any extra fields after them in name order.
pub async fn export_snapshot(
    dir: &Path,
    source_id: &str,
    schema: &EntitySchema,
    records: &[Record],
    taken_at: DateTime<Utc>,
) -> Result<PathBuf, StoreError> {
    let columns = table_columns(schema, records);
    let path = dir
        .join(SNAPSHOTS_DIR)
        .join(format!("{source_id}_{}.csv", taken_at.format("%Y%m%d")));
    let bytes = encode_rows(&path, &columns, records.iter().map(|r| project(&columns, r)))?;
    write_atomic(&path, &bytes).await?;
    Ok(path)
}

/// Schema columns first, then every other field the records carry in name order.
fn table_columns<'r>(schema: &EntitySchema, records: impl IntoIterator<Item = &'r Record>) -> Vec<String> {
    let mut extras = BTreeSet::new();
    for record in records {
        for (field, _) in record.iter() {
            if !schema.columns.iter().any(|c| c == field)
                && field != HISTORY_FIRST_SEEN
                && field != HISTORY_LAST_SEEN
            {
                extras.insert(field.to_string());
            }
        }
    }
    let mut columns = schema.columns.clone();
    columns.extend(extras);
    columns
}

fn project(columns: &[String], record: &Record) -> Vec<String> {
    columns
        .iter()
        .map(|column| record.get(column).unwrap_or_default().to_string())
        .collect()
}

fn column_index(headers: &[String], name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

fn parse_timestamp(path: &Path, line: usize, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::malformed(path, format!("row {}: bad timestamp {value:?}: {err}", line + 1)))
}

async fn read_table(path: &Path) -> Result<Option<Table>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes.as_slice());
    let headers = reader
        .headers()
        .map_err(|err| StoreError::malformed(path, err))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();
    let rows = reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| StoreError::malformed(path, err))?;
    Ok(Some(Table { headers, rows }))
}

fn encode_rows(
    path: &Path,
    columns: &[String],
    rows: impl Iterator<Item = Vec<String>>,
) -> Result<Vec<u8>, StoreError> {
    let to_io = |err: csv::Error| StoreError::write(path, std::io::Error::other(err.to_string()));
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns).map_err(to_io)?;
    for row in rows {
        writer.write_record(&row).map_err(to_io)?;
    }
    writer
        .into_inner()
        .map_err(|err| StoreError::write(path, std::io::Error::other(err.to_string())))
}

/// Replace `path` through a sibling temp file so readers never see a half-written table.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|source| StoreError::write(parent, source))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written: std::io::Result<()> = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::write(path, source));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw fetched pages, one folder per day and source.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Identical pages fetched on the same day are stored once.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes)
                .await
                .with_context(|| format!("storing artifact {}", absolute_path.display()))?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            accept_language: Some("en-US,en;q=0.9".to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential page fetcher with retry on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8",
            ),
        );
        if let Some(lang) = &config.accept_language {
            let value = reqwest::header::HeaderValue::from_str(lang)
                .context("invalid accept-language header value")?;
            headers.insert(reqwest::header::ACCEPT_LANGUAGE, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = resp.bytes().await?.to_vec();
                        info!(status = status.as_u16(), bytes = body.len(), "fetched page");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retrying page fetch");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "retrying page fetch");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
