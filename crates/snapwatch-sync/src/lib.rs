//! Scan orchestration: configuration, source registry, notification gate and the scan loop.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use snapwatch_adapters::{
    adapter_for_kind, load_page_file, FetchedPage, ScanContext, SnapshotSource, SourceKind,
};
use snapwatch_core::{Direction, EntitySchema, LatestView, ReconcileError, Reconciler, Reconciliation};
use snapwatch_storage::{
    export_snapshot, ArtifactStore, HttpClientConfig, HttpFetcher, ViewStore,
};
use thiserror::Error;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "snapwatch-sync";

const DEFAULT_SMTP_HOST: &str = "smtp.qq.com";
const DEFAULT_SMTP_PORT: u16 = 465;
const SEPARATOR_WIDTH: usize = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Live,
    /// Re-reads a page saved on disk on every pass.
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            let id = source.source_id.as_str();
            if id.trim().is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
                bail!("source_id {id:?} cannot be used as a directory name");
            }
            if !seen.insert(id) {
                bail!("duplicate source_id {id}");
            }
            match source.mode {
                SourceMode::Live if source.url.is_none() => {
                    bail!("live source {id} needs a url")
                }
                SourceMode::File if source.path.is_none() => {
                    bail!("file source {id} needs a path")
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    /// Enabled sources when `ids` is empty, otherwise exactly the named ones.
    pub fn select(&self, ids: &[String]) -> Result<Vec<SourceConfig>> {
        if ids.is_empty() {
            return Ok(self.sources.iter().filter(|s| s.enabled).cloned().collect());
        }
        ids.iter()
            .map(|id| {
                self.get(id)
                    .cloned()
                    .with_context(|| format!("unknown source {id}"))
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub sender: String,
    pub app_password: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub recipients: Vec<String>,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("sender", &self.sender)
            .field("app_password", &"<redacted>")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("recipients", &self.recipients)
            .finish()
    }
}

impl SmtpConfig {
    /// `None` unless sender, app password and at least one recipient are all set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let sender = non_empty("SNAPWATCH_SMTP_SENDER");
        let app_password = non_empty("SNAPWATCH_SMTP_APP_PASSWORD");
        let recipients: Vec<String> = non_empty("SNAPWATCH_SMTP_RECIPIENTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        match (sender, app_password) {
            (Some(sender), Some(app_password)) if !recipients.is_empty() => Some(Self {
                sender: sender.trim().to_string(),
                app_password,
                smtp_host: non_empty("SNAPWATCH_SMTP_HOST")
                    .unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string()),
                smtp_port: non_empty("SNAPWATCH_SMTP_PORT")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(DEFAULT_SMTP_PORT),
                recipients,
            }),
            (None, None) if recipients.is_empty() => None,
            _ => {
                warn!("smtp settings incomplete (need sender, app password and recipients); email disabled");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub save_pages: bool,
    pub smtp: Option<SmtpConfig>,
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("SNAPWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        Self {
            artifacts_dir: lookup("SNAPWATCH_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("artifacts")),
            sources_path: lookup("SNAPWATCH_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            user_agent: lookup("SNAPWATCH_USER_AGENT").unwrap_or_else(|| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string()
            }),
            http_timeout_secs: lookup("SNAPWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            save_pages: lookup("SNAPWATCH_SAVE_PAGES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            smtp: SmtpConfig::from_lookup(&lookup),
            data_dir,
        }
    }

    pub fn source_dir(&self, source_id: &str) -> PathBuf {
        self.data_dir.join(source_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mailbox {address:?}: {reason}")]
    Address { address: String, reason: String },
    #[error("building message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp delivery: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Mails notifications over implicit-TLS SMTP with app-password login.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse::<Mailbox>().map_err(|e| NotifyError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let from = parse_mailbox(&config.sender)?;
        let to = config
            .recipients
            .iter()
            .map(|r| parse_mailbox(r))
            .collect::<Result<Vec<_>, _>>()?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)?
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.sender.clone(),
                config.app_password.clone(),
            ))
            .build();
        Ok(Self { transport, from, to })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        let message = builder.body(notification.body.clone())?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Used when SMTP is not configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(subject = %notification.subject, body = %notification.body, "notification");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FearGreedBand {
    ExtremeFear,
    Fear,
    MildFear,
    MildGreed,
    Greed,
    ExtremeGreed,
}

impl FearGreedBand {
    /// Most extreme band the value falls in; `None` inside the neutral zone (45, 56).
    pub fn classify(value: f64) -> Option<Self> {
        [
            Self::ExtremeFear,
            Self::Fear,
            Self::MildFear,
            Self::ExtremeGreed,
            Self::Greed,
            Self::MildGreed,
        ]
        .into_iter()
        .find(|band| band.contains(value))
    }

    pub fn threshold(self) -> f64 {
        match self {
            Self::ExtremeFear => 28.0,
            Self::Fear => 38.0,
            Self::MildFear => 45.0,
            Self::MildGreed => 56.0,
            Self::Greed => 65.0,
            Self::ExtremeGreed => 78.0,
        }
    }

    fn is_fear(self) -> bool {
        matches!(self, Self::ExtremeFear | Self::Fear | Self::MildFear)
    }

    fn contains(self, value: f64) -> bool {
        if self.is_fear() {
            value <= self.threshold()
        } else {
            value >= self.threshold()
        }
    }

    pub fn describe(self) -> String {
        let side = if self.is_fear() { "at or below" } else { "at or above" };
        format!("{side} {}", self.threshold())
    }
}

/// Renders one message per direction for the events worth announcing.
pub fn render_notifications(
    source: &SourceConfig,
    schema: &EntitySchema,
    reconciliation: &Reconciliation,
) -> Vec<Notification> {
    match source.kind {
        SourceKind::FearGreed => render_fear_greed(source, reconciliation),
        SourceKind::PumpFun | SourceKind::FourMeme => [Direction::Added, Direction::Removed]
            .into_iter()
            .filter_map(|direction| render_listing(source, schema, reconciliation, direction))
            .collect(),
    }
}

fn render_listing(
    source: &SourceConfig,
    schema: &EntitySchema,
    reconciliation: &Reconciliation,
    direction: Direction,
) -> Option<Notification> {
    let events: Vec<_> = reconciliation.notifiable(direction).collect();
    if events.is_empty() {
        return None;
    }
    let stamp = reconciliation.reconciled_at.format("%Y-%m-%d %H:%M:%S UTC");
    let (subject, intro) = match direction {
        Direction::Added => (
            format!("{}: {} new listing(s) - {stamp}", source.display_name, events.len()),
            format!("New listings found on {}:", source.display_name),
        ),
        Direction::Removed => (
            format!("{}: {} listing(s) removed - {stamp}", source.display_name, events.len()),
            format!("These listings are no longer on {}:", source.display_name),
        ),
    };

    let mut body = format!("{intro}\n\n");
    for event in events {
        body.push_str(schema.label_of(&event.record));
        body.push('\n');
        for column in &schema.columns {
            if schema.label_field.as_deref() == Some(column.as_str()) {
                continue;
            }
            if let Some(value) = event.record.get(column).filter(|v| !v.is_empty()) {
                body.push_str(&format!("  {column}: {value}\n"));
            }
        }
        body.push_str(&"-".repeat(SEPARATOR_WIDTH));
        body.push('\n');
    }
    Some(Notification { subject, body })
}

fn render_fear_greed(source: &SourceConfig, reconciliation: &Reconciliation) -> Vec<Notification> {
    reconciliation
        .notifiable(Direction::Added)
        .filter_map(|event| {
            let raw = event.record.get("value")?;
            let value: f64 = match raw.trim().parse() {
                Ok(value) => value,
                Err(_) => {
                    warn!(value = raw, "fear & greed value is not a number");
                    return None;
                }
            };
            let Some(band) = FearGreedBand::classify(value) else {
                debug!(value, "fear & greed reading inside the neutral zone");
                return None;
            };
            let date = event.record.get("date").unwrap_or_default();
            let rating = event.record.get("rating").unwrap_or_default();
            let updated = event.record.get("last_update").unwrap_or_default();
            Some(Notification {
                subject: format!("{} alert [{raw}]", source.display_name),
                body: format!(
                    "Fear & Greed Index on {date}: {raw} ({rating})\nThreshold: {}\nLast update: {updated}\n",
                    band.describe()
                ),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub sent: usize,
    pub failed: usize,
}

/// Delivery failures are logged and counted, never propagated: the views are
/// already committed when the gate runs.
pub struct NotificationGate {
    notifier: Box<dyn Notifier>,
}

impl NotificationGate {
    pub fn new(notifier: Box<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub async fn dispatch(
        &self,
        source: &SourceConfig,
        schema: &EntitySchema,
        reconciliation: &Reconciliation,
    ) -> GateReport {
        let mut report = GateReport::default();
        for notification in render_notifications(source, schema, reconciliation) {
            match self.notifier.send(&notification).await {
                Ok(()) => {
                    report.sent += 1;
                    info!(source_id = %source.source_id, subject = %notification.subject, "notification sent");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        source_id = %source.source_id,
                        subject = %notification.subject,
                        error = %err,
                        "notification delivery failed"
                    );
                }
            }
        }
        report
    }
}

/// Process-wide resources shared by every scan.
pub struct WatchContext {
    config: WatchConfig,
    http: HttpFetcher,
    artifacts: ArtifactStore,
    gate: NotificationGate,
}

impl WatchContext {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let notifier: Box<dyn Notifier> = match &config.smtp {
            Some(smtp) => {
                info!(host = %smtp.smtp_host, port = smtp.smtp_port, recipients = smtp.recipients.len(), "email notifications enabled");
                Box::new(SmtpNotifier::new(smtp).context("configuring smtp notifier")?)
            }
            None => {
                info!("smtp not configured, notifications go to the log");
                Box::<LogNotifier>::default()
            }
        };
        Ok(Self {
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            http,
            gate: NotificationGate::new(notifier),
            config,
        })
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.gate = NotificationGate::new(notifier);
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn view_store(&self, source: &SourceConfig, schema: EntitySchema) -> ViewStore {
        ViewStore::new(self.config.source_dir(&source.source_id), schema)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    Reconciled,
    /// Page parsed, but nothing in it carried a natural key.
    EmptySnapshot,
    /// Fetching or parsing failed; handled like an empty snapshot.
    ScrapeFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ScanOutcome,
    pub records: usize,
    pub added: usize,
    pub removed: usize,
    pub audited: usize,
    pub notifications: GateReport,
    pub artifact_path: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
}

impl ScanSummary {
    fn started(scan: &ScanContext, source: &SourceConfig) -> Self {
        Self {
            run_id: scan.run_id,
            source_id: source.source_id.clone(),
            started_at: scan.fetched_at,
            finished_at: scan.fetched_at,
            outcome: ScanOutcome::Reconciled,
            records: 0,
            added: 0,
            removed: 0,
            audited: 0,
            notifications: GateReport::default(),
            artifact_path: None,
            snapshot_path: None,
        }
    }

    fn finish(mut self, outcome: ScanOutcome) -> Self {
        self.outcome = outcome;
        self.finished_at = Utc::now();
        self
    }
}

async fn fetch_source_page(
    ctx: &WatchContext,
    adapter: &dyn SnapshotSource,
    scan: &ScanContext,
    source: &SourceConfig,
) -> Result<FetchedPage> {
    match source.mode {
        SourceMode::Live => {
            let url = source
                .url
                .as_deref()
                .with_context(|| format!("source {} has no url", source.source_id))?;
            Ok(adapter
                .fetch_page(&ctx.http, scan, &source.source_id, url)
                .await?)
        }
        SourceMode::File => {
            let path = source
                .path
                .as_deref()
                .with_context(|| format!("source {} has no path", source.source_id))?;
            load_page_file(path, adapter.page_format(), scan.fetched_at).await
        }
    }
}

/// One full pass for one source: fetch, archive, parse, reconcile, commit, notify.
pub async fn scan_source(ctx: &WatchContext, source: &SourceConfig) -> Result<ScanSummary> {
    let adapter = adapter_for_kind(source.kind);
    let scan = ScanContext::new(Utc::now());
    let mut summary = ScanSummary::started(&scan, source);
    info!(run_id = %scan.run_id, source_id = %source.source_id, kind = %source.kind, "scan started");

    let page = match fetch_source_page(ctx, adapter.as_ref(), &scan, source).await {
        Ok(page) => page,
        Err(err) => {
            warn!(
                source_id = %source.source_id,
                error = %format!("{err:#}"),
                "scrape failed, leaving views untouched"
            );
            return Ok(summary.finish(ScanOutcome::ScrapeFailed));
        }
    };

    if ctx.config.save_pages && source.mode == SourceMode::Live {
        match ctx
            .artifacts
            .store_bytes(
                page.fetched_at,
                &source.source_id,
                adapter.page_format().extension(),
                &page.body,
            )
            .await
        {
            Ok(stored) => {
                debug!(path = %stored.absolute_path.display(), deduplicated = stored.deduplicated, "raw page archived");
                summary.artifact_path = Some(stored.absolute_path);
            }
            Err(err) => warn!(source_id = %source.source_id, error = %format!("{err:#}"), "could not archive raw page"),
        }
    }

    reconcile_page(ctx, source, adapter.as_ref(), &page, summary).await
}

/// Reconciles a page saved on disk instead of fetching the source.
pub async fn ingest_page_file(
    ctx: &WatchContext,
    source: &SourceConfig,
    path: &Path,
) -> Result<ScanSummary> {
    let adapter = adapter_for_kind(source.kind);
    let scan = ScanContext::new(Utc::now());
    let page = load_page_file(path, adapter.page_format(), scan.fetched_at).await?;
    info!(run_id = %scan.run_id, source_id = %source.source_id, path = %path.display(), "ingesting saved page");
    reconcile_page(ctx, source, adapter.as_ref(), &page, ScanSummary::started(&scan, source)).await
}

async fn reconcile_page(
    ctx: &WatchContext,
    source: &SourceConfig,
    adapter: &dyn SnapshotSource,
    page: &FetchedPage,
    mut summary: ScanSummary,
) -> Result<ScanSummary> {
    let schema = adapter.schema();
    let records = match adapter.parse_page(page) {
        Ok(records) => records,
        Err(err) => {
            warn!(source_id = %source.source_id, error = %err, "page could not be parsed, leaving views untouched");
            return Ok(summary.finish(ScanOutcome::ScrapeFailed));
        }
    };
    summary.records = records.len();
    let store = ctx.view_store(source, schema.clone());

    if !records.is_empty() {
        match export_snapshot(store.dir(), &source.source_id, schema, &records, page.fetched_at).await {
            Ok(path) => summary.snapshot_path = Some(path),
            Err(err) => warn!(source_id = %source.source_id, error = %err, "could not write dated snapshot"),
        }
    }

    let latest = match store.load_latest().await {
        Ok(latest) => latest,
        Err(err) => {
            warn!(source_id = %source.source_id, error = %err, "latest view unreadable, reconciling against an empty view");
            LatestView::new()
        }
    };
    let history_keys = store
        .load_history_keys()
        .await
        .with_context(|| format!("loading history of {}", source.source_id))?;

    let reconciliation = match Reconciler::new(schema).reconcile(&records, &latest, &history_keys, Utc::now()) {
        Ok(reconciliation) => reconciliation,
        Err(ReconcileError::EmptySnapshot { records, unkeyed, key_field }) => {
            if records == 0 {
                warn!(source_id = %source.source_id, "page yielded no records; layout change or empty listing, views left untouched");
            } else {
                warn!(source_id = %source.source_id, records, unkeyed, %key_field, "no record carried a natural key, views left untouched");
            }
            return Ok(summary.finish(ScanOutcome::EmptySnapshot));
        }
    };
    summary.added = reconciliation.count(Direction::Added);
    summary.removed = reconciliation.count(Direction::Removed);

    let commit = store
        .commit(&reconciliation)
        .await
        .with_context(|| format!("committing views of {}", source.source_id))?;
    summary.audited = commit.audit_appended;
    info!(
        source_id = %source.source_id,
        action = reconciliation.action.as_str(),
        added = summary.added,
        removed = summary.removed,
        history_appended = commit.history_appended,
        audit_appended = commit.audit_appended,
        latest_rows = commit.latest_rows,
        "views committed"
    );

    summary.notifications = ctx.gate.dispatch(source, schema, &reconciliation).await;
    Ok(summary.finish(ScanOutcome::Reconciled))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndTimeError {
    #[error("end time {0:?} is neither `YYYY-MM-DD HH:MM:SS` nor `HH:MM`")]
    Malformed(String),
    #[error("end time {0:?} does not exist in the local time zone")]
    Nonexistent(String),
}

/// Accepts `YYYY-MM-DD HH:MM:SS`, or `HH:MM` meaning the next occurrence of that time.
pub fn parse_end_time<Tz: TimeZone>(
    raw: &str,
    now: &DateTime<Tz>,
) -> Result<DateTime<Tz>, EndTimeError> {
    let raw = raw.trim();
    let tz = now.timezone();
    let resolve = |naive: NaiveDateTime| {
        tz.from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| EndTimeError::Nonexistent(raw.to_string()))
    };

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return resolve(naive);
    }
    let time = NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| EndTimeError::Malformed(raw.to_string()))?;
    let today = now.naive_local().date().and_time(time);
    let candidate = resolve(today)?;
    if candidate > *now {
        Ok(candidate)
    } else {
        resolve(today + chrono::Duration::days(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    RunOnce,
    EndTime,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverReport {
    pub iterations: usize,
    pub scans: usize,
    pub failed_scans: usize,
    pub stop_reason: StopReason,
}

/// Repeats sequential scan passes over the selected sources.
#[derive(Debug, Clone)]
pub struct ScanDriver {
    pub interval: Duration,
    pub end_time: Option<DateTime<Local>>,
    pub run_once: bool,
}

impl ScanDriver {
    /// Runs until the end time, after one pass in run-once mode, or until Ctrl-C.
    pub async fn run(&self, ctx: &WatchContext, sources: &[SourceConfig]) -> DriverReport {
        let (tx, rx) = watch::channel(false);
        let listener = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, stopping after the current scan");
                    let _ = tx.send(true);
                }
                Err(err) => {
                    warn!(error = %err, "cannot listen for ctrl-c");
                    tx.closed().await;
                }
            }
        });
        let report = self.run_until(ctx, sources, rx).await;
        listener.abort();
        report
    }

    /// Like [`ScanDriver::run`], stopping once `shutdown` turns true. Scans in flight always finish.
    pub async fn run_until(
        &self,
        ctx: &WatchContext,
        sources: &[SourceConfig],
        mut shutdown: watch::Receiver<bool>,
    ) -> DriverReport {
        let mut report = DriverReport {
            iterations: 0,
            scans: 0,
            failed_scans: 0,
            stop_reason: StopReason::RunOnce,
        };

        loop {
            if let Some(end) = self.end_time {
                if Local::now() >= end {
                    info!(end_time = %end, "end time reached");
                    report.stop_reason = StopReason::EndTime;
                    break;
                }
            }

            report.iterations += 1;
            info!(iteration = report.iterations, sources = sources.len(), "scan pass started");
            for source in sources {
                report.scans += 1;
                match scan_source(ctx, source).await {
                    Ok(summary) => info!(
                        source_id = %summary.source_id,
                        outcome = ?summary.outcome,
                        records = summary.records,
                        added = summary.added,
                        removed = summary.removed,
                        "scan finished"
                    ),
                    Err(err) => {
                        report.failed_scans += 1;
                        error!(source_id = %source.source_id, error = %format!("{err:#}"), "scan failed");
                    }
                }
            }

            if self.run_once {
                report.stop_reason = StopReason::RunOnce;
                break;
            }
            if *shutdown.borrow() {
                report.stop_reason = StopReason::Interrupted;
                break;
            }

            let next_run = chrono::Duration::from_std(self.interval)
                .ok()
                .and_then(|step| Local::now().checked_add_signed(step));
            if let Some(end) = self.end_time {
                if next_run.map_or(true, |next| next >= end) {
                    info!(end_time = %end, "next pass would start past the end time");
                    report.stop_reason = StopReason::EndTime;
                    break;
                }
            }
            if let Some(next) = next_run {
                info!(next_run = %next.format("%Y-%m-%d %H:%M:%S"), "waiting for next pass");
            }

            if wait_for_next_pass(self.interval, &mut shutdown).await {
                report.stop_reason = StopReason::Interrupted;
                break;
            }
        }

        info!(
            iterations = report.iterations,
            scans = report.scans,
            failed_scans = report.failed_scans,
            stop_reason = ?report.stop_reason,
            "scan loop stopped"
        );
        report
    }
}

/// `true` when shutdown was requested during the wait.
async fn wait_for_next_pass(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return true,
                Ok(()) => continue,
                Err(_) => {
                    (&mut sleep).await;
                    return false;
                }
            },
        }
    }
}

/// Markdown overview of the stored views of each source.
pub async fn report_markdown(
    config: &WatchConfig,
    sources: &[SourceConfig],
    events: usize,
) -> Result<String> {
    let mut lines = vec!["# Snapshot Watch Report".to_string(), String::new()];
    for source in sources {
        let schema = adapter_for_kind(source.kind).schema().clone();
        let store = ViewStore::new(config.source_dir(&source.source_id), schema);
        let latest = store
            .load_latest()
            .await
            .with_context(|| format!("reading latest view of {}", source.source_id))?;
        let history = store
            .load_history()
            .await
            .with_context(|| format!("reading history of {}", source.source_id))?;
        let audit = store
            .load_audit()
            .await
            .with_context(|| format!("reading audit of {}", source.source_id))?;
        let added = audit
            .iter()
            .filter(|row| row.change_type == Direction::Added)
            .count();

        lines.push(format!("## {} (`{}`)", source.display_name, source.source_id));
        lines.push(format!("- kind: {}", source.kind));
        lines.push(format!("- latest entities: {}", latest.len()));
        lines.push(format!("- ever seen: {}", history.len()));
        lines.push(format!(
            "- audit events: {} ({added} added, {} removed)",
            audit.len(),
            audit.len() - added
        ));
        if let Some(last_seen) = history.iter().map(|entry| entry.last_seen).max() {
            lines.push(format!("- last seen: {}", last_seen.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        if events > 0 && !audit.is_empty() {
            lines.push(String::new());
            lines.push("Recent events:".to_string());
            for row in audit.iter().rev().take(events) {
                lines.push(format!(
                    "- {} {} `{}` ({})",
                    row.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    row.change_type,
                    row.key,
                    row.action.as_str()
                ));
            }
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
