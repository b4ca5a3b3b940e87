use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use snapwatch_adapters::{adapter_for_kind, fear_greed_schema, load_page_file, pump_fun_schema, SourceKind};
use snapwatch_core::Direction;
use snapwatch_storage::ViewStore;
use snapwatch_sync::{
    ingest_page_file, report_markdown, scan_source, GateReport, Notification, Notifier,
    NotifyError, ScanDriver, ScanOutcome, SourceConfig, SourceMode, SourceRegistry, StopReason,
    WatchConfig, WatchContext,
};
use tempfile::TempDir;
use tokio::sync::watch;

fn fixture(rel: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(rel)
}

fn config(tmp: &TempDir) -> WatchConfig {
    WatchConfig {
        data_dir: tmp.path().join("data"),
        artifacts_dir: tmp.path().join("artifacts"),
        sources_path: tmp.path().join("sources.yaml"),
        user_agent: "snapwatch-test".to_string(),
        http_timeout_secs: 5,
        save_pages: false,
        smtp: None,
    }
}

fn file_source(id: &str, kind: SourceKind, path: PathBuf) -> SourceConfig {
    SourceConfig {
        source_id: id.to_string(),
        display_name: id.to_string(),
        enabled: true,
        kind,
        mode: SourceMode::File,
        url: None,
        path: Some(path),
        notes: None,
    }
}

type Sent = Arc<Mutex<Vec<Notification>>>;

struct Recording(Sent);

#[async_trait]
impl Notifier for Recording {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.0.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl Notifier for Failing {
    async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Err(NotifyError::Other("smtp unreachable".into()))
    }
}

fn recording_context(tmp: &TempDir) -> (WatchContext, Sent) {
    let sent: Sent = Arc::default();
    let ctx = WatchContext::new(config(tmp))
        .unwrap()
        .with_notifier(Box::new(Recording(sent.clone())));
    (ctx, sent)
}

fn use_page(page: &Path, fixture_rel: &str) {
    std::fs::copy(fixture(fixture_rel), page).unwrap();
}

async fn latest_len(ctx: &WatchContext, source: &SourceConfig) -> usize {
    ctx.view_store(source, pump_fun_schema())
        .load_latest()
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn board_changes_flow_through_views_and_notifications() {
    let tmp = TempDir::new().unwrap();
    let (ctx, sent) = recording_context(&tmp);
    let page = tmp.path().join("board.html");
    let source = file_source("pump-fun", SourceKind::PumpFun, page.clone());

    use_page(&page, "pump-fun/board.html");
    let first = scan_source(&ctx, &source).await.unwrap();
    assert_eq!(first.outcome, ScanOutcome::Reconciled);
    assert_eq!((first.records, first.added, first.removed, first.audited), (3, 3, 0, 3));
    assert_eq!(first.notifications, GateReport { sent: 1, failed: 0 });
    assert!(first.snapshot_path.as_ref().unwrap().exists());
    assert!(sent.lock().unwrap()[0].body.contains("FROG"));

    let again = scan_source(&ctx, &source).await.unwrap();
    assert_eq!((again.added, again.removed, again.audited), (0, 0, 0));
    assert_eq!(sent.lock().unwrap().len(), 1);

    use_page(&page, "pump-fun/board_without_carousel.html");
    let swapped = scan_source(&ctx, &source).await.unwrap();
    assert_eq!((swapped.added, swapped.removed, swapped.audited), (2, 3, 5));
    assert_eq!(swapped.notifications.sent, 2);
    assert_eq!(latest_len(&ctx, &source).await, 2);

    // Everything coming back is known from history: only the removals are announced.
    use_page(&page, "pump-fun/board.html");
    let back = scan_source(&ctx, &source).await.unwrap();
    assert_eq!((back.added, back.removed, back.audited), (3, 2, 2));
    {
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        assert!(sent[3].subject.contains("removed"));
    }

    let store = ViewStore::new(tmp.path().join("data/pump-fun"), pump_fun_schema());
    assert_eq!(store.load_history().await.unwrap().len(), 5);
    let audit = store.load_audit().await.unwrap();
    assert_eq!(audit.len(), 10);
    assert_eq!(audit.iter().filter(|r| r.change_type == Direction::Removed).count(), 5);
}

#[tokio::test]
async fn empty_page_leaves_views_untouched() {
    let tmp = TempDir::new().unwrap();
    let (ctx, sent) = recording_context(&tmp);
    let page = tmp.path().join("board.html");
    let source = file_source("pump-fun", SourceKind::PumpFun, page.clone());

    use_page(&page, "pump-fun/board.html");
    scan_source(&ctx, &source).await.unwrap();

    std::fs::write(&page, "<html><body><p>maintenance</p></body></html>").unwrap();
    let summary = scan_source(&ctx, &source).await.unwrap();
    assert_eq!(summary.outcome, ScanOutcome::EmptySnapshot);
    assert_eq!(summary.removed, 0);
    assert_eq!(latest_len(&ctx, &source).await, 3);
    assert_eq!(sent.lock().unwrap().len(), 1);

    std::fs::remove_file(&page).unwrap();
    let missing = scan_source(&ctx, &source).await.unwrap();
    assert_eq!(missing.outcome, ScanOutcome::ScrapeFailed);
    assert_eq!(latest_len(&ctx, &source).await, 3);
}

#[tokio::test]
async fn reloaded_latest_keeps_every_scraped_field() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _sent) = recording_context(&tmp);
    let page = fixture("pump-fun/board_without_carousel.html");
    let source = file_source("pump-fun", SourceKind::PumpFun, page.clone());
    scan_source(&ctx, &source).await.unwrap();

    let adapter = adapter_for_kind(SourceKind::PumpFun);
    let scraped = adapter
        .parse_page(&load_page_file(&page, adapter.page_format(), chrono::Utc::now()).await.unwrap())
        .unwrap();
    let store = ctx.view_store(&source, pump_fun_schema());
    let latest = store.load_latest().await.unwrap();
    let reloaded: Vec<_> = latest.records().cloned().collect();
    assert_eq!(reloaded, scraped);
    assert_eq!(reloaded[0].get("symbol"), Some("DOGEK"));
    assert_eq!(reloaded[1].get("symbol"), None);

    let history = store.load_history().await.unwrap();
    assert_eq!(history[0].record.get("symbol"), Some("DOGEK"));
}

#[tokio::test]
async fn unreadable_latest_is_rebuilt_without_notifying() {
    let tmp = TempDir::new().unwrap();
    let (ctx, sent) = recording_context(&tmp);
    let source = file_source("pump-fun", SourceKind::PumpFun, fixture("pump-fun/board.html"));
    scan_source(&ctx, &source).await.unwrap();
    assert_eq!(sent.lock().unwrap().len(), 1);

    let latest_path = tmp.path().join("data/pump-fun/latest.csv");
    std::fs::write(&latest_path, "a,b\n1,2,3\n").unwrap();

    let rescan = scan_source(&ctx, &source).await.unwrap();
    assert_eq!(rescan.outcome, ScanOutcome::Reconciled);
    assert_eq!((rescan.added, rescan.removed, rescan.audited), (3, 0, 0));
    assert_eq!(rescan.notifications, GateReport::default());
    assert_eq!(sent.lock().unwrap().len(), 1);
    assert_eq!(latest_len(&ctx, &source).await, 3);
    assert!(std::fs::read_to_string(&latest_path).unwrap().starts_with("name,"));
}

#[tokio::test]
async fn failed_delivery_keeps_committed_views() {
    let tmp = TempDir::new().unwrap();
    let ctx = WatchContext::new(config(&tmp))
        .unwrap()
        .with_notifier(Box::new(Failing));
    let source = file_source("pump-fun", SourceKind::PumpFun, fixture("pump-fun/board.html"));

    let summary = scan_source(&ctx, &source).await.unwrap();
    assert_eq!(summary.notifications, GateReport { sent: 0, failed: 1 });
    assert_eq!(summary.audited, 3);
    assert_eq!(latest_len(&ctx, &source).await, 3);
}

#[tokio::test]
async fn unreadable_history_fails_only_that_source() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _sent) = recording_context(&tmp);
    let broken = file_source("broken", SourceKind::PumpFun, fixture("pump-fun/board.html"));
    let healthy = file_source("healthy", SourceKind::PumpFun, fixture("pump-fun/board.html"));

    let broken_dir = tmp.path().join("data/broken");
    std::fs::create_dir_all(&broken_dir).unwrap();
    std::fs::write(broken_dir.join("history.csv"), "name,ca_address\nFROG,abc\n").unwrap();

    assert!(scan_source(&ctx, &broken).await.is_err());

    let driver = ScanDriver {
        interval: Duration::from_secs(3600),
        end_time: None,
        run_once: true,
    };
    let report = driver.run(&ctx, &[broken.clone(), healthy.clone()]).await;
    assert_eq!(report.iterations, 1);
    assert_eq!(report.scans, 2);
    assert_eq!(report.failed_scans, 1);
    assert_eq!(report.stop_reason, StopReason::RunOnce);
    assert_eq!(latest_len(&ctx, &healthy).await, 3);
    assert_eq!(latest_len(&ctx, &broken).await, 0);
}

#[tokio::test]
async fn driver_stops_on_shutdown_and_end_time() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _sent) = recording_context(&tmp);
    let sources = vec![file_source(
        "pump-fun",
        SourceKind::PumpFun,
        fixture("pump-fun/board.html"),
    )];

    let (_tx, rx) = watch::channel(true);
    let looping = ScanDriver {
        interval: Duration::from_secs(3600),
        end_time: None,
        run_once: false,
    };
    let report = looping.run_until(&ctx, &sources, rx).await;
    assert_eq!(report.iterations, 1);
    assert_eq!(report.stop_reason, StopReason::Interrupted);

    let (_tx, rx) = watch::channel(false);
    let expired = ScanDriver {
        end_time: Some(Local::now() - chrono::Duration::minutes(1)),
        ..looping.clone()
    };
    let report = expired.run_until(&ctx, &sources, rx).await;
    assert_eq!(report.iterations, 0);
    assert_eq!(report.stop_reason, StopReason::EndTime);

    let (_tx, rx) = watch::channel(false);
    let closing_soon = ScanDriver {
        end_time: Some(Local::now() + chrono::Duration::minutes(5)),
        ..looping
    };
    let report = closing_soon.run_until(&ctx, &sources, rx).await;
    assert_eq!(report.iterations, 1);
    assert_eq!(report.stop_reason, StopReason::EndTime);
}

#[tokio::test]
async fn ingested_fear_greed_reading_raises_alert() {
    let tmp = TempDir::new().unwrap();
    let (ctx, sent) = recording_context(&tmp);
    let source = file_source(
        "cnn-fgi",
        SourceKind::FearGreed,
        fixture("cnn-fear-greed/graphdata.json"),
    );

    let summary = ingest_page_file(&ctx, &source, &fixture("cnn-fear-greed/graphdata.json"))
        .await
        .unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.notifications.sent, 1);
    assert!(sent.lock().unwrap()[0].subject.contains("[24.7]"));

    let latest = ctx
        .view_store(&source, fear_greed_schema())
        .load_latest()
        .await
        .unwrap();
    assert_eq!(latest.len(), 1);
}

#[tokio::test]
async fn report_lists_view_counts_and_recent_events() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _sent) = recording_context(&tmp);
    let source = file_source("pump-fun", SourceKind::PumpFun, fixture("pump-fun/board.html"));
    scan_source(&ctx, &source).await.unwrap();

    let markdown = report_markdown(ctx.config(), &[source], 2).await.unwrap();
    assert!(markdown.contains("## pump-fun (`pump-fun`)"));
    assert!(markdown.contains("- latest entities: 3"));
    assert!(markdown.contains("- audit events: 3 (3 added, 0 removed)"));
    assert_eq!(markdown.matches(" added `").count(), 2);
}

#[tokio::test]
async fn workspace_registry_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
    let registry = SourceRegistry::load(&path).await.unwrap();
    let enabled = registry.select(&[]).unwrap();
    assert_eq!(enabled.len(), 3);
    assert!(enabled.iter().all(|s| s.mode == SourceMode::Live));
    assert_eq!(registry.get("pump-fun-saved").unwrap().kind, SourceKind::PumpFun);
}
