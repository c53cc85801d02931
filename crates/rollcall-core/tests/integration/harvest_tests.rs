//! Integration tests for HarvestService using mock implementations.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use rollcall_core::config::{ReferenceBlockConfig, SheetConfig, SheetMode};
use rollcall_core::progress::{HarvestEvent, ProgressReporter};
use rollcall_core::{AppError, CredentialRotator, EntityId, HarvestConfig, HarvestService};

use crate::integration::common::{
    CLASS_SHEET, CN_SHEET, MockPortalClient, MockStoreFactory, Script, Spreadsheet, ids,
    init_tracing, test_config,
};

const KEYS: [&str; 5] = ["E01", "E02", "E03", "E04", "E05"];

fn spreadsheet() -> Spreadsheet {
    let sheet = Spreadsheet::new();
    sheet.seed_keys(CN_SHEET, 1, 11, &KEYS);
    sheet
}

fn service(
    portal: MockPortalClient,
    factory: &MockStoreFactory,
    config: HarvestConfig,
) -> HarvestService<MockPortalClient, crate::integration::common::MockSheetStore> {
    HarvestService::from_factory(portal, factory, config).unwrap()
}

/// Class sheet with fixed columns plus the "classes held" reference block.
fn class_sheet() -> SheetConfig {
    let mut columns = BTreeMap::new();
    columns.insert("Overall %".to_string(), "F".to_string());
    columns.insert("CN".to_string(), "H".to_string());
    SheetConfig {
        name: CLASS_SHEET.to_string(),
        key_range: "B27:B91".to_string(),
        mode: SheetMode::Fixed { columns },
        clear: vec!["F27:H91".to_string()],
    }
}

#[derive(Default)]
struct EventLog {
    flushed: Mutex<Vec<(String, usize)>>,
    failed: Mutex<Vec<String>>,
    fetched: Mutex<Vec<usize>>,
}

impl ProgressReporter for EventLog {
    fn report(&self, event: HarvestEvent<'_>) {
        match event {
            HarvestEvent::BatchFlushed { sheet, cells } => {
                self.flushed.lock().unwrap().push((sheet.to_string(), cells));
            }
            HarvestEvent::FlushFailed { sheet, .. } => {
                self.failed.lock().unwrap().push(sheet.to_string());
            }
            HarvestEvent::EntityFetched { completed, .. } => {
                self.fetched.lock().unwrap().push(completed);
            }
            _ => {}
        }
    }
}

// =============================================================================
// End to end
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_run_with_one_failing_entity() {
    init_tracing();
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    let portal = MockPortalClient::new().with_script("E03", Script::AlwaysDown);
    let svc = service(portal.clone(), &factory, test_config());

    let summary = svc.run(ids(&KEYS)).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.total(), 5);
    assert_eq!(summary.successes(), 4);
    assert_eq!(summary.stats.failed_transient, 1);
    assert!(summary.failures.contains_key("E03"));
    assert_eq!(summary.cells_written(), 4);
    assert!(!summary.cancelled);

    // Inserted column C, one value per mapped row, header stamped.
    assert_eq!(sheet.get(CN_SHEET, 3, 11).as_deref(), Some("01.5 %"));
    assert_eq!(sheet.get(CN_SHEET, 3, 15).as_deref(), Some("05.5 %"));
    assert_eq!(sheet.get(CN_SHEET, 3, 13), None);
    assert_eq!(sheet.get(CN_SHEET, 3, 10), Some(summary.timestamp.clone()));

    // 4 single attempts plus 3 for E03, every session closed.
    assert_eq!(summary.stats.attempts, 7);
    assert_eq!(portal.sessions_opened.load(Ordering::SeqCst), 7);
    assert_eq!(portal.sessions_closed.load(Ordering::SeqCst), 7);
}

#[tokio::test(start_paused = true)]
async fn test_flaky_entity_recovers() {
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    let portal = MockPortalClient::new().with_script("E02", Script::FlakyThen(2));
    let svc = service(portal, &factory, test_config());

    let summary = svc.run(ids(&KEYS)).await.unwrap();

    assert_eq!(summary.successes(), 5);
    assert!(summary.failures.is_empty());
    assert_eq!(summary.stats.attempts, 7);
    assert_eq!(sheet.get(CN_SHEET, 3, 12).as_deref(), Some("02.5 %"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_login_is_not_retried() {
    let factory = MockStoreFactory::new(spreadsheet());
    let portal = MockPortalClient::new().with_script("E04", Script::Rejected);
    let svc = service(portal.clone(), &factory, test_config());

    let summary = svc.run(ids(&KEYS)).await.unwrap();

    assert_eq!(summary.stats.failed_permanent, 1);
    assert_eq!(summary.stats.attempts, 5);
    assert!(summary.failures["E04"].contains("Login rejected"));
}

#[tokio::test(start_paused = true)]
async fn test_unmapped_entity_is_reported_not_fatal() {
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    let svc = service(MockPortalClient::new(), &factory, test_config());

    let summary = svc.run(ids(&["E01", "X99"])).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.successes(), 2);
    assert_eq!(summary.unmapped.get("X99"), Some(&vec![CN_SHEET.to_string()]));
    assert_eq!(summary.stats.unmapped, 1);
    assert_eq!(summary.cells_written(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_run_still_prepares_sheets() {
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    let svc = service(MockPortalClient::new(), &factory, test_config());

    let summary = svc.run(Vec::<EntityId>::new()).await.unwrap();

    assert_eq!(summary.total(), 0);
    assert_eq!(summary.cells_written(), 0);
    let ops: Vec<_> = sheet.calls().iter().map(|c| c.op).collect();
    assert_eq!(ops, vec!["read", "insert", "cell"]);
}

// =============================================================================
// Incremental flushing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_flush_every_writes_incrementally() {
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    let config = HarvestConfig {
        flush_every: 2,
        ..test_config()
    };
    let svc = service(MockPortalClient::new(), &factory, config);
    let log = EventLog::default();

    let summary = svc.run_with_progress(ids(&KEYS), &log).await.unwrap();

    // Flushes after outcomes 2 and 4, then the final one.
    let flushed = log.flushed.lock().unwrap().clone();
    assert_eq!(flushed.len(), 3);
    assert_eq!(flushed.iter().map(|(_, n)| n).sum::<usize>(), 5);
    assert!(flushed.iter().all(|(s, _)| s == CN_SHEET));
    assert_eq!(summary.cells_written(), 5);
    assert_eq!(*log.fetched.lock().unwrap(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_coalesced_final_flush() {
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    let svc = service(MockPortalClient::new(), &factory, test_config());

    svc.run(ids(&KEYS)).await.unwrap();

    let writes: Vec<_> = sheet
        .calls()
        .into_iter()
        .filter(|c| c.op == "range")
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].target, "C11:C15");
}

// =============================================================================
// Reference blocks and fixed sheets
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_fixed_sheet_and_reference_block() {
    let sheet = spreadsheet();
    sheet.seed_keys(CLASS_SHEET, 2, 27, &["E02", "E01"]);
    let factory = MockStoreFactory::new(sheet.clone());
    let config = HarvestConfig {
        sheets: vec![
            crate::integration::common::cn_sheet(),
            class_sheet(),
        ],
        reference_blocks: vec![ReferenceBlockConfig {
            sheet: CLASS_SHEET.to_string(),
            entity: EntityId::from("E01"),
            anchor: "D8".to_string(),
            fields: vec![
                "CN.held".to_string(),
                "DAA.held".to_string(),
                "LIBRARY.held".to_string(),
            ],
            missing: Some("0".to_string()),
        }],
        ..test_config()
    };
    let svc = service(MockPortalClient::new(), &factory, config);

    let summary = svc.run(ids(&["E01", "E02"])).await.unwrap();

    assert!(summary.is_success());
    // Fixed columns F and H, rows from the class key column.
    assert_eq!(sheet.get(CLASS_SHEET, 6, 28).as_deref(), Some("75.0"));
    assert_eq!(sheet.get(CLASS_SHEET, 8, 28).as_deref(), Some("01.5 %"));
    assert_eq!(sheet.get(CLASS_SHEET, 8, 27).as_deref(), Some("02.5 %"));
    // Reference block from E01, missing subject padded.
    assert_eq!(sheet.get(CLASS_SHEET, 4, 8).as_deref(), Some("40"));
    assert_eq!(sheet.get(CLASS_SHEET, 4, 9).as_deref(), Some("35"));
    assert_eq!(sheet.get(CLASS_SHEET, 4, 10).as_deref(), Some("0"));
    // CN: 2 cells, class: 4 fixed + 3 block.
    assert_eq!(summary.cells_written(), 9);
}

#[tokio::test(start_paused = true)]
async fn test_clear_ranges_before_writing() {
    let sheet = spreadsheet();
    sheet.seed_keys(CLASS_SHEET, 2, 27, &["E01"]);
    sheet.seed_keys(CLASS_SHEET, 7, 27, &["stale"]);
    let factory = MockStoreFactory::new(sheet.clone());
    let config = HarvestConfig {
        sheets: vec![class_sheet()],
        ..test_config()
    };
    let svc = service(MockPortalClient::new(), &factory, config);

    svc.run(ids(&["E01"])).await.unwrap();

    assert_eq!(sheet.get(CLASS_SHEET, 7, 27), None);
    assert_eq!(sheet.get(CLASS_SHEET, 8, 27).as_deref(), Some("01.5 %"));
}

// =============================================================================
// Credential rotation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rotates_to_next_credential() {
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    factory.prepare("alpha").throttle(usize::MAX);
    let svc = service(MockPortalClient::new(), &factory, test_config());

    let summary = svc.run(ids(&KEYS)).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.cells_written(), 5);
    assert_eq!(summary.rotator.rotations, 1);
    assert_eq!(summary.rotator.cooldowns, 0);
    assert_eq!(summary.rotator.current, 1);
    assert_eq!(sheet.calls_by("alpha"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_when_every_credential_throttled() {
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    factory.prepare("alpha").throttle(1);
    factory.prepare("beta").throttle(1);
    let svc = service(MockPortalClient::new(), &factory, test_config());

    let summary = svc.run(ids(&KEYS)).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.rotator.cooldowns, 1);
    // Back on the credential the escalation started from.
    assert_eq!(summary.rotator.current, 0);
    assert_eq!(summary.cells_written(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_exhaustion_aborts_setup() {
    let factory = MockStoreFactory::new(spreadsheet());
    factory.prepare("alpha").throttle(usize::MAX);
    factory.prepare("beta").throttle(usize::MAX);
    let svc = service(MockPortalClient::new(), &factory, test_config());

    let err = svc.run(ids(&KEYS)).await.unwrap_err();

    assert!(matches!(err, AppError::RateLimitExceeded));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_during_flush_switches_credential() {
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    // Setup takes three calls (read, insert, header); the flush is throttled.
    factory.prepare("alpha").throttle_after(3, 1);
    let svc = service(MockPortalClient::new(), &factory, test_config());
    let log = EventLog::default();

    let summary = svc.run_with_progress(ids(&KEYS), &log).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.cells_written(), 5);
    assert!(log.failed.lock().unwrap().is_empty());
    assert_eq!(summary.rotator.rotations, 1);
    assert_eq!(sheet.calls_by("alpha"), 4);
    let beta: Vec<_> = sheet
        .calls()
        .into_iter()
        .filter(|c| c.credential == "beta")
        .collect();
    assert_eq!(beta.len(), 1);
    assert_eq!(beta[0].target, "C11:C15");
    assert_eq!(sheet.get(CN_SHEET, 3, 15).as_deref(), Some("05.5 %"));
}

#[test]
fn test_rotator_holds_every_credential() {
    let factory = MockStoreFactory::new(spreadsheet());
    let svc = service(MockPortalClient::new(), &factory, test_config());
    let rotator: &CredentialRotator<_> = svc.rotator();

    assert_eq!(rotator.len(), 2);
    assert!(factory.store("beta").is_some());
}

// =============================================================================
// Flush failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_sheet_does_not_block_others() {
    let sheet = spreadsheet();
    sheet.seed_keys(CLASS_SHEET, 2, 27, &KEYS);
    sheet.protect(CLASS_SHEET);
    let factory = MockStoreFactory::new(sheet.clone());
    let config = HarvestConfig {
        sheets: vec![crate::integration::common::cn_sheet(), class_sheet()],
        ..test_config()
    };
    let svc = service(MockPortalClient::new(), &factory, config);
    let log = EventLog::default();

    let summary = svc.run_with_progress(ids(&KEYS), &log).await.unwrap();

    assert!(!summary.is_success());
    assert_eq!(summary.failed_sheets(), 1);
    assert_eq!(summary.successes(), 5);
    let class = summary
        .sheets
        .iter()
        .find(|s| s.sheet == CLASS_SHEET)
        .unwrap();
    assert!(class.error.as_deref().unwrap().contains("protected"));
    assert_eq!(class.cells_written, 0);
    // CN still written.
    assert_eq!(sheet.get(CN_SHEET, 3, 11).as_deref(), Some("01.5 %"));
    assert_eq!(*log.failed.lock().unwrap(), vec![CLASS_SHEET.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_flush_failure_is_retried_at_end() {
    let sheet = spreadsheet();
    let factory = MockStoreFactory::new(sheet.clone());
    let config = HarvestConfig {
        flush_every: 2,
        ..test_config()
    };
    let svc = service(MockPortalClient::new(), &factory, config);
    sheet.protect(CN_SHEET);
    let log = EventLog::default();

    let summary = svc.run_with_progress(ids(&KEYS), &log).await.unwrap();

    // Both periodic flushes and the final one fail; nothing is dropped silently.
    assert_eq!(log.failed.lock().unwrap().len(), 3);
    assert!(!summary.is_success());
    assert_eq!(summary.cells_written(), 0);
}

// =============================================================================
// Construction
// =============================================================================

#[test]
fn test_from_factory_validates_config() {
    let factory = MockStoreFactory::new(Spreadsheet::new());
    let config = HarvestConfig {
        sheets: Vec::new(),
        ..test_config()
    };

    let result = HarvestService::from_factory(MockPortalClient::new(), &factory, config);

    assert!(matches!(result, Err(AppError::ConfigError(_))));
}

#[test]
fn test_from_factory_rejects_bad_credential() {
    let factory = MockStoreFactory::new(Spreadsheet::new());
    let config = HarvestConfig {
        credentials: vec!["alpha".to_string(), String::new()],
        ..test_config()
    };

    let result = HarvestService::from_factory(MockPortalClient::new(), &factory, config);

    assert!(matches!(result, Err(AppError::ConfigError(_))));
    assert!(factory.store("alpha").is_some());
}
