//! Integration tests for cancellation support in HarvestService.

use std::time::Duration;

use rollcall_core::progress::SilentReporter;
use rollcall_core::{EntityId, HarvestConfig, HarvestService};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{
    CN_SHEET, MockPortalClient, MockStoreFactory, Spreadsheet, test_config,
};

fn keys(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("E{:02}", i)).collect()
}

fn entity_ids(keys: &[String]) -> Vec<EntityId> {
    keys.iter().map(|k| EntityId::from(k.as_str())).collect()
}

fn spreadsheet(keys: &[String]) -> Spreadsheet {
    let sheet = Spreadsheet::new();
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    sheet.seed_keys(CN_SHEET, 1, 11, &refs);
    sheet
}

fn sequential_config() -> HarvestConfig {
    HarvestConfig {
        concurrency: 1,
        ..test_config()
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_before_start() {
    // Arrange
    let keys = keys(3);
    let sheet = spreadsheet(&keys);
    let factory = MockStoreFactory::new(sheet.clone());
    let service = HarvestService::from_factory(MockPortalClient::new(), &factory, test_config())
        .unwrap();

    let token = CancellationToken::new();
    token.cancel(); // Cancel immediately

    // Act
    let summary = service
        .run_cancellable(entity_ids(&keys), &SilentReporter, token)
        .await
        .unwrap();

    // Assert
    assert!(summary.cancelled, "Summary should be marked cancelled");
    assert_eq!(summary.total(), 0, "Should have processed 0 entities");
    assert!(sheet.calls().is_empty(), "Sheets must stay untouched");
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_processing() {
    // Arrange: 10 entities, one at a time, 100ms each.
    let keys = keys(10);
    let sheet = spreadsheet(&keys);
    let factory = MockStoreFactory::new(sheet.clone());
    let portal = MockPortalClient::new().with_delay(Duration::from_millis(100));
    let service = HarvestService::from_factory(portal, &factory, sequential_config()).unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(250)).await;
        trigger.cancel();
    });

    // Act
    let summary = service
        .run_cancellable(entity_ids(&keys), &SilentReporter, token)
        .await
        .unwrap();

    // Assert
    assert!(summary.cancelled);
    assert!(summary.total() >= 1, "In-flight fetches should finish");
    assert!(summary.total() < 10, "Cancellation should stop new fetches");
    // Whatever was fetched still reached the sheet.
    assert_eq!(summary.cells_written(), summary.successes());
    assert_eq!(sheet.get(CN_SHEET, 3, 11).as_deref(), Some("01.5 %"));
    assert_eq!(sheet.get(CN_SHEET, 3, 20), None);
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_cancels_run() {
    // Arrange
    let keys = keys(10);
    let sheet = spreadsheet(&keys);
    let factory = MockStoreFactory::new(sheet.clone());
    let portal = MockPortalClient::new().with_delay(Duration::from_millis(400));
    let config = HarvestConfig {
        run_timeout_secs: Some(1),
        ..sequential_config()
    };
    let service = HarvestService::from_factory(portal, &factory, config).unwrap();
    let token = CancellationToken::new();

    // Act
    let summary = service
        .run_cancellable(
            entity_ids(&keys),
            &SilentReporter,
            token.clone(),
        )
        .await
        .unwrap();

    // Assert
    assert!(summary.cancelled);
    assert!(summary.total() < 10);
    assert_eq!(summary.cells_written(), summary.successes());
    assert!(
        !token.is_cancelled(),
        "The run deadline must not cancel the caller's token"
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_not_reached() {
    let keys = keys(3);
    let factory = MockStoreFactory::new(spreadsheet(&keys));
    let portal = MockPortalClient::new().with_delay(Duration::from_millis(10));
    let config = HarvestConfig {
        run_timeout_secs: Some(60),
        ..test_config()
    };
    let service = HarvestService::from_factory(portal, &factory, config).unwrap();

    let summary = service
        .run(entity_ids(&keys))
        .await
        .unwrap();

    assert!(!summary.cancelled);
    assert_eq!(summary.successes(), 3);
}
