//! End-to-end allocation properties: concurrent buyers never share a unit, sequences stay
//! gapless, holds are exclusive until they lapse, and failed batches leave nothing sold.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use boxoffice::batch::BatchRequest;
use boxoffice::clock::{Clock, ManualClock, SystemClock};
use boxoffice::db::InventoryStore;
use boxoffice::db::in_memory::InMemoryStore;
use boxoffice::db::postgres::PgStore;
use boxoffice::descriptor::{NewPool, Pool, SeatLayout, SeatRow};
use boxoffice::settlement::SettlementBridge;
use boxoffice::types::{AllocationMode, UnitState};
use boxoffice::{BoxOffice, Config, Error};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn config() -> Config {
    let mut config = Config::default();
    config.tickets.secret_key = Some("integration-test-secret".to_string());
    config
}

fn boxoffice<S: InventoryStore>(store: S, clock: Arc<dyn Clock>) -> BoxOffice<S> {
    BoxOffice::new(&config(), Arc::new(store), clock).unwrap()
}

fn seats(rows: &[(&str, u32)]) -> NewPool {
    NewPool {
        event_id: Uuid::new_v4(),
        name: "Main floor".into(),
        mode: AllocationMode::Seat,
        layout: Some(SeatLayout::new(rows.iter().map(|(row, columns)| SeatRow::new(*row, *columns)).collect())),
        quantity: None,
        prefix: None,
        unit_price: Decimal::new(5000, 2),
    }
}

fn numbered(mode: AllocationMode, quantity: Option<u32>) -> NewPool {
    NewPool {
        event_id: Uuid::new_v4(),
        name: "Numbered".into(),
        mode,
        layout: None,
        quantity,
        prefix: Some("N-".into()),
        unit_price: Decimal::new(1200, 2),
    }
}

async fn race_for_one_seat<S: InventoryStore>(boxoffice: &BoxOffice<S>, buyers: usize) {
    let pool_id = boxoffice.inventory.create_pool(seats(&[("A", 10)])).await.unwrap().id;

    let attempts = (0..buyers).map(|_| {
        let allocator = boxoffice.allocator.clone();
        tokio::spawn(async move { allocator.allocate(pool_id, Uuid::new_v4(), Some("A5")).await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(|joined| joined.unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let losers = results.iter().filter(|r| matches!(r, Err(Error::AlreadySold { .. }))).count();
    assert_eq!(winners, 1);
    assert_eq!(losers, buyers - 1);

    let units = boxoffice.allocator.store().list_units(pool_id).await.unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].state, UnitState::Sold);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_buyers_never_double_sell() {
    race_for_one_seat(&boxoffice(InMemoryStore::new(), Arc::new(SystemClock)), 64).await;
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL"]
async fn test_concurrent_buyers_never_double_sell_postgres(pool: sqlx::PgPool) {
    race_for_one_seat(&boxoffice(PgStore::new(pool), Arc::new(SystemClock)), 32).await;
}

async fn race_for_numbers<S: InventoryStore>(boxoffice: &BoxOffice<S>, capacity: u32, extra: u32) {
    let pool: Pool = boxoffice
        .inventory
        .create_pool(numbered(AllocationMode::Queue, Some(capacity)))
        .await
        .unwrap();
    let pool_id = pool.id;

    let attempts = (0..capacity + extra).map(|_| {
        let allocator = boxoffice.allocator.clone();
        tokio::spawn(async move { allocator.allocate(pool_id, Uuid::new_v4(), None).await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(|joined| joined.unwrap()).collect();

    let sold: HashSet<i64> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .filter_map(|unit| unit.sequence)
        .collect();
    let expected: HashSet<i64> = (1..=i64::from(capacity)).collect();
    assert_eq!(sold, expected);
    let sold_out = results.iter().filter(|r| matches!(r, Err(Error::SoldOut { .. }))).count();
    assert_eq!(sold_out, extra as usize);

    let labels: HashSet<String> = results.into_iter().filter_map(|r| r.ok()).map(|unit| unit.label).collect();
    assert_eq!(labels.len(), capacity as usize);
    assert!(labels.contains("N-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_sequence_is_gapless() {
    race_for_numbers(&boxoffice(InMemoryStore::new(), Arc::new(SystemClock)), 25, 15).await;
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL"]
async fn test_concurrent_sequence_is_gapless_postgres(pool: sqlx::PgPool) {
    race_for_numbers(&boxoffice(PgStore::new(pool), Arc::new(SystemClock)), 10, 5).await;
}

#[tokio::test]
async fn test_unlimited_general_pool_keeps_counting() {
    let boxoffice = boxoffice(InMemoryStore::new(), Arc::new(SystemClock));
    let pool = boxoffice
        .inventory
        .create_pool(numbered(AllocationMode::General, None))
        .await
        .unwrap();
    let units = boxoffice
        .batch
        .allocate_batch(pool.id, Uuid::new_v4(), &BatchRequest::count(AllocationMode::General, 40))
        .await
        .unwrap();
    assert_eq!(units.last().map(|u| u.label.as_str()), Some("N-40"));
}

#[tokio::test]
async fn test_hold_exclusivity_until_expiry() {
    let clock = Arc::new(ManualClock::starting_now());
    let boxoffice = boxoffice(InMemoryStore::new(), clock.clone());
    let pool = boxoffice.inventory.create_pool(seats(&[("A", 3)])).await.unwrap();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    assert_ok!(
        boxoffice
            .settlement
            .acquire_holds(pool.id, &["A1".to_string()], alice, Some(Duration::from_secs(120)))
            .await
    );
    let err = boxoffice.allocator.allocate(pool.id, bob, Some("A1")).await.unwrap_err();
    assert!(matches!(err, Error::HeldByOther { .. }));

    clock.advance(chrono::Duration::seconds(121));
    let report = boxoffice.sweeper().sweep_once().await.unwrap();
    assert_eq!(report.released, 1);
    let unit = assert_ok!(boxoffice.allocator.allocate(pool.id, bob, Some("A1")).await);
    assert_eq!(unit.owner_user_id, Some(bob));
}

#[tokio::test]
async fn test_release_is_idempotent_and_isolated() {
    let boxoffice = boxoffice(InMemoryStore::new(), Arc::new(ManualClock::starting_now()));
    let pool = boxoffice.inventory.create_pool(seats(&[("B", 4)])).await.unwrap();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let alice_seats = vec!["B1".to_string(), "B2".to_string()];

    boxoffice.settlement.acquire_holds(pool.id, &alice_seats, alice, None).await.unwrap();
    boxoffice
        .settlement
        .acquire_holds(pool.id, &["B3".to_string()], bob, None)
        .await
        .unwrap();

    assert_eq!(boxoffice.settlement.release_holds(pool.id, &alice_seats, alice).await.unwrap(), 2);
    let err = assert_err!(boxoffice.settlement.release_holds(pool.id, &alice_seats, alice).await);
    assert_eq!(err.kind(), boxoffice::ErrorKind::NotFound);

    let remaining = boxoffice.holds.holds_for_pool(pool.id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].holder_user_id, bob);
}

#[tokio::test]
async fn test_failed_batch_leaves_no_net_sales() {
    let boxoffice = boxoffice(InMemoryStore::new(), Arc::new(SystemClock));
    let pool = boxoffice.inventory.create_pool(seats(&[("C", 5)])).await.unwrap();
    boxoffice.allocator.allocate(pool.id, Uuid::new_v4(), Some("C3")).await.unwrap();

    let request = BatchRequest::seats(["C1", "C2", "C3", "C4", "C5"]);
    let err = boxoffice
        .settlement
        .allocate_batch(pool.id, Uuid::new_v4(), &request)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Batch item 2 failed (Already sold: C3); 2 allocated units rolled back");

    let availability = boxoffice.inventory.availability(pool.id).await.unwrap();
    assert_eq!(availability.sold, 1);
    assert_eq!(availability.available, Some(4));
}

#[tokio::test]
async fn test_refund_round_trip() {
    let boxoffice = boxoffice(InMemoryStore::new(), Arc::new(SystemClock));
    let pool = boxoffice.inventory.create_pool(seats(&[("D", 2)])).await.unwrap();
    let unit = boxoffice.settlement.allocate(pool.id, Uuid::new_v4(), Some("D1")).await.unwrap();

    assert_eq!(boxoffice.settlement.revert(&[unit.id]).await.unwrap(), 1);
    let reverted = boxoffice.allocator.store().get_unit(unit.id).await.unwrap().unwrap();
    assert_eq!(reverted.state, UnitState::Available);
    assert_eq!(reverted.owner_user_id, None);
    assert_eq!(reverted.validation_token, None);

    let buyer = Uuid::new_v4();
    let again = boxoffice.settlement.allocate(pool.id, buyer, Some("D1")).await.unwrap();
    assert_eq!(again.id, unit.id);
    assert_eq!(again.owner_user_id, Some(buyer));
}

/// Pool of one row of three; a 1s hold on A1 and A2 lapses and another buyer takes A1.
#[tokio::test]
async fn test_lapsed_hold_scenario() {
    let clock = Arc::new(ManualClock::starting_now());
    let boxoffice = boxoffice(InMemoryStore::new(), clock.clone());
    let pool = boxoffice.inventory.create_pool(seats(&[("A", 3)])).await.unwrap();
    let (user1, user2) = (Uuid::new_v4(), Uuid::new_v4());

    boxoffice
        .holds
        .acquire_holds(pool.id, &["A1".to_string(), "A2".to_string()], user1, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    clock.advance(chrono::Duration::milliseconds(1100));

    let unit = boxoffice.allocator.allocate(pool.id, user2, Some("A1")).await.unwrap();
    assert_eq!(unit.label, "A1");
    assert_eq!(unit.state, UnitState::Sold);
    assert_eq!(unit.owner_user_id, Some(user2));
}
