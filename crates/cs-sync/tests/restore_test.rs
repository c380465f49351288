mod common;

use common::*;
use cs_core::config::ReconcileConfig;
use cs_core::store::Store;
use cs_core::types::{CancellationReason, ReservationStatus};
use cs_harness::shutdown::CancelFlag;
use cs_sync::{ReconcileRequest, RestoreJob};

#[tokio::test]
async fn wrongly_cancelled_reservation_is_restored() {
    let store = Store::new_in_memory().await.unwrap();
    let fake = FakeChannel::with_reservations(vec![booked("R1", 5), booked("R2", 8), booked("R3", 12)]);
    let rec = reconciler(&store, &fake, ReconcileConfig::default());
    rec.run(ReconcileRequest::apply(), CancelFlag::new()).await.unwrap();

    // The source briefly answered 404 for R1, then it came back.
    let original = fake.reservations.lock().unwrap()[0].clone();
    fake.remove("R1");
    fake.remove("R3");
    let run = rec.run(ReconcileRequest::apply(), CancelFlag::new()).await.unwrap();
    assert_eq!(run.stats.reservations.cancelled, 2);
    fake.reservations.lock().unwrap().push(original);
    fake.hide("R1");

    let report = RestoreJob::new(store.clone(), guard(&fake))
        .run(CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.stats.examined, 2);
    assert_eq!(report.stats.restored, 1);
    assert_eq!(report.stats.still_cancelled, 1);
    assert_eq!(report.restored_ids, vec!["R1".to_string()]);

    let r1 = store.get_reservation_by_external_id("R1").await.unwrap().unwrap();
    assert_eq!(r1.status, ReservationStatus::Confirmed);
    assert_eq!(r1.cancellation_reason, None);
    assert!(r1.cancelled_at.is_none());
    assert_eq!(store.blocks_for_property(r1.property_ref).await.unwrap().len(), 1);

    let r3 = store.get_reservation_by_external_id("R3").await.unwrap().unwrap();
    assert_eq!(r3.status, ReservationStatus::Cancelled);
    assert_eq!(r3.cancellation_reason, Some(CancellationReason::VerifiedAbsent));
}

#[tokio::test]
async fn unreachable_lookups_are_skipped() {
    let store = Store::new_in_memory().await.unwrap();
    let fake = FakeChannel::with_reservations(vec![booked("R1", 5)]);
    let rec = reconciler(&store, &fake, ReconcileConfig::default());
    rec.run(ReconcileRequest::apply(), CancelFlag::new()).await.unwrap();
    fake.remove("R1");
    rec.run(ReconcileRequest::apply(), CancelFlag::new()).await.unwrap();

    fake.script_lookup("R1", Lookup::Transient);
    let report = RestoreJob::new(store.clone(), guard(&fake))
        .run(CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(report.stats.restored, 0);
    assert_eq!(report.errors.len(), 1);
    let r1 = store.get_reservation_by_external_id("R1").await.unwrap().unwrap();
    assert_eq!(r1.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn remote_still_cancelled_stays_cancelled() {
    let store = Store::new_in_memory().await.unwrap();
    let fake = FakeChannel::with_reservations(vec![booked("R1", 5)]);
    let rec = reconciler(&store, &fake, ReconcileConfig::default());
    rec.run(ReconcileRequest::apply(), CancelFlag::new()).await.unwrap();
    fake.reservations.lock().unwrap()[0] = remote_reservation("R1", "L-R1", 5, "canceled");
    rec.run(ReconcileRequest::apply(), CancelFlag::new()).await.unwrap();

    let report = RestoreJob::new(store.clone(), guard(&fake))
        .run(CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.stats.still_cancelled, 1);
    assert_eq!(report.stats.restored, 0);
}

#[tokio::test]
async fn restore_error_list_is_capped() {
    let store = Store::new_in_memory().await.unwrap();
    let items = reservation_ids(5)
        .iter()
        .map(|id| remote_reservation(id, &format!("L-{id}"), 10, "canceled"))
        .collect();
    let fake = FakeChannel::with_reservations(items);
    reconciler(&store, &fake, ReconcileConfig::default())
        .run(ReconcileRequest::apply(), CancelFlag::new())
        .await
        .unwrap();
    for id in reservation_ids(5) {
        fake.script_lookup(&id, Lookup::Transient);
    }

    let report = RestoreJob::new(store.clone(), guard(&fake))
        .with_max_errors(2)
        .run(CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.stats.examined, 5);
    assert_eq!(report.stats.skipped, 5);
    assert_eq!(report.errors.len(), 3);
    assert_eq!(report.errors[2], "... and 3 more");
}
