//! Integration tests for the autoscale advisor.

use chrono::Utc;
use dispatchd::autoscale::{Adjustment, AutoscaleAdvisor, AutoscalePolicy};
use dispatchd::ceiling::ConcurrencyCeiling;
use dispatchd::ledger::{DispatchLedger, MemoryLedger, Patch};
use dispatchd::model::{CanonicalEvent, EventKind, ResourceRef, State, UtilizationSample};
use dispatchd::normalize::event_id;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn sample(cpu_pct: f64, mem_pct: f64) -> UtilizationSample {
    UtilizationSample { cpu_pct, mem_pct }
}

async fn add_pending(ledger: &MemoryLedger, count: usize) {
    for i in 0..count {
        let now = Utc::now();
        let event = CanonicalEvent {
            id: event_id("111122223333", "ingest/a.csv", &format!("seq-{i}")),
            source_account: "111122223333".to_string(),
            resource: ResourceRef::parse("ingest/a.csv").unwrap(),
            kind: EventKind::Created,
            occurred_at: now,
            received_at: now,
        };
        ledger.admit(event, "ingest", 3).await.unwrap();
    }
}

fn advisor(
    ledger: &Arc<MemoryLedger>,
    initial: usize,
    min: usize,
    max: usize,
) -> (AutoscaleAdvisor, Arc<ConcurrencyCeiling>) {
    let ceiling = Arc::new(ConcurrencyCeiling::new(initial, min, max).unwrap());
    let advisor = AutoscaleAdvisor::new(
        Arc::clone(&ceiling),
        ledger.clone(),
        AutoscalePolicy::default(),
    );
    (advisor, ceiling)
}

#[test]
fn decide_follows_utilization_and_backlog() {
    let policy = AutoscalePolicy::default();
    assert_eq!(policy.decide(sample(90.0, 20.0), 5), Adjustment::Decrease);
    assert_eq!(policy.decide(sample(20.0, 95.0), 0), Adjustment::Decrease);
    assert_eq!(policy.decide(sample(20.0, 20.0), 5), Adjustment::Increase);
    assert_eq!(policy.decide(sample(20.0, 20.0), 0), Adjustment::Decay);
    assert_eq!(policy.decide(sample(70.0, 20.0), 5), Adjustment::Hold);
}

#[tokio::test]
async fn hot_host_with_backlog_lowers_ceiling() {
    let ledger = Arc::new(MemoryLedger::new());
    add_pending(&ledger, 3).await;
    let (advisor, ceiling) = advisor(&ledger, 4, 1, 8);

    let next = advisor.observe(sample(90.0, 40.0)).await.unwrap();
    assert_eq!(next, 3);
    assert_eq!(ceiling.get(), 3);
}

#[tokio::test]
async fn decrease_stops_at_minimum() {
    let ledger = Arc::new(MemoryLedger::new());
    add_pending(&ledger, 3).await;
    let (advisor, ceiling) = advisor(&ledger, 2, 1, 8);

    for _ in 0..5 {
        advisor.observe(sample(90.0, 40.0)).await.unwrap();
    }
    assert_eq!(ceiling.get(), 1);
}

#[tokio::test]
async fn backlog_raises_ceiling_up_to_maximum() {
    let ledger = Arc::new(MemoryLedger::new());
    add_pending(&ledger, 10).await;
    let (advisor, ceiling) = advisor(&ledger, 0, 0, 3);

    for _ in 0..5 {
        advisor.observe(sample(10.0, 10.0)).await.unwrap();
    }
    assert_eq!(ceiling.get(), 3);
}

#[tokio::test]
async fn zero_minimum_stays_idle_without_backlog() {
    let ledger = Arc::new(MemoryLedger::new());
    let (advisor, ceiling) = advisor(&ledger, 0, 0, 8);

    advisor.tick().await.unwrap();
    assert_eq!(ceiling.get(), 0);

    add_pending(&ledger, 1).await;
    advisor.tick().await.unwrap();
    assert_eq!(ceiling.get(), 1);
}

#[tokio::test]
async fn idle_decay_does_not_undercut_running_work() {
    let ledger = Arc::new(MemoryLedger::new());
    add_pending(&ledger, 2).await;
    for record in ledger.list(Some(State::Pending), 10).await.unwrap() {
        ledger
            .transition(record.id(), State::Pending, State::Launching, Patch::new())
            .await
            .unwrap();
    }
    let (advisor, ceiling) = advisor(&ledger, 4, 0, 8);

    for _ in 0..5 {
        advisor.observe(sample(10.0, 10.0)).await.unwrap();
    }
    assert_eq!(ceiling.get(), 2);
}

#[tokio::test]
async fn run_loop_applies_samples_until_shutdown() {
    let ledger = Arc::new(MemoryLedger::new());
    let ceiling = Arc::new(ConcurrencyCeiling::new(4, 1, 8).unwrap());
    let advisor = Arc::new(AutoscaleAdvisor::new(
        Arc::clone(&ceiling),
        ledger.clone(),
        AutoscalePolicy {
            tick_interval: Duration::from_secs(3600),
            ..AutoscalePolicy::default()
        },
    ));

    let (tx, rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Arc::clone(&advisor);
    let task = tokio::spawn(async move { worker.run(rx, shutdown_rx).await });

    // The immediate first tick (idle decay) and the hot sample each take one
    // step off, in either order.
    tx.send(sample(95.0, 95.0)).await.unwrap();
    for _ in 0..50 {
        if ceiling.get() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ceiling.get(), 2);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}
