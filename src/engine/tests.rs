use super::*;
use crate::clock::{ManualTimeSource, offset_from_minutes};
use crate::store::{AcquireOutcome, ReleaseOutcome};
use chrono::NaiveDate;
use ulid::Ulid;

/// 2026-02-10T14:30:00Z, i.e. 09:30 at UTC-5.
const T: Ms = 1_770_733_800_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotlock_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_at(name: &str, now: Ms) -> (Arc<Engine>, ManualTimeSource, PathBuf) {
    let path = test_wal_path(name);
    let (clock, time) = Clock::manual(offset_from_minutes(-300).unwrap(), now);
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), clock).unwrap();
    (Arc::new(engine), time, path)
}

fn slot(hour: u8) -> TimeSlot {
    TimeSlot::new(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(), hour).unwrap()
}

fn entry(resource: &str, hour: u8, holder: &str, obs: Observation) -> Entry {
    Entry {
        id: Ulid::new(),
        resource_id: resource.into(),
        slot: slot(hour),
        holder: holder.into(),
        observation: obs,
        auto_saved: false,
        created_at: T,
    }
}

// ── Acquisition ──────────────────────────────────────────────

#[tokio::test]
async fn acquire_free_key() {
    let (engine, _, _) = engine_at("acquire_free.wal", T);
    let out = engine.try_acquire("R1", slot(9), "alice").await.unwrap();
    let AcquireOutcome::Acquired(lease) = out else {
        panic!("expected Acquired, got {out:?}");
    };
    assert_eq!(lease.holder, "alice");
    assert_eq!(lease.acquired_at, T);
    assert_eq!(lease.expires_at, 1_770_735_600_000);
    assert_eq!(engine.lease_for("R1", slot(9)).await, Some(lease));
}

#[tokio::test]
async fn reacquire_by_holder_is_idempotent() {
    let (engine, _, _) = engine_at("reacquire.wal", T);
    engine.try_acquire("R1", slot(9), "alice").await.unwrap();
    let again = engine.try_acquire("R1", slot(9), "ALICE").await.unwrap();
    assert!(matches!(again, AcquireOutcome::AlreadyHeld(ref l) if l.holder == "alice"));
    assert_eq!(engine.list_active().await.len(), 1);
}

#[tokio::test]
async fn second_holder_conflicts() {
    let (engine, _, _) = engine_at("conflict.wal", T);
    engine.try_acquire("R1", slot(9), "alice").await.unwrap();
    let out = engine.try_acquire("R1", slot(9), "bob").await.unwrap();
    assert_eq!(
        out,
        AcquireOutcome::Conflict {
            holder: "alice".into()
        }
    );
    // Different slot on the same resource is a different key.
    let other = engine.try_acquire("R1", slot(10), "bob").await.unwrap();
    assert!(matches!(other, AcquireOutcome::Acquired(_)));
}

#[tokio::test]
async fn concurrent_acquires_admit_exactly_one() {
    let (engine, _, _) = engine_at("concurrent.wal", T);
    let mut handles = Vec::new();
    for i in 0..32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .try_acquire("R1", slot(9), &format!("op{i}"))
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for h in handles {
        if matches!(h.await.unwrap(), AcquireOutcome::Acquired(_)) {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(engine.list_active().await.len(), 1);
}

#[tokio::test]
async fn expired_lease_is_replaced() {
    let (engine, time, _) = engine_at("expired_replace.wal", T);
    engine.try_acquire("R1", slot(9), "alice").await.unwrap();
    // 09:59:59 local: still alice's
    time.set(1_770_735_599_000);
    assert!(matches!(
        engine.try_acquire("R1", slot(10), "bob").await.unwrap(),
        AcquireOutcome::Acquired(_)
    ));
    assert!(engine.lease_for("R1", slot(9)).await.is_some());

    // Past the end of hour 9 the row is dead weight; the slot itself has ended,
    // so acquiring it is refused while the expired row still reports its tenure.
    time.set(1_770_735_600_000);
    assert!(engine.lease_for("R1", slot(9)).await.is_none());
    assert!(matches!(
        engine.try_acquire("R1", slot(9), "bob").await,
        Err(EngineError::SlotElapsed(_))
    ));
    let ended = engine.ended_lease("R1", slot(9)).await.unwrap();
    assert_eq!(ended.holder, "alice");
    assert_eq!(ended.reason, ReleaseReason::Expired);
}

#[tokio::test]
async fn expired_row_on_future_slot_does_not_block() {
    // Simulate a lease whose expiry was recorded earlier than its slot end,
    // as after a clock correction: a new holder takes over.
    let (engine, _, _) = engine_at("expired_row.wal", T);
    let lane = engine.lane("R1").unwrap();
    lane.write().await.insert_lease(Lease {
        resource_id: "R1".into(),
        slot: slot(11),
        holder: "alice".into(),
        acquired_at: T - 10,
        expires_at: T - 1,
    });
    let out = engine.try_acquire("R1", slot(11), "bob").await.unwrap();
    assert!(matches!(out, AcquireOutcome::Acquired(ref l) if l.holder == "bob"));
}

#[tokio::test]
async fn acquire_validates_input() {
    let (engine, _, _) = engine_at("validate.wal", T);
    assert!(matches!(
        engine.try_acquire("", slot(9), "alice").await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.try_acquire("R1", slot(9), "  ").await,
        Err(EngineError::Invalid(_))
    ));
    let long = "x".repeat(MAX_RESOURCE_ID_LEN + 1);
    assert!(matches!(
        engine.try_acquire(&long, slot(9), "alice").await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Release ──────────────────────────────────────────────────

#[tokio::test]
async fn release_by_holder_then_noop() {
    let (engine, _, _) = engine_at("release.wal", T);
    engine.try_acquire("R1", slot(9), "alice").await.unwrap();

    let out = engine
        .release("R1", slot(9), "bob", ReleaseReason::Manual)
        .await
        .unwrap();
    assert_eq!(
        out,
        ReleaseOutcome::NotHolder {
            current: Some("alice".into())
        }
    );

    let out = engine
        .release("R1", slot(9), "alice", ReleaseReason::Manual)
        .await
        .unwrap();
    assert!(matches!(out, ReleaseOutcome::Released(_)));

    let out = engine
        .release("R1", slot(9), "alice", ReleaseReason::Manual)
        .await
        .unwrap();
    assert_eq!(out, ReleaseOutcome::NotHolder { current: None });

    let ended = engine.ended_lease("R1", slot(9)).await.unwrap();
    assert_eq!(ended.reason, ReleaseReason::Manual);
    assert_eq!(ended.ended_at, T);
}

#[tokio::test]
async fn force_release_ignores_holder() {
    let (engine, _, _) = engine_at("force.wal", T);
    engine.try_acquire("R1", slot(9), "alice").await.unwrap();
    let removed = engine
        .force_release("R1", slot(9), ReleaseReason::Administrative)
        .await
        .unwrap();
    assert_eq!(removed.map(|l| l.holder), Some("alice".into()));
    assert!(engine.list_active().await.is_empty());
    assert!(
        engine
            .force_release("R1", slot(9), ReleaseReason::Administrative)
            .await
            .unwrap()
            .is_none()
    );
}

// ── Sweep ────────────────────────────────────────────────────

#[tokio::test]
async fn sweep_removes_only_expired() {
    let (engine, time, _) = engine_at("sweep.wal", T);
    engine.try_acquire("R1", slot(9), "alice").await.unwrap();
    engine.try_acquire("R2", slot(10), "bob").await.unwrap();
    assert_eq!(engine.sweep_expired().await.unwrap(), 0);

    time.set(1_770_735_600_000);
    assert_eq!(engine.sweep_expired().await.unwrap(), 1);
    assert_eq!(engine.sweep_expired().await.unwrap(), 0);

    let active = engine.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].resource_id, "R2");
    assert_eq!(
        engine.ended_lease("R1", slot(9)).await.unwrap().reason,
        ReleaseReason::Expired
    );
}

// ── Queries ──────────────────────────────────────────────────

#[tokio::test]
async fn leases_held_by_is_case_insensitive_and_ordered() {
    let (engine, _, _) = engine_at("held_by.wal", T);
    engine.try_acquire("R2", slot(9), "Alice").await.unwrap();
    engine.try_acquire("R1", slot(10), "alice").await.unwrap();
    engine.try_acquire("R3", slot(9), "bob").await.unwrap();

    let held: Vec<_> = engine
        .leases_held_by("ALICE")
        .await
        .into_iter()
        .map(|l| l.resource_id)
        .collect();
    assert_eq!(held, vec!["R1".to_string(), "R2".to_string()]);
}

// ── Entries and completion ───────────────────────────────────

#[tokio::test]
async fn entries_keep_insertion_order() {
    let (engine, _, _) = engine_at("entries.wal", T);
    let a = engine
        .append_entry(entry("R1", 9, "alice", Observation::no_issue()))
        .await
        .unwrap();
    let b = engine
        .append_entry(entry("R1", 10, "alice", Observation::issue("inverter 3 offline")))
        .await
        .unwrap();
    let c = engine
        .append_entry(entry("R1", 9, "bob", Observation::issue("string fault")))
        .await
        .unwrap();

    assert_eq!(engine.entries("R1", None).await, vec![a.clone(), b, c.clone()]);
    assert_eq!(engine.entries("R1", Some(slot(9))).await, vec![a, c]);
    assert!(engine.entries("R9", None).await.is_empty());
}

#[tokio::test]
async fn oversized_description_rejected() {
    let (engine, _, _) = engine_at("entry_limit.wal", T);
    let obs = Observation::issue("x".repeat(MAX_DESCRIPTION_LEN + 1));
    assert!(matches!(
        engine.append_entry(entry("R1", 9, "alice", obs)).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn completion_set_and_clear() {
    let (engine, _, _) = engine_at("completion.wal", T);
    assert!(engine.completion("R1").await.is_none());
    let done = Completion {
        slot: slot(9),
        holder: "alice".into(),
        completed_at: T,
    };
    engine.set_completion("R1", done.clone()).await.unwrap();
    assert_eq!(engine.completion("R1").await, Some(done));
    engine.clear_completion("R1").await.unwrap();
    assert!(engine.completion("R1").await.is_none());
    // Clearing twice is fine.
    engine.clear_completion("R1").await.unwrap();
}

// ── Registry ─────────────────────────────────────────────────

#[tokio::test]
async fn register_and_unregister_resource() {
    let (engine, _, _) = engine_at("registry.wal", T);
    engine
        .register_resource("R1", Some("North Ridge".into()))
        .await
        .unwrap();
    engine.register_resource("R0", None).await.unwrap();
    assert!(engine.resource_exists("R1"));
    let ids: Vec<_> = engine.list_resources().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["R0".to_string(), "R1".to_string()]);

    engine.try_acquire("R1", slot(9), "alice").await.unwrap();
    engine.unregister_resource("R1").await.unwrap();
    assert!(!engine.resource_exists("R1"));
    // The lease outlives its resource.
    assert!(engine.lease_for("R1", slot(9)).await.is_some());

    assert!(matches!(
        engine.unregister_resource("R1").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn notify_fires_on_commit() {
    let (engine, _, _) = engine_at("notify.wal", T);
    let mut rx = engine.notify.subscribe("R1");
    engine.try_acquire("R1", slot(9), "alice").await.unwrap();
    let event = rx.recv().await.unwrap();
    assert!(matches!(event, Event::LeaseAcquired { ref lease } if lease.holder == "alice"));
}

// ── Durability ───────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let (engine, _, path) = engine_at("replay.wal", T);
    engine.register_resource("R1", None).await.unwrap();
    engine.try_acquire("R1", slot(9), "alice").await.unwrap();
    engine.try_acquire("R1", slot(10), "alice").await.unwrap();
    engine
        .release("R1", slot(10), "alice", ReleaseReason::Manual)
        .await
        .unwrap();
    engine
        .append_entry(entry("R1", 9, "alice", Observation::no_issue()))
        .await
        .unwrap();
    drop(engine);

    let (clock, _) = Clock::manual(offset_from_minutes(-300).unwrap(), T);
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap();
    assert!(engine.resource_exists("R1"));
    let active = engine.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].slot, slot(9));
    assert_eq!(engine.entries("R1", None).await.len(), 1);
    assert_eq!(
        engine.ended_lease("R1", slot(10)).await.unwrap().reason,
        ReleaseReason::Manual
    );
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (engine, _, path) = engine_at("compact_engine.wal", T);
    engine.register_resource("R1", None).await.unwrap();
    for hour in 10..20 {
        engine.try_acquire("R1", slot(hour), "alice").await.unwrap();
        engine
            .release("R1", slot(hour), "alice", ReleaseReason::Manual)
            .await
            .unwrap();
    }
    engine.try_acquire("R1", slot(9), "bob").await.unwrap();
    engine
        .set_completion(
            "R1",
            Completion {
                slot: slot(9),
                holder: "bob".into(),
                completed_at: T,
            },
        )
        .await
        .unwrap();
    assert!(engine.wal_appends_since_compact().await >= 22);

    let before = std::fs::metadata(&path).unwrap().len();
    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&path).unwrap().len() < before);
    drop(engine);

    let (clock, _) = Clock::manual(offset_from_minutes(-300).unwrap(), T);
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap();
    assert!(engine.resource_exists("R1"));
    let active = engine.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].holder, "bob");
    assert!(engine.completion("R1").await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_keeps_appends_that_race_it() {
    let (engine, _, path) = engine_at("compact_race.wal", T);
    let mut writers = Vec::new();
    for task in 0..4 {
        let engine = engine.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..200 {
                let resource = format!("R{}", (task * 200 + i) % 40);
                engine
                    .append_entry(entry(&resource, 9, &format!("op{task}"), Observation::no_issue()))
                    .await
                    .unwrap();
                if i % 50 == 0 {
                    engine
                        .try_acquire(&resource, slot(10 + task as u8), &format!("op{task}"))
                        .await
                        .unwrap();
                }
            }
        }));
    }
    let compactor = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..30 {
                engine.compact_wal().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for w in writers {
        w.await.unwrap();
    }
    compactor.await.unwrap();

    let mut in_memory = 0;
    for i in 0..40 {
        in_memory += engine.entries(&format!("R{i}"), None).await.len();
    }
    let leases = engine.list_active().await;
    assert_eq!(in_memory, 800);
    drop(engine);

    let (clock, _) = Clock::manual(offset_from_minutes(-300).unwrap(), T);
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap();
    let mut replayed = 0;
    for i in 0..40 {
        replayed += engine.entries(&format!("R{i}"), None).await.len();
    }
    assert_eq!(replayed, 800);
    assert_eq!(engine.list_active().await, leases);
}
