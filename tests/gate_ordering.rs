use durable_gate::cache::ActorCache;
use durable_gate::config::DAY_MS;
use durable_gate::error::ActorError;
use durable_gate::{
    Actor, ActorConfig, ActorId, GetOptions, MemoryCache, MemoryStore, NoopObserver, PutOptions,
    RequestTracker,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

fn actor_with_cache() -> (Arc<Actor>, MemoryCache, Arc<MemoryStore>) {
    let store = MemoryStore::new(30 * DAY_MS);
    let cache = store.open_session();
    let actor = Actor::new(
        ActorId::new("gates"),
        Arc::new(cache.clone()),
        ActorConfig::default(),
        Arc::new(NoopObserver),
        RequestTracker::detached(),
    )
    .expect("actor");
    (actor, cache, store)
}

#[tokio::test]
async fn turns_queued_behind_exclusive_section_run_in_arrival_order() {
    let (actor, _cache, _store) = actor_with_cache();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let section_state = actor.state().clone();
    let section = tokio::spawn(async move {
        section_state
            .block_concurrency_while(|_| async move {
                release_rx.await.expect("release");
                Ok(())
            })
            .await
    });
    tokio::task::yield_now().await;
    assert!(actor.gates().input.is_locked());

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut turns = Vec::new();
    for i in 0..5 {
        let actor = Arc::clone(&actor);
        let order = Arc::clone(&order);
        turns.push(tokio::spawn(async move {
            actor
                .run_turn(|_| async move {
                    order.lock().expect("order").push(i);
                    Ok(())
                })
                .await
        }));
        tokio::task::yield_now().await;
    }
    assert!(order.lock().expect("order").is_empty());

    release_tx.send(()).expect("send");
    section.await.expect("join").expect("section");
    for turn in turns {
        turn.await.expect("join").expect("turn");
    }
    assert_eq!(*order.lock().expect("order"), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn storage_outside_the_exclusive_section_is_denied_unless_concurrent() {
    let (actor, _cache, _store) = actor_with_cache();
    let (entered_tx, entered_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let section_state = actor.state().clone();
    let section = tokio::spawn(async move {
        section_state
            .block_concurrency_while(|inner| async move {
                inner
                    .storage()
                    .put(("inside", b"1".to_vec()), PutOptions::default())
                    .await?;
                entered_tx.send(()).expect("entered");
                release_rx.await.expect("release");
                Ok(())
            })
            .await
    });
    entered_rx.await.expect("entered");

    let outside = actor.state().storage();
    let err = outside
        .get("inside", GetOptions::default())
        .await
        .expect_err("denied");
    assert_eq!(err, ActorError::ConcurrencyDenied { op: "get()" });

    let value = outside
        .get(
            "inside",
            GetOptions {
                allow_concurrency: true,
                ..GetOptions::default()
            },
        )
        .await
        .expect("concurrent read")
        .into_one();
    assert_eq!(value, Some(b"1".to_vec()));

    let direct = outside
        .with_direct_io()
        .get("inside", GetOptions::default())
        .await
        .expect("direct io bypasses the gate");
    assert!(direct.into_one().is_some());

    release_tx.send(()).expect("release");
    section.await.expect("join").expect("section");
    outside
        .get("inside", GetOptions::default())
        .await
        .expect("gate open again");
}

#[tokio::test]
async fn nested_exclusive_section_runs_inside_the_held_one() {
    let (actor, _cache, store) = actor_with_cache();
    let turn = actor.run_turn(|state| async move {
        state
            .block_concurrency_while(|outer| async move {
                outer
                    .storage()
                    .put(("k", b"v".to_vec()), PutOptions::default())
                    .await?;
                outer
                    .block_concurrency_while(|inner| async move {
                        Ok(inner
                            .storage()
                            .get("k", GetOptions::default())
                            .await?
                            .into_one())
                    })
                    .await
            })
            .await
    });
    let value = tokio::time::timeout(Duration::from_secs(5), turn)
        .await
        .expect("nested section must not wait on itself")
        .expect("turn");
    assert_eq!(value, Some(b"v".to_vec()));
    assert!(!actor.gates().input.is_locked());
    assert_eq!(store.snapshot().get("k"), Some(&b"v".to_vec()));

    let direct = actor
        .state()
        .block_concurrency_while(|outer| async move {
            outer.block_concurrency_while(|_| async { Ok(1) }).await
        })
        .await
        .expect("section");
    assert_eq!(direct, 1);
    assert!(!actor.gates().input.is_locked());
}

#[tokio::test]
async fn abort_fails_queued_turns_and_pending_output() {
    let (actor, cache, _store) = actor_with_cache();
    cache.set_hold_confirmations(true);

    let writer = {
        let actor = Arc::clone(&actor);
        tokio::spawn(async move {
            actor
                .run_turn(|state| async move {
                    state
                        .storage()
                        .put(("k", b"v".to_vec()), PutOptions::default())
                        .await
                })
                .await
        })
    };
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert!(actor.gates().output.is_locked());

    let (_release_tx, release_rx) = oneshot::channel::<()>();
    let section_state = actor.state().clone();
    let section = tokio::spawn(async move {
        section_state
            .block_concurrency_while(|_| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .await
    });
    tokio::task::yield_now().await;
    let queued = {
        let actor = Arc::clone(&actor);
        tokio::spawn(async move { actor.run_turn(|_| async { Ok(()) }).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(actor.gates().input.waiter_count(), 1);

    actor.abort("operator reset");
    let queued_err = queued.await.expect("join").expect_err("queued turn fails");
    assert!(queued_err.is_aborted());
    let writer_err = writer.await.expect("join").expect_err("held output fails");
    assert!(writer_err.is_aborted());
    assert!(cache.is_closed());
    section.abort();
    let _ = section.await;
}

#[tokio::test]
async fn read_only_turn_never_locks_output() {
    let (actor, cache, _store) = actor_with_cache();
    cache.set_hold_confirmations(true);
    actor
        .run_turn(|state| async move {
            state.storage().get("missing", GetOptions::default()).await?;
            state.storage().list(Default::default()).await?;
            state.storage().get_alarm(Default::default()).await?;
            Ok(())
        })
        .await
        .expect("turn");
    assert!(!actor.gates().output.is_locked());
    assert_eq!(cache.unconfirmed_writes(), 0);
}

proptest! {
    #[test]
    fn writes_commit_in_submission_order(
        writes in prop::collection::vec((0u8..6, any::<u8>()), 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let (actor, cache, store) = actor_with_cache();
        let submitted = writes.clone();
        runtime.block_on(async {
            actor
                .run_turn(|state| async move {
                    for (key, value) in submitted {
                        state
                            .storage()
                            .put((format!("k{key}"), vec![value]), PutOptions::default())
                            .await?;
                    }
                    Ok(())
                })
                .await
                .expect("turn");
            cache.flush().await.expect("flush");
        });

        let mut expected = BTreeMap::new();
        for (key, value) in writes {
            expected.insert(format!("k{key}"), vec![value]);
        }
        prop_assert_eq!(store.snapshot(), expected);
    }
}
