//! Realtime sync integration tests.
//!
//! Checks that a [`SyncObserver`] projection converges to the store's state
//! while conversions run, survives duplicate and out-of-order deliveries, and
//! resyncs after lagging.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use common::TestHarness;
use parking_lot::Mutex;
use vf_core::{
    ChangeEvent, ChangeNotifier, JobPatch, JobStatus, JobStore, NewVideo, UserId, VideoStatus,
};
use vf_db::{init_memory_pool, SqliteJobStore};
use vidforge::{ApplyOutcome, SyncObserver, SyncUpdate, VideoProjection};

/// Poll `cond` until it holds or two seconds pass.
async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[tokio::test]
async fn projection_converges_to_store_after_a_run() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let observer = SyncObserver::spawn(harness.store.clone(), user).unwrap();
    assert!(observer.snapshot().is_empty());

    let video = harness.upload(user, "a.mp4");
    harness
        .orchestrator()
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap();

    let expected = harness.store.list_videos_with_jobs(user).unwrap();
    assert!(
        wait_for(|| observer.snapshot() == expected).await,
        "projection never converged"
    );
    assert_eq!(observer.snapshot()[0].video.status, VideoStatus::Completed);
    observer.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_job_updates_are_idempotent() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let video = harness.upload(user, "a.mp4");
    let mut projection = VideoProjection::load(harness.store.as_ref(), user).unwrap();

    let job_id = video.conversion_jobs[0].id;
    let started = harness
        .store
        .update_job(job_id, JobPatch::start(Utc::now()))
        .unwrap();
    let event = ChangeEvent::JobUpdated { job: started };

    assert_eq!(
        projection.apply(&event, harness.store.as_ref()).unwrap(),
        ApplyOutcome::Applied
    );
    let once = projection.get(video.video.id).unwrap();
    for _ in 0..3 {
        assert_eq!(
            projection.apply(&event, harness.store.as_ref()).unwrap(),
            ApplyOutcome::Stale
        );
    }
    assert_eq!(projection.get(video.video.id).unwrap(), once);
}

#[tokio::test]
async fn stale_progress_never_moves_projection_backwards() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let video = harness.upload(user, "a.mp4");
    let mut projection = VideoProjection::load(harness.store.as_ref(), user).unwrap();

    let job_id = video.conversion_jobs[1].id;
    let store = harness.store.as_ref();
    let mut updates = vec![store.update_job(job_id, JobPatch::start(Utc::now())).unwrap()];
    for pct in [20, 50, 90] {
        updates.push(store.update_job(job_id, JobPatch::progress(pct)).unwrap());
    }
    updates.push(
        store
            .update_job(job_id, JobPatch::complete("p", "u", 3, Utc::now()))
            .unwrap(),
    );

    // Deliver newest first, then everything again in order.
    for job in updates.iter().rev().chain(updates.iter()) {
        projection
            .apply(&ChangeEvent::JobUpdated { job: job.clone() }, store)
            .unwrap();
        let projected = projection.job(job_id).unwrap();
        assert_eq!(projected.progress, 100);
        assert_eq!(projected.status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn observer_only_sees_its_own_users_videos() {
    let harness = TestHarness::new();
    let alice = UserId::new();
    let bob = UserId::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer = SyncObserver::spawn_with_listener(harness.store.clone(), alice, move |u| {
        sink.lock().push(u.clone());
    })
    .unwrap();

    harness.upload(bob, "bob.mp4");
    let mine = harness.upload(alice, "alice.mp4");

    assert!(wait_for(|| observer.snapshot().len() == 1).await);
    assert_eq!(observer.snapshot()[0].video.id, mine.video.id);
    // One video insert plus four job inserts, all for alice.
    assert!(wait_for(|| seen.lock().len() == 5).await);
    assert!(seen.lock().iter().all(|u| matches!(
        u,
        SyncUpdate::Change { record, .. } if record.user_id == alice
    )));
    observer.shutdown().await.unwrap();
}

fn upload_burst(store: &SqliteJobStore, user: UserId, count: usize) {
    // No await between writes, so the observer cannot keep up.
    for i in 0..count {
        store
            .create_video(NewVideo {
                user_id: user,
                title: format!("v{i}"),
                original_filename: format!("v{i}.mp4"),
                mime_type: "video/mp4".into(),
                storage_path: format!("{user}/v{i}.mp4"),
                file_size: 1,
            })
            .unwrap();
    }
}

#[tokio::test]
async fn lagging_observer_replays_from_history() {
    let store = Arc::new(SqliteJobStore::new(
        init_memory_pool().unwrap(),
        Arc::new(ChangeNotifier::new(4)),
    ));
    let user = UserId::new();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let observer = SyncObserver::spawn_with_listener(store.clone(), user, move |u| {
        sink.lock().push(u.clone());
    })
    .unwrap();

    // Five videos, each one insert plus four job inserts.
    upload_burst(&store, user, 5);

    let expected = store.list_videos_with_jobs(user).unwrap();
    assert!(wait_for(|| observer.snapshot() == expected).await);
    observer.shutdown().await.unwrap();

    let updates = updates.lock();
    assert_matches!(
        updates.as_slice(),
        [SyncUpdate::Replayed { missed, replayed: 25 }] if *missed > 0
    );
}

#[tokio::test]
async fn lagging_past_history_reloads_from_store() {
    let store = Arc::new(SqliteJobStore::new(
        init_memory_pool().unwrap(),
        Arc::new(ChangeNotifier::with_history(4, 2)),
    ));
    let user = UserId::new();
    let resyncs = Arc::new(Mutex::new(Vec::new()));
    let sink = resyncs.clone();
    let observer = SyncObserver::spawn_with_listener(store.clone(), user, move |u| {
        if let SyncUpdate::Resynced { missed } = u {
            sink.lock().push(*missed);
        }
    })
    .unwrap();

    upload_burst(&store, user, 5);

    assert!(wait_for(|| !resyncs.lock().is_empty()).await);
    assert!(resyncs.lock()[0] > 0);
    let expected = store.list_videos_with_jobs(user).unwrap();
    assert!(wait_for(|| observer.snapshot() == expected).await);
    observer.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_observer_stops_applying() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let observer = SyncObserver::spawn(harness.store.clone(), user).unwrap();
    let projection = observer.projection();

    harness.upload(user, "a.mp4");
    assert!(wait_for(|| projection.read().len() == 1).await);

    observer.shutdown().await.unwrap();
    assert_eq!(harness.store.notifier().subscriber_count(), 0);

    harness.upload(user, "b.mp4");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(projection.read().len(), 1);
}

#[tokio::test]
async fn deleted_video_disappears_from_projection() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let video = harness.upload(user, "a.mp4");
    let observer = SyncObserver::spawn(harness.store.clone(), user).unwrap();
    assert_eq!(observer.snapshot().len(), 1);

    assert!(harness.store.delete_video(video.video.id).unwrap());
    assert!(wait_for(|| observer.snapshot().is_empty()).await);
    assert!(observer
        .projection()
        .read()
        .job(video.conversion_jobs[0].id)
        .is_none());
    observer.shutdown().await.unwrap();
}
