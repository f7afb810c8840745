//! Orchestrator integration tests.
//!
//! Runs whole conversions against an in-memory store and temp-dir storage
//! (via [`TestHarness`]) and checks the persisted job and video states and
//! the change events they produced.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use assert_matches::assert_matches;
use common::{
    drain, progress_trail, BrokenEncoder, FailingEncoder, FlakyStorage, FlakyStore, TestHarness,
    UnavailableEncoder, SOURCE,
};
use vf_core::{ChangeEvent, Error, JobStatus, JobStore, Resolution, UserId, VideoStatus};
use vidforge::Orchestrator;

// ---------------------------------------------------------------------------
// Happy paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_jobs_without_real_encoder_complete_the_video() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let video = harness.upload_with(user, "trip.mp4", &[Resolution::P1080, Resolution::P720]);

    let report = harness
        .orchestrator()
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.pending_jobs(),
        )
        .await
        .unwrap();
    assert_eq!(report.encoder, "fallback");
    assert_eq!(report.status, VideoStatus::Completed);

    let stored = harness.video(video.video.id);
    assert_eq!(stored.video.status, VideoStatus::Completed);
    for job in &stored.conversion_jobs {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        let path = job.output_path.as_deref().unwrap();
        assert!(path.starts_with(&format!("{user}/converted_{}_", job.resolution)));
        assert!(path.ends_with(".mp4"));
        assert_eq!(
            job.output_url.as_deref(),
            Some(format!("http://media.test/{path}").as_str())
        );
        assert_eq!(job.file_size, Some(SOURCE.len() as i64));
        assert!(job.started_at.is_some());
        assert!(job.completed_at >= job.started_at);
        assert!(job.error_message.is_none());
    }
}

#[tokio::test]
async fn fallback_output_is_byte_identical_to_source() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let video = harness.upload(user, "clip.mov");
    let mut sub = harness.store.subscribe(user);

    harness
        .orchestrator()
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap();

    let events = drain(&mut sub).await;
    let stored = harness.video(video.video.id);
    assert_eq!(stored.video.status, VideoStatus::Completed);

    for job in &stored.conversion_jobs {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(harness.read_output(job.output_path.as_deref().unwrap()), SOURCE);

        // pending -> processing -> ... -> completed, progress monotone to 100.
        let statuses: Vec<JobStatus> = events
            .iter()
            .filter_map(|e| match e {
                ChangeEvent::JobUpdated { job: j } if j.id == job.id => Some(j.status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.first(), Some(&JobStatus::Processing));
        assert_eq!(statuses.last(), Some(&JobStatus::Completed));
        assert_eq!(
            statuses.iter().filter(|s| **s == JobStatus::Completed).count(),
            1
        );

        let trail = progress_trail(&events, job.id);
        assert_eq!(trail.first(), Some(&0));
        assert_eq!(trail.last(), Some(&100));
        assert!(trail.windows(2).all(|w| w[0] <= w[1]), "{trail:?}");
    }
}

#[tokio::test]
async fn unavailable_encoder_falls_back_for_the_whole_run() {
    let harness = TestHarness::new();
    let video = harness.upload(UserId::new(), "a.mp4");

    let report = harness
        .orchestrator_with(Some(Arc::new(UnavailableEncoder)))
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap();

    assert_eq!(report.encoder, "fallback");
    assert_eq!(report.completed(), 4);
}

#[tokio::test]
async fn jobs_run_in_listed_order() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let video = harness.upload(user, "a.mp4");
    let mut sub = harness.store.subscribe(user);

    let mut jobs = video.conversion_jobs.clone();
    jobs.reverse();
    harness
        .orchestrator()
        .run_conversion(video.video.id, &video.video.storage_path, &jobs)
        .await
        .unwrap();

    let started: Vec<Resolution> = drain(&mut sub)
        .await
        .into_iter()
        .filter_map(|e| match e {
            ChangeEvent::JobUpdated { job } if job.progress == 0 => Some(job.resolution),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![
            Resolution::P360,
            Resolution::P480,
            Resolution::P720,
            Resolution::P1080
        ]
    );
}

// ---------------------------------------------------------------------------
// Partial failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_failed_job_does_not_block_the_others() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let video = harness.upload(user, "a.mp4");
    let mut sub = harness.store.subscribe(user);

    let report = harness
        .orchestrator_with(Some(Arc::new(FailingEncoder::new([Resolution::P720]))))
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap();

    assert_eq!(report.encoder, "failing");
    assert_eq!(report.completed(), 3);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.status, VideoStatus::Failed);

    let events = drain(&mut sub).await;
    let stored = harness.video(video.video.id);
    assert_eq!(stored.video.status, VideoStatus::Failed);
    for job in &stored.conversion_jobs {
        let trail = progress_trail(&events, job.id);
        assert!(trail.windows(2).all(|w| w[0] <= w[1]), "{trail:?}");
        if job.resolution == Resolution::P720 {
            assert_eq!(job.status, JobStatus::Failed);
            assert!(job.progress < 100);
            assert!(job
                .error_message
                .as_deref()
                .unwrap()
                .contains("simulated encoder crash"));
            assert!(job.completed_at.is_some());
            assert!(job.output_path.is_none());
            assert!(job.output_url.is_none());
        } else {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.progress, 100);
            assert!(job.output_path.is_some());
        }
    }
}

#[tokio::test]
async fn derived_status_over_every_failure_combination() {
    for mask in 0u8..16 {
        let harness = TestHarness::new();
        let video = harness.upload(UserId::new(), "a.mp4");
        let failing: Vec<Resolution> = Resolution::ALL
            .into_iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, r)| r)
            .collect();

        let report = harness
            .orchestrator_with(Some(Arc::new(FailingEncoder::new(failing.clone()))))
            .run_conversion(
                video.video.id,
                &video.video.storage_path,
                &video.conversion_jobs,
            )
            .await
            .unwrap();

        let expected = if failing.is_empty() {
            VideoStatus::Completed
        } else {
            VideoStatus::Failed
        };
        assert_eq!(report.status, expected, "failing {failing:?}");
        assert_eq!(harness.video(video.video.id).video.status, expected);
        assert_eq!(report.failed(), failing.len());
    }
}

#[tokio::test]
async fn non_encode_errors_from_the_encoder_stay_job_level() {
    let harness = TestHarness::new();
    let video = harness.upload(UserId::new(), "a.mp4");

    let report = harness
        .orchestrator_with(Some(Arc::new(BrokenEncoder)))
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap();

    assert_eq!(report.failed(), 4);
    assert_eq!(report.status, VideoStatus::Failed);
    let stored = harness.video(video.video.id);
    for job in &stored.conversion_jobs {
        let message = job.error_message.as_deref().unwrap();
        assert!(message.contains("scratch disk vanished"), "{message}");
        assert!(message.contains(job.resolution.as_str()), "{message}");
    }
}

#[tokio::test]
async fn output_store_failure_fails_only_that_job() {
    let harness = TestHarness::new();
    let video = harness.upload(UserId::new(), "a.mp4");

    let mut storage = FlakyStorage::new(harness.storage.clone());
    storage.fail_store_matching = vec!["converted_480p_".into()];
    let orchestrator = Orchestrator::new(
        harness.store.clone(),
        Arc::new(storage),
        None,
        common::instant_fallback(),
    );

    let report = orchestrator
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap();
    assert_eq!(report.failed(), 1);
    assert_eq!(report.status, VideoStatus::Failed);

    let stored = harness.video(video.video.id);
    let failed = stored.job_for(Resolution::P480).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    // The encode itself finished; only the completion write may reach 100.
    assert!(failed.progress < 100, "failed job kept progress {}", failed.progress);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("quota exceeded"));
    assert_eq!(
        stored.job_for(Resolution::P360).unwrap().status,
        JobStatus::Completed
    );
}

// ---------------------------------------------------------------------------
// Run-level failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn source_unavailable_fails_video_and_leaves_jobs_pending() {
    let harness = TestHarness::new();
    let video = harness.upload(UserId::new(), "a.mp4");

    let storage = FlakyStorage::new(harness.storage.clone());
    storage.fail_fetch.store(true, Ordering::SeqCst);
    let orchestrator = Orchestrator::new(
        harness.store.clone(),
        Arc::new(storage),
        None,
        common::instant_fallback(),
    );

    let err = orchestrator
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap_err();
    assert_matches!(err, Error::SourceUnavailable { ref path, .. } if *path == video.video.storage_path);

    let stored = harness.video(video.video.id);
    assert_eq!(stored.video.status, VideoStatus::Failed);
    assert!(stored
        .conversion_jobs
        .iter()
        .all(|j| j.status == JobStatus::Pending && j.version == 1));
}

#[tokio::test]
async fn missing_source_object_is_source_unavailable() {
    let harness = TestHarness::new();
    let video = harness.upload(UserId::new(), "a.mp4");
    std::fs::remove_file(harness.dir.path().join(&video.video.storage_path)).unwrap();

    let err = harness
        .orchestrator()
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap_err();
    assert_matches!(err, Error::SourceUnavailable { .. });
    assert_eq!(harness.video(video.video.id).video.status, VideoStatus::Failed);
}

#[tokio::test]
async fn dropped_progress_writes_do_not_fail_the_run() {
    let harness = TestHarness::new();
    let video = harness.upload(UserId::new(), "a.mp4");
    let store = Arc::new(FlakyStore::new(harness.store.clone()));
    store.fail_progress.store(true, Ordering::SeqCst);

    let orchestrator = Orchestrator::new(
        store,
        harness.storage.clone(),
        None,
        common::instant_fallback(),
    );
    let report = orchestrator
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap();

    assert_eq!(report.status, VideoStatus::Completed);
    let stored = harness.video(video.video.id);
    assert!(stored.conversion_jobs.iter().all(|j| j.progress == 100));
}

#[tokio::test]
async fn terminal_write_failure_aborts_the_run() {
    let harness = TestHarness::new();
    let video = harness.upload(UserId::new(), "a.mp4");
    let store = Arc::new(FlakyStore::new(harness.store.clone()));
    store.fail_terminal.store(true, Ordering::SeqCst);

    let orchestrator = Orchestrator::new(
        store,
        harness.storage.clone(),
        None,
        common::instant_fallback(),
    );
    let err = orchestrator
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap_err();
    assert_matches!(err, Error::Database { .. });
    assert!(err.is_run_level());

    let stored = harness.video(video.video.id);
    assert_eq!(stored.video.status, VideoStatus::Failed);
    // The first job is stranded in processing; the rest never started.
    assert_eq!(stored.conversion_jobs[0].status, JobStatus::Processing);
    assert!(stored.conversion_jobs[1..]
        .iter()
        .all(|j| j.status == JobStatus::Pending));
}

// ---------------------------------------------------------------------------
// Input validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejects_jobs_that_are_not_pending() {
    let harness = TestHarness::new();
    let video = harness.upload(UserId::new(), "a.mp4");
    let orchestrator = harness.orchestrator();

    orchestrator
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs[..1],
        )
        .await
        .unwrap();
    let version_before = harness.video(video.video.id).video.version;

    // The stale snapshot still claims the first job is pending.
    let err = orchestrator
        .run_conversion(
            video.video.id,
            &video.video.storage_path,
            &video.conversion_jobs,
        )
        .await
        .unwrap_err();
    assert_matches!(err, Error::InvalidState(_));

    let stored = harness.video(video.video.id);
    assert_eq!(stored.video.version, version_before);
    assert!(stored.conversion_jobs[1..]
        .iter()
        .all(|j| j.status == JobStatus::Pending));
}

#[tokio::test]
async fn rejects_jobs_of_another_video() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let first = harness.upload(user, "a.mp4");
    let second = harness.upload(user, "b.mp4");

    let err = harness
        .orchestrator()
        .run_conversion(
            first.video.id,
            &first.video.storage_path,
            &second.conversion_jobs,
        )
        .await
        .unwrap_err();
    assert_matches!(err, Error::InvalidState(_));
    assert_eq!(harness.video(first.video.id).video.status, VideoStatus::Uploaded);
    assert_eq!(
        harness.video(second.video.id).video.status,
        VideoStatus::Uploaded
    );
}

#[tokio::test]
async fn rejects_unknown_jobs() {
    let harness = TestHarness::new();
    let video = harness.upload(UserId::new(), "a.mp4");
    let mut ghost = video.conversion_jobs[0].clone();
    ghost.id = vf_core::ConversionJobId::new();

    let err = harness
        .orchestrator()
        .run_conversion(video.video.id, &video.video.storage_path, &[ghost])
        .await
        .unwrap_err();
    assert_matches!(err, Error::InvalidState(_));
}

#[tokio::test]
async fn concurrent_runs_on_different_videos() {
    let harness = TestHarness::new();
    let user = UserId::new();
    let a = harness.upload(user, "a.mp4");
    let b = harness.upload(user, "b.mp4");
    let orchestrator = harness.orchestrator();

    let (ra, rb) = tokio::join!(
        orchestrator.run_conversion(a.video.id, &a.video.storage_path, &a.conversion_jobs),
        orchestrator.run_conversion(b.video.id, &b.video.storage_path, &b.conversion_jobs),
    );
    assert_eq!(ra.unwrap().status, VideoStatus::Completed);
    assert_eq!(rb.unwrap().status, VideoStatus::Completed);
    assert_eq!(harness.store.list_videos_with_jobs(user).unwrap().len(), 2);
}
