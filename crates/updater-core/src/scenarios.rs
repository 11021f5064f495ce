//! End-to-end coordinator scenarios against scripted collaborators.
//!
//! Each test runs a coordinator rooted in a temp dir with a scripted
//! manifest fetcher, scripted transfer backends, and, where staging is
//! involved, a scripted apply process.

#![cfg(test)]

use std::time::Duration;

use crate::checker::{CheckError, CheckKind};
use crate::codes;
use crate::coordinator::{CheckOutcome, DownloadStart};
use crate::error::UpdateError;
use crate::events::{AvailableReason, BackendKindName, ErrorReason, UpdateEvent};
use crate::harness::{app, update, wait_for_event, wait_for_state, Rig, Script};
use crate::prefs::{PrefsStore, UpdatePrefs};
use crate::record::{props, PatchType, UpdateRecord};
use crate::status::{read_status, read_version, StatusToken, UpdateState, UpdateStatus};
use crate::store::{UpdateDirs, UpdateStateStore, ACTIVE_UPDATE_FILE};
use crate::transfer::native::{ACTIVE_POLL_INTERVAL, IDLE_POLL_INTERVAL};
use crate::transfer::{TransferError, TransferStatus};

fn is_downloaded(event: &UpdateEvent) -> bool {
    matches!(event, UpdateEvent::UpdateDownloaded { .. })
}

fn is_download_error(event: &UpdateEvent) -> bool {
    matches!(event, UpdateEvent::UpdateError { reason: ErrorReason::DownloadFailed, .. })
}

/// Writes records, a status token, and optionally a ready patch as an
/// earlier process would have left them.
fn seed(rig: &Rig, ready: Option<UpdateRecord>, downloading: Option<UpdateRecord>, status: &str) {
    let dirs = UpdateDirs::new(rig.root().to_path_buf());
    let mut store = UpdateStateStore::new(dirs.clone(), app().record_defaults(), Duration::ZERO);
    let has_ready = ready.is_some();
    store.set_ready(ready);
    store.set_downloading(downloading);
    store.save_updates();
    store.flush().unwrap();
    std::fs::create_dir_all(dirs.ready_dir()).unwrap();
    if has_ready {
        std::fs::write(dirs.ready_patch(), b"patch").unwrap();
    }
    std::fs::write(dirs.ready_dir().join("update.status"), status).unwrap();
}

fn seed_prefs(rig: &Rig, f: impl FnOnce(&mut UpdatePrefs)) {
    let mut prefs = PrefsStore::open(UpdateDirs::new(rig.root().to_path_buf()).prefs_file());
    prefs.update(f);
}

fn selected(mut update: UpdateRecord, state: UpdateStatus) -> UpdateRecord {
    update.patches[0].selected = true;
    update.set_state(state);
    update
}

#[tokio::test]
async fn test_background_check_downloads_to_pending() {
    let rig = Rig::new();
    rig.fetcher.push_updates(&[update("2.0", 10, None)]);
    rig.chunked.push(Script::Complete(vec![7; 10]));
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    let outcome = coordinator.check_for_updates(CheckKind::Background).await.unwrap();
    assert_eq!(outcome, CheckOutcome::Downloading { version: "2.0".to_string() });
    assert_eq!(read_status(&rig.ready_dir()), "downloading");

    let downloaded = wait_for_event(&mut events, is_downloaded).await;
    assert_eq!(
        downloaded,
        UpdateEvent::UpdateDownloaded { version: "2.0".to_string(), state: UpdateStatus::Pending }
    );
    assert_eq!(coordinator.state(), UpdateState::Pending);

    let ready = coordinator.ready_update().await.unwrap();
    assert_eq!(ready.state(), UpdateStatus::Pending);
    assert_eq!(ready.selected_patch().unwrap().final_url.as_deref(), Some("http://u/2.0/complete?final"));
    assert!(coordinator.downloading_update().await.is_none());
    assert_eq!(read_status(&rig.ready_dir()), "pending");
    assert_eq!(read_version(&rig.ready_dir()).as_deref(), Some("2.0"));
    assert_eq!(std::fs::read(rig.ready_dir().join("update.patch")).unwrap(), vec![7; 10]);
    assert_eq!(rig.fetcher.urls().len(), 1);
}

#[tokio::test]
async fn test_partial_download_swaps_ready_update() {
    let rig = Rig::new();
    rig.fetcher.push_updates(&[update("2.0", 10, None)]);
    rig.fetcher.push_updates(&[update("3.0", 100, Some(4))]);
    rig.chunked.push(Script::Complete(vec![1; 10]));
    rig.chunked.push(Script::Complete(vec![2; 4]));
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    coordinator.check_for_updates(CheckKind::Background).await.unwrap();
    wait_for_event(&mut events, is_downloaded).await;

    let outcome = coordinator.check_for_updates(CheckKind::Background).await.unwrap();
    assert_eq!(outcome, CheckOutcome::Downloading { version: "3.0".to_string() });
    // The ready update keeps its status while the partial downloads.
    assert_eq!(read_status(&rig.ready_dir()), "pending");

    let swap = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::UpdateSwap { .. })).await;
    assert_eq!(swap, UpdateEvent::UpdateSwap { version: "3.0".to_string() });
    wait_for_event(&mut events, is_downloaded).await;

    let requests = rig.chunked.requests();
    assert_eq!(requests[1].url, "http://u/3.0/partial");
    assert_eq!(requests[1].size, 4);
    let ready = coordinator.ready_update().await.unwrap();
    assert_eq!(ready.app_version.as_deref(), Some("3.0"));
    assert_eq!(ready.selected_patch().unwrap().patch_type, PatchType::Partial);
    assert_eq!(coordinator.state(), UpdateState::Pending);
}

#[tokio::test]
async fn test_native_failure_retries_once_with_chunked() {
    let rig = Rig::new().with_native();
    let native = rig.native.clone().unwrap();
    native.push(Script::Fail(TransferStatus::Failed("job error".to_string())));
    rig.chunked.push(Script::Complete(vec![3; 10]));
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    let started = coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    assert_eq!(started, DownloadStart::Started);

    let first = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::DownloadStarted { .. })).await;
    assert_eq!(
        first,
        UpdateEvent::DownloadStarted { version: "2.0".to_string(), backend: BackendKindName::Native }
    );
    let second = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::DownloadStarted { .. })).await;
    assert_eq!(
        second,
        UpdateEvent::DownloadStarted { version: "2.0".to_string(), backend: BackendKindName::Chunked }
    );
    wait_for_event(&mut events, is_downloaded).await;

    assert_eq!(native.requests().len(), 1);
    assert_eq!(rig.chunked.requests().len(), 1);
    let ready = coordinator.ready_update().await.unwrap();
    let patch = ready.selected_patch().unwrap();
    assert_eq!(patch.properties.get(props::NATIVE_RESULT), Some("failed: job error"));
    assert!(!patch.properties.contains(props::NATIVE_JOB_ID));
}

#[tokio::test]
async fn test_native_owned_by_other_user_is_avoided() {
    let rig = Rig::new().with_native();
    let native = rig.native.clone().unwrap();
    native.push(Script::Refuse(TransferError::AccessDenied));
    rig.chunked.push(Script::Complete(vec![3; 10]));
    rig.chunked.push(Script::Complete(vec![4; 4]));
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    wait_for_event(&mut events, is_downloaded).await;
    coordinator.download_update(update("3.0", 100, Some(4)), false).await.unwrap();
    wait_for_event(&mut events, is_downloaded).await;

    assert_eq!(native.requests().len(), 1);
    assert_eq!(rig.chunked.requests().len(), 2);
}

#[tokio::test]
async fn test_overrun_is_cancelled_and_counted() {
    let rig = Rig::new();
    rig.chunked.push(Script::Progress { transferred: 20, total: 20 });
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    let failed = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::DownloadAttemptFailed { .. })).await;
    assert_eq!(failed, UpdateEvent::DownloadAttemptFailed { attempts: 1 });
    let error = wait_for_event(&mut events, is_download_error).await;
    assert_eq!(
        error,
        UpdateEvent::UpdateError {
            version: Some("2.0".to_string()),
            reason: ErrorReason::DownloadFailed,
            code: codes::DOWNLOAD_FAILED
        }
    );

    assert!(coordinator.downloading_update().await.is_none());
    let history = coordinator.history().await;
    assert_eq!(history[0].state(), UpdateStatus::DownloadFailed);
    assert_eq!(
        history[0].selected_patch().unwrap().properties.get(props::CHUNKED_RESULT),
        Some("unexpected")
    );
    assert_eq!(coordinator.prefs().await.download_attempts, 1);
    assert_eq!(coordinator.state(), UpdateState::Idle);
    assert_eq!(read_status(&rig.ready_dir()), "null");
}

#[tokio::test(start_paused = true)]
async fn test_socket_errors_retry_up_to_limit() {
    let mut rig = Rig::new();
    rig.config.network.socket_max_errors = 2;
    rig.config.network.socket_retry_timeout_ms = 500;
    for _ in 0..3 {
        rig.chunked.push(Script::Fail(TransferStatus::ConnectionReset));
    }
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    wait_for_event(&mut events, is_download_error).await;

    assert_eq!(rig.chunked.requests().len(), 3);
    assert_eq!(coordinator.prefs().await.download_attempts, 1);
    assert!(coordinator.downloading_update().await.is_none());
}

#[tokio::test]
async fn test_offline_download_resumes_when_online() {
    let rig = Rig::new();
    rig.network.set_online(false);
    rig.chunked.push(Script::Fail(TransferStatus::ConnectionReset));
    rig.chunked.push(Script::Complete(vec![9; 10]));
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, UpdateEvent::DownloadStopped { .. })).await;
    tokio::task::yield_now().await;
    assert_eq!(rig.chunked.requests().len(), 1);
    assert!(coordinator.downloading_update().await.is_some());

    rig.network.set_online(true);
    wait_for_event(&mut events, is_downloaded).await;
    assert_eq!(rig.chunked.requests().len(), 2);
    assert_eq!(coordinator.prefs().await.download_attempts, 0);
}

#[tokio::test]
async fn test_second_applying_resets_as_crash() {
    let rig = Rig::new();
    seed(&rig, Some(selected(update("2.0", 10, None), UpdateStatus::Applying)), None, "applying");
    let coordinator = rig.coordinator();
    coordinator.init().await.unwrap();

    assert!(coordinator.ready_update().await.is_none());
    let history = coordinator.history().await;
    assert_eq!(history[0].app_version.as_deref(), Some("2.0"));
    assert_eq!(history[0].state(), UpdateStatus::Failed);
    assert_eq!(history[0].error_code(), codes::ERR_UPDATER_CRASHED);
    assert!(!rig.ready_dir().join("update.patch").exists());
    assert_eq!(coordinator.state(), UpdateState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_first_applying_waits_for_staging() {
    let rig = Rig::new();
    seed(&rig, Some(selected(update("2.0", 10, None), UpdateStatus::Pending)), None, "applying");
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();
    coordinator.init().await.unwrap();
    assert_eq!(coordinator.state(), UpdateState::Staging);
    assert_eq!(coordinator.ready_update().await.unwrap().state(), UpdateStatus::Applying);

    std::fs::write(rig.ready_dir().join("update.status"), "applied").unwrap();
    let staged = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::UpdateStaged { .. })).await;
    assert_eq!(
        staged,
        UpdateEvent::UpdateStaged { version: "2.0".to_string(), state: UpdateStatus::Applied }
    );
    assert_eq!(coordinator.state(), UpdateState::Pending);
}

#[tokio::test]
async fn test_native_job_resumed_at_startup() {
    let rig = Rig::new().with_native();
    let native = rig.native.clone().unwrap();
    native.push(Script::Complete(vec![5; 10]));
    let mut downloading = selected(update("2.0", 10, None), UpdateStatus::Downloading);
    downloading.patches[0].properties.set_known(props::NATIVE_JOB_ID, "job-7");
    seed(&rig, None, Some(downloading), "downloading");

    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();
    coordinator.init().await.unwrap();
    wait_for_event(&mut events, is_downloaded).await;

    assert_eq!(native.resumed_jobs(), vec!["job-7".to_string()]);
    assert_eq!(native.completes(), 1);
    assert_eq!(coordinator.state(), UpdateState::Pending);
}

#[tokio::test]
async fn test_channel_change_discards_ready_update() {
    let rig = Rig::new();
    let mut ready = selected(update("2.0", 10, None), UpdateStatus::Pending);
    ready.channel = "beta".to_string();
    seed(&rig, Some(ready), None, "pending");

    let coordinator = rig.coordinator();
    coordinator.init().await.unwrap();
    assert!(coordinator.ready_update().await.is_none());
    assert_eq!(coordinator.history().await[0].error_code(), codes::ERR_CHANNEL_CHANGE);
}

#[tokio::test]
async fn test_succeeded_install_moves_to_history() {
    let rig = Rig::new();
    seed(&rig, Some(selected(update("2.0", 10, None), UpdateStatus::Pending)), None, "succeeded");
    let coordinator = rig.coordinator();
    coordinator.init().await.unwrap();

    assert!(coordinator.ready_update().await.is_none());
    let history = coordinator.history().await;
    assert_eq!(history[0].state(), UpdateStatus::Succeeded);
    assert_eq!(coordinator.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_staging_after_download() {
    let rig = Rig::new().with_staging(StatusToken::new(UpdateStatus::Applied));
    rig.chunked.push(Script::Complete(vec![1; 10]));
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    let staged = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::UpdateStaged { .. })).await;
    assert_eq!(
        staged,
        UpdateEvent::UpdateStaged { version: "2.0".to_string(), state: UpdateStatus::Applied }
    );
    assert_eq!(rig.apply.as_ref().unwrap().runs(), 1);
    assert_eq!(read_status(&rig.ready_dir()), "applied");
    assert_eq!(coordinator.state(), UpdateState::Pending);
}

#[tokio::test]
async fn test_failed_partial_falls_back_to_complete() {
    let rig = Rig::new().with_staging(StatusToken::failed(1));
    rig.apply.as_ref().unwrap().then(StatusToken::new(UpdateStatus::Applied));
    rig.chunked.push(Script::Complete(vec![1; 4]));
    rig.chunked.push(Script::Complete(vec![2; 10]));
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    coordinator.download_update(update("2.0", 10, Some(4)), false).await.unwrap();
    let staged = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::UpdateStaged { .. })).await;
    assert_eq!(
        staged,
        UpdateEvent::UpdateStaged { version: "2.0".to_string(), state: UpdateStatus::Applied }
    );

    let requests = rig.chunked.requests();
    assert_eq!(requests[0].url, "http://u/2.0/partial");
    assert_eq!(requests[1].url, "http://u/2.0/complete");
    let ready = coordinator.ready_update().await.unwrap();
    assert_eq!(ready.selected_patch().unwrap().patch_type, PatchType::Complete);
    let history = coordinator.history().await;
    assert_eq!(history[0].state(), UpdateStatus::Failed);
    assert_eq!(history[0].error_code(), 1);
    assert_eq!(rig.apply.as_ref().unwrap().runs(), 2);
}

#[tokio::test]
async fn test_write_error_requeues_install() {
    let rig = Rig::new().with_staging(StatusToken::failed(7));
    rig.chunked.push(Script::Complete(vec![1; 10]));
    let coordinator = rig.coordinator();

    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    wait_for_state(&coordinator, UpdateState::Pending).await;

    let ready = coordinator.ready_update().await.unwrap();
    assert_eq!(ready.state(), UpdateStatus::Pending);
    assert_eq!(ready.selected_patch().unwrap().properties.get(props::TOTAL_INSTALL_ATTEMPTS), Some("1"));
    assert_eq!(read_status(&rig.ready_dir()), "pending");
}

#[tokio::test]
async fn test_foreground_check_prompts() {
    let rig = Rig::new();
    rig.fetcher.push_updates(&[update("2.0", 10, None)]);
    let coordinator = rig.coordinator();

    let outcome = coordinator.check_for_updates(CheckKind::Foreground).await.unwrap();
    match outcome {
        CheckOutcome::Available { update, reason } => {
            assert_eq!(update.app_version.as_deref(), Some("2.0"));
            assert_eq!(reason, AvailableReason::ShowPrompt);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(rig.chunked.requests().is_empty());
    assert_eq!(coordinator.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_background_check_failures_are_counted() {
    let rig = Rig::new();
    rig.fetcher.push_error(CheckError::Http(500));
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    let outcome = coordinator.check_for_updates(CheckKind::Background).await.unwrap();
    assert_eq!(outcome, CheckOutcome::Failed { code: 1500 });
    let failed = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::CheckAttemptFailed { .. })).await;
    assert_eq!(failed, UpdateEvent::CheckAttemptFailed { errors: 1 });
    assert_eq!(coordinator.prefs().await.background_errors, 1);
}

#[tokio::test]
async fn test_no_newer_update() {
    let rig = Rig::new();
    rig.fetcher.push_updates(&[update("0.9", 10, None)]);
    let coordinator = rig.coordinator();

    let outcome = coordinator.check_for_updates(CheckKind::Background).await.unwrap();
    assert_eq!(outcome, CheckOutcome::NoUpdate);
}

#[tokio::test]
async fn test_stop_downloading_keeps_update() {
    let rig = Rig::new();
    rig.chunked.push(Script::Progress { transferred: 5, total: 10 });
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    let progress = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::DownloadProgress { .. })).await;
    assert_eq!(progress, UpdateEvent::DownloadProgress { transferred: 5, total: 10 });

    coordinator.stop_downloading().await;
    assert!(!coordinator.is_downloading().await);
    assert!(coordinator.downloading_update().await.is_some());
    assert_eq!(coordinator.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_listeners_speed_up_polling() {
    let rig = Rig::new();
    rig.chunked.push(Script::Progress { transferred: 5, total: 10 });
    let coordinator = rig.coordinator();

    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    assert_eq!(rig.chunked.poll_intervals().last(), Some(&IDLE_POLL_INTERVAL));
    coordinator.add_download_listener().await;
    assert_eq!(rig.chunked.poll_intervals().last(), Some(&ACTIVE_POLL_INTERVAL));
    coordinator.remove_download_listener().await;
    assert_eq!(rig.chunked.poll_intervals().last(), Some(&IDLE_POLL_INTERVAL));
}

#[tokio::test]
async fn test_second_instance_only_checks() {
    let rig = Rig::new();
    let first = rig.coordinator();
    first.init().await.unwrap();
    assert!(first.has_lock().await);

    rig.fetcher.push_updates(&[update("2.0", 10, None)]);
    let second = rig.coordinator();
    let outcome = second.check_for_updates(CheckKind::Background).await.unwrap();
    assert!(matches!(outcome, CheckOutcome::Available { reason: AvailableReason::ShowPrompt, .. }));
    assert!(!second.has_lock().await);

    let refused = second.download_update(update("2.0", 10, None), false).await;
    assert!(matches!(refused, Err(UpdateError::LockUnavailable)));
    assert!(rig.chunked.requests().is_empty());
}

#[tokio::test]
async fn test_reset_clears_slots_and_counters() {
    let rig = Rig::new();
    rig.chunked.push(Script::Complete(vec![1; 10]));
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();
    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    wait_for_event(&mut events, is_downloaded).await;

    coordinator.reset().await.unwrap();
    assert!(coordinator.ready_update().await.is_none());
    assert_eq!(coordinator.state(), UpdateState::Idle);
    assert!(!rig.ready_dir().join("update.patch").exists());
    assert!(!rig.root().join(ACTIVE_UPDATE_FILE).exists());
}

#[tokio::test(start_paused = true)]
async fn test_restart_during_staging_keeps_waiting() {
    let rig = Rig::new().with_stalled_staging();
    let apply = rig.apply.clone().unwrap();
    rig.chunked.push(Script::Complete(vec![1; 10]));
    let coordinator = rig.coordinator();

    coordinator.download_update(update("2.0", 10, None), false).await.unwrap();
    wait_for_state(&coordinator, UpdateState::Staging).await;
    while apply.runs() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(read_status(&rig.ready_dir()), "applying");
    assert_eq!(coordinator.ready_update().await.unwrap().state(), UpdateStatus::Pending);
    coordinator.shutdown().await;
    drop(coordinator);

    let restarted = rig.coordinator();
    let mut events = restarted.subscribe();
    restarted.init().await.unwrap();
    assert_eq!(restarted.state(), UpdateState::Staging);
    assert_eq!(restarted.ready_update().await.unwrap().state(), UpdateStatus::Applying);
    assert!(restarted.history().await.is_empty());

    std::fs::write(rig.ready_dir().join("update.status"), "applied").unwrap();
    let staged = wait_for_event(&mut events, |e| matches!(e, UpdateEvent::UpdateStaged { .. })).await;
    assert_eq!(
        staged,
        UpdateEvent::UpdateStaged { version: "2.0".to_string(), state: UpdateStatus::Applied }
    );
    assert_eq!(apply.runs(), 1);
    assert_eq!(restarted.state(), UpdateState::Pending);
}

#[tokio::test]
async fn test_failed_downloads_stop_after_max_attempts() {
    let mut rig = Rig::new();
    rig.config.download.max_attempts = 2;
    let coordinator = rig.coordinator();
    let mut events = coordinator.subscribe();

    let mut counted = Vec::new();
    for _ in 0..3 {
        rig.fetcher.push_updates(&[update("2.0", 10, None)]);
        rig.chunked.push(Script::Fail(TransferStatus::Http(500)));
        let outcome = coordinator.check_for_updates(CheckKind::Background).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Downloading { version: "2.0".to_string() });
        counted.push(
            wait_for_event(&mut events, |e| {
                matches!(e, UpdateEvent::DownloadAttemptFailed { .. } | UpdateEvent::DownloadAttemptsExceeded { .. })
            })
            .await,
        );
        wait_for_event(&mut events, is_download_error).await;
    }
    assert_eq!(
        counted,
        vec![
            UpdateEvent::DownloadAttemptFailed { attempts: 1 },
            UpdateEvent::DownloadAttemptFailed { attempts: 2 },
            UpdateEvent::DownloadAttemptsExceeded { attempts: 3 },
        ]
    );

    rig.fetcher.push_updates(&[update("2.0", 10, None)]);
    let outcome = coordinator.check_for_updates(CheckKind::Background).await.unwrap();
    assert!(matches!(outcome, CheckOutcome::Available { reason: AvailableReason::ShowPrompt, .. }));
    assert_eq!(rig.chunked.requests().len(), 3);
    assert_eq!(coordinator.prefs().await.download_attempts, 3);

    // A newer update starts a fresh count.
    rig.fetcher.push_updates(&[update("3.0", 10, None)]);
    rig.chunked.push(Script::Complete(vec![3; 10]));
    let outcome = coordinator.check_for_updates(CheckKind::Background).await.unwrap();
    assert_eq!(outcome, CheckOutcome::Downloading { version: "3.0".to_string() });
    wait_for_event(&mut events, is_downloaded).await;
    let prefs = coordinator.prefs().await;
    assert_eq!(prefs.download_attempts, 0);
    assert_eq!(prefs.download_version, None);
}

#[tokio::test]
async fn test_service_disabled_after_max_errors() {
    let mut rig = Rig::new();
    rig.privileges.service_installed = true;
    let max = rig.config.service.effective_max_errors();
    seed_prefs(&rig, |p| p.service_errors = max - 1);
    seed(&rig, Some(selected(update("2.0", 10, None), UpdateStatus::PendingService)), None, "failed:58");

    let coordinator = rig.coordinator();
    coordinator.init().await.unwrap();
    let prefs = coordinator.prefs().await;
    assert_eq!(prefs.service_errors, max);
    assert!(!prefs.service_disabled);
    assert_eq!(read_status(&rig.ready_dir()), "pending");
    coordinator.shutdown().await;
    drop(coordinator);

    std::fs::write(rig.ready_dir().join("update.status"), "failed:58").unwrap();
    let restarted = rig.coordinator();
    restarted.init().await.unwrap();
    let prefs = restarted.prefs().await;
    assert_eq!(prefs.service_errors, 0);
    assert!(prefs.service_disabled);
    assert_eq!(restarted.ready_update().await.unwrap().state(), UpdateStatus::Pending);
    assert_eq!(restarted.state(), UpdateState::Pending);
}

#[tokio::test]
async fn test_elevation_gate_cap_drops_ready_update() {
    let mut rig = Rig::new();
    rig.config.elevation.gate_enabled = true;
    let max = rig.config.elevation.effective_cancelations_max();
    seed_prefs(&rig, |p| p.cancelations_gated = max - 1);
    seed(&rig, Some(selected(update("2.0", 10, Some(4)), UpdateStatus::PendingElevate)), None, "failed:9");

    let coordinator = rig.coordinator();
    coordinator.init().await.unwrap();

    assert!(coordinator.ready_update().await.is_none());
    assert!(coordinator.downloading_update().await.is_none());
    assert!(rig.chunked.requests().is_empty());
    let history = coordinator.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].error_code(), 9);
    assert_eq!(coordinator.prefs().await.cancelations_gated, max);
    assert_eq!(coordinator.state(), UpdateState::Idle);
}
