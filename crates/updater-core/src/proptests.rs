//! Property-based tests for updater-core.
//!
//! These tests use proptest to check properties of the pure decision code
//! and the record format across randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Property 1: Record persistence round-trips
//! - Property 2: At most two active updates survive a reload
//! - Property 3: Patch selection keeps a single selected patch
//! - Property 4: Selected updates are always newer
//! - Property 5: Socket retries are bounded
//! - Property 6: Progress never exceeds the patch size
//! - Property 7: Staging polls stop within the ceiling

#![cfg(test)]

use std::time::Duration;

use proptest::prelude::*;
use tempfile::TempDir;

use crate::config::StagingConfig;
use crate::download::{classify_stop, select_patch, DownloadSession, PatchSelection, StepAction, StopClass};
use crate::record::{parse_document, to_document, PatchRecord, PatchType, RecordDefaults, UpdateRecord, UpdateType};
use crate::select::{select_update, Baseline};
use crate::staging::{PollDecision, StagingPollSchedule};
use crate::status::{write_status, UpdateStatus};
use crate::store::{UpdateDirs, UpdateStateStore};
use crate::transfer::{BackendKind, TransferEvent, TransferStatus};
use crate::version::is_at_least_as_old_as;

// =============================================================================
// Generators
// =============================================================================

/// Generate a dotted version with two or three numeric parts.
fn arb_version() -> impl Strategy<Value = String> {
    (0u32..20, 0u32..20, prop::option::of(0u32..20)).prop_map(|(major, minor, patch)| match patch {
        Some(patch) => format!("{}.{}.{}", major, minor, patch),
        None => format!("{}.{}", major, minor),
    })
}

/// Generate a 14 digit build id.
fn arb_build_id() -> impl Strategy<Value = String> {
    (20200101u32..20301231, 0u32..240000).prop_map(|(day, time)| format!("{}{:06}", day, time))
}

fn arb_state() -> impl Strategy<Value = UpdateStatus> {
    prop_oneof![
        Just(UpdateStatus::None),
        Just(UpdateStatus::Downloading),
        Just(UpdateStatus::Pending),
        Just(UpdateStatus::PendingService),
        Just(UpdateStatus::PendingElevate),
        Just(UpdateStatus::Applying),
        Just(UpdateStatus::Applied),
        Just(UpdateStatus::AppliedService),
        Just(UpdateStatus::Succeeded),
        Just(UpdateStatus::DownloadFailed),
        Just(UpdateStatus::Failed),
    ]
}

/// Generate extra properties whose names never collide with fixed
/// attributes.
fn arb_properties() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("x-[a-z]{1,8}", "[A-Za-z0-9 ]{1,12}"), 0..4)
}

/// Generate a patch list: a complete patch and maybe a partial one.
fn arb_patches() -> impl Strategy<Value = Vec<PatchRecord>> {
    (1u64..1_000_000, prop::option::of(1u64..1_000_000), arb_properties()).prop_map(
        |(complete, partial, properties)| {
            let mut patches = vec![PatchRecord::new(PatchType::Complete, "https://u/complete", complete)];
            if let Some(size) = partial {
                patches.push(PatchRecord::new(PatchType::Partial, "https://u/partial", size));
            }
            for (name, value) in properties {
                patches[0].properties.set(&name, value).unwrap();
            }
            patches
        },
    )
}

/// Generate an update record as it would be persisted.
fn arb_record() -> impl Strategy<Value = UpdateRecord> {
    (
        arb_version(),
        prop::option::of(arb_build_id()),
        prop::bool::ANY,
        arb_patches(),
        prop::option::of(0usize..2),
        arb_state(),
        0i32..200,
        arb_properties(),
        1i64..4_000_000_000_000,
        prop::option::of("[a-z ]{1,20}"),
    )
        .prop_map(
            |(version, build_id, major, patches, selected, state, code, properties, date, status_text)| {
                let update_type = if major { UpdateType::Major } else { UpdateType::Minor };
                let mut update = UpdateRecord::new(version, update_type, patches);
                update.build_id = build_id;
                update.previous_app_version = Some("1.0".to_string());
                update.install_date = date;
                update.status_text = status_text;
                if let Some(index) = selected {
                    if let Some(patch) = update.patches.get_mut(index) {
                        patch.selected = true;
                    }
                }
                update.set_state(state);
                update.set_error_code(code);
                for (name, value) in properties {
                    update.properties.set(&name, value).unwrap();
                }
                update
            },
        )
}

fn arb_candidates() -> impl Strategy<Value = Vec<UpdateRecord>> {
    prop::collection::vec(
        (arb_version(), prop::option::of(arb_build_id()), prop::bool::ANY, prop::bool::ANY).prop_map(
            |(version, build_id, major, partial)| {
                let mut patches = vec![PatchRecord::new(PatchType::Complete, "c", 100)];
                if partial {
                    patches.push(PatchRecord::new(PatchType::Partial, "p", 10));
                }
                let update_type = if major { UpdateType::Major } else { UpdateType::Minor };
                let mut update = UpdateRecord::new(version, update_type, patches);
                update.build_id = build_id;
                update
            },
        ),
        0..6,
    )
}

fn defaults() -> RecordDefaults {
    RecordDefaults { app_version: "1.0".to_string(), ..RecordDefaults::default() }
}

// =============================================================================
// Property 1: Record Persistence Round-Trip
//
// *For any* record, writing it to a record document and parsing it back
// SHALL produce an equal record.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 1: Record Persistence Round-Trip**
    #[test]
    fn prop_record_round_trip(update in arb_record()) {
        let bytes = to_document([&update]).to_xml().unwrap();
        let parsed = parse_document(&bytes, &defaults()).unwrap();
        prop_assert_eq!(parsed.len(), 1);
        prop_assert_eq!(&parsed[0], &update);
        prop_assert_eq!(parsed[0].state(), update.state());
        prop_assert_eq!(parsed[0].error_code(), update.error_code());
    }
}

// =============================================================================
// Property 2: Slot Invariant
//
// *For any* combination of active records and status token, a reload SHALL
// fill at most two slots and keep every record that was written.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// **Property 2: At most two active updates survive a reload**
    #[test]
    fn prop_reload_keeps_slots(
        ready in prop::option::of(arb_record()),
        downloading in prop::option::of(arb_record()),
        status in arb_state(),
    ) {
        let temp = TempDir::new().unwrap();
        let dirs = UpdateDirs::new(temp.path());
        let mut store = UpdateStateStore::new(dirs.clone(), defaults(), Duration::ZERO);
        let written = usize::from(ready.is_some()) + usize::from(downloading.is_some());
        store.set_ready(ready.clone());
        store.set_downloading(downloading.clone());
        store.save_updates();
        store.flush().unwrap();
        write_status(&dirs.ready_dir(), status.into()).unwrap();

        let mut reloaded = UpdateStateStore::new(dirs, defaults(), Duration::ZERO);
        reloaded.reload(false);
        prop_assert!(reloaded.slot_count() <= 2);
        prop_assert_eq!(reloaded.slot_count(), written);
        if let (Some(ready), Some(downloading)) = (&ready, &downloading) {
            prop_assert_eq!(reloaded.ready_update(), Some(ready));
            prop_assert_eq!(reloaded.downloading_update(), Some(downloading));
        }
    }
}

// =============================================================================
// Property 3: Single Selected Patch
//
// *For any* update, patch selection SHALL leave at most one patch selected,
// and with an update already ready only a partial patch.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// **Property 3: Patch selection keeps a single selected patch**
    #[test]
    fn prop_single_selected_patch(mut update in arb_record(), has_ready in prop::bool::ANY) {
        let selection = select_patch(&mut update, has_ready);
        let selected = update.patches.iter().filter(|p| p.selected).count();
        prop_assert!(selected <= 1);

        if let Some(index) = selection.patch_index() {
            prop_assert!(update.patches[index].selected);
            if has_ready && matches!(selection, PatchSelection::Selected(_)) {
                prop_assert_eq!(update.patches[index].patch_type, PatchType::Partial);
            }
        }
    }
}

// =============================================================================
// Property 4: Selected Updates Are Newer
//
// *For any* manifest, the selected update SHALL be newer than the running
// build and, when an update is ready, newer than it and carry a partial
// patch.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// **Property 4: Selected updates are always newer**
    #[test]
    fn prop_selected_update_is_newer(
        candidates in arb_candidates(),
        running in arb_version(),
        ready_version in prop::option::of(arb_version()),
    ) {
        let running_build = "20250101000000";
        let ready = ready_version.map(|v| {
            let mut ready = UpdateRecord::new(v, UpdateType::Minor, vec![PatchRecord::new(PatchType::Complete, "c", 1)]);
            ready.build_id = Some(running_build.to_string());
            ready
        });
        let baseline = Baseline { version: &running, build_id: Some(running_build) };

        if let Some(update) = select_update(candidates, baseline, ready.as_ref()) {
            let version = update.app_version.as_deref().unwrap();
            prop_assert!(!is_at_least_as_old_as(version, update.build_id.as_deref(), &running, Some(running_build)));
            if let Some(ready) = &ready {
                let ready_version = ready.app_version.as_deref().unwrap();
                prop_assert!(!is_at_least_as_old_as(
                    version,
                    update.build_id.as_deref(),
                    ready_version,
                    ready.build_id.as_deref(),
                ));
                prop_assert!(update.patch_of_type(PatchType::Partial).is_some());
            }
        }
    }
}

// =============================================================================
// Property 5: Bounded Socket Retries
//
// *For any* limit, a run of socket errors SHALL be retried at most `limit`
// times before it counts as a failure.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 5: Socket retries are bounded**
    #[test]
    fn prop_socket_retries_bounded(limit in 0u32..20, failures in 1usize..40) {
        let mut consecutive = 0;
        let mut gave_up = false;
        for _ in 0..failures {
            match classify_stop(&TransferStatus::ConnectionReset, consecutive, limit, false) {
                StopClass::RetryableNetwork => consecutive += 1,
                StopClass::OtherFailure => {
                    gave_up = true;
                    break;
                }
                other => prop_assert!(false, "unexpected class {:?}", other),
            }
        }
        prop_assert!(consecutive <= limit);
        prop_assert_eq!(gave_up, failures > limit as usize);
    }
}

// =============================================================================
// Property 6: Progress Bounded By Patch Size
//
// *For any* progress report, the session SHALL only pass on progress that
// fits the patch size.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// **Property 6: Progress never exceeds the patch size**
    #[test]
    fn prop_progress_within_size(size in 1u64..10_000, transferred in 0u64..20_000, total in 0u64..20_000) {
        let mut session = DownloadSession::new(BackendKind::Chunked, size);
        match session.step(TransferEvent::Progress { transferred, total }) {
            StepAction::Progress(progress) => {
                prop_assert!(progress.downloaded <= size);
                prop_assert!(transferred == 0 || progress.total == size);
            }
            StepAction::Cancel(status) => {
                prop_assert_eq!(status, TransferStatus::Unexpected);
                prop_assert!(transferred > size || total != size);
            }
            other => prop_assert!(false, "unexpected action {:?}", other),
        }
    }
}

// =============================================================================
// Property 7: Staging Poll Ceiling
//
// *For any* schedule, polling while staging never ends SHALL stop once the
// summed intervals reach the ceiling, and no interval SHALL exceed the
// configured maximum.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 7: Staging polls stop within the ceiling**
    #[test]
    fn prop_staging_polls_bounded(
        min in 1u64..60,
        max in 1u64..600,
        attempts in 0u32..10,
        ceiling in 0u64..7200,
    ) {
        let config = StagingConfig {
            min_interval_seconds: min,
            max_interval_seconds: max,
            attempts_per_interval: attempts,
            max_duration_seconds: ceiling,
        };
        let limit = Duration::from_secs(min.max(max));
        let mut schedule = StagingPollSchedule::new(&config);
        let mut elapsed = Duration::ZERO;
        loop {
            let interval = schedule.interval();
            prop_assert!(interval <= limit);
            elapsed += interval;
            if schedule.poll(true) == PollDecision::Refresh {
                break;
            }
            prop_assert!(elapsed < Duration::from_secs(ceiling));
        }
        prop_assert!(elapsed >= Duration::from_secs(ceiling));
    }
}
