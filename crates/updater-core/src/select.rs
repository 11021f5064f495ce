//! Choosing one update out of a manifest.

use std::cmp::Ordering;

use tracing::{debug, info};

use crate::config::ElevationConfig;
use crate::prefs::PrefsStore;
use crate::record::{PatchType, UpdateRecord, UpdateType};
use crate::version::{compare_versions, is_at_least_as_old_as};

/// Version and build an update must be newer than.
#[derive(Debug, Clone, Copy)]
pub struct Baseline<'a> {
    pub version: &'a str,
    pub build_id: Option<&'a str>,
}

impl<'a> Baseline<'a> {
    fn of(update: &'a UpdateRecord) -> Option<Self> {
        Some(Self { version: update.app_version.as_deref()?, build_id: update.build_id.as_deref() })
    }

    fn is_not_older_than(&self, update: &UpdateRecord) -> bool {
        match update.app_version.as_deref() {
            Some(version) => {
                is_at_least_as_old_as(version, update.build_id.as_deref(), self.version, self.build_id)
            }
            None => true,
        }
    }
}

/// Returns true if `candidate` should replace `best` in its type bucket.
fn replaces(best: Option<&UpdateRecord>, candidate: &UpdateRecord) -> bool {
    let Some(best) = best else {
        return true;
    };
    if best.unsupported {
        return true;
    }
    if candidate.unsupported {
        return false;
    }
    let ord = compare_versions(
        candidate.app_version.as_deref().unwrap_or_default(),
        best.app_version.as_deref().unwrap_or_default(),
    );
    ord != Ordering::Less
}

/// Picks the update to offer from `updates`.
///
/// Candidates not newer than the running build, or not newer than `ready`
/// when an update is already waiting, are discarded; with a ready update
/// only candidates carrying a partial patch qualify. The newest major and
/// newest minor update are tracked separately and the minor one wins.
pub fn select_update(
    updates: Vec<UpdateRecord>,
    running: Baseline<'_>,
    ready: Option<&UpdateRecord>,
) -> Option<UpdateRecord> {
    if updates.is_empty() {
        return None;
    }

    // A lone unsupported update is offered so the user learns about it.
    if updates.len() == 1 && updates[0].unsupported {
        return updates.into_iter().next();
    }

    let ready_baseline = ready.and_then(Baseline::of);
    let mut major: Option<UpdateRecord> = None;
    let mut minor: Option<UpdateRecord> = None;

    for update in updates {
        if running.is_not_older_than(&update) {
            debug!("Ignoring update {}, not newer than the running build", update.describe());
            continue;
        }
        if let Some(baseline) = &ready_baseline {
            if baseline.is_not_older_than(&update) {
                debug!("Ignoring update {}, not newer than the ready update", update.describe());
                continue;
            }
            if update.patch_of_type(PatchType::Partial).is_none() {
                debug!("Ignoring update {}, no partial patch for the ready update", update.describe());
                continue;
            }
        }

        let kind = update.update_type.clone();
        match kind {
            Some(UpdateType::Major) => {
                if replaces(major.as_ref(), &update) {
                    major = Some(update);
                }
            }
            Some(UpdateType::Minor) => {
                if replaces(minor.as_ref(), &update) {
                    minor = Some(update);
                }
            }
            other => {
                info!("Ignoring update {} of unknown type {:?}", update.describe(), other);
            }
        }
    }

    minor.or(major)
}

/// Marks `update` with `elevation_failure` when applying it needs an
/// elevation the user has refused too often, or refused for good.
///
/// A new version resets the refusal counters.
pub fn apply_elevation_gate(
    update: &mut UpdateRecord,
    prefs: &mut PrefsStore,
    config: &ElevationConfig,
    elevation_required: bool,
) {
    if !config.gate_enabled {
        return;
    }

    if !elevation_required {
        if prefs.get().elevate_version.is_some() || prefs.get().elevate_never {
            prefs.update(|p| {
                p.elevate_version = None;
                p.elevate_never = false;
                p.clear_cancelations();
            });
        }
        return;
    }

    let version = update.app_version.clone().unwrap_or_default();
    let same_version = prefs
        .get()
        .elevate_version
        .as_deref()
        .map(|v| compare_versions(v, &version) == Ordering::Equal)
        .unwrap_or(false);

    if !same_version {
        debug!("Elevation required for new version {}, resetting refusals", version);
        prefs.update(|p| {
            p.elevate_version = Some(version);
            p.elevate_never = false;
            p.clear_cancelations();
        });
        return;
    }

    let prefs = prefs.get();
    if prefs.cancelations_gated >= config.effective_cancelations_max() || prefs.elevate_never {
        info!("Elevation refused for {}, marking elevation failure", update.describe());
        update.elevation_failure = true;
    }
}
