//! Sync engine (C8).
//!
//! One background thread per volume, driven by a `std::thread` with a
//! `Condvar`: a cooperative sync thread woken by an explicit trigger or
//! a periodic timer.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use tape_transport::{CapacityState, PartitionId, TapeTransport};

use crate::error::{Result, Status};
use crate::index::manager::IndexManager;
use crate::index::xml::IndexPartitionCriteriaXml;
use crate::position::PositionManager;
use crate::tree::Tree;

/// Why a sync ran; used only for logging (the trigger table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Timer,
    FileClose,
    Unmount,
    ExplicitXattr,
    CachePressure,
    IndexPartitionEarlyWarning,
    DataPartitionEarlyWarning,
}

struct SharedState {
    keepalive: AtomicBool,
    requested: Mutex<Option<SyncTrigger>>,
    cond: Condvar,
}

/// Handle kept by the façade (C10) to request syncs and to join the
/// background thread at unmount.
pub struct SyncHandle {
    shared: Arc<SharedState>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl SyncHandle {
    pub fn request(&self, trigger: SyncTrigger) {
        let mut requested = self.shared.requested.lock().unwrap();
        // A higher-priority trigger should not be clobbered by a lower one
        // arriving first; in practice any trigger just means "a sync is
        // due," so last-write overwrite is fine except unmount always wins.
        if !matches!(*requested, Some(SyncTrigger::Unmount)) {
            *requested = Some(trigger);
        }
        self.shared.cond.notify_all();
    }

    /// Sets `keepalive=false`, wakes the thread, and joins it. The caller
    /// is expected to have already requested one final `Unmount` sync.
    pub fn shutdown(&mut self) {
        self.shared.keepalive.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// Generation-write inputs captured under the volume lock, then used to
/// build the index XML and write it without holding that lock.
pub struct SyncSnapshot {
    pub tree: Arc<Tree>,
    pub creator: String,
    pub blocksize: u32,
    pub index_criteria: Option<IndexPartitionCriteriaXml>,
    pub partitions: Vec<PartitionId>,
}

/// Runs one sync pass: writes a new generation to `snapshot.partitions`
/// using `mgr`/`manager`,
pub fn run_sync<T: TapeTransport>(
    mgr: &mut PositionManager<T>,
    manager: &mut IndexManager,
    snapshot: &SyncSnapshot,
) -> Result<Status> {
    manager.write_generation(
        mgr,
        &snapshot.tree,
        &snapshot.creator,
        snapshot.blocksize,
        snapshot.index_criteria.clone(),
        &snapshot.partitions,
    )
}

/// Spawns the background sync thread. `on_trigger` is called with the
/// trigger that fired; it owns taking the volume lock, building a
/// [`SyncSnapshot`], calling [`run_sync`], and releasing the lock again,
/// matching "snapshot under lock, build XML unlocked, take
/// lock again to write" discipline. Returns `false` from `on_trigger` to
/// stop the loop early (used for an unrecoverable `ReadOnlyVolume`).
pub fn spawn(
    sync_interval: Option<Duration>,
    mut on_trigger: impl FnMut(SyncTrigger) -> bool + Send + 'static,
) -> SyncHandle {
    let shared = Arc::new(SharedState {
        keepalive: AtomicBool::new(true),
        requested: Mutex::new(None),
        cond: Condvar::new(),
    });
    let worker_shared = shared.clone();

    let join = std::thread::spawn(move || {
        let mut next_timer = sync_interval.map(|d| Instant::now() + d);
        loop {
            let mut requested = worker_shared.requested.lock().unwrap();
            loop {
                if !worker_shared.keepalive.load(Ordering::SeqCst) {
                    return;
                }
                if requested.is_some() {
                    break;
                }
                match next_timer {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let (guard, timeout) = worker_shared.cond.wait_timeout(requested, deadline - now).unwrap();
                        requested = guard;
                        if timeout.timed_out() {
                            break;
                        }
                    }
                    None => {
                        requested = worker_shared.cond.wait(requested).unwrap();
                    }
                }
            }
            if !worker_shared.keepalive.load(Ordering::SeqCst) {
                return;
            }
            let trigger = requested.take().unwrap_or(SyncTrigger::Timer);
            drop(requested);

            if let Some(interval) = sync_interval {
                next_timer = Some(Instant::now() + interval);
            }

            info!("sync engine: running sync for trigger {:?}", trigger);
            let keep_going = on_trigger(trigger);
            if !keep_going {
                warn!("sync engine: stopping after trigger {:?}", trigger);
                worker_shared.keepalive.store(false, Ordering::SeqCst);
                return;
            }
        }
    });

    SyncHandle { shared, join: Some(join) }
}

/// Whether a write status warrants an immediate sync request per the
/// trigger table (the IP/DP early-warning rows).
pub fn trigger_for_capacity(state_ip: CapacityState, state_dp: CapacityState) -> Option<SyncTrigger> {
    if state_ip == CapacityState::ProgramEarlyWarning {
        Some(SyncTrigger::IndexPartitionEarlyWarning)
    } else if state_dp == CapacityState::ProgramEarlyWarning {
        Some(SyncTrigger::DataPartitionEarlyWarning)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn explicit_trigger_wakes_and_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let mut handle = spawn(None, move |_trigger| {
            count2.fetch_add(1, Ordering::SeqCst);
            true
        });
        handle.request(SyncTrigger::ExplicitXattr);
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        handle.request(SyncTrigger::Unmount);
        handle.shutdown();
    }

    #[test]
    fn capacity_trigger_prefers_index_partition_pew() {
        assert_eq!(
            trigger_for_capacity(CapacityState::ProgramEarlyWarning, CapacityState::ProgramEarlyWarning),
            Some(SyncTrigger::IndexPartitionEarlyWarning)
        );
        assert_eq!(trigger_for_capacity(CapacityState::Ok, CapacityState::Ok), None);
    }
}
