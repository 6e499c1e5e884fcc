//! Connectivity state.
//!
//! Mirrors the platform online/offline signal forwarded by the host
//! app. The signal is a reachability heuristic — the OS can report
//! "online" while the business API is unreachable; that is an accepted
//! approximation, handled by dispatch failures staying queued, not by
//! probing here.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::notify::{Notification, NotificationHub};

pub struct ConnectivityMonitor {
    online: AtomicBool,
    seeded: AtomicBool,
    hub: NotificationHub,
}

impl ConnectivityMonitor {
    /// Starts unseeded; the first `set_online` call records the current
    /// platform state without firing transition effects.
    pub fn new(hub: NotificationHub) -> Self {
        Self {
            online: AtomicBool::new(false),
            seeded: AtomicBool::new(false),
            hub,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Apply a platform reachability signal. `pending` is the current
    /// queue depth, attached to transition notifications so the UI can
    /// show "back online, N pending" without a second query. Replay
    /// itself stays explicit — this only signals availability, and only
    /// when there is queued work to sync.
    pub fn set_online(&self, online: bool, pending: usize) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        let first_signal = !self.seeded.swap(true, Ordering::SeqCst);

        if first_signal || previous == online {
            debug!(online, "connectivity signal (no transition)");
            return;
        }

        if online {
            info!(pending, "network restored, queued work can sync");
            if pending > 0 {
                self.hub.emit(Notification::BackOnline { pending });
            }
        } else {
            warn!(pending, "network lost, mutations will queue offline");
            self.hub.emit(Notification::WentOffline { pending });
        }
    }
}
