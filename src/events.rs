//! Coordination events and wait handles
//!
//! Watch notifications arrive on a channel and are routed by path to a set
//! of named, resettable wait handles. A handle only says "something may
//! have changed": waiters re-read the coordination state after waking.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordination::{CoordinationPaths, EventType, PathKind, WatchedEvent};
use crate::coordinator::superstep::SuperstepTracker;
use crate::runtime::ShutdownSignal;

/// Resettable one-bit event
pub struct BspEvent {
    name: &'static str,
    signaled: Mutex<bool>,
    notify: Notify,
}

impl BspEvent {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            signaled: Mutex::new(false),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Set the event and wake every waiter
    pub fn signal(&self) {
        *self.signaled.lock() = true;
        self.notify.notify_waiters();
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Wait until the event is signaled; returns at once if it already is
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_signaled() {
                return;
            }
            notified.await;
        }
    }

    /// Wait with a timeout; returns true if the event was signaled
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

/// Every event the master waits on
pub struct MasterEvents {
    pub master_election_changed: BspEvent,
    pub job_state_changed: BspEvent,
    pub worker_health_registration_changed: BspEvent,
    pub superstep_state_changed: BspEvent,
    pub vertex_range_exchange_changed: BspEvent,
    pub cleaned_up_changed: BspEvent,
}

impl MasterEvents {
    pub fn new() -> Self {
        Self {
            master_election_changed: BspEvent::new("master_election_changed"),
            job_state_changed: BspEvent::new("job_state_changed"),
            worker_health_registration_changed: BspEvent::new(
                "worker_health_registration_changed",
            ),
            superstep_state_changed: BspEvent::new("superstep_state_changed"),
            vertex_range_exchange_changed: BspEvent::new("vertex_range_exchange_changed"),
            cleaned_up_changed: BspEvent::new("cleaned_up_changed"),
        }
    }
}

impl Default for MasterEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes watch notifications to [`MasterEvents`]
pub struct EventBus {
    paths: CoordinationPaths,
    tracker: SuperstepTracker,
    events: Arc<MasterEvents>,
}

impl EventBus {
    pub fn new(paths: CoordinationPaths, tracker: SuperstepTracker, events: Arc<MasterEvents>) -> Self {
        Self {
            paths,
            tracker,
            events,
        }
    }

    /// Route one notification; returns false if nothing was interested
    pub fn process(&self, event: &WatchedEvent) -> bool {
        let target = match (self.paths.classify(&event.path), event.event_type) {
            (
                PathKind::MasterElection,
                EventType::NodeChildrenChanged | EventType::NodeDeleted,
            ) => {
                &self.events.master_election_changed
            }
            (
                PathKind::JobState,
                EventType::NodeChildrenChanged | EventType::NodeCreated | EventType::NodeDeleted,
            ) => &self.events.job_state_changed,
            (
                PathKind::WorkerHealthyDir { .. } | PathKind::WorkerUnhealthyDir { .. },
                EventType::NodeChildrenChanged,
            ) => &self.events.worker_health_registration_changed,
            (
                PathKind::WorkerHealthy {
                    attempt,
                    superstep,
                    worker_id,
                },
                EventType::NodeDeleted,
            ) => {
                if self.tracker.is_worker_failure(attempt, superstep, &worker_id) {
                    warn!(
                        "process: healthy worker {} died on superstep {} (attempt {})",
                        worker_id, superstep, attempt
                    );
                } else {
                    info!(
                        "process: healthy registration of {} removed on superstep {}",
                        worker_id, superstep
                    );
                }
                &self.events.superstep_state_changed
            }
            (PathKind::WorkerFinishedDir { .. }, EventType::NodeChildrenChanged) => {
                &self.events.superstep_state_changed
            }
            (PathKind::VertexRangeExchangeDir { .. }, EventType::NodeChildrenChanged) => {
                &self.events.vertex_range_exchange_changed
            }
            (PathKind::CleanedUp, EventType::NodeChildrenChanged) => {
                &self.events.cleaned_up_changed
            }
            _ => {
                debug!("process: unhandled {:?} on {}", event.event_type, event.path);
                return false;
            }
        };
        debug!("process: {:?} on {} -> {}", event.event_type, event.path, target.name());
        target.signal();
        true
    }

    /// Consume notifications until the channel closes or shutdown fires
    pub fn spawn(
        self,
        mut receiver: mpsc::UnboundedReceiver<WatchedEvent>,
        shutdown: &ShutdownSignal,
    ) -> JoinHandle<()> {
        let mut listener = shutdown.listener();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = listener.recv() => {
                        debug!("Event bus stopping on shutdown");
                        break;
                    }
                    event = receiver.recv() => match event {
                        Some(event) => {
                            self.process(&event);
                        }
                        None => {
                            debug!("Event bus stopping, channel closed");
                            break;
                        }
                    }
                }
            }
        })
    }
}
