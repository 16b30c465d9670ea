//! Acknowledgment tracking for sent statuses
//!
//! Every status published to the backend is registered here and stays
//! pending until a `StatusResponse` carrying the same message counter
//! arrives. Each pending entry owns a timer task; when one expires, a
//! [`Event::StatusResponseTimeout`] is raised for the endpoint. A single
//! guard flag per tracker ensures that event fires at most once until the
//! tracker's timers are cleared on teardown. Clearing also advances the
//! tracker's epoch; a timer from an older epoch never emits, even if it had
//! already woken up when it was cancelled.
//!
//! The tracker also keeps the set of devices the backend considers
//! connected, which decides the device-state tag of outgoing statuses and
//! whether inbound commands are forwarded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{Device, Endpoint, Status, StatusResponse};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::event::{Event, EventDispatcher};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    /// The backend acknowledged a counter that is not pending
    #[error("Backend acknowledged status {0} that was never sent")]
    Unmatched(u64),
}

struct PendingAck {
    status: Status,
    deadline: Instant,
    timer: Option<JoinHandle<()>>,
    timed_out: bool,
}

#[derive(Default)]
struct TrackerState {
    pending: Vec<PendingAck>,
    timeout_handled: bool,
    /// Advanced whenever timers are cancelled
    epoch: u64,
}

impl TrackerState {
    fn cancel_timers(&mut self) {
        self.epoch += 1;
        for entry in self.pending.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        self.timeout_handled = false;
    }
}

/// Pending-ack bookkeeping for one endpoint connection
pub struct PendingAckTracker {
    endpoint: Endpoint,
    dispatcher: EventDispatcher,
    timeout: Duration,
    state: Arc<Mutex<TrackerState>>,
    connected: RwLock<HashSet<Device>>,
}

impl PendingAckTracker {
    pub fn new(endpoint: Endpoint, dispatcher: EventDispatcher, timeout: Duration) -> Self {
        Self {
            endpoint,
            dispatcher,
            timeout,
            state: Arc::new(Mutex::new(TrackerState::default())),
            connected: RwLock::new(HashSet::new()),
        }
    }

    /// Track a sent status and arm its timeout
    pub fn register(&self, status: Status) {
        let counter = status.message_counter;
        let deadline = Instant::now() + self.timeout;

        let mut state = self.state.lock();
        let timer = self.spawn_timer(counter, deadline, state.epoch);
        state.pending.push(PendingAck {
            status,
            deadline,
            timer: Some(timer),
            timed_out: false,
        });
        debug!(endpoint = %self.endpoint, counter, "Status awaiting ack");
    }

    fn spawn_timer(&self, counter: u64, deadline: Instant, epoch: u64) -> JoinHandle<()> {
        let state = self.state.clone();
        let dispatcher = self.dispatcher.clone();
        let endpoint = self.endpoint.clone();

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let mut state = state.lock();
            if state.epoch != epoch {
                debug!(endpoint = %endpoint, counter, "Status timer cancelled");
                return;
            }
            let Some(entry) = state
                .pending
                .iter_mut()
                .find(|p| p.status.message_counter == counter)
            else {
                return;
            };
            entry.timed_out = true;
            entry.timer = None;

            if state.timeout_handled {
                debug!(endpoint = %endpoint, counter, "Status timeout already handled");
                return;
            }
            state.timeout_handled = true;
            warn!(endpoint = %endpoint, counter, "Status was not acknowledged in time");
            dispatcher.push(Event::StatusResponseTimeout(endpoint));
        })
    }

    /// Resolve the pending status matching the response's counter
    pub fn acknowledge(&self, response: &StatusResponse) -> Result<(), AckError> {
        let counter = response.message_counter;
        let mut state = self.state.lock();
        let index = state
            .pending
            .iter()
            .position(|p| p.status.message_counter == counter)
            .ok_or(AckError::Unmatched(counter))?;

        let entry = state.pending.remove(index);
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        debug!(
            endpoint = %self.endpoint,
            counter,
            late = entry.timed_out || Instant::now() > entry.deadline,
            "Status acknowledged"
        );
        Ok(())
    }

    /// True when no sent status awaits an ack
    pub fn all_acked(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Remove and return every un-acknowledged status, oldest first
    pub fn take_unacked(&self) -> Vec<Status> {
        let mut state = self.state.lock();
        state
            .pending
            .drain(..)
            .map(|mut p| {
                if let Some(timer) = p.timer.take() {
                    timer.abort();
                }
                p.status
            })
            .collect()
    }

    /// Cancel every timer and re-arm the timeout guard, keeping entries
    pub fn clear_timers(&self) {
        self.state.lock().cancel_timers();
    }

    /// Cancel timers and forget every pending status
    pub fn clear(&self) {
        self.clear_timers();
        self.state.lock().pending.clear();
    }

    pub fn mark_connected(&self, device: &Device) {
        self.connected.write().insert(device.clone());
    }

    pub fn mark_disconnected(&self, device: &Device) {
        if !self.connected.write().remove(device) {
            warn!(
                endpoint = %self.endpoint,
                device = %device,
                "Tried to disconnect a device that is not connected, ignoring"
            );
        }
    }

    pub fn is_connected(&self, device: &Device) -> bool {
        self.connected.read().contains(device)
    }

    pub fn any_connected(&self) -> bool {
        !self.connected.read().is_empty()
    }

    pub fn clear_connected(&self) {
        self.connected.write().clear();
    }
}

impl Drop for PendingAckTracker {
    fn drop(&mut self) {
        for entry in self.state.lock().pending.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}
