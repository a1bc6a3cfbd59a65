//! Tracks which remote tool the agent is currently running.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

/// The currently visible tool invocation.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    id: u64,
}

/// Holds the "active tool" indicator for a bounded visibility window.
///
/// The protocol never reports that a tool finished, so every invocation is
/// cleared automatically once the window elapses. A newer invocation replaces
/// the current one and restarts the window.
pub struct ToolCallTracker {
    window: Duration,
    armed: bool,
    next_id: u64,
    active: Arc<watch::Sender<Option<ToolInvocation>>>,
    expiry: Option<JoinHandle<()>>,
}

impl ToolCallTracker {
    pub fn new(window: Duration) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            window,
            armed: false,
            next_id: 0,
            active: Arc::new(active),
            expiry: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Starts accepting invocations, with the visibility window of the new session.
    pub fn arm(&mut self, window: Duration) {
        self.window = window;
        self.armed = true;
    }

    /// Clears the indicator and ignores invocations until armed again.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.clear();
    }

    pub fn notify(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.armed {
            debug!(tool = %name, "Ignoring tool invocation while tracker is disarmed.");
            return;
        }
        self.cancel_expiry();

        self.next_id += 1;
        let id = self.next_id;
        debug!(tool = %name, window_ms = self.window.as_millis() as u64, "Tool invocation started.");
        self.active.send_replace(Some(ToolInvocation {
            name,
            started_at: Utc::now(),
            id,
        }));

        let active = self.active.clone();
        let window = self.window;
        self.expiry = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            active.send_if_modified(|current| match current {
                Some(invocation) if invocation.id == id => {
                    *current = None;
                    true
                }
                _ => false,
            });
        }));
    }

    pub fn clear(&mut self) {
        self.cancel_expiry();
        self.active.send_if_modified(|current| current.take().is_some());
    }

    /// Name of the visible tool, if any.
    pub fn active(&self) -> Option<String> {
        self.active.borrow().as_ref().map(|t| t.name.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ToolInvocation>> {
        self.active.subscribe()
    }

    fn cancel_expiry(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.abort();
        }
    }
}

impl Drop for ToolCallTracker {
    fn drop(&mut self) {
        self.cancel_expiry();
    }
}
