//! Starts a session from an external activation trigger such as a wake word
//! or a push-to-talk key.

use crate::{config::ConfigProvider, session::SessionHandle};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// Turns activation signals into `connect()` calls.
///
/// A fresh configuration snapshot is taken for every trigger. Triggers that
/// arrive while a session is already active are ignored by the session.
pub struct ActivationListener<P> {
    session: SessionHandle,
    provider: Arc<P>,
}

impl<P> Clone for ActivationListener<P> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            provider: self.provider.clone(),
        }
    }
}

impl<P> ActivationListener<P>
where
    P: ConfigProvider + 'static,
{
    pub fn new(session: SessionHandle, provider: Arc<P>) -> Self {
        Self { session, provider }
    }

    /// Handles one activation. Returns whether a connect was started.
    pub async fn trigger(&self) -> bool {
        let config = match self.provider.snapshot() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Activation ignored: configuration unavailable.");
                return false;
            }
        };
        let started = self.session.connect(config).await;
        if started {
            info!("Activation started a voice session.");
        } else {
            debug!("Activation ignored: session already active.");
        }
        started
    }

    /// Listens for activation signals until the sender is dropped.
    pub fn spawn(self, mut signals: mpsc::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while signals.recv().await.is_some() {
                self.trigger().await;
            }
            debug!("Activation source closed.");
        })
    }
}
