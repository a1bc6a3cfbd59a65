//! Folds the inbound event stream into the transcript and tool indicator.

use crate::{
    error::SessionError,
    protocol::{AgentEvent, WireMessage},
    tool_tracker::ToolCallTracker,
    transcript::{Transcript, TranscriptEntry},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

/// Where a decoded inbound frame has to go.
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// Offer/answer/candidate traffic for the negotiation.
    Negotiation(WireMessage),
    /// A conversational event for the processor.
    Event(AgentEvent),
    /// The frame was malformed and has been dropped.
    Dropped(SessionError),
}

/// Decodes a raw text frame. Malformed frames are logged and dropped; they
/// never end the session.
pub fn route_frame(text: &str) -> Routed {
    match WireMessage::decode(text) {
        Ok(message) => match message.into_event() {
            Ok(event) => Routed::Event(event),
            Err(negotiation) => Routed::Negotiation(negotiation),
        },
        Err(e) => {
            warn!(error = %e, "Dropping malformed inbound event.");
            Routed::Dropped(e)
        }
    }
}

/// Applies events, in arrival order, to the session's transcript.
///
/// Only this processor writes the transcript; observers get read-only
/// snapshots through [`EventStreamProcessor::subscribe`].
pub struct EventStreamProcessor {
    transcript: Transcript,
    published: watch::Sender<Vec<TranscriptEntry>>,
    consuming: bool,
    feed: Option<JoinHandle<()>>,
}

impl Default for EventStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamProcessor {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            transcript: Transcript::new(),
            published,
            consuming: false,
            feed: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TranscriptEntry>> {
        self.published.subscribe()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming
    }

    /// Takes ownership of the task that feeds inbound frames to the session.
    pub fn attach_feed(&mut self, feed: JoinHandle<()>) {
        if let Some(previous) = self.feed.replace(feed) {
            previous.abort();
        }
    }

    /// Starts consuming with an empty transcript.
    pub fn begin(&mut self) {
        self.reset();
        self.consuming = true;
    }

    /// Stops consuming: the feed task is aborted and later events are ignored.
    pub fn stop(&mut self) {
        self.consuming = false;
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
    }

    /// Like [`EventStreamProcessor::stop`], but also waits for the feed task
    /// to be gone so nothing it holds outlives this call.
    pub async fn shutdown(&mut self) {
        self.consuming = false;
        if let Some(feed) = self.feed.take() {
            feed.abort();
            let _ = feed.await;
        }
    }

    pub fn reset(&mut self) {
        self.transcript.clear();
        self.publish();
    }

    /// Applies one event. A fatal agent error is returned to the caller,
    /// which owns the session state.
    pub fn apply(
        &mut self,
        event: AgentEvent,
        tools: &mut ToolCallTracker,
    ) -> Result<(), SessionError> {
        if !self.consuming {
            debug!(?event, "Ignoring event while not consuming.");
            return Ok(());
        }
        match event {
            AgentEvent::UserTranscript { content, is_final } => {
                if self.transcript.push_user(content, is_final) {
                    self.publish();
                }
            }
            AgentEvent::AssistantTranscript { content, is_final } => {
                self.transcript.merge_assistant(content, is_final);
                self.publish();
            }
            AgentEvent::ToolInvocation { name } => tools.notify(name),
            AgentEvent::FatalError { message } => return Err(SessionError::Transport(message)),
        }
        Ok(())
    }

    fn publish(&self) {
        self.published
            .send_replace(self.transcript.entries().to_vec());
    }
}

impl Drop for EventStreamProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}
