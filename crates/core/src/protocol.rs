//! JSON messages exchanged with the remote voice agent.
//!
//! The same message set travels over the signaling channel and, when the
//! transport provides one, over its event data channel.

use crate::{error::SessionError, transcript::Role};
use serde::{Deserialize, Serialize};

/// A network-reachability candidate for the peer transport.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// A message on the wire, tagged by its `type` field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Client → agent session description.
    Offer { sdp: String },
    /// Agent → client session description.
    Answer {
        sdp: String,
        /// Session identity assigned by the agent, if it assigns one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    IceCandidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
    Transcript {
        role: Role,
        content: String,
        #[serde(rename = "final", default)]
        is_final: bool,
    },
    ToolInvocation { function_name: String },
    /// The agent reports an unrecoverable failure.
    Error { message: String },
}

/// A conversational event, already separated from negotiation traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    UserTranscript { content: String, is_final: bool },
    AssistantTranscript { content: String, is_final: bool },
    ToolInvocation { name: String },
    FatalError { message: String },
}

impl WireMessage {
    pub fn decode(text: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::Signaling(e.to_string()))
    }

    /// Converts conversational messages into events. Negotiation messages
    /// are handed back unchanged.
    pub fn into_event(self) -> Result<AgentEvent, WireMessage> {
        match self {
            WireMessage::Transcript {
                role: Role::User,
                content,
                is_final,
            } => Ok(AgentEvent::UserTranscript { content, is_final }),
            WireMessage::Transcript {
                role: Role::Assistant,
                content,
                is_final,
            } => Ok(AgentEvent::AssistantTranscript { content, is_final }),
            WireMessage::ToolInvocation { function_name } => {
                Ok(AgentEvent::ToolInvocation { name: function_name })
            }
            WireMessage::Error { message } => Ok(AgentEvent::FatalError { message }),
            other => Err(other),
        }
    }
}

impl From<IceCandidate> for WireMessage {
    fn from(c: IceCandidate) -> Self {
        WireMessage::IceCandidate {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}
