pub mod activation;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod tool_tracker;
pub mod transcript;
pub mod transport;

pub use activation::ActivationListener;
pub use config::{ConfigProvider, ConnectionConfig};
pub use error::{ErrorKind, SessionError};
pub use media::{AudioFrame, AudioSource, CaptureDevice, LocalAudio, PlaybackSink};
pub use protocol::{AgentEvent, IceCandidate, WireMessage};
pub use session::{SessionDeps, SessionHandle, SessionState, SessionStatus};
pub use signaling::EndpointSignaling;
pub use tool_tracker::ToolInvocation;
pub use transcript::{Role, TranscriptEntry};
pub use transport::{PeerConnector, PeerEvent, PeerTransport, RemoteAudio};
