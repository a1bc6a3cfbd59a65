//! A WebRTC peer transport for the voice session, in the offerer role.
//!
//! Outbound audio is sent as G.711 µ-law (PCMU) at 8 kHz; conversational
//! events may also arrive on the `events` data channel.

pub mod audio;
pub mod peer;

pub use peer::{WebRtcConnector, WebRtcPeer};
