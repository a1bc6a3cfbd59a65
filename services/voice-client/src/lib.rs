//! Console front end for a voice-agent session.
//!
//! Wires the session core to a cpal microphone, WebRTC transport and the
//! environment-based configuration, and renders what the session exposes.

pub mod config;
pub mod console;
pub mod sink;

pub use config::{ConfigError, EnvConfigProvider, load_connection_config};
pub use console::{TranscriptPrinter, format_status, render};
pub use sink::LoggingPlaybackSink;
