//! Native device adapters for the voice session.

pub mod capture;

pub use capture::{CpalAudioSource, input_device_names};
