//! Core engine: the one-shot account probe.

pub mod probe;

pub use probe::{AccountProbe, ProbeSettings};
