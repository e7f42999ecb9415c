//! Detector backends.
//!
//! Real deployments plug an inference engine in behind the `Detector` trait.
//! The backends here are deterministic stand-ins: `scripted` replays a
//! per-frame script (tests), `synthetic` generates plausible traffic
//! (bring-up and the demo daemon).

pub mod scripted;
pub mod synthetic;
