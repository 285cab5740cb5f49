//! # vrs-server: VR screen streamer
//!
//! Process shell around `vrs-core`: reads a TOML configuration, applies
//! command-line overrides, picks a capture backend and runs the
//! pipeline until Ctrl-C.
//!
//! ## Modes
//!
//! - **Stream** (default): capture, encode and serve viewers.
//! - **List sources**: print monitors and capturable windows.
//! - **Generate config**: print the default TOML.

pub mod config;
pub mod service;
