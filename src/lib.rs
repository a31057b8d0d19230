#![deny(missing_debug_implementations)]
//! # localstream
//! Signaling server for streaming phone cameras to desktops over a local network. Streamers are
//! admitted only when the measured link can carry them, and the measured capacity is divided
//! fairly among everyone streaming. Media flows peer to peer; this crate only negotiates it.

/// Fair share bandwidth allocation and admission control.
pub mod allocation;
/// Send-side adaptive bitrate control and the client bandwidth test.
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
/// REST endpoints and the signaling socket route.
pub mod http;
/// Server-side bookkeeping of bandwidth tests.
pub mod probe;
pub mod server;
pub mod signaling;
/// Quality tiers and the catalog they are looked up in.
pub mod tier;
