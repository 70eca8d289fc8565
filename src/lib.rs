//! # bplux-recorder
//!
//! Acquisition service for Bioplux biosignal devices: streams raw frames from
//! the device, persists every one of them, and forwards a decimated preview to
//! an optional client.
//!
//! ## Modules
//! - `service`: session lifecycle, frame ingestion and teardown
//! - `decimator`: display-rate thinning of the raw stream
//! - `write_gate`: barrier between frame writes and storage finalization
//! - `client`: message protocol towards the UI client
//! - `device`: device capability and a simulated device
//! - `storage`: recording persistence
//! - `config`, `error`, `frame`: settings, error types, frame helpers

pub mod client;
pub mod config;
pub mod decimator;
pub mod device;
pub mod error;
pub mod frame;
pub mod service;
pub mod storage;
pub mod write_gate;
