//! tsmon-core: Core library for tsmon
//!
//! This crate mirrors C2 team server activity into SQLite by supervising a
//! headless scripting client per server and correlating its log stream
//! into operator actions.
//!
//! # Architecture
//!
//! ```text
//! Scripting Client (JVM) → Line Stream → Decoders → Merge Buffer
//!                                            ↓
//!                              Correlator → Storage (SQLite)
//!                                            ↓
//!                                    Presence Tracking
//! ```
//!
//! # Modules
//!
//! - `client`: Headless scripting-client subprocess wrapper
//! - `protocol`: Tagged line grammar and entity decoders
//! - `merge`: Adjacent output fragment coalescing
//! - `correlate`: Log-to-action correlation planning
//! - `presence`: Check-in cadence and presence windows
//! - `storage`: SQLite storage with a single-writer thread
//! - `poller`: Per-server poll tasks and their supervisor
//! - `lock`: Single-instance supervisor lock
//! - `config`: Configuration management
//! - `error`: Error taxonomy
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod correlate;
pub mod error;
pub mod lock;
pub mod merge;
pub mod poller;
pub mod presence;
pub mod protocol;
pub mod storage;

pub use error::{Error, Result};

/// Crate version, recorded in the supervisor lock metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
