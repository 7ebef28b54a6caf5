//! # Fuzzfleet Core
//!
//! Fault-tolerant orchestration of remote fuzzing-fleet locations.
//!
//! Each location is a pair of hosts behind a jump host: a master
//! running the fleet's control plane and results database, and a
//! worker running the agents. Everything in between — the SSH path,
//! the SOCKS tunnel, the web application, the database server — fails
//! routinely, so every client here retries until its operation
//! succeeds or a genuinely unrecoverable local error surfaces.
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, Error>`. Retryable
//! failures never escape a client; [`Error::is_fatal`] is the single
//! classifier deciding which errors abort instead of retry.
//!
//! ## Layering
//!
//! - [`ssh`], [`tunnel`]: transport to the location
//! - [`web`], [`store`]: control plane and results database clients
//! - [`job`], [`controller`]: per-job operations and load control
//! - [`session`]: lifecycle orchestration tying it all together

pub mod config;
pub mod controller;
mod error;
pub mod job;
pub mod retry;
pub mod session;
pub mod ssh;
pub mod store;
pub mod tunnel;
pub mod web;

pub use config::Config;
pub use error::{Error, Result};
pub use job::{Job, JobHandle, JobStats};
pub use session::Session;
