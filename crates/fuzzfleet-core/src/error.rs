//! Error types for fuzzfleet.
//!
//! Errors fall into two classes with very different handling:
//!
//! - **Retryable failures** (dropped connections, flaky control-plane
//!   responses, database hiccups) are swallowed by the retrying clients
//!   and never reach a caller. They only exist between one attempt and
//!   the next.
//! - **Fatal failures** (bad configuration, a subprocess that cannot be
//!   spawned, a missing local file meant for upload) and **data-quality
//!   anomalies** (CPU time moving backwards) always propagate; retrying
//!   them would loop forever on a problem retries cannot fix.
//!
//! `Error::is_fatal` is the classifier every retry loop consults before
//! deciding to sleep and go again.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the orchestration core.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is malformed or internally inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required local binary (ssh, scp, zip, ...) is not installed.
    #[error("required binary `{name}` not found in PATH")]
    MissingBinary {
        /// Name of the binary that could not be located.
        name: String,
    },

    /// A local subprocess could not be spawned at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// The command that failed to start.
        command: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A local file needed for an upload is missing or unreadable.
    #[error("local file `{path}` unusable: {message}")]
    LocalFile {
        /// Path that was checked.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A local build/package step failed. Builds are not retryable.
    #[error("build step `{command}` failed: {message}")]
    Build {
        /// The command that failed.
        command: String,
        /// Exit status or stderr excerpt.
        message: String,
    },

    /// Endpoint resolution failed at session creation.
    #[error("failed to resolve endpoint `{alias}`: {message}")]
    Resolve {
        /// SSH alias that was being resolved.
        alias: String,
        /// What went wrong.
        message: String,
    },

    /// A remote shell or file-transfer operation failed (retryable).
    #[error("remote operation on `{host}` failed: {message}")]
    Remote {
        /// Endpoint the operation ran against.
        host: String,
        /// What went wrong.
        message: String,
    },

    /// An HTTP request against the control plane failed (retryable).
    #[error("control-plane request failed: {0}")]
    Http(String),

    /// A persistent-store query failed (retryable).
    #[error("store query failed: {0}")]
    Store(String),

    /// A measurement or scrape produced impossible data.
    #[error("data quality: {0}")]
    DataQuality(String),

    /// An operation was invoked on an archived job handle.
    #[error("job `{name}` is archived")]
    JobArchived {
        /// Name of the archived job.
        name: String,
    },

    /// An operation requires an active job.
    #[error("job `{name}` is {state}, not active")]
    JobNotActive {
        /// Name of the job.
        name: String,
        /// Lifecycle state the handle is actually in.
        state: String,
    },
}

impl Error {
    /// True when a retry loop must propagate this error instead of
    /// sleeping and trying again.
    ///
    /// Fatal errors are environment or caller problems; repeating the
    /// operation cannot change the outcome.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::MissingBinary { .. }
                | Self::Spawn { .. }
                | Self::LocalFile { .. }
                | Self::Build { .. }
                | Self::Resolve { .. }
                | Self::DataQuality(_)
                | Self::JobArchived { .. }
                | Self::JobNotActive { .. }
        )
    }
}
