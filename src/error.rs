//! Error types for SetuSLAM.
//!
//! # Error Tiers
//!
//! The back-end distinguishes three failure classes:
//!
//! ## Contract Violations (Fatal)
//!
//! Callers that modify a `Finished` or `Deleted` trajectory, reference a
//! stale submap, or feed fixed-frame poses to the 2D back-end have broken
//! the pose-graph contract. These panic after logging at error level; the
//! graph state cannot be trusted once such a call has been made, and
//! degrading silently would corrupt the map in ways that are undetectable
//! downstream.
//!
//! ## Recoverable Errors (This Enum)
//!
//! - **`Serialization`**: a serialized submap, node, or constraint has an
//!   inconsistent shape (e.g. a finished submap without a grid). The
//!   record can be rejected and the rest of the stream loaded.
//! - **`Config`**: a configuration section fails validation. Fix the
//!   configuration and reconstruct the graph.
//!
//! ## Transient Data Issues (Logged, Skipped)
//!
//! Empty grids during trimming and constraints whose source node has been
//! trimmed away are logged at warning level and skipped; they are expected
//! under concurrent trimming and are not surfaced as errors.

use thiserror::Error;

/// Errors that can occur in the SLAM back-end.
///
/// See module-level documentation for the full error model.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
