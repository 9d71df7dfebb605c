//! Error types for buildenv
//!
//! All modules use `BuildEnvResult<T>` as their return type. Expected,
//! branch-on conditions (a missing snapshot, an already mounted image) are
//! ordinary variants so callers can match on them.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for buildenv operations
pub type BuildEnvResult<T> = Result<T, BuildEnvError>;

/// All errors that can occur in buildenv
#[derive(Error, Debug)]
pub enum BuildEnvError {
    // Constraint errors
    #[error("Contradictory constraints for {object}: {existing} cannot hold together with {incoming}")]
    ConstraintContradiction {
        object: String,
        existing: String,
        incoming: String,
    },

    #[error("Invalid constraint type: {0:?}")]
    InvalidConstraintType(String),

    #[error("Invalid requirement {input:?}: {reason}")]
    InvalidRequirement { input: String, reason: String },

    #[error("Invalid version {0:?}")]
    InvalidVersion(String),

    // Image errors
    #[error("Image not found: {0}")]
    NoSuchImage(String),

    #[error("Image {id} is already mounted in namespace {namespace}")]
    ImageAlreadyMounted { id: String, namespace: String },

    #[error("Image {id} is not mounted in namespace {namespace}")]
    ImageNotMounted { id: String, namespace: String },

    #[error("Image {0} is not published")]
    ImageNotPublished(String),

    #[error("Image {id} is still referenced by {children} clone(s)")]
    ImageInUse { id: String, children: usize },

    // Scratch space errors
    #[error("Scratch space not found: {0}")]
    NoSuchScratchSpace(String),

    #[error("Scratch space {0} is already mounted")]
    ScratchSpaceAlreadyMounted(String),

    #[error("Scratch space {0} is not mounted")]
    ScratchSpaceNotMounted(String),

    // Snapshot errors
    #[error("Snapshot not found: {volume}@{snapshot}")]
    NoSuchSnapshot { volume: String, snapshot: String },

    #[error("Snapshot already exists: {volume}@{snapshot}")]
    SnapshotExists { volume: String, snapshot: String },

    #[error("{0} is not writable")]
    NotWritable(String),

    // Lock errors
    #[error("Lock does not exist: {0}")]
    NoSuchLock(String),

    #[error("Lock already exists: {0}")]
    LockExists(String),

    #[error("Lock {path} must be held in {required} mode")]
    LockNotHeld { path: String, required: String },

    // External command errors
    #[error("Command `{command}` exited with {status}: {stderr}")]
    ExternalCommand {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Catalog errors
    #[error("Corrupt catalog entry {path}: {reason}")]
    CatalogCorrupt { path: PathBuf, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BuildEnvError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error (the process could not be spawned)
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create an error for a command that ran and reported failure
    pub fn external(
        command: impl Into<String>,
        status: std::process::ExitStatus,
        stderr: impl Into<String>,
    ) -> Self {
        let status = match status.code() {
            Some(code) => format!("exit code {}", code),
            None => "signal".to_string(),
        };
        Self::ExternalCommand {
            command: command.into(),
            status,
            stderr: stderr.into().trim().to_string(),
        }
    }

    /// Whether the error means "the thing is not there"
    ///
    /// Idempotent teardown paths branch on this instead of string matching.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoSuchImage(_)
                | Self::NoSuchScratchSpace(_)
                | Self::NoSuchSnapshot { .. }
                | Self::NoSuchLock(_)
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoSuchLock(_) => Some("Run: buildenv image list  (the pool may not be initialised)"),
            Self::ImageNotPublished(_) => Some("Only published images can be cloned. Run: buildenv image publish <id>"),
            Self::ImageInUse { .. } => Some("Delete the clones first, they share the frozen snapshot"),
            Self::CommandFailed { .. } => Some("Check that the rbd and mount tools are installed and on PATH"),
            Self::ConstraintContradiction { .. } => Some("No version can satisfy both requirements"),
            Self::CatalogCorrupt { .. } => Some("Repair or remove the entry; clones are checked against every row"),
            _ => None,
        }
    }
}
