//! Error types for the wcprod core library.

use std::fmt;

/// The invariant a failed integrity check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// The project name appears more than once in the project table.
    ProjectUnique,
    /// A per-project or per-shard table is missing.
    MissingTable,
    /// Geometry rows are inconsistent with the configuration count.
    GeometryCount,
    /// Shard ids are not a dense permutation of `0..num_tables`.
    ShardIds,
    /// A shard's target does not match its range size.
    ShardTarget,
    /// Shard ranges overlap, leave gaps, or do not cover the project.
    ShardRanges,
    /// A configuration table does not match its declared id range.
    ConfigRange,
    /// A configuration references a geometry id that does not exist.
    GeometryReference,
    /// A configuration lies outside the project's geometric bounds.
    GeometryBounds,
    /// A file table holds configuration ids from another shard.
    FileRange,
    /// Shard aggregate counters disagree with configuration or file counters.
    Counters,
}

impl IntegrityCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrityCheck::ProjectUnique => "project_unique",
            IntegrityCheck::MissingTable => "missing_table",
            IntegrityCheck::GeometryCount => "geometry_count",
            IntegrityCheck::ShardIds => "shard_ids",
            IntegrityCheck::ShardTarget => "shard_target",
            IntegrityCheck::ShardRanges => "shard_ranges",
            IntegrityCheck::ConfigRange => "config_range",
            IntegrityCheck::GeometryReference => "geometry_reference",
            IntegrityCheck::GeometryBounds => "geometry_bounds",
            IntegrityCheck::FileRange => "file_range",
            IntegrityCheck::Counters => "counters",
        }
    }
}

impl fmt::Display for IntegrityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error enum for the wcprod core library.
#[derive(Debug, thiserror::Error)]
pub enum WcprodError {
    #[error("Project '{0}' already exists in the database")]
    DuplicateProject(String),

    #[error("Project '{0}' not found in the project table")]
    ProjectNotFound(String),

    #[error("Table '{0}' not found (this may not be a wcprod database)")]
    TableNotFound(String),

    #[error("Integrity check '{check}' failed for project '{project}': {detail}")]
    ProjectIntegrity {
        project: String,
        check: IntegrityCheck,
        detail: String,
    },

    #[error("No unlocked shard of project '{0}' needs more work: the production is finished")]
    CampaignComplete(String),

    #[error("Invalid config id {config_id} for project '{project}'")]
    InvalidConfigId { project: String, config_id: i64 },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid project name '{0}' (must match [A-Za-z][A-Za-z0-9_]*)")]
    InvalidProjectName(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl WcprodError {
    pub(crate) fn integrity(
        project: &str,
        check: IntegrityCheck,
        detail: impl Into<String>,
    ) -> Self {
        WcprodError::ProjectIntegrity {
            project: project.to_string(),
            check,
            detail: detail.into(),
        }
    }
}

#[cfg(feature = "python")]
impl From<WcprodError> for pyo3::PyErr {
    fn from(err: WcprodError) -> pyo3::PyErr {
        use crate::python::exceptions;
        use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};

        let msg = err.to_string();
        match err {
            WcprodError::DuplicateProject(_) => exceptions::DuplicateProjectError::new_err(msg),
            WcprodError::ProjectNotFound(_) => exceptions::ProjectNotFoundError::new_err(msg),
            WcprodError::TableNotFound(_) => exceptions::TableNotFoundError::new_err(msg),
            WcprodError::ProjectIntegrity { .. } => {
                exceptions::ProjectIntegrityError::new_err(msg)
            }
            WcprodError::CampaignComplete(_) => exceptions::CampaignCompleteError::new_err(msg),
            WcprodError::InvalidConfigId { .. } => exceptions::InvalidConfigIdError::new_err(msg),
            WcprodError::InvalidGeometry(_)
            | WcprodError::InvalidProjectName(_)
            | WcprodError::InvalidArgument(_)
            | WcprodError::Json(_)
            | WcprodError::Yaml(_) => PyValueError::new_err(msg),
            WcprodError::Io(_) => PyIOError::new_err(msg),
            WcprodError::Sqlite(_) => PyRuntimeError::new_err(msg),
        }
    }
}

pub type WcprodResult<T> = Result<T, WcprodError>;
