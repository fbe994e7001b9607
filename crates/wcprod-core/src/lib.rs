//! wcprod core library: production bookkeeping for sharded simulation
//! campaigns.
//!
//! A campaign (project) is a fixed grid of configurations generated from a
//! cylindrical detector volume. This crate generates that grid, stores it in
//! a file-backed SQLite database split into shards, hands out work to
//! independent worker processes, and records the output files they produce.
//! With the `python` feature it is also built as the `_wcprod_core`
//! extension module.

pub mod config;
pub mod errors;
pub mod geometry;
pub mod models;
pub mod naming;
pub mod project;
pub mod store;

#[cfg(feature = "python")]
pub mod python;

pub use config::StoreConfig;
pub use errors::{IntegrityCheck, WcprodError, WcprodResult};
pub use models::{Registration, Rejection, WorkItem};
pub use project::{Project, ProjectSpec};
pub use store::ProductionStore;

#[cfg(feature = "python")]
use pyo3::prelude::*;

// ---------------------------------------------------------------------------
// Top-level Python module: _wcprod_core
// ---------------------------------------------------------------------------

#[cfg(feature = "python")]
#[pymodule]
fn _wcprod_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    python::register(m)?;
    m.add("SCHEMA_VERSION", store::schema::SCHEMA_VERSION)?;
    m.add(
        "DEFAULT_MAX_ENTRIES_PER_SHARD",
        config::DEFAULT_MAX_ENTRIES_PER_SHARD,
    )?;
    m.add("DEFAULT_SAMPLE_SIZE", config::DEFAULT_SAMPLE_SIZE)?;
    Ok(())
}
