//! Python bindings (`python` feature): the `ProductionDb` class and one
//! exception class per error kind.
//!
//! Records cross the boundary as plain dicts built from their serde form.

use std::path::{Path, PathBuf};

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyList};
use serde::Serialize;

use crate::config::{StoreConfig, DEFAULT_MAX_ENTRIES_PER_SHARD, DEFAULT_SAMPLE_SIZE};
use crate::errors::{WcprodError, WcprodResult};
use crate::models::Registration;
use crate::project::{Project, ProjectSpec};
use crate::store::ProductionStore;

pub mod exceptions {
    use pyo3::create_exception;
    use pyo3::exceptions::PyException;

    create_exception!(_wcprod_core, WcprodException, PyException);
    create_exception!(_wcprod_core, DuplicateProjectError, WcprodException);
    create_exception!(_wcprod_core, ProjectNotFoundError, WcprodException);
    create_exception!(_wcprod_core, TableNotFoundError, WcprodException);
    create_exception!(_wcprod_core, ProjectIntegrityError, WcprodException);
    create_exception!(_wcprod_core, CampaignCompleteError, WcprodException);
    create_exception!(_wcprod_core, InvalidConfigIdError, WcprodException);
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

fn json_to_py(py: Python<'_>, value: &serde_json::Value) -> PyResult<PyObject> {
    use serde_json::Value;
    Ok(match value {
        Value::Null => py.None(),
        Value::Bool(b) => PyBool::new(py, *b).to_owned().into_any().unbind(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into_pyobject(py)?.into_any().unbind(),
            None => n.as_f64().unwrap_or(f64::NAN).into_pyobject(py)?.into_any().unbind(),
        },
        Value::String(s) => s.into_pyobject(py)?.into_any().unbind(),
        Value::Array(items) => {
            let converted = items
                .iter()
                .map(|item| json_to_py(py, item))
                .collect::<PyResult<Vec<_>>>()?;
            PyList::new(py, converted)?.into_any().unbind()
        }
        Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, json_to_py(py, item)?)?;
            }
            dict.into_any().unbind()
        }
    })
}

fn to_py<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<PyObject> {
    let json = serde_json::to_value(value).map_err(WcprodError::from)?;
    json_to_py(py, &json)
}

/// Accept either YAML text or a path to a YAML file.
fn load_spec(cfg: &str) -> WcprodResult<ProjectSpec> {
    let path = Path::new(cfg);
    if path.is_file() {
        ProjectSpec::from_yaml_file(path)
    } else {
        ProjectSpec::from_yaml_str(cfg)
    }
}

// ---------------------------------------------------------------------------
// ProductionDb
// ---------------------------------------------------------------------------

/// Handle on a production database, one connection per call.
#[pyclass]
pub struct ProductionDb {
    store: ProductionStore,
}

#[pymethods]
impl ProductionDb {
    #[new]
    fn new(db_path: PathBuf) -> PyResult<Self> {
        let store = ProductionStore::open_with_config(db_path, StoreConfig::from_env())?;
        Ok(Self { store })
    }

    #[getter]
    fn db_path(&self) -> String {
        self.store.db_path().to_string_lossy().into_owned()
    }

    // -- Projects ------------------------------------------------------------

    /// Generate and register a project from YAML text or a YAML file path.
    #[pyo3(signature = (cfg, max_entries_per_table=DEFAULT_MAX_ENTRIES_PER_SHARD))]
    fn register_project(
        &self,
        py: Python<'_>,
        cfg: &str,
        max_entries_per_table: usize,
    ) -> PyResult<PyObject> {
        let spec = load_spec(cfg)?;
        let record = py.allow_threads(|| -> WcprodResult<_> {
            let project = Project::generate(spec)?;
            self.store.register_project(&project, max_entries_per_table)
        })?;
        to_py(py, &record)
    }

    fn drop_project(&self, project: &str) -> PyResult<()> {
        Ok(self.store.drop_project(project)?)
    }

    fn list_projects(&self) -> PyResult<Vec<String>> {
        Ok(self.store.list_projects()?)
    }

    fn exist_project(&self, project: &str) -> PyResult<bool> {
        Ok(self.store.exist_project(project)?)
    }

    fn list_all_tables(&self) -> PyResult<Vec<String>> {
        Ok(self.store.list_all_tables()?)
    }

    fn exist_table(&self, name: &str) -> PyResult<bool> {
        Ok(self.store.exist_table(name)?)
    }

    /// Project parameters and geometry counts, or None.
    fn get_project(&self, py: Python<'_>, project: &str) -> PyResult<Option<PyObject>> {
        let Some(project) = self.store.get_project(project)? else {
            return Ok(None);
        };
        let dict = PyDict::new(py);
        dict.set_item("spec", to_py(py, &project.spec)?)?;
        dict.set_item("num_positions", project.positions.len())?;
        dict.set_item("num_directions", project.directions.len())?;
        dict.set_item("num_voxels", project.voxels.len())?;
        dict.set_item("num_configs", project.num_configs())?;
        dict.set_item("summary", project.to_string())?;
        Ok(Some(dict.into_any().unbind()))
    }

    fn get_config(&self, py: Python<'_>, project: &str, config_id: i64) -> PyResult<Option<PyObject>> {
        self.store
            .get_config(project, config_id)?
            .map(|record| to_py(py, &record))
            .transpose()
    }

    #[pyo3(signature = (project, pos_id=None))]
    fn list_positions(&self, py: Python<'_>, project: &str, pos_id: Option<i64>) -> PyResult<PyObject> {
        to_py(py, &self.store.list_positions(project, pos_id)?)
    }

    #[pyo3(signature = (project, dir_id=None))]
    fn list_directions(&self, py: Python<'_>, project: &str, dir_id: Option<i64>) -> PyResult<PyObject> {
        to_py(py, &self.store.list_directions(project, dir_id)?)
    }

    #[pyo3(signature = (project, vox_id=None))]
    fn list_voxels(&self, py: Python<'_>, project: &str, vox_id: Option<i64>) -> PyResult<PyObject> {
        to_py(py, &self.store.list_voxels(project, vox_id)?)
    }

    fn check_integrity(&self, py: Python<'_>, project: &str) -> PyResult<()> {
        Ok(py.allow_threads(|| self.store.check_integrity(project))?)
    }

    // -- Shards --------------------------------------------------------------

    fn table_count(&self, project: &str) -> PyResult<i64> {
        Ok(self.store.table_count(project)?)
    }

    fn table_id(&self, project: &str, config_id: i64) -> PyResult<i64> {
        Ok(self.store.table_id(project, config_id)?)
    }

    fn list_shards(&self, py: Python<'_>, project: &str) -> PyResult<PyObject> {
        to_py(py, &self.store.list_shards(project)?)
    }

    #[pyo3(signature = (project, table_id=None))]
    fn lock_table(&self, project: &str, table_id: Option<i64>) -> PyResult<usize> {
        Ok(self.store.lock_shard(project, table_id)?)
    }

    #[pyo3(signature = (project, table_id=None))]
    fn unlock_table(&self, project: &str, table_id: Option<i64>) -> PyResult<usize> {
        Ok(self.store.unlock_shard(project, table_id)?)
    }

    fn progress(&self, py: Python<'_>, project: &str) -> PyResult<PyObject> {
        to_py(py, &self.store.progress(project)?)
    }

    // -- Work ----------------------------------------------------------------

    /// Next configuration to simulate, or None once the campaign is done.
    #[pyo3(signature = (project, prioritize=true, sample_size=DEFAULT_SAMPLE_SIZE))]
    fn get_random_config(
        &self,
        py: Python<'_>,
        project: &str,
        prioritize: bool,
        sample_size: usize,
    ) -> PyResult<Option<PyObject>> {
        match self.store.select_work(project, prioritize, sample_size) {
            Ok(item) => Ok(Some(to_py(py, &item)?)),
            Err(WcprodError::CampaignComplete(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// True when the file was recorded; False when it was refused.
    fn register_file(
        &self,
        project: &str,
        config_id: i64,
        file_path: PathBuf,
        units: u64,
        duration: f64,
    ) -> PyResult<bool> {
        let outcome = self
            .store
            .register_file(project, config_id, file_path, units, duration)?;
        Ok(matches!(outcome, Registration::Registered { .. }))
    }

    #[pyo3(signature = (project, config_id=None, table_id=None))]
    fn list_files(
        &self,
        py: Python<'_>,
        project: &str,
        config_id: Option<i64>,
        table_id: Option<i64>,
    ) -> PyResult<PyObject> {
        to_py(py, &self.store.list_files(project, config_id, table_id)?)
    }

    fn exist_file(&self, project: &str, file_path: PathBuf) -> PyResult<bool> {
        Ok(self.store.exist_file(project, file_path)?)
    }

    // -- Maintenance ---------------------------------------------------------

    fn backup_to(&self, destination: PathBuf) -> PyResult<String> {
        let path = self.store.backup_to(destination)?;
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Add the class, exceptions, and helpers to the extension module.
pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    use exceptions::*;

    let py = m.py();
    m.add_class::<ProductionDb>()?;
    m.add("WcprodException", py.get_type::<WcprodException>())?;
    m.add("DuplicateProjectError", py.get_type::<DuplicateProjectError>())?;
    m.add("ProjectNotFoundError", py.get_type::<ProjectNotFoundError>())?;
    m.add("TableNotFoundError", py.get_type::<TableNotFoundError>())?;
    m.add("ProjectIntegrityError", py.get_type::<ProjectIntegrityError>())?;
    m.add("CampaignCompleteError", py.get_type::<CampaignCompleteError>())?;
    m.add("InvalidConfigIdError", py.get_type::<InvalidConfigIdError>())?;

    m.add_function(wrap_pyfunction!(storage_path, m)?)?;
    m.add_function(wrap_pyfunction!(output_file_name, m)?)?;
    Ok(())
}

#[pyfunction]
fn storage_path(root: PathBuf, config_id: i64) -> String {
    crate::naming::storage_path(&root, config_id)
        .to_string_lossy()
        .into_owned()
}

#[pyfunction]
#[pyo3(signature = (project, config_id, file_ctr, extension="root"))]
fn output_file_name(project: &str, config_id: i64, file_ctr: i64, extension: &str) -> String {
    crate::naming::output_file_name(project, config_id, file_ctr, extension)
}
