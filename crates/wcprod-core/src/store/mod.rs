pub mod database;
pub mod files;
pub mod integrity;
pub mod schema;
pub mod selection;
pub mod sharding;

pub use database::ProductionStore;
pub use sharding::{partition, ShardRange};

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::StoreConfig;
    use crate::models::Registration;
    use crate::project::ProjectSpec;
    use crate::store::ProductionStore;

    static FILE_SEQ: AtomicUsize = AtomicUsize::new(0);

    /// 54 positions x 24 directions = 1296 configurations.
    pub fn small_spec(name: &str) -> ProjectSpec {
        ProjectSpec {
            project: name.to_string(),
            rmin: 0.0,
            rmax: 100.0,
            zmin: 0.0,
            zmax: 100.0,
            gap_space: 50.0,
            gap_angle: 60.0,
            n_phi_start: 0,
            num_photons: 100,
        }
    }

    pub fn test_store() -> (tempfile::TempDir, ProductionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ProductionStore::open_with_config(dir.path().join("prod.db"), StoreConfig::default())
                .unwrap();
        (dir, store)
    }

    pub fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"output").unwrap();
        path
    }

    /// Register a fresh output file carrying `units` for one configuration.
    pub fn complete_config(
        store: &ProductionStore,
        dir: &Path,
        project: &str,
        config_id: i64,
        units: u64,
    ) {
        let seq = FILE_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = touch(dir, &format!("out_{project}_{config_id:09}_{seq:06}.root"));
        let result = store
            .register_file(project, config_id, &path, units, 1.0)
            .unwrap();
        assert!(matches!(result, Registration::Registered { .. }));
    }
}
