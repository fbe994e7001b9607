//! Output file registration and lookup.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::errors::{WcprodError, WcprodResult};
use crate::models::{FileRecord, ProjectRecord, Registration, Rejection};
use crate::store::database::{require_project, ProductionStore};
use crate::store::schema;
use crate::store::sharding::find_shard;

/// Shard holding `file_path`, searching every file table of the project.
fn find_file(conn: &Connection, record: &ProjectRecord, file_path: &str) -> WcprodResult<Option<i64>> {
    for table_id in 0..record.num_tables {
        let sql = format!(
            "SELECT file_id FROM {} WHERE file_path = ?1;",
            schema::file_table(&record.name, table_id)
        );
        let hit: Option<i64> = conn
            .query_row(&sql, params![file_path], |row| row.get(0))
            .optional()?;
        if hit.is_some() {
            return Ok(Some(table_id));
        }
    }
    Ok(None)
}

fn read_files(
    conn: &Connection,
    project: &str,
    table_id: i64,
    config_id: Option<i64>,
) -> WcprodResult<Vec<FileRecord>> {
    let sql = format!(
        "SELECT file_id, config_id, file_path, units, duration, created_at FROM {} \
         WHERE ?1 IS NULL OR config_id = ?1 ORDER BY file_id;",
        schema::file_table(project, table_id)
    );
    let mut stmt = conn.prepare(&sql)?;
    let files = stmt
        .query_map(params![config_id], |row| {
            Ok(FileRecord {
                file_id: row.get(0)?,
                table_id,
                config_id: row.get(1)?,
                file_path: row.get(2)?,
                units: row.get(3)?,
                duration: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}

fn absolute_string(path: &Path) -> WcprodResult<String> {
    Ok(std::path::absolute(path)?.to_string_lossy().into_owned())
}

impl ProductionStore {
    /// Record an output file produced for `config_id` and add its units to
    /// the configuration and shard counters.
    ///
    /// A missing file, an unknown configuration, or an already registered
    /// path comes back as `Registration::Rejected` and changes nothing.
    pub fn register_file(
        &self,
        project: &str,
        config_id: i64,
        file_path: impl AsRef<Path>,
        units: u64,
        duration: f64,
    ) -> WcprodResult<Registration> {
        let file_path = file_path.as_ref();
        let units = i64::try_from(units)
            .map_err(|_| WcprodError::InvalidArgument(format!("units out of range: {units}")))?;
        if !duration.is_finite() || duration < 0.0 {
            return Err(WcprodError::InvalidArgument(format!(
                "duration must be a non-negative number (got {duration})"
            )));
        }

        let mut conn = self.connect()?;
        let record = require_project(&conn, project)?;

        if !file_path.is_file() {
            warn!(project, config_id, path = %file_path.display(), "file does not exist");
            return Ok(Registration::Rejected {
                reason: Rejection::MissingFile,
            });
        }
        let path = absolute_string(file_path)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(table_id) = find_shard(&tx, project, config_id)? else {
            warn!(project, config_id, "no shard owns config id");
            return Ok(Registration::Rejected {
                reason: Rejection::InvalidConfigId,
            });
        };
        let cfg = schema::cfg_table(project, table_id);
        let config_exists = tx
            .query_row(
                &format!("SELECT 1 FROM {cfg} WHERE config_id = ?1;"),
                params![config_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !config_exists {
            warn!(project, config_id, table_id, "config row missing");
            return Ok(Registration::Rejected {
                reason: Rejection::InvalidConfigId,
            });
        }

        if let Some(owner) = find_file(&tx, &record, &path)? {
            warn!(project, config_id, path = %path, table_id = owner, "file already registered");
            return Ok(Registration::Rejected {
                reason: Rejection::DuplicatePath,
            });
        }

        tx.execute(
            &format!(
                "INSERT INTO {}(config_id, file_path, units, duration) VALUES (?1, ?2, ?3, ?4);",
                schema::file_table(project, table_id)
            ),
            params![config_id, path, units, duration],
        )?;
        let file_id = tx.last_insert_rowid();
        tx.execute(
            &format!(
                "UPDATE {cfg} SET file_ctr = file_ctr + 1, unit_ctr = unit_ctr + ?1, \
                 updated_at = CURRENT_TIMESTAMP WHERE config_id = ?2;"
            ),
            params![units, config_id],
        )?;
        tx.execute(
            &format!(
                "UPDATE {} SET unit_ctr = unit_ctr + ?1 WHERE table_id = ?2;",
                schema::map_table(project)
            ),
            params![units, table_id],
        )?;
        tx.commit()?;

        debug!(project, config_id, table_id, file_id, units, "file registered");
        Ok(Registration::Registered { table_id, file_id })
    }

    /// Registered files, optionally restricted to one configuration and/or
    /// one shard. A configuration id outside the given shard is an
    /// `InvalidArgument`.
    pub fn list_files(
        &self,
        project: &str,
        config_id: Option<i64>,
        table_id: Option<i64>,
    ) -> WcprodResult<Vec<FileRecord>> {
        let conn = self.connect()?;
        let record = require_project(&conn, project)?;

        let owner = match config_id {
            Some(id) => match find_shard(&conn, project, id)? {
                Some(owner) => Some(owner),
                None => {
                    return Err(WcprodError::InvalidConfigId {
                        project: project.to_string(),
                        config_id: id,
                    })
                }
            },
            None => None,
        };

        let tables: Vec<i64> = match (owner, table_id) {
            (Some(owner), Some(requested)) if owner != requested => {
                return Err(WcprodError::InvalidArgument(format!(
                    "config id {} belongs to shard {owner}, not {requested}",
                    config_id.unwrap_or_default()
                )));
            }
            (Some(owner), _) => vec![owner],
            (None, Some(requested)) => {
                if !(0..record.num_tables).contains(&requested) {
                    return Err(WcprodError::InvalidArgument(format!(
                        "project '{project}' has no shard {requested}"
                    )));
                }
                vec![requested]
            }
            (None, None) => (0..record.num_tables).collect(),
        };

        let mut files = Vec::new();
        for table in tables {
            files.extend(read_files(&conn, project, table, config_id)?);
        }
        Ok(files)
    }

    /// Whether the absolute form of `file_path` is registered in any shard.
    pub fn exist_file(&self, project: &str, file_path: impl AsRef<Path>) -> WcprodResult<bool> {
        let conn = self.connect()?;
        let record = require_project(&conn, project)?;
        let path = absolute_string(file_path.as_ref())?;
        Ok(find_file(&conn, &record, &path)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;
    use crate::store::testutil::{small_spec, test_store, touch};

    fn registered(result: Registration) -> (i64, i64) {
        match result {
            Registration::Registered { table_id, file_id } => (table_id, file_id),
            other => panic!("expected registration, got {other:?}"),
        }
    }

    #[test]
    fn test_register_updates_counters() {
        let (dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();

        let path = touch(dir.path(), "out_a.root");
        let (table_id, _) = registered(store.register_file("demo", 700, &path, 40, 1.5).unwrap());
        let path = touch(dir.path(), "out_b.root");
        registered(store.register_file("demo", 700, &path, 2, 0.5).unwrap());

        let config = store.get_config("demo", 700).unwrap().unwrap();
        assert_eq!(config.table_id, table_id);
        assert_eq!(config.file_ctr, 2);
        assert_eq!(config.unit_ctr, 42);
        let shard = &store.list_shards("demo").unwrap()[table_id as usize];
        assert_eq!(shard.unit_ctr, 42);
        store.check_integrity("demo").unwrap();
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let (dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();

        let path = touch(dir.path(), "out.root");
        registered(store.register_file("demo", 3, &path, 10, 1.0).unwrap());
        // Same path against another configuration in another shard.
        let second = store.register_file("demo", 1200, &path, 10, 1.0).unwrap();
        assert_eq!(
            second,
            Registration::Rejected {
                reason: Rejection::DuplicatePath
            }
        );

        assert_eq!(store.get_config("demo", 3).unwrap().unwrap().unit_ctr, 10);
        assert_eq!(store.get_config("demo", 1200).unwrap().unwrap().unit_ctr, 0);
        let total: i64 = store.list_shards("demo").unwrap().iter().map(|s| s.unit_ctr).sum();
        assert_eq!(total, 10);
        assert_eq!(store.list_files("demo", None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_file_and_bad_config_rejected() {
        let (dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();

        let absent = dir.path().join("never_written.root");
        assert_eq!(
            store.register_file("demo", 0, &absent, 1, 1.0).unwrap(),
            Registration::Rejected {
                reason: Rejection::MissingFile
            }
        );

        let path = touch(dir.path(), "out.root");
        let n = project.num_configs() as i64;
        for bad in [n, n + 10, -1] {
            assert_eq!(
                store.register_file("demo", bad, &path, 1, 1.0).unwrap(),
                Registration::Rejected {
                    reason: Rejection::InvalidConfigId
                }
            );
        }
        assert!(store.list_files("demo", None, None).unwrap().is_empty());
        assert!(matches!(
            store.register_file("ghost", 0, &path, 1, 1.0),
            Err(WcprodError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn test_stored_path_is_absolute() {
        let (dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();

        let path = touch(dir.path(), "abs.root");
        registered(store.register_file("demo", 5, &path, 1, 1.0).unwrap());
        let files = store.list_files("demo", Some(5), None).unwrap();
        assert_eq!(files.len(), 1);
        assert!(Path::new(&files[0].file_path).is_absolute());
        assert!(store.exist_file("demo", &path).unwrap());
    }

    #[test]
    fn test_two_files_two_configs() {
        let (dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();

        let first = touch(dir.path(), "first.root");
        let second = touch(dir.path(), "second.root");
        let (t0, _) = registered(store.register_file("demo", 1, &first, 5, 2.0).unwrap());
        let (t1, _) = registered(store.register_file("demo", 1000, &second, 7, 3.0).unwrap());
        assert_ne!(t0, t1);

        let files = store.list_files("demo", None, None).unwrap();
        assert_eq!(files.len(), 2);
        assert!(store.exist_file("demo", &first).unwrap());
        assert!(store.exist_file("demo", &second).unwrap());
        assert!(!store.exist_file("demo", dir.path().join("third.root")).unwrap());

        let by_config = store.list_files("demo", Some(1000), None).unwrap();
        assert_eq!(by_config.len(), 1);
        assert_eq!(by_config[0].units, 7);
        assert_eq!(by_config[0].table_id, t1);

        let by_table = store.list_files("demo", None, Some(t0)).unwrap();
        assert_eq!(by_table.len(), 1);
        assert_eq!(by_table[0].config_id, 1);

        assert!(matches!(
            store.list_files("demo", Some(1000), Some(t0)),
            Err(WcprodError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.list_files("demo", None, Some(42)),
            Err(WcprodError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_register_rejects_bad_duration() {
        let (dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();
        let path = touch(dir.path(), "out.root");
        assert!(matches!(
            store.register_file("demo", 0, &path, 1, f64::NAN),
            Err(WcprodError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.register_file("demo", 0, &path, u64::MAX, 1.0),
            Err(WcprodError::InvalidArgument(_))
        ));
    }

    /// One store handle per thread, as separate worker processes would open.
    fn worker_handles(store: &ProductionStore, n: usize) -> Vec<ProductionStore> {
        (0..n)
            .map(|_| ProductionStore::open_existing(store.db_path(), store.config().clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_concurrent_same_path_registers_once() {
        let (dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();
        let path = touch(dir.path(), "shared.root");

        let handles = worker_handles(&store, 8);
        let outcomes: Vec<Registration> = std::thread::scope(|scope| {
            let workers: Vec<_> = handles
                .iter()
                .enumerate()
                .map(|(i, handle)| {
                    let path = &path;
                    scope.spawn(move || {
                        handle
                            .register_file("demo", i as i64 * 150, path, 10, 1.0)
                            .unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let accepted = outcomes
            .iter()
            .filter(|o| matches!(o, Registration::Registered { .. }))
            .count();
        assert_eq!(accepted, 1);
        for outcome in &outcomes {
            if let Registration::Rejected { reason } = outcome {
                assert_eq!(*reason, Rejection::DuplicatePath);
            }
        }
        assert_eq!(store.list_files("demo", None, None).unwrap().len(), 1);
        let total: i64 = store.list_shards("demo").unwrap().iter().map(|s| s.unit_ctr).sum();
        assert_eq!(total, 10);
        store.check_integrity("demo").unwrap();
    }

    #[test]
    fn test_concurrent_distinct_paths_keep_counters() {
        let (dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();
        let n = project.num_configs() as i64;

        let handles = worker_handles(&store, 8);
        let accepted: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = handles
                .iter()
                .enumerate()
                .map(|(worker, handle)| {
                    let dir = dir.path();
                    scope.spawn(move || {
                        let mut ok = 0;
                        for i in 0..20 {
                            let path = touch(dir, &format!("w{worker}_{i}.root"));
                            // Workers overlap on configurations and shards.
                            let config_id = ((worker * 20 + i) as i64 * 37) % n;
                            if let Registration::Registered { .. } =
                                handle.register_file("demo", config_id, &path, 3, 0.5).unwrap()
                            {
                                ok += 1;
                            }
                        }
                        ok
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(accepted, 160);
        assert_eq!(store.list_files("demo", None, None).unwrap().len(), 160);
        let total: i64 = store.list_shards("demo").unwrap().iter().map(|s| s.unit_ctr).sum();
        assert_eq!(total, 160 * 3);
        store.check_integrity("demo").unwrap();
    }
}
