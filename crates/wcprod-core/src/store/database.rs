//! SQLite production store.
//!
//! Every public method opens its own connection, so a `ProductionStore` is
//! just a resolved path plus configuration and can be shared freely between
//! threads or rebuilt in each worker process.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::errors::{WcprodError, WcprodResult};
use crate::geometry::{Configuration, Direction, Position, Voxel};
use crate::models::{ConfigGeometry, ConfigRecord, ProjectRecord};
use crate::project::{validate_project_name, Project};
use crate::store::integrity;
use crate::store::schema::{self, GEO_DIRECTION, GEO_POSITION, GEO_VOXEL};
use crate::store::sharding;

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text == "~" || text.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if text.len() > 2 {
                expanded.push(&text[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

/// Expand `~` and make `path` absolute against the working directory.
pub(crate) fn resolve_path(path: &Path) -> WcprodResult<PathBuf> {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

const PROJECT_COLUMNS: &str = "name, rmin, rmax, zmin, zmax, gap_space, gap_angle, \
     n_phi_start, num_config, num_tables, num_photons";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectRecord> {
    Ok(ProjectRecord {
        name: row.get(0)?,
        rmin: row.get(1)?,
        rmax: row.get(2)?,
        zmin: row.get(3)?,
        zmax: row.get(4)?,
        gap_space: row.get(5)?,
        gap_angle: row.get(6)?,
        n_phi_start: row.get(7)?,
        num_config: row.get(8)?,
        num_tables: row.get(9)?,
        num_photons: row.get(10)?,
    })
}

/// Read the project row, `None` when the project is not registered.
pub(crate) fn find_project(conn: &Connection, name: &str) -> WcprodResult<Option<ProjectRecord>> {
    let sql = format!("SELECT {PROJECT_COLUMNS} FROM project WHERE name = ?1;");
    Ok(conn
        .query_row(&sql, params![name], project_from_row)
        .optional()?)
}

/// Read the project row or fail with `ProjectNotFound`.
pub(crate) fn require_project(conn: &Connection, name: &str) -> WcprodResult<ProjectRecord> {
    find_project(conn, name)?.ok_or_else(|| WcprodError::ProjectNotFound(name.to_string()))
}

/// Select list for a configuration row: geometry columns first, then
/// `config_id, pos_id, dir_id, file_ctr, unit_ctr, updated_at`.
pub(crate) fn cfg_select_columns(voxel_mode: bool) -> String {
    format!(
        "{}, config_id, pos_id, dir_id, file_ctr, unit_ctr, updated_at",
        schema::cfg_geometry_columns(voxel_mode)
    )
}

/// Decode a row selected with [`cfg_select_columns`].
pub(crate) fn config_from_row(
    row: &Row<'_>,
    table_id: i64,
    voxel_mode: bool,
) -> rusqlite::Result<ConfigRecord> {
    let (geometry, next) = if voxel_mode {
        (
            ConfigGeometry::Voxel {
                r0: row.get(0)?,
                r1: row.get(1)?,
                phi0: row.get(2)?,
                phi1: row.get(3)?,
                z0: row.get(4)?,
                z1: row.get(5)?,
            },
            6,
        )
    } else {
        (
            ConfigGeometry::Point {
                x: row.get(0)?,
                y: row.get(1)?,
                z: row.get(2)?,
                theta: row.get(3)?,
                phi: row.get(4)?,
            },
            5,
        )
    };
    Ok(ConfigRecord {
        config_id: row.get(next)?,
        table_id,
        geometry,
        pos_id: row.get(next + 1)?,
        dir_id: row.get(next + 2)?,
        file_ctr: row.get(next + 3)?,
        unit_ctr: row.get(next + 4)?,
        updated_at: row.get(next + 5)?,
    })
}

fn to_i64(value: usize, what: &str) -> WcprodResult<i64> {
    i64::try_from(value)
        .map_err(|_| WcprodError::InvalidArgument(format!("{what} out of range: {value}")))
}

// ---------------------------------------------------------------------------
// ProductionStore
// ---------------------------------------------------------------------------

/// Handle on a production database file.
#[derive(Debug, Clone)]
pub struct ProductionStore {
    db_path: PathBuf,
    config: StoreConfig,
}

impl ProductionStore {
    /// Open (creating if needed) a store with configuration from the
    /// environment.
    pub fn open(db_path: impl AsRef<Path>) -> WcprodResult<Self> {
        Self::open_with_config(db_path, StoreConfig::from_env())
    }

    /// Open (creating if needed) a store. Parent directories are created and
    /// the schema is initialised.
    pub fn open_with_config(db_path: impl AsRef<Path>, config: StoreConfig) -> WcprodResult<Self> {
        let resolved = resolve_path(db_path.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            db_path: resolved,
            config,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a store that must already exist. Nothing is created: a missing
    /// file is an IO error and a file without the `project` table is
    /// `TableNotFound`.
    pub fn open_existing(db_path: impl AsRef<Path>, config: StoreConfig) -> WcprodResult<Self> {
        let resolved = resolve_path(db_path.as_ref())?;
        if !resolved.is_file() {
            return Err(WcprodError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Database file does not exist: {}", resolved.display()),
            )));
        }
        let store = Self {
            db_path: resolved,
            config,
        };
        let conn = store.connect()?;
        if !schema::table_exists(&conn, "project")? {
            return Err(WcprodError::TableNotFound("project".to_string()));
        }
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Open a new connection with the busy timeout applied.
    pub(crate) fn connect(&self) -> WcprodResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Set WAL mode, create the global tables, then run pending migrations.
    pub fn init_schema(&self) -> WcprodResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    pub fn list_all_tables(&self) -> WcprodResult<Vec<String>> {
        let conn = self.connect()?;
        schema::list_tables(&conn)
    }

    pub fn exist_table(&self, name: &str) -> WcprodResult<bool> {
        let conn = self.connect()?;
        schema::table_exists(&conn, name)
    }

    /// Registered project names in registration order.
    pub fn list_projects(&self) -> WcprodResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT name FROM project ORDER BY id;")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn exist_project(&self, name: &str) -> WcprodResult<bool> {
        let conn = self.connect()?;
        Ok(find_project(&conn, name)?.is_some())
    }

    pub fn project_record(&self, name: &str) -> WcprodResult<Option<ProjectRecord>> {
        let conn = self.connect()?;
        find_project(&conn, name)
    }

    /// Rebuild a registered project from its stored geometry.
    pub fn get_project(&self, name: &str) -> WcprodResult<Option<Project>> {
        let conn = self.connect()?;
        let Some(record) = find_project(&conn, name)? else {
            return Ok(None);
        };
        let positions = read_positions(&conn, name, None)?;
        let directions = read_directions(&conn, name, None)?;
        let voxels = read_voxels(&conn, name, None)?;
        Ok(Some(Project::from_parts(
            record.spec(),
            positions,
            directions,
            voxels,
        )))
    }

    /// One configuration with its counters; `None` when no shard owns the id.
    pub fn get_config(&self, project: &str, config_id: i64) -> WcprodResult<Option<ConfigRecord>> {
        let conn = self.connect()?;
        let record = require_project(&conn, project)?;
        let Some(table_id) = sharding::find_shard(&conn, project, config_id)? else {
            return Ok(None);
        };
        let voxel_mode = record.is_voxel_mode();
        let sql = format!(
            "SELECT {} FROM {} WHERE config_id = ?1;",
            cfg_select_columns(voxel_mode),
            schema::cfg_table(project, table_id)
        );
        Ok(conn
            .query_row(&sql, params![config_id], |row| {
                config_from_row(row, table_id, voxel_mode)
            })
            .optional()?)
    }

    pub fn list_positions(&self, project: &str, pos_id: Option<i64>) -> WcprodResult<Vec<Position>> {
        let conn = self.connect()?;
        require_project(&conn, project)?;
        read_positions(&conn, project, pos_id)
    }

    pub fn list_directions(
        &self,
        project: &str,
        dir_id: Option<i64>,
    ) -> WcprodResult<Vec<Direction>> {
        let conn = self.connect()?;
        require_project(&conn, project)?;
        read_directions(&conn, project, dir_id)
    }

    pub fn list_voxels(&self, project: &str, vox_id: Option<i64>) -> WcprodResult<Vec<Voxel>> {
        let conn = self.connect()?;
        require_project(&conn, project)?;
        read_voxels(&conn, project, vox_id)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Persist a generated project split into shards of at most
    /// `max_entries_per_shard` configurations.
    ///
    /// Everything is written in one IMMEDIATE transaction. The integrity
    /// checker runs after commit; if it finds a violation the project is
    /// dropped again and the violation returned.
    pub fn register_project(
        &self,
        project: &Project,
        max_entries_per_shard: usize,
    ) -> WcprodResult<ProjectRecord> {
        let spec = &project.spec;
        spec.validate()?;
        if project.configs.is_empty() {
            return Err(WcprodError::InvalidGeometry(format!(
                "project '{}' has no configurations",
                spec.project
            )));
        }
        let ranges = sharding::partition(project.configs.len(), max_entries_per_shard)?;
        let name = spec.project.as_str();
        let voxel_mode = spec.is_voxel_mode();
        let num_photons = i64::try_from(spec.num_photons).map_err(|_| {
            WcprodError::InvalidArgument(format!("num_photons out of range: {}", spec.num_photons))
        })?;
        let record = ProjectRecord {
            name: name.to_string(),
            rmin: spec.rmin,
            rmax: spec.rmax,
            zmin: spec.zmin,
            zmax: spec.zmax,
            gap_space: spec.gap_space,
            gap_angle: spec.gap_angle,
            n_phi_start: i64::from(spec.n_phi_start),
            num_config: to_i64(project.configs.len(), "num_config")?,
            num_tables: to_i64(ranges.len(), "num_tables")?,
            num_photons,
        };

        info!(
            project = name,
            configs = record.num_config,
            shards = record.num_tables,
            voxel_mode,
            "registering project"
        );

        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_project(&tx, name)?.is_some() {
            return Err(WcprodError::DuplicateProject(name.to_string()));
        }
        tx.execute(
            "INSERT INTO project(name, rmin, rmax, zmin, zmax, gap_space, gap_angle, \
             n_phi_start, num_config, num_tables, num_photons) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
            params![
                record.name,
                record.rmin,
                record.rmax,
                record.zmin,
                record.zmax,
                record.gap_space,
                record.gap_angle,
                record.n_phi_start,
                record.num_config,
                record.num_tables,
                record.num_photons,
            ],
        )?;

        tx.execute_batch(&schema::create_map_table_sql(name))?;
        tx.execute_batch(&schema::create_geo_table_sql(name))?;
        insert_geometry(&tx, project)?;

        let map_insert = format!(
            "INSERT INTO {}(table_id, config_range_min, config_range_max, unit_ctr, target_ctr, locked) \
             VALUES (?1, ?2, ?3, 0, ?4, 0);",
            schema::map_table(name)
        );
        for range in &ranges {
            tx.execute_batch(&schema::create_cfg_table_sql(name, range.table_id, voxel_mode))?;
            tx.execute_batch(&schema::create_file_table_sql(name, range.table_id))?;

            let first = range.config_range_min as usize;
            let last = range.config_range_max as usize;
            insert_configs(
                &tx,
                name,
                range.table_id,
                range.config_range_min,
                &project.configs[first..=last],
            )?;

            let target = range.entries().checked_mul(num_photons).ok_or_else(|| {
                WcprodError::InvalidArgument(format!(
                    "target of shard {} overflows ({} entries x {num_photons})",
                    range.table_id,
                    range.entries()
                ))
            })?;
            tx.execute(
                &map_insert,
                params![
                    range.table_id,
                    range.config_range_min,
                    range.config_range_max,
                    target
                ],
            )?;
            debug!(
                project = name,
                table_id = range.table_id,
                min = range.config_range_min,
                max = range.config_range_max,
                "shard written"
            );
        }

        tx.commit()?;

        if let Err(err) = integrity::check_project(&conn, name) {
            warn!(project = name, error = %err, "registered project failed integrity check, dropping");
            drop_project_tables(&mut conn, name)?;
            return Err(err);
        }

        info!(project = name, shards = record.num_tables, "project registered");
        Ok(record)
    }

    /// Drop every table of a project and its project row.
    pub fn drop_project(&self, name: &str) -> WcprodResult<()> {
        validate_project_name(name)?;
        let mut conn = self.connect()?;
        drop_project_tables(&mut conn, name)?;
        info!(project = name, "project dropped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    /// Copy the database to `destination` with the SQLite online backup API.
    /// Returns the resolved destination path.
    pub fn backup_to(&self, destination: impl AsRef<Path>) -> WcprodResult<PathBuf> {
        let resolved = resolve_path(destination.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(&resolved)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        info!(destination = %resolved.display(), "store backed up");
        Ok(resolved)
    }
}

// ---------------------------------------------------------------------------
// Registration helpers
// ---------------------------------------------------------------------------

fn insert_geometry(conn: &Connection, project: &Project) -> WcprodResult<()> {
    let sql = format!(
        "INSERT INTO {}(geo_type, geo_id, val0, val1, val2, val3, val4, val5) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
        schema::geo_table(project.name())
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    for (id, p) in project.positions.iter().enumerate() {
        stmt.execute(params![
            GEO_POSITION,
            to_i64(id, "geo_id")?,
            p.x,
            p.y,
            p.z,
            None::<f64>,
            None::<f64>,
            None::<f64>
        ])?;
    }
    for (id, d) in project.directions.iter().enumerate() {
        stmt.execute(params![
            GEO_DIRECTION,
            to_i64(id, "geo_id")?,
            d.theta,
            d.phi,
            None::<f64>,
            None::<f64>,
            None::<f64>,
            None::<f64>
        ])?;
    }
    for (id, v) in project.voxels.iter().enumerate() {
        stmt.execute(params![
            GEO_VOXEL,
            to_i64(id, "geo_id")?,
            v.r0,
            v.r1,
            v.phi0,
            v.phi1,
            v.z0,
            v.z1
        ])?;
    }
    Ok(())
}

fn insert_configs(
    conn: &Connection,
    project: &str,
    table_id: i64,
    first_id: i64,
    configs: &[Configuration],
) -> WcprodResult<()> {
    let cfg = schema::cfg_table(project, table_id);
    let point_sql = format!(
        "INSERT INTO {cfg}(config_id, x, y, z, theta, phi, pos_id, dir_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);"
    );
    let voxel_sql = format!(
        "INSERT INTO {cfg}(config_id, r0, r1, phi0, phi1, z0, z1, pos_id, dir_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0);"
    );

    for (offset, config) in configs.iter().enumerate() {
        let config_id = first_id + to_i64(offset, "config_id")?;
        match config {
            Configuration::Point {
                position,
                direction,
                pos_id,
                dir_id,
            } => {
                let mut stmt = conn.prepare_cached(&point_sql)?;
                stmt.execute(params![
                    config_id,
                    position.x,
                    position.y,
                    position.z,
                    direction.theta,
                    direction.phi,
                    to_i64(*pos_id, "pos_id")?,
                    to_i64(*dir_id, "dir_id")?
                ])?;
            }
            Configuration::Voxel { voxel, vox_id } => {
                let mut stmt = conn.prepare_cached(&voxel_sql)?;
                stmt.execute(params![
                    config_id,
                    voxel.r0,
                    voxel.r1,
                    voxel.phi0,
                    voxel.phi1,
                    voxel.z0,
                    voxel.z1,
                    to_i64(*vox_id, "pos_id")?
                ])?;
            }
        }
    }
    Ok(())
}

/// Drop all tables of `name` and delete its project row in one transaction.
fn drop_project_tables(conn: &mut Connection, name: &str) -> WcprodResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let record = require_project(&tx, name)?;
    for table_id in 0..record.num_tables {
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
            schema::cfg_table(name, table_id),
            schema::file_table(name, table_id)
        ))?;
    }
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
        schema::map_table(name),
        schema::geo_table(name)
    ))?;
    tx.execute("DELETE FROM project WHERE name = ?1;", params![name])?;
    tx.commit()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Geometry readers
// ---------------------------------------------------------------------------

fn query_geometry<T>(
    conn: &Connection,
    project: &str,
    geo_type: i64,
    geo_id: Option<i64>,
    map: impl Fn(&Row<'_>) -> rusqlite::Result<T>,
) -> WcprodResult<Vec<T>> {
    let geo = schema::geo_table(project);
    let mut stmt = conn.prepare(&format!(
        "SELECT val0, val1, val2, val3, val4, val5 FROM {geo} \
         WHERE geo_type = ?1 AND (?2 IS NULL OR geo_id = ?2) ORDER BY geo_id;"
    ))?;
    let rows = stmt
        .query_map(params![geo_type, geo_id], |row| map(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn read_positions(conn: &Connection, project: &str, id: Option<i64>) -> WcprodResult<Vec<Position>> {
    query_geometry(conn, project, GEO_POSITION, id, |row| {
        Ok(Position {
            x: row.get(0)?,
            y: row.get(1)?,
            z: row.get(2)?,
        })
    })
}

fn read_directions(
    conn: &Connection,
    project: &str,
    id: Option<i64>,
) -> WcprodResult<Vec<Direction>> {
    query_geometry(conn, project, GEO_DIRECTION, id, |row| {
        Ok(Direction {
            theta: row.get(0)?,
            phi: row.get(1)?,
        })
    })
}

fn read_voxels(conn: &Connection, project: &str, id: Option<i64>) -> WcprodResult<Vec<Voxel>> {
    query_geometry(conn, project, GEO_VOXEL, id, |row| {
        Ok(Voxel {
            r0: row.get(0)?,
            r1: row.get(1)?,
            phi0: row.get(2)?,
            phi1: row.get(3)?,
            z0: row.get(4)?,
            z1: row.get(5)?,
        })
    })
}
