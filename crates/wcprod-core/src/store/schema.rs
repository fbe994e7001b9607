//! SQLite schema DDL, table naming, and the migration framework.
//!
//! Global tables are created once per store. Every project owns a shard map
//! (`map_<project>`), a geometry table (`geo_<project>`), and per shard a
//! configuration table (`cfg_<project>_<i>`) and a file table
//! (`file_<project>_<i>`). Project names are validated to
//! `[A-Za-z][A-Za-z0-9_]*` before they reach any of the builders below.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::WcprodResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 1;

/// `geo_type` discriminators in the geometry table.
pub const GEO_POSITION: i64 = 0;
pub const GEO_DIRECTION: i64 = 1;
pub const GEO_VOXEL: i64 = 2;

/// Bookkeeping DDL the migration runner needs, safe to replay on an
/// initialised database. Everything else is created by migration steps.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
];

/// v1: the project registry.
const V1_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS project (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        rmin REAL NOT NULL,
        rmax REAL NOT NULL,
        zmin REAL NOT NULL,
        zmax REAL NOT NULL,
        gap_space REAL NOT NULL,
        gap_angle REAL NOT NULL,
        n_phi_start INTEGER NOT NULL DEFAULT 0,
        num_config INTEGER NOT NULL,
        num_tables INTEGER NOT NULL,
        num_photons INTEGER NOT NULL,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
];

// ─── Table names ────────────────────────────────────────────────────────────

pub fn map_table(project: &str) -> String {
    format!("map_{project}")
}

pub fn geo_table(project: &str) -> String {
    format!("geo_{project}")
}

pub fn cfg_table(project: &str, table_id: i64) -> String {
    format!("cfg_{project}_{table_id}")
}

pub fn file_table(project: &str, table_id: i64) -> String {
    format!("file_{project}_{table_id}")
}

// ─── Per-project DDL ────────────────────────────────────────────────────────

pub fn create_map_table_sql(project: &str) -> String {
    let map = map_table(project);
    format!(
        "CREATE TABLE {map} (
            table_id INTEGER PRIMARY KEY,
            config_range_min INTEGER NOT NULL,
            config_range_max INTEGER NOT NULL,
            unit_ctr INTEGER NOT NULL DEFAULT 0,
            target_ctr INTEGER NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_{map}_range ON {map}(config_range_min);"
    )
}

pub fn create_geo_table_sql(project: &str) -> String {
    let geo = geo_table(project);
    format!(
        "CREATE TABLE {geo} (
            geo_type INTEGER NOT NULL,
            geo_id INTEGER NOT NULL,
            val0 REAL,
            val1 REAL,
            val2 REAL,
            val3 REAL,
            val4 REAL,
            val5 REAL,
            PRIMARY KEY(geo_type, geo_id)
        );"
    )
}

pub fn create_cfg_table_sql(project: &str, table_id: i64, voxel_mode: bool) -> String {
    let cfg = cfg_table(project, table_id);
    let geometry_columns = if voxel_mode {
        "r0 REAL NOT NULL,
            r1 REAL NOT NULL,
            phi0 REAL NOT NULL,
            phi1 REAL NOT NULL,
            z0 REAL NOT NULL,
            z1 REAL NOT NULL,"
    } else {
        "x REAL NOT NULL,
            y REAL NOT NULL,
            z REAL NOT NULL,
            theta REAL NOT NULL,
            phi REAL NOT NULL,"
    };
    format!(
        "CREATE TABLE {cfg} (
            config_id INTEGER PRIMARY KEY,
            {geometry_columns}
            pos_id INTEGER NOT NULL,
            dir_id INTEGER NOT NULL,
            file_ctr INTEGER NOT NULL DEFAULT 0,
            unit_ctr INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX idx_{cfg}_units ON {cfg}(unit_ctr);"
    )
}

pub fn create_file_table_sql(project: &str, table_id: i64) -> String {
    let file = file_table(project, table_id);
    format!(
        "CREATE TABLE {file} (
            file_id INTEGER PRIMARY KEY AUTOINCREMENT,
            config_id INTEGER NOT NULL,
            file_path TEXT NOT NULL UNIQUE,
            units INTEGER NOT NULL,
            duration REAL NOT NULL,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX idx_{file}_config ON {file}(config_id);"
    )
}

/// Column list of a configuration table's geometry, in storage order.
pub fn cfg_geometry_columns(voxel_mode: bool) -> &'static str {
    if voxel_mode {
        "r0, r1, phi0, phi1, z0, z1"
    } else {
        "x, y, z, theta, phi"
    }
}

// ─── Introspection ──────────────────────────────────────────────────────────

pub fn table_exists(conn: &Connection, name: &str) -> WcprodResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1;",
            params![name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn list_tables(conn: &Connection) -> WcprodResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name;",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`]. Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> WcprodResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT wcprod_migrate_step;")?;

        let step_result = (|| -> WcprodResult<()> {
            if next_version == 1 {
                migrate_to_v1(conn)?;
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT wcprod_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT wcprod_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT wcprod_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Read the schema version from `store_meta`; 0 when absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> WcprodResult<()> {
    conn.execute(
        "INSERT INTO store_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> WcprodResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

/// v0 -> v1: project registry. Stores written before versioning already
/// have the table, hence `IF NOT EXISTS`.
fn migrate_to_v1(conn: &Connection) -> WcprodResult<()> {
    for stmt in V1_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    Ok(())
}
