//! Read-only consistency audit of a registered project.
//!
//! Checks run in a fixed order and stop at the first violation, which is
//! reported as `ProjectIntegrity` carrying the failed [`IntegrityCheck`].

use rusqlite::{params, Connection};
use tracing::debug;

use crate::errors::{IntegrityCheck, WcprodError, WcprodResult};
use crate::models::{ProjectRecord, ShardRecord};
use crate::store::database::{find_project, ProductionStore};
use crate::store::schema::{self, GEO_DIRECTION, GEO_POSITION, GEO_VOXEL};
use crate::store::sharding::read_shards;

const RELATIVE_TOLERANCE: f64 = 1e-6;

/// `value` inside `[lo, hi]` up to a small relative slack.
fn within(value: f64, lo: f64, hi: f64) -> bool {
    let slack = RELATIVE_TOLERANCE * lo.abs().max(hi.abs()).max(1.0);
    value >= lo - slack && value <= hi + slack
}

fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> WcprodResult<i64> {
    Ok(conn.query_row(sql, params, |row| row.get(0))?)
}

fn require_table(conn: &Connection, project: &str, table: &str) -> WcprodResult<()> {
    if schema::table_exists(conn, table)? {
        Ok(())
    } else {
        Err(WcprodError::integrity(
            project,
            IntegrityCheck::MissingTable,
            format!("table {table} does not exist"),
        ))
    }
}

struct GeometryCounts {
    positions: i64,
    directions: i64,
    voxels: i64,
}

fn check_project_row(conn: &Connection, project: &str) -> WcprodResult<ProjectRecord> {
    if !schema::table_exists(conn, "project")? {
        return Err(WcprodError::TableNotFound("project".to_string()));
    }
    let rows = count(
        conn,
        "SELECT COUNT(*) FROM project WHERE name = ?1;",
        params![project],
    )?;
    match rows {
        0 => Err(WcprodError::ProjectNotFound(project.to_string())),
        1 => find_project(conn, project)?
            .ok_or_else(|| WcprodError::ProjectNotFound(project.to_string())),
        n => Err(WcprodError::integrity(
            project,
            IntegrityCheck::ProjectUnique,
            format!("{n} project rows share this name"),
        )),
    }
}

fn check_geometry(conn: &Connection, record: &ProjectRecord) -> WcprodResult<GeometryCounts> {
    let project = record.name.as_str();
    let geo = schema::geo_table(project);
    require_table(conn, project, &geo)?;

    let unknown = count(
        conn,
        &format!("SELECT COUNT(*) FROM {geo} WHERE geo_type NOT IN (?1, ?2, ?3);"),
        params![GEO_POSITION, GEO_DIRECTION, GEO_VOXEL],
    )?;
    if unknown > 0 {
        return Err(WcprodError::integrity(
            project,
            IntegrityCheck::GeometryCount,
            format!("{unknown} geometry rows have an unknown geo_type"),
        ));
    }

    let of_type = |geo_type: i64| -> WcprodResult<i64> {
        count(
            conn,
            &format!("SELECT COUNT(*) FROM {geo} WHERE geo_type = ?1;"),
            params![geo_type],
        )
    };
    let counts = GeometryCounts {
        positions: of_type(GEO_POSITION)?,
        directions: of_type(GEO_DIRECTION)?,
        voxels: of_type(GEO_VOXEL)?,
    };

    if record.is_voxel_mode() {
        if counts.voxels != record.num_config {
            return Err(WcprodError::integrity(
                project,
                IntegrityCheck::GeometryCount,
                format!(
                    "{} voxels for {} configurations",
                    counts.voxels, record.num_config
                ),
            ));
        }
    } else if counts.positions * counts.directions != record.num_config {
        return Err(WcprodError::integrity(
            project,
            IntegrityCheck::GeometryCount,
            format!(
                "{} positions x {} directions for {} configurations",
                counts.positions, counts.directions, record.num_config
            ),
        ));
    }
    Ok(counts)
}

fn check_shard_map(conn: &Connection, record: &ProjectRecord) -> WcprodResult<Vec<ShardRecord>> {
    let project = record.name.as_str();
    require_table(conn, project, &schema::map_table(project))?;
    let shards = read_shards(conn, project)?;

    let dense = shards.len() as i64 == record.num_tables
        && shards
            .iter()
            .enumerate()
            .all(|(i, shard)| shard.table_id == i as i64);
    if !dense {
        let ids: Vec<i64> = shards.iter().map(|s| s.table_id).collect();
        return Err(WcprodError::integrity(
            project,
            IntegrityCheck::ShardIds,
            format!("expected ids 0..{}, found {ids:?}", record.num_tables),
        ));
    }

    for shard in &shards {
        let expected = shard.entries().checked_mul(record.num_photons);
        if expected != Some(shard.target_ctr) {
            return Err(WcprodError::integrity(
                project,
                IntegrityCheck::ShardTarget,
                format!(
                    "shard {} target {} != {} entries x {}",
                    shard.table_id,
                    shard.target_ctr,
                    shard.entries(),
                    record.num_photons
                ),
            ));
        }
    }

    let mut next_min = 0;
    for shard in &shards {
        if shard.config_range_min > shard.config_range_max || shard.config_range_min != next_min {
            return Err(WcprodError::integrity(
                project,
                IntegrityCheck::ShardRanges,
                format!(
                    "shard {} covers [{}, {}], expected it to start at {next_min}",
                    shard.table_id, shard.config_range_min, shard.config_range_max
                ),
            ));
        }
        next_min = shard.config_range_max + 1;
    }
    if next_min != record.num_config {
        return Err(WcprodError::integrity(
            project,
            IntegrityCheck::ShardRanges,
            format!(
                "shards end at {}, expected {}",
                next_min - 1,
                record.num_config - 1
            ),
        ));
    }
    Ok(shards)
}

fn check_config_table(
    conn: &Connection,
    record: &ProjectRecord,
    shard: &ShardRecord,
    geometry: &GeometryCounts,
) -> WcprodResult<()> {
    let project = record.name.as_str();
    let cfg = schema::cfg_table(project, shard.table_id);
    require_table(conn, project, &cfg)?;

    let (min_id, max_id, rows): (Option<i64>, Option<i64>, i64) = conn.query_row(
        &format!("SELECT MIN(config_id), MAX(config_id), COUNT(*) FROM {cfg};"),
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    if min_id != Some(shard.config_range_min)
        || max_id != Some(shard.config_range_max)
        || rows != shard.entries()
    {
        return Err(WcprodError::integrity(
            project,
            IntegrityCheck::ConfigRange,
            format!(
                "{cfg} holds {rows} rows in [{min_id:?}, {max_id:?}], expected [{}, {}]",
                shard.config_range_min, shard.config_range_max
            ),
        ));
    }

    let (pos_limit, dir_limit) = if record.is_voxel_mode() {
        (geometry.voxels, 1)
    } else {
        (geometry.positions, geometry.directions)
    };
    let (pos_lo, pos_hi, dir_lo, dir_hi): (i64, i64, i64, i64) = conn.query_row(
        &format!("SELECT MIN(pos_id), MAX(pos_id), MIN(dir_id), MAX(dir_id) FROM {cfg};"),
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;
    if pos_lo < 0 || pos_hi >= pos_limit || dir_lo < 0 || dir_hi >= dir_limit {
        return Err(WcprodError::integrity(
            project,
            IntegrityCheck::GeometryReference,
            format!(
                "{cfg} references pos_id [{pos_lo}, {pos_hi}] of {pos_limit} and \
                 dir_id [{dir_lo}, {dir_hi}] of {dir_limit}"
            ),
        ));
    }
    Ok(())
}

fn check_config_bounds(
    conn: &Connection,
    record: &ProjectRecord,
    shard: &ShardRecord,
) -> WcprodResult<()> {
    let project = record.name.as_str();
    let cfg = schema::cfg_table(project, shard.table_id);

    let bounds = record.bounds();
    // (label, SQL expression, lower bound, upper bound)
    let checks: Vec<(&str, &str, f64, f64)> = if record.is_voxel_mode() {
        vec![
            ("r0", "r0", bounds.rmin, bounds.rmax),
            ("r1", "r1", bounds.rmin, bounds.rmax),
            ("phi0", "phi0", 0.0, 360.0),
            ("phi1", "phi1", 0.0, 360.0),
            ("z0", "z0", bounds.zmin, bounds.zmax),
            ("z1", "z1", bounds.zmin, bounds.zmax),
        ]
    } else {
        vec![
            (
                "radius^2",
                "x * x + y * y",
                bounds.rmin * bounds.rmin,
                bounds.rmax * bounds.rmax,
            ),
            ("z", "z", bounds.zmin, bounds.zmax),
            ("theta", "theta", 0.0, 180.0),
            ("phi", "phi", 0.0, 360.0),
        ]
    };

    for (label, expr, lo, hi) in checks {
        let (min, max): (f64, f64) = conn.query_row(
            &format!("SELECT MIN({expr}), MAX({expr}) FROM {cfg};"),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if !within(min, lo, hi) || !within(max, lo, hi) {
            return Err(WcprodError::integrity(
                project,
                IntegrityCheck::GeometryBounds,
                format!("{cfg}: {label} spans [{min}, {max}] outside [{lo}, {hi}]"),
            ));
        }
    }
    Ok(())
}

fn check_file_table(conn: &Connection, record: &ProjectRecord, shard: &ShardRecord) -> WcprodResult<()> {
    let project = record.name.as_str();
    let file = schema::file_table(project, shard.table_id);
    require_table(conn, project, &file)?;

    let stray = count(
        conn,
        &format!("SELECT COUNT(*) FROM {file} WHERE config_id < ?1 OR config_id > ?2;"),
        params![shard.config_range_min, shard.config_range_max],
    )?;
    if stray > 0 {
        return Err(WcprodError::integrity(
            project,
            IntegrityCheck::FileRange,
            format!(
                "{file} has {stray} files outside [{}, {}]",
                shard.config_range_min, shard.config_range_max
            ),
        ));
    }
    Ok(())
}

fn check_counters(conn: &Connection, record: &ProjectRecord, shard: &ShardRecord) -> WcprodResult<()> {
    let project = record.name.as_str();
    let config_units = count(
        conn,
        &format!(
            "SELECT COALESCE(SUM(unit_ctr), 0) FROM {};",
            schema::cfg_table(project, shard.table_id)
        ),
        [],
    )?;
    let file_units = count(
        conn,
        &format!(
            "SELECT COALESCE(SUM(units), 0) FROM {};",
            schema::file_table(project, shard.table_id)
        ),
        [],
    )?;
    if shard.unit_ctr != config_units || shard.unit_ctr != file_units {
        return Err(WcprodError::integrity(
            project,
            IntegrityCheck::Counters,
            format!(
                "shard {} counts {} units, configurations {config_units}, files {file_units}",
                shard.table_id, shard.unit_ctr
            ),
        ));
    }
    Ok(())
}

/// Audit `project` on an open connection.
pub(crate) fn check_project(conn: &Connection, project: &str) -> WcprodResult<()> {
    let record = check_project_row(conn, project)?;
    let geometry = check_geometry(conn, &record)?;
    let shards = check_shard_map(conn, &record)?;
    for shard in &shards {
        check_config_table(conn, &record, shard, &geometry)?;
        check_config_bounds(conn, &record, shard)?;
        check_file_table(conn, &record, shard)?;
        check_counters(conn, &record, shard)?;
        debug!(project, table_id = shard.table_id, "shard consistent");
    }
    Ok(())
}

impl ProductionStore {
    /// Verify the stored layout of `project`; the first broken invariant is
    /// returned as `ProjectIntegrity`.
    pub fn check_integrity(&self, project: &str) -> WcprodResult<()> {
        let conn = self.connect()?;
        check_project(&conn, project)
    }
}
