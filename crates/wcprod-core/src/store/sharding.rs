//! Shard layout: partitioning at registration, lookup by configuration id,
//! lock flags, and progress reporting.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::errors::{WcprodError, WcprodResult};
use crate::models::{ProductionProgress, ShardProgress, ShardRecord};
use crate::store::database::{require_project, ProductionStore};
use crate::store::schema;

/// A contiguous configuration id range assigned to one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRange {
    pub table_id: i64,
    pub config_range_min: i64,
    pub config_range_max: i64,
}

impl ShardRange {
    pub fn entries(&self) -> i64 {
        self.config_range_max - self.config_range_min + 1
    }
}

/// Split `[0, num_configs)` into `ceil(num_configs / max_entries)` ranges
/// whose sizes differ by at most one. The larger ranges come last, so no
/// range exceeds `max_entries`.
pub fn partition(num_configs: usize, max_entries: usize) -> WcprodResult<Vec<ShardRange>> {
    if max_entries == 0 {
        return Err(WcprodError::InvalidArgument(
            "max_entries_per_shard must be positive".to_string(),
        ));
    }
    if num_configs == 0 {
        return Err(WcprodError::InvalidArgument(
            "cannot partition zero configurations".to_string(),
        ));
    }
    if i64::try_from(num_configs).is_err() {
        return Err(WcprodError::InvalidArgument(format!(
            "too many configurations: {num_configs}"
        )));
    }

    let shards = num_configs.div_ceil(max_entries);
    let base = num_configs / shards;
    let extra = num_configs % shards;

    let mut ranges = Vec::with_capacity(shards);
    let mut next = 0usize;
    for table_id in 0..shards {
        let size = if table_id >= shards - extra { base + 1 } else { base };
        ranges.push(ShardRange {
            table_id: table_id as i64,
            config_range_min: next as i64,
            config_range_max: (next + size - 1) as i64,
        });
        next += size;
    }
    Ok(ranges)
}

/// Table id of the shard owning `config_id`, if any.
pub(crate) fn find_shard(
    conn: &Connection,
    project: &str,
    config_id: i64,
) -> WcprodResult<Option<i64>> {
    let sql = format!(
        "SELECT table_id, config_range_max FROM {} \
         WHERE config_range_min <= ?1 ORDER BY config_range_min DESC LIMIT 1;",
        schema::map_table(project)
    );
    let found: Option<(i64, i64)> = conn
        .query_row(&sql, params![config_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;
    Ok(found.and_then(|(table_id, max)| (config_id <= max).then_some(table_id)))
}

/// All shard map rows ordered by table id.
pub(crate) fn read_shards(conn: &Connection, project: &str) -> WcprodResult<Vec<ShardRecord>> {
    let sql = format!(
        "SELECT table_id, config_range_min, config_range_max, unit_ctr, target_ctr, locked \
         FROM {} ORDER BY table_id;",
        schema::map_table(project)
    );
    let mut stmt = conn.prepare(&sql)?;
    let shards = stmt
        .query_map([], |row| {
            Ok(ShardRecord {
                table_id: row.get(0)?,
                config_range_min: row.get(1)?,
                config_range_max: row.get(2)?,
                unit_ctr: row.get(3)?,
                target_ctr: row.get(4)?,
                locked: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(shards)
}

impl ProductionStore {
    pub fn list_shards(&self, project: &str) -> WcprodResult<Vec<ShardRecord>> {
        let conn = self.connect()?;
        require_project(&conn, project)?;
        read_shards(&conn, project)
    }

    /// Number of shards of a project.
    pub fn table_count(&self, project: &str) -> WcprodResult<i64> {
        let conn = self.connect()?;
        Ok(require_project(&conn, project)?.num_tables)
    }

    /// Shard owning `config_id`; `InvalidConfigId` when none does.
    pub fn table_id(&self, project: &str, config_id: i64) -> WcprodResult<i64> {
        let conn = self.connect()?;
        require_project(&conn, project)?;
        find_shard(&conn, project, config_id)?.ok_or_else(|| WcprodError::InvalidConfigId {
            project: project.to_string(),
            config_id,
        })
    }

    /// Exclude one shard (or all with `None`) from work selection. Returns
    /// the number of shards touched.
    pub fn lock_shard(&self, project: &str, table_id: Option<i64>) -> WcprodResult<usize> {
        self.set_locked(project, table_id, true)
    }

    pub fn unlock_shard(&self, project: &str, table_id: Option<i64>) -> WcprodResult<usize> {
        self.set_locked(project, table_id, false)
    }

    fn set_locked(&self, project: &str, table_id: Option<i64>, locked: bool) -> WcprodResult<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_project(&tx, project)?;
        let map = schema::map_table(project);
        let touched = match table_id {
            Some(id) => tx.execute(
                &format!("UPDATE {map} SET locked = ?1 WHERE table_id = ?2;"),
                params![locked, id],
            )?,
            None => tx.execute(&format!("UPDATE {map} SET locked = ?1;"), params![locked])?,
        };
        if let (Some(id), 0) = (table_id, touched) {
            return Err(WcprodError::InvalidArgument(format!(
                "project '{project}' has no shard {id}"
            )));
        }
        tx.commit()?;
        info!(project, table_id, locked, shards = touched, "shard lock changed");
        Ok(touched)
    }

    /// Produced and target units per shard plus project totals.
    pub fn progress(&self, project: &str) -> WcprodResult<ProductionProgress> {
        let conn = self.connect()?;
        let record = require_project(&conn, project)?;
        let mut shards = Vec::new();
        for shard in read_shards(&conn, project)? {
            let complete_configs: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE unit_ctr >= ?1;",
                    schema::cfg_table(project, shard.table_id)
                ),
                params![record.num_photons],
                |row| row.get(0),
            )?;
            debug!(
                project,
                table_id = shard.table_id,
                ratio = shard.ratio(),
                complete_configs,
                "shard progress"
            );
            shards.push(ShardProgress {
                shard,
                complete_configs,
            });
        }

        Ok(ProductionProgress {
            project: record.name,
            num_config: record.num_config,
            complete_configs: shards.iter().map(|s| s.complete_configs).sum(),
            unit_ctr: shards.iter().map(|s| s.shard.unit_ctr).sum(),
            target_ctr: shards.iter().map(|s| s.shard.target_ctr).sum(),
            locked_shards: shards.iter().filter(|s| s.shard.locked).count() as i64,
            shards,
        })
    }
}
