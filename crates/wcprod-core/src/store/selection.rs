//! Work selection: which configuration a worker should simulate next.
//!
//! Selection is advisory. Nothing is leased, so two workers may be handed
//! the same configuration; output naming keeps their files apart.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rusqlite::{params, Connection};
use tracing::debug;

use crate::errors::{WcprodError, WcprodResult};
use crate::models::{PointWork, ProjectRecord, VoxelWork, WorkItem};
use crate::store::database::{require_project, ProductionStore};
use crate::store::schema;

/// Per-call generator seeded from the wall clock and the process id.
fn fresh_rng() -> StdRng {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let pid = u64::from(std::process::id());
    StdRng::seed_from_u64(nanos ^ pid.rotate_left(32))
}

/// Unlocked shards not yet past their target, least produced first.
fn prioritized_shards(conn: &Connection, project: &str) -> WcprodResult<Vec<i64>> {
    let sql = format!(
        "SELECT table_id FROM {} \
         WHERE locked = 0 AND unit_ctr <= target_ctr \
         ORDER BY CAST(unit_ctr AS REAL) / target_ctr ASC, table_id ASC;",
        schema::map_table(project)
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn unlocked_shards(conn: &Connection, project: &str) -> WcprodResult<Vec<i64>> {
    let sql = format!(
        "SELECT table_id FROM {} WHERE locked = 0 ORDER BY table_id;",
        schema::map_table(project)
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Under-target configurations of one shard, truncated to `sample_size`
/// (0 = all).
fn candidates(
    conn: &Connection,
    record: &ProjectRecord,
    table_id: i64,
    prioritize: bool,
    sample_size: usize,
) -> WcprodResult<Vec<WorkItem>> {
    let voxel_mode = record.is_voxel_mode();
    let order = if prioritize {
        "ORDER BY unit_ctr ASC, config_id ASC"
    } else {
        ""
    };
    let limit = i64::try_from(sample_size)
        .ok()
        .filter(|n| *n > 0)
        .unwrap_or(-1);
    let sql = format!(
        "SELECT config_id, file_ctr, {} FROM {} WHERE unit_ctr < ?1 {order} LIMIT ?2;",
        schema::cfg_geometry_columns(voxel_mode),
        schema::cfg_table(&record.name, table_id)
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![record.num_photons, limit], |row| {
            let config_id: i64 = row.get(0)?;
            let file_ctr: i64 = row.get(1)?;
            if voxel_mode {
                Ok(WorkItem::Voxel(VoxelWork {
                    config_id,
                    table_id,
                    r0: row.get(2)?,
                    r1: row.get(3)?,
                    phi0: row.get(4)?,
                    phi1: row.get(5)?,
                    z0: row.get(6)?,
                    z1: row.get(7)?,
                    file_ctr,
                }))
            } else {
                Ok(WorkItem::Point(PointWork {
                    config_id,
                    table_id,
                    x: row.get(2)?,
                    y: row.get(3)?,
                    z: row.get(4)?,
                    theta: row.get(5)?,
                    phi: row.get(6)?,
                    file_ctr,
                }))
            }
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

impl ProductionStore {
    /// Pick a configuration that still needs units.
    ///
    /// With `prioritize` the unlocked shard with the smallest produced/target
    /// ratio is searched first and candidates are the least produced
    /// configurations in it. Without it unlocked shards are visited in
    /// random order. `CampaignComplete` when no unlocked shard has work left.
    pub fn select_work(
        &self,
        project: &str,
        prioritize: bool,
        sample_size: usize,
    ) -> WcprodResult<WorkItem> {
        let conn = self.connect()?;
        let record = require_project(&conn, project)?;
        let mut rng = fresh_rng();

        let shard_order = if prioritize {
            prioritized_shards(&conn, project)?
        } else {
            let mut ids = unlocked_shards(&conn, project)?;
            ids.shuffle(&mut rng);
            ids
        };

        for table_id in shard_order {
            let pool = candidates(&conn, &record, table_id, prioritize, sample_size)?;
            if pool.is_empty() {
                debug!(project, table_id, "shard has no configuration below target");
                continue;
            }
            let item = pool[rng.gen_range(0..pool.len())];
            debug!(
                project,
                table_id,
                config_id = item.config_id(),
                pool = pool.len(),
                "work selected"
            );
            return Ok(item);
        }

        Err(WcprodError::CampaignComplete(project.to_string()))
    }

    /// [`select_work`](Self::select_work) with the store's configured
    /// priority mode and sample size.
    pub fn select_default_work(&self, project: &str) -> WcprodResult<WorkItem> {
        self.select_work(project, self.config().prioritize, self.config().sample_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;
    use crate::config::StoreConfig;
    use crate::store::testutil::{complete_config, small_spec, test_store};

    /// 3-shard project with one direction band, cheap to fill up.
    fn coarse_store() -> (tempfile::TempDir, ProductionStore, Vec<crate::models::ShardRecord>) {
        let (dir, store) = test_store();
        let mut spec = small_spec("coarse");
        spec.num_photons = 10;
        spec.gap_angle = 180.0;
        let project = Project::generate(spec).unwrap();
        store
            .register_project(&project, project.num_configs().div_ceil(3))
            .unwrap();
        let shards = store.list_shards("coarse").unwrap();
        assert_eq!(shards.len(), 3);
        (dir, store, shards)
    }

    #[test]
    fn test_select_returns_point_work() {
        let (_dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();

        let item = store.select_work("demo", true, 10).unwrap();
        let WorkItem::Point(work) = item else {
            panic!("expected point work, got {item:?}");
        };
        assert_eq!(work.file_ctr, 0);
        let record = store.get_config("demo", work.config_id).unwrap().unwrap();
        assert_eq!(record.table_id, work.table_id);
        // Fresh project: every shard has ratio 0, ties go to shard 0.
        assert_eq!(work.table_id, 0);
    }

    #[test]
    fn test_select_voxel_work() {
        let (_dir, store) = test_store();
        let mut spec = small_spec("vox");
        spec.n_phi_start = 4;
        let project = Project::generate(spec).unwrap();
        store.register_project(&project, 10).unwrap();

        let item = store.select_work("vox", false, 0).unwrap();
        assert!(matches!(item, WorkItem::Voxel(_)));
    }

    #[test]
    fn test_locked_shards_never_chosen() {
        let (_dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();
        store.lock_shard("demo", Some(0)).unwrap();
        store.lock_shard("demo", Some(2)).unwrap();

        for prioritize in [true, false] {
            for _ in 0..25 {
                let item = store.select_work("demo", prioritize, 0).unwrap();
                assert_eq!(item.table_id(), 1);
            }
        }

        store.lock_shard("demo", None).unwrap();
        assert!(matches!(
            store.select_work("demo", true, 0),
            Err(WcprodError::CampaignComplete(_))
        ));
        assert!(matches!(
            store.select_work("demo", false, 0),
            Err(WcprodError::CampaignComplete(_))
        ));
    }

    #[test]
    fn test_prioritized_picks_smallest_ratio_shard() {
        let (dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();
        let shards = store.list_shards("demo").unwrap();

        // Shards 0 and 1 get some production, shard 2 stays empty.
        complete_config(&store, dir.path(), "demo", shards[0].config_range_min, 100);
        complete_config(&store, dir.path(), "demo", shards[1].config_range_min, 50);

        for _ in 0..20 {
            let item = store.select_work("demo", true, 5).unwrap();
            assert_eq!(item.table_id(), 2);
        }
    }

    #[test]
    fn test_prioritized_candidates_are_least_produced() {
        let (_dir, store) = test_store();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 10_000).unwrap();

        // Give every configuration except the last one some units.
        let n = project.num_configs() as i64;
        let conn = store.connect().unwrap();
        conn.execute(
            "UPDATE cfg_demo_0 SET unit_ctr = 1 WHERE config_id < ?1;",
            params![n - 1],
        )
        .unwrap();

        for _ in 0..10 {
            let item = store.select_work("demo", true, 1).unwrap();
            assert_eq!(item.config_id(), n - 1);
        }
    }

    #[test]
    fn test_campaign_complete_after_all_targets() {
        let (dir, store) = test_store();
        let mut spec = small_spec("tiny");
        spec.num_photons = 10;
        spec.gap_angle = 180.0;
        let project = Project::generate(spec).unwrap();
        store.register_project(&project, 20).unwrap();

        for config_id in 0..project.num_configs() as i64 {
            complete_config(&store, dir.path(), "tiny", config_id, 10);
        }
        assert!(store.progress("tiny").unwrap().is_complete());
        for prioritize in [true, false] {
            assert!(matches!(
                store.select_work("tiny", prioritize, 0),
                Err(WcprodError::CampaignComplete(p)) if p == "tiny"
            ));
        }
    }

    #[test]
    fn test_select_unknown_project() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.select_work("ghost", true, 0),
            Err(WcprodError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn test_overshot_shard_is_skipped() {
        let (dir, store, shards) = coarse_store();
        // One configuration alone pushes shard 0 past its target while the
        // rest of the shard is untouched.
        let overshoot = shards[0].target_ctr as u64 + 10;
        complete_config(&store, dir.path(), "coarse", shards[0].config_range_min, overshoot);

        for _ in 0..20 {
            assert_ne!(store.select_work("coarse", true, 0).unwrap().table_id(), 0);
        }

        store.lock_shard("coarse", Some(1)).unwrap();
        store.lock_shard("coarse", Some(2)).unwrap();
        assert!(matches!(
            store.select_work("coarse", true, 0),
            Err(WcprodError::CampaignComplete(_))
        ));
        // Random mode only looks at configurations.
        assert_eq!(store.select_work("coarse", false, 0).unwrap().table_id(), 0);
    }

    #[test]
    fn test_complete_shard_falls_through() {
        let (dir, store, shards) = coarse_store();
        for config_id in shards[0].config_range_min..=shards[0].config_range_max {
            complete_config(&store, dir.path(), "coarse", config_id, 10);
        }
        // Shard 1 reaches ratio 1 through a single configuration.
        let hog = shards[1].config_range_min;
        complete_config(&store, dir.path(), "coarse", hog, shards[1].target_ctr as u64);
        store.lock_shard("coarse", Some(2)).unwrap();

        let progress = store.list_shards("coarse").unwrap();
        assert_eq!(progress[0].unit_ctr, progress[0].target_ctr);
        assert_eq!(progress[1].unit_ctr, progress[1].target_ctr);

        for sample_size in [0, 1, 5] {
            let item = store.select_work("coarse", true, sample_size).unwrap();
            assert_eq!(item.table_id(), 1);
            assert_ne!(item.config_id(), hog);
        }
        store.check_integrity("coarse").unwrap();
    }

    #[test]
    fn test_zero_sample_size_takes_whole_shard() {
        let (dir, store, shards) = coarse_store();
        let size = (shards[0].config_range_max - shards[0].config_range_min + 1) as usize;
        let conn = store.connect().unwrap();
        let record = require_project(&conn, "coarse").unwrap();

        assert_eq!(candidates(&conn, &record, 0, true, 0).unwrap().len(), size);
        assert_eq!(candidates(&conn, &record, 0, false, 0).unwrap().len(), size);
        assert_eq!(candidates(&conn, &record, 0, true, 5).unwrap().len(), 5);

        complete_config(&store, dir.path(), "coarse", shards[0].config_range_min, 10);
        let pool = candidates(&conn, &record, 0, true, 0).unwrap();
        assert_eq!(pool.len(), size - 1);
        assert!(pool.iter().all(|item| item.config_id() != shards[0].config_range_min));
    }

    #[test]
    fn test_default_work_uses_store_config() {
        let (dir, _store) = test_store();
        let config = StoreConfig {
            prioritize: true,
            sample_size: 1,
            ..StoreConfig::default()
        };
        let store = ProductionStore::open_with_config(dir.path().join("tuned.db"), config).unwrap();
        let project = Project::generate(small_spec("demo")).unwrap();
        store.register_project(&project, 500).unwrap();

        // Prioritized with a pool of one: always the first configuration.
        for _ in 0..5 {
            assert_eq!(store.select_default_work("demo").unwrap().config_id(), 0);
        }
    }
}
