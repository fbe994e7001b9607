//! Typed records read from and written to the production store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geometry::CylinderBounds;
use crate::project::ProjectSpec;

// ---------------------------------------------------------------------------
// 1. ProjectRecord
// ---------------------------------------------------------------------------

/// One row of the global `project` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub name: String,
    pub rmin: f64,
    pub rmax: f64,
    pub zmin: f64,
    pub zmax: f64,
    pub gap_space: f64,
    pub gap_angle: f64,
    pub n_phi_start: i64,
    pub num_config: i64,
    pub num_tables: i64,
    pub num_photons: i64,
}

impl ProjectRecord {
    pub fn is_voxel_mode(&self) -> bool {
        self.n_phi_start > 0
    }

    pub fn bounds(&self) -> CylinderBounds {
        CylinderBounds {
            rmin: self.rmin,
            rmax: self.rmax,
            zmin: self.zmin,
            zmax: self.zmax,
        }
    }

    pub fn spec(&self) -> ProjectSpec {
        ProjectSpec {
            project: self.name.clone(),
            rmin: self.rmin,
            rmax: self.rmax,
            zmin: self.zmin,
            zmax: self.zmax,
            gap_space: self.gap_space,
            gap_angle: self.gap_angle,
            n_phi_start: self.n_phi_start.max(0) as u32,
            num_photons: self.num_photons.max(0) as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// 2. ShardRecord
// ---------------------------------------------------------------------------

/// One row of a project's shard map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub table_id: i64,
    pub config_range_min: i64,
    pub config_range_max: i64,
    pub unit_ctr: i64,
    pub target_ctr: i64,
    pub locked: bool,
}

impl ShardRecord {
    pub fn entries(&self) -> i64 {
        self.config_range_max - self.config_range_min + 1
    }

    pub fn contains(&self, config_id: i64) -> bool {
        self.config_range_min <= config_id && config_id <= self.config_range_max
    }

    /// Produced units as a fraction of the target.
    pub fn ratio(&self) -> f64 {
        if self.target_ctr <= 0 {
            return 1.0;
        }
        self.unit_ctr as f64 / self.target_ctr as f64
    }
}

// ---------------------------------------------------------------------------
// 3. ConfigRecord
// ---------------------------------------------------------------------------

/// The geometric part of a configuration row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigGeometry {
    Point {
        x: f64,
        y: f64,
        z: f64,
        theta: f64,
        phi: f64,
    },
    Voxel {
        r0: f64,
        r1: f64,
        phi0: f64,
        phi1: f64,
        z0: f64,
        z1: f64,
    },
}

/// One configuration row together with its production counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub config_id: i64,
    pub table_id: i64,
    #[serde(flatten)]
    pub geometry: ConfigGeometry,
    pub pos_id: i64,
    pub dir_id: i64,
    pub file_ctr: i64,
    pub unit_ctr: i64,
    pub updated_at: Option<String>,
}

// ---------------------------------------------------------------------------
// 4. FileRecord
// ---------------------------------------------------------------------------

/// A registered output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: i64,
    pub table_id: i64,
    pub config_id: i64,
    pub file_path: String,
    pub units: i64,
    pub duration: f64,
    pub created_at: Option<String>,
}

/// Why a file registration was refused. These are expected outcomes in a
/// production loop, not store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    MissingFile,
    InvalidConfigId,
    DuplicatePath,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Rejection::MissingFile => "file does not exist",
            Rejection::InvalidConfigId => "config id does not exist",
            Rejection::DuplicatePath => "file already registered",
        };
        f.write_str(text)
    }
}

/// Outcome of `register_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Registration {
    Registered { table_id: i64, file_id: i64 },
    Rejected { reason: Rejection },
}

impl Registration {
    pub fn is_registered(&self) -> bool {
        matches!(self, Registration::Registered { .. })
    }
}

// ---------------------------------------------------------------------------
// 5. WorkItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointWork {
    pub config_id: i64,
    pub table_id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub theta: f64,
    pub phi: f64,
    pub file_ctr: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoxelWork {
    pub config_id: i64,
    pub table_id: i64,
    pub r0: f64,
    pub r1: f64,
    pub phi0: f64,
    pub phi1: f64,
    pub z0: f64,
    pub z1: f64,
    pub file_ctr: i64,
}

/// A configuration handed out by work selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkItem {
    Point(PointWork),
    Voxel(VoxelWork),
}

impl WorkItem {
    pub fn config_id(&self) -> i64 {
        match self {
            WorkItem::Point(w) => w.config_id,
            WorkItem::Voxel(w) => w.config_id,
        }
    }

    pub fn table_id(&self) -> i64 {
        match self {
            WorkItem::Point(w) => w.table_id,
            WorkItem::Voxel(w) => w.table_id,
        }
    }

    pub fn file_ctr(&self) -> i64 {
        match self {
            WorkItem::Point(w) => w.file_ctr,
            WorkItem::Voxel(w) => w.file_ctr,
        }
    }
}

// ---------------------------------------------------------------------------
// 6. Progress
// ---------------------------------------------------------------------------

/// Production state of one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardProgress {
    #[serde(flatten)]
    pub shard: ShardRecord,
    /// Configurations that reached the per-configuration target.
    pub complete_configs: i64,
}

/// Production state of a whole project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionProgress {
    pub project: String,
    pub num_config: i64,
    pub complete_configs: i64,
    pub unit_ctr: i64,
    pub target_ctr: i64,
    pub locked_shards: i64,
    pub shards: Vec<ShardProgress>,
}

impl ProductionProgress {
    pub fn is_complete(&self) -> bool {
        self.complete_configs >= self.num_config
    }
}
