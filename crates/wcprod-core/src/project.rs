//! Project descriptors: the input a campaign is registered from, and the
//! generated geometry that goes with it.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{WcprodError, WcprodResult};
use crate::geometry::{self, Configuration, CylinderBounds, Direction, Position, Voxel};

static PROJECT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

/// Check that a project name can be embedded in table names.
pub fn validate_project_name(name: &str) -> WcprodResult<()> {
    if PROJECT_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(WcprodError::InvalidProjectName(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ProjectSpec
// ---------------------------------------------------------------------------

/// Geometric and production parameters of a campaign, as written in a
/// project YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSpec {
    pub project: String,
    pub rmin: f64,
    pub rmax: f64,
    pub zmin: f64,
    pub zmax: f64,
    pub gap_space: f64,
    pub gap_angle: f64,
    /// Azimuthal sector count of the innermost voxel ring; 0 selects
    /// point/direction sampling.
    #[serde(default)]
    pub n_phi_start: u32,
    /// Target number of units (photons) per configuration.
    pub num_photons: u64,
}

impl ProjectSpec {
    /// Parse a YAML document.
    pub fn from_yaml_str(text: &str) -> WcprodResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a YAML project file.
    pub fn from_yaml_file(path: &Path) -> WcprodResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn bounds(&self) -> CylinderBounds {
        CylinderBounds {
            rmin: self.rmin,
            rmax: self.rmax,
            zmin: self.zmin,
            zmax: self.zmax,
        }
    }

    pub fn is_voxel_mode(&self) -> bool {
        self.n_phi_start > 0
    }

    pub fn validate(&self) -> WcprodResult<()> {
        validate_project_name(&self.project)?;
        self.bounds().validate()?;
        if !(self.gap_space.is_finite() && self.gap_space > 0.0) {
            return Err(WcprodError::InvalidGeometry(format!(
                "gap_space must be positive (got {})",
                self.gap_space
            )));
        }
        if !(self.gap_angle.is_finite() && self.gap_angle > 0.0) {
            return Err(WcprodError::InvalidGeometry(format!(
                "gap_angle must be positive (got {})",
                self.gap_angle
            )));
        }
        if self.num_photons == 0 || i64::try_from(self.num_photons).is_err() {
            return Err(WcprodError::InvalidArgument(format!(
                "num_photons must be a positive 64-bit integer (got {})",
                self.num_photons
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A project with its generated sampling geometry.
///
/// In point mode `positions` and `directions` are filled and `voxels` is
/// empty; in voxel mode only `voxels` is filled.
#[derive(Debug, Clone)]
pub struct Project {
    pub spec: ProjectSpec,
    pub positions: Vec<Position>,
    pub directions: Vec<Direction>,
    pub voxels: Vec<Voxel>,
    pub configs: Vec<Configuration>,
}

impl Project {
    /// Validate `spec` and run the coordinate generator for it.
    pub fn generate(spec: ProjectSpec) -> WcprodResult<Self> {
        spec.validate()?;
        let bounds = spec.bounds();
        if spec.is_voxel_mode() {
            let voxels = geometry::voxels(&bounds, spec.gap_space, spec.n_phi_start)?;
            let configs = geometry::voxel_configurations(&voxels);
            Ok(Self {
                spec,
                positions: Vec::new(),
                directions: Vec::new(),
                voxels,
                configs,
            })
        } else {
            let positions = geometry::positions(&bounds, spec.gap_space)?;
            let directions = geometry::directions(spec.gap_angle)?;
            let configs = geometry::point_configurations(&positions, &directions);
            Ok(Self {
                spec,
                positions,
                directions,
                voxels: Vec::new(),
                configs,
            })
        }
    }

    /// Rebuild a project from geometry read back out of the store.
    pub fn from_parts(
        spec: ProjectSpec,
        positions: Vec<Position>,
        directions: Vec<Direction>,
        voxels: Vec<Voxel>,
    ) -> Self {
        let configs = if spec.is_voxel_mode() {
            geometry::voxel_configurations(&voxels)
        } else {
            geometry::point_configurations(&positions, &directions)
        };
        Self {
            spec,
            positions,
            directions,
            voxels,
            configs,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.project
    }

    pub fn num_configs(&self) -> usize {
        self.configs.len()
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.spec;
        writeln!(f, "Project name: {}", s.project)?;
        writeln!(f, "Cylinder geometry")?;
        writeln!(f, "  R: {} => {}", s.rmin, s.rmax)?;
        writeln!(f, "  Z: {} => {}", s.zmin, s.zmax)?;
        writeln!(f, "Gap space: {}", s.gap_space)?;
        writeln!(f, "Gap angle: {}", s.gap_angle)?;
        if s.is_voxel_mode() {
            writeln!(f, "Initial phi sectors: {}", s.n_phi_start)?;
            writeln!(f, "Sampling voxels: {}", self.voxels.len())?;
        } else {
            writeln!(f, "Sampling points: {}", self.positions.len())?;
            writeln!(f, "Sampling directions: {}", self.directions.len())?;
        }
        writeln!(f, "Sampling configs: {}", self.configs.len())?;
        write!(f, "Photons per config: {}", s.num_photons)
    }
}
