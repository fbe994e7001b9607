//! Coordinate generation for sampling campaigns.
//!
//! Pure functions that turn a cylinder description (radial/height bounds and
//! gap sizes) into the ordered list of configurations a project simulates.
//! Nothing here touches the database; the store consumes the output at
//! registration time.

use std::f64::consts::PI;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{WcprodError, WcprodResult};

// ---------------------------------------------------------------------------
// Geometric primitives
// ---------------------------------------------------------------------------

/// A sampling position in cartesian coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    /// Distance from the cylinder axis.
    pub fn radius(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// A sampling direction as (polar, azimuthal) angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    pub theta: f64,
    pub phi: f64,
}

/// An annular cell `[r0, r1] x [phi0, phi1] x [z0, z1]`, phi in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Voxel {
    pub r0: f64,
    pub r1: f64,
    pub phi0: f64,
    pub phi1: f64,
    pub z0: f64,
    pub z1: f64,
}

impl Voxel {
    pub fn volume(&self) -> f64 {
        (self.r1 * self.r1 - self.r0 * self.r0) * PI * ((self.phi1 - self.phi0) / 360.0)
            * (self.z1 - self.z0)
    }
}

/// One unit of work: a position/direction pair or a voxel, together with
/// the ids of the geometry rows it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Configuration {
    Point {
        position: Position,
        direction: Direction,
        pos_id: usize,
        dir_id: usize,
    },
    Voxel {
        voxel: Voxel,
        vox_id: usize,
    },
}

impl Configuration {
    /// Position id in point mode, voxel id in voxel mode.
    pub fn pos_id(&self) -> usize {
        match self {
            Configuration::Point { pos_id, .. } => *pos_id,
            Configuration::Voxel { vox_id, .. } => *vox_id,
        }
    }

    /// Direction id in point mode; always 0 for voxels.
    pub fn dir_id(&self) -> usize {
        match self {
            Configuration::Point { dir_id, .. } => *dir_id,
            Configuration::Voxel { .. } => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

/// Radial and height extent of the sampled cylinder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CylinderBounds {
    pub rmin: f64,
    pub rmax: f64,
    pub zmin: f64,
    pub zmax: f64,
}

impl CylinderBounds {
    pub fn validate(&self) -> WcprodResult<()> {
        let values = [self.rmin, self.rmax, self.zmin, self.zmax];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(WcprodError::InvalidGeometry(format!(
                "bounds must be finite (r: {} => {}, z: {} => {})",
                self.rmin, self.rmax, self.zmin, self.zmax
            )));
        }
        if self.rmin < 0.0 || self.rmax <= self.rmin {
            return Err(WcprodError::InvalidGeometry(format!(
                "rmin must be non-negative and rmax must be larger than rmin (got {} => {})",
                self.rmin, self.rmax
            )));
        }
        if self.zmax <= self.zmin {
            return Err(WcprodError::InvalidGeometry(format!(
                "zmax must be larger than zmin (got {} => {})",
                self.zmin, self.zmax
            )));
        }
        Ok(())
    }
}

fn validate_gap(name: &str, gap: f64) -> WcprodResult<()> {
    if !gap.is_finite() || gap <= 0.0 {
        return Err(WcprodError::InvalidGeometry(format!(
            "{name} must be a positive number (got {gap})"
        )));
    }
    Ok(())
}

/// Number of grid steps of size `gap` that fit in `span`, plus one.
fn grid_count(span: f64, gap: f64) -> usize {
    (span / gap).floor() as usize + 1
}

// ---------------------------------------------------------------------------
// Point mode
// ---------------------------------------------------------------------------

/// Fill the cylinder with positions on a roughly uniform grid.
///
/// Radii and heights are spaced by `gap` and centred inside their ranges.
/// Each ring gets as many equally spaced points as keep the arc length close
/// to `gap`; rings whose circumference is below `2 * gap` are skipped.
pub fn positions(bounds: &CylinderBounds, gap: f64) -> WcprodResult<Vec<Position>> {
    bounds.validate()?;
    validate_gap("gap_space", gap)?;

    let nz = grid_count(bounds.zmax - bounds.zmin, gap);
    let nr = grid_count(bounds.rmax - bounds.rmin, gap);
    let z_start = (bounds.zmax - bounds.zmin - (nz - 1) as f64 * gap) / 2.0 + bounds.zmin;
    let r_start = (bounds.rmax - bounds.rmin - (nr - 1) as f64 * gap) / 2.0 + bounds.rmin;

    let mut plane: Vec<(f64, f64)> = Vec::new();
    for i in 0..nr {
        let r = r_start + i as f64 * gap;
        let circumference = 2.0 * PI * r;
        if circumference < 2.0 * gap {
            continue;
        }
        let n = (circumference / gap).floor() as usize;
        let step = 2.0 * PI / n as f64;
        plane.extend((0..n).map(|k| (r, k as f64 * step)));
    }
    if plane.is_empty() {
        return Err(WcprodError::InvalidGeometry(format!(
            "no sampling positions fit in r: {} => {} with gap {gap}",
            bounds.rmin, bounds.rmax
        )));
    }

    let mut out = Vec::with_capacity(nz * plane.len());
    for i in 0..nz {
        let z = z_start + i as f64 * gap;
        out.extend(plane.iter().map(|&(r, phi)| Position {
            x: r * phi.cos(),
            y: r * phi.sin(),
            z,
        }));
    }
    Ok(out)
}

/// Uniform (theta, phi) grid with `gap_angle` degree spacing.
///
/// Ordered by phi first, then theta.
pub fn directions(gap_angle: f64) -> WcprodResult<Vec<Direction>> {
    validate_gap("gap_angle", gap_angle)?;
    if gap_angle > 180.0 {
        return Err(WcprodError::InvalidGeometry(format!(
            "gap_angle must not exceed 180 degrees (got {gap_angle})"
        )));
    }

    let nphi = (360.0 / gap_angle).floor() as usize;
    let ntheta = grid_count(180.0, gap_angle);
    let phi_start = (360.0 - gap_angle * nphi as f64) / 2.0;
    let theta_start = (180.0 - gap_angle * (ntheta - 1) as f64) / 2.0;

    let mut out = Vec::with_capacity(nphi * ntheta);
    for ip in 0..nphi {
        let phi = phi_start + ip as f64 * gap_angle;
        for it in 0..ntheta {
            out.push(Direction {
                theta: theta_start + it as f64 * gap_angle,
                phi,
            });
        }
    }
    Ok(out)
}

/// Cross product of positions and directions.
///
/// Directions form the outer loop, so configuration `k` uses direction
/// `k / positions.len()` and position `k % positions.len()`.
pub fn point_configurations(positions: &[Position], directions: &[Direction]) -> Vec<Configuration> {
    let n_pos = positions.len();
    (0..n_pos * directions.len())
        .into_par_iter()
        .map(|k| {
            let pos_id = k % n_pos;
            let dir_id = k / n_pos;
            Configuration::Point {
                position: positions[pos_id],
                direction: directions[dir_id],
                pos_id,
                dir_id,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Voxel mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ring {
    r0: f64,
    r1: f64,
    sectors: usize,
}

/// Split `[rmin, rmax]` into rings whose sectors all share one area.
///
/// The innermost ring `[rmin, rmin + gap]` is cut into `n_phi_start`
/// sectors, which fixes the sector area. Every following ring is roughly
/// `gap` wide with its sector count rounded to keep that area. The squared
/// radii are finally rescaled so the outermost ring ends exactly at `rmax`.
fn voxel_rings(rmin: f64, rmax: f64, gap: f64, n_phi_start: usize) -> Vec<Ring> {
    let rmin_sq = rmin * rmin;
    let rmax_sq = rmax * rmax;
    let first_outer = (rmin + gap).min(rmax);
    let area = PI * (first_outer * first_outer - rmin_sq) / n_phi_start as f64;

    let mut edges_sq = vec![rmin_sq, first_outer * first_outer];
    let mut sectors = vec![n_phi_start];
    while edges_sq[edges_sq.len() - 1] < rmax_sq {
        let outer_sq = edges_sq[edges_sq.len() - 1];
        let r = outer_sq.sqrt();
        let ring_area = PI * ((r + gap) * (r + gap) - outer_sq);
        let n = ((ring_area / area).round() as usize).max(1);
        edges_sq.push(outer_sq + n as f64 * area / PI);
        sectors.push(n);
    }

    if sectors.len() > 1 {
        let last = edges_sq[edges_sq.len() - 1];
        let prev = edges_sq[edges_sq.len() - 2];
        if last - rmax_sq > rmax_sq - prev {
            edges_sq.pop();
            sectors.pop();
        }
    }

    let outer_sq = edges_sq[edges_sq.len() - 1];
    let scale = (rmax_sq - rmin_sq) / (outer_sq - rmin_sq);
    let radius = |i: usize| -> f64 {
        if i == 0 {
            rmin
        } else if i == sectors.len() {
            rmax
        } else {
            (rmin_sq + (edges_sq[i] - rmin_sq) * scale)
                .sqrt()
                .clamp(rmin, rmax)
        }
    };

    sectors
        .iter()
        .enumerate()
        .map(|(i, &n)| Ring {
            r0: radius(i),
            r1: radius(i + 1),
            sectors: n,
        })
        .collect()
}

/// Cut the cylinder into approximately equal-volume annular voxels.
///
/// Ordered by height slab, then ring, then sector.
pub fn voxels(bounds: &CylinderBounds, gap: f64, n_phi_start: u32) -> WcprodResult<Vec<Voxel>> {
    bounds.validate()?;
    validate_gap("gap_space", gap)?;
    if n_phi_start == 0 {
        return Err(WcprodError::InvalidGeometry(
            "n_phi_start must be positive in voxel mode".to_string(),
        ));
    }

    let rings = voxel_rings(bounds.rmin, bounds.rmax, gap, n_phi_start as usize);
    let span = bounds.zmax - bounds.zmin;
    let nz = ((span / gap).round() as usize).max(1);
    let dz = span / nz as f64;
    let per_slab: usize = rings.iter().map(|ring| ring.sectors).sum();

    let mut out = Vec::with_capacity(nz * per_slab);
    for iz in 0..nz {
        let z0 = bounds.zmin + iz as f64 * dz;
        let z1 = if iz + 1 == nz {
            bounds.zmax
        } else {
            bounds.zmin + (iz + 1) as f64 * dz
        };
        for ring in &rings {
            let dphi = 360.0 / ring.sectors as f64;
            for k in 0..ring.sectors {
                let phi1 = if k + 1 == ring.sectors {
                    360.0
                } else {
                    (k + 1) as f64 * dphi
                };
                out.push(Voxel {
                    r0: ring.r0,
                    r1: ring.r1,
                    phi0: k as f64 * dphi,
                    phi1,
                    z0,
                    z1,
                });
            }
        }
    }
    Ok(out)
}

/// One configuration per voxel, in voxel order.
pub fn voxel_configurations(voxels: &[Voxel]) -> Vec<Configuration> {
    voxels
        .par_iter()
        .enumerate()
        .map(|(vox_id, voxel)| Configuration::Voxel {
            voxel: *voxel,
            vox_id,
        })
        .collect()
}
