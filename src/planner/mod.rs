//! Adaptive tile planner.
//!
//! Splits an area of interest into rectangular cells of a projected CRS so
//! that every emitted tile fits the pixel, vertex and physical-size budgets
//! in [`PlanningConstraints`]. Cells start on a regular grid and are bisected
//! along their longer axis until they pass.

mod aoi;

pub use aoi::{AoiError, AoiSource, AreaOfInterest};

use geo::{BoundingRect, CoordsIter, MultiPolygon, Rect, coord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::geometry::{self, GeometryError, WGS84};

/// Slack applied before ceiling divisions so that a cell whose extent is an
/// exact multiple of the resolution does not pick up an extra pixel from
/// floating-point noise.
const PIXEL_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("invalid planning constraints: {0}")]
    InvalidConstraints(String),

    #[error("constraints not satisfiable after {iterations} iterations ({accepted} tiles accepted)")]
    ConstraintUnsatisfiable { iterations: usize, accepted: usize },

    #[error("area of interest is empty")]
    EmptyAoi,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanningConstraints {
    pub max_pixels_per_side: u64,
    /// 0 selects bbox-only mode
    pub max_vertex_count: usize,
    pub max_tile_side_meters: f64,
    pub ground_resolution_meters: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_max_iterations() -> usize {
    100_000
}

impl PlanningConstraints {
    pub fn new(
        max_pixels_per_side: u64,
        max_vertex_count: usize,
        max_tile_side_meters: f64,
        ground_resolution_meters: f64,
    ) -> Self {
        Self {
            max_pixels_per_side,
            max_vertex_count,
            max_tile_side_meters,
            ground_resolution_meters,
            max_iterations: default_max_iterations(),
        }
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let fail = |msg: &str| Err(PlanError::InvalidConstraints(msg.to_string()));
        if !(self.ground_resolution_meters.is_finite() && self.ground_resolution_meters > 0.0) {
            return fail("ground_resolution_meters must be a positive number");
        }
        if !(self.max_tile_side_meters.is_finite() && self.max_tile_side_meters > 0.0) {
            return fail("max_tile_side_meters must be a positive number");
        }
        if self.max_pixels_per_side == 0 {
            return fail("max_pixels_per_side must be greater than 0");
        }
        if self.max_iterations == 0 {
            return fail("max_iterations must be greater than 0");
        }
        Ok(())
    }

    fn bbox_only(&self) -> bool {
        self.max_vertex_count == 0
    }
}

/// One accepted processing cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    /// `[min_x, min_y, max_x, max_y]` in `bbox_crs`
    pub bbox: [f64; 4],
    pub bbox_crs: String,
    pub width_px: u64,
    pub height_px: u64,
    pub clip_geometry: MultiPolygon<f64>,
}

impl Tile {
    pub fn rect(&self) -> Rect<f64> {
        let [min_x, min_y, max_x, max_y] = self.bbox;
        Rect::new(coord! { x: min_x, y: min_y }, coord! { x: max_x, y: max_y })
    }

    pub fn vertex_count(&self) -> usize {
        self.clip_geometry.coords_count()
    }
}

/// Plan tiles for a WGS84 AOI in `target_crs`.
pub fn plan(
    aoi: &AreaOfInterest,
    target_crs: &str,
    constraints: &PlanningConstraints,
) -> Result<Vec<Tile>, PlanError> {
    constraints.validate()?;
    let projected = geometry::reproject_multipolygon(aoi.geometry(), WGS84, target_crs)?;
    plan_projected(&projected, target_crs, constraints)
}

/// Plan tiles for an AOI already expressed in `crs`.
pub fn plan_projected(
    aoi: &MultiPolygon<f64>,
    crs: &str,
    constraints: &PlanningConstraints,
) -> Result<Vec<Tile>, PlanError> {
    constraints.validate()?;
    let bounds = aoi.bounding_rect().ok_or(PlanError::EmptyAoi)?;

    let Some((nx, ny)) = grid_shape(&bounds, constraints) else {
        return Err(PlanError::ConstraintUnsatisfiable {
            iterations: 0,
            accepted: 0,
        });
    };
    let mut queue = initial_grid(&bounds, constraints.max_tile_side_meters, nx, ny);
    debug!(
        crs,
        cells = queue.len(),
        side = constraints.max_tile_side_meters,
        "Seeded planning grid"
    );

    let mut tiles = Vec::new();
    let mut iterations = 0usize;
    let mut splits = 0usize;

    while let Some(cell) = queue.pop() {
        iterations += 1;
        if iterations > constraints.max_iterations {
            return Err(PlanError::ConstraintUnsatisfiable {
                iterations: constraints.max_iterations,
                accepted: tiles.len(),
            });
        }

        let clip = geometry::clip_to_rect(aoi, &cell);
        if clip.0.is_empty() {
            continue;
        }

        let width_px = pixels(cell.width(), constraints.ground_resolution_meters);
        let height_px = pixels(cell.height(), constraints.ground_resolution_meters);

        if accepts(constraints, &cell, &clip, width_px, height_px) {
            tiles.push(Tile {
                bbox: [cell.min().x, cell.min().y, cell.max().x, cell.max().y],
                bbox_crs: crs.to_string(),
                width_px,
                height_px,
                clip_geometry: clip,
            });
        } else {
            let (a, b) = bisect(&cell);
            queue.push(a);
            queue.push(b);
            splits += 1;
        }
    }

    if tiles.is_empty() {
        return Err(PlanError::EmptyAoi);
    }

    info!(crs, tiles = tiles.len(), splits, iterations, "Planned tiles");
    Ok(tiles)
}

fn pixels(extent: f64, resolution: f64) -> u64 {
    ((extent / resolution) - PIXEL_EPSILON).ceil().max(1.0) as u64
}

fn fits_side(extent: f64, max_side: f64) -> bool {
    extent <= max_side * (1.0 + 1e-9)
}

fn accepts(
    constraints: &PlanningConstraints,
    cell: &Rect<f64>,
    clip: &MultiPolygon<f64>,
    width_px: u64,
    height_px: u64,
) -> bool {
    let pixels_ok =
        width_px <= constraints.max_pixels_per_side && height_px <= constraints.max_pixels_per_side;
    if constraints.bbox_only() {
        return pixels_ok;
    }

    pixels_ok
        && clip.coords_count() <= constraints.max_vertex_count
        && fits_side(cell.width(), constraints.max_tile_side_meters)
        && fits_side(cell.height(), constraints.max_tile_side_meters)
}

/// Seed grid dimensions, or `None` when the grid alone would need more cells
/// than `max_iterations` allows to visit.
fn grid_shape(bounds: &Rect<f64>, constraints: &PlanningConstraints) -> Option<(usize, usize)> {
    let limit = constraints.max_iterations;
    let count = |extent: f64| {
        let n = ((extent / constraints.max_tile_side_meters) - PIXEL_EPSILON)
            .ceil()
            .max(1.0);
        (n.is_finite() && n <= limit as f64).then_some(n as usize)
    };
    let nx = count(bounds.width())?;
    let ny = count(bounds.height())?;
    nx.checked_mul(ny)
        .filter(|cells| *cells <= limit)
        .map(|_| (nx, ny))
}

/// Square cells of side `side` anchored at the min corner, clipped to the
/// bounds on the max edges.
fn initial_grid(bounds: &Rect<f64>, side: f64, nx: usize, ny: usize) -> Vec<Rect<f64>> {
    let (min, max) = (bounds.min(), bounds.max());

    let edge = |origin: f64, i: usize, n: usize, limit: f64| {
        if i + 1 == n {
            limit
        } else {
            (origin + (i + 1) as f64 * side).min(limit)
        }
    };

    let mut cells = Vec::with_capacity(nx * ny);
    for ix in 0..nx {
        let x0 = min.x + ix as f64 * side;
        let x1 = edge(min.x, ix, nx, max.x);
        for iy in 0..ny {
            let y0 = min.y + iy as f64 * side;
            let y1 = edge(min.y, iy, ny, max.y);
            cells.push(Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 }));
        }
    }
    cells
}

/// Halve along the longer axis; ties split x.
fn bisect(cell: &Rect<f64>) -> (Rect<f64>, Rect<f64>) {
    let (min, max) = (cell.min(), cell.max());
    if cell.width() >= cell.height() {
        let mid = min.x + cell.width() / 2.0;
        (
            Rect::new(min, coord! { x: mid, y: max.y }),
            Rect::new(coord! { x: mid, y: min.y }, max),
        )
    } else {
        let mid = min.y + cell.height() / 2.0;
        (
            Rect::new(min, coord! { x: max.x, y: mid }),
            Rect::new(coord! { x: min.x, y: mid }, max),
        )
    }
}
