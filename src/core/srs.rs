//! Spatial reference systems and coordinate transformation.
//!
//! Reprojection math is delegated to `proj4rs`. SRS identifiers are either
//! `EPSG:<code>` strings for the codes listed in [`proj_string`], or raw
//! `+proj=...` definitions.

use crate::core::error::{ChunkError, ChunkResult};
use crate::core::view::SpatialExtent;
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use std::fmt;

/// Parse the EPSG code of an `EPSG:<code>` identifier.
pub fn epsg_code(srs: &str) -> Option<u32> {
    let trimmed = srs.trim();
    let (authority, code) = trimmed.split_once(':')?;
    if !authority.eq_ignore_ascii_case("epsg") {
        return None;
    }
    code.trim().parse().ok()
}

/// Whether two SRS identifiers denote the same system.
pub fn same_srs(a: &str, b: &str) -> bool {
    match (epsg_code(a), epsg_code(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.trim() == b.trim(),
    }
}

/// proj definition of a supported EPSG code.
pub fn proj_string(code: u32) -> Option<String> {
    let def = match code {
        4326 => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
        4258 => "+proj=longlat +ellps=GRS80 +no_defs".to_string(),
        3857 => "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +nadgrids=@null +no_defs".to_string(),
        3035 => "+proj=laea +lat_0=52 +lon_0=10 +x_0=4321000 +y_0=3210000 +ellps=GRS80 +units=m +no_defs".to_string(),
        32601..=32660 => format!(
            "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
            code - 32600
        ),
        32701..=32760 => format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            code - 32700
        ),
        25828..=25838 => format!(
            "+proj=utm +zone={} +ellps=GRS80 +units=m +no_defs",
            code - 25800
        ),
        _ => return None,
    };
    Some(def)
}

fn is_geographic(definition: &str) -> bool {
    definition.contains("+proj=longlat") || definition.contains("+proj=latlong")
}

/// Whether `srs` has geographic (longitude/latitude) coordinates.
/// Unsupported identifiers count as projected.
pub fn is_geographic_srs(srs: &str) -> bool {
    resolve(srs).map(|def| is_geographic(&def)).unwrap_or(false)
}

fn resolve(srs: &str) -> ChunkResult<String> {
    if srs.trim_start().starts_with("+proj") {
        return Ok(srs.trim().to_string());
    }
    epsg_code(srs)
        .and_then(proj_string)
        .ok_or_else(|| ChunkError::Reprojection(format!("unsupported SRS '{}'", srs)))
}

struct Projection {
    source: Proj,
    target: Proj,
    source_geographic: bool,
    target_geographic: bool,
}

/// Transforms points between two SRS; identity when both are equal.
pub struct CoordTransformer {
    source: String,
    target: String,
    projection: Option<Projection>,
}

impl fmt::Debug for CoordTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordTransformer")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("identity", &self.is_identity())
            .finish()
    }
}

impl CoordTransformer {
    /// Create a transformer from `source` to `target`.
    pub fn new(source: &str, target: &str) -> ChunkResult<Self> {
        let projection = if same_srs(source, target) {
            None
        } else {
            let source_def = resolve(source)?;
            let target_def = resolve(target)?;
            let parse = |def: &str| {
                Proj::from_proj_string(def)
                    .map_err(|e| ChunkError::Reprojection(format!("invalid projection '{}': {:?}", def, e)))
            };
            Some(Projection {
                source: parse(&source_def)?,
                target: parse(&target_def)?,
                source_geographic: is_geographic(&source_def),
                target_geographic: is_geographic(&target_def),
            })
        };
        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            projection,
        })
    }

    /// Whether this transformer leaves coordinates unchanged.
    pub fn is_identity(&self) -> bool {
        self.projection.is_none()
    }

    /// Bounding box of `extent` after transformation, sampled at corners and edge midpoints.
    pub fn transform_extent(&self, extent: &SpatialExtent) -> ChunkResult<SpatialExtent> {
        if self.is_identity() {
            return Ok(*extent);
        }
        let mid_x = (extent.left + extent.right) / 2.0;
        let mid_y = (extent.bottom + extent.top) / 2.0;
        let samples = [
            (extent.left, extent.bottom),
            (extent.right, extent.bottom),
            (extent.right, extent.top),
            (extent.left, extent.top),
            (mid_x, extent.bottom),
            (mid_x, extent.top),
            (extent.left, mid_y),
            (extent.right, mid_y),
        ];
        let mut out = SpatialExtent::new(f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
        for (x, y) in samples {
            let (tx, ty) = self.transform(x, y)?;
            out.left = out.left.min(tx);
            out.right = out.right.max(tx);
            out.bottom = out.bottom.min(ty);
            out.top = out.top.max(ty);
        }
        Ok(out)
    }

    /// Transform one point.
    #[inline]
    pub fn transform(&self, x: f64, y: f64) -> ChunkResult<(f64, f64)> {
        let Some(p) = &self.projection else {
            return Ok((x, y));
        };
        let mut point = if p.source_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(&p.source, &p.target, &mut point)
            .map_err(|e| ChunkError::Reprojection(format!("({}, {}): {:?}", x, y, e)))?;
        if p.target_geographic {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }
}
