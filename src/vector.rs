//! Built-in polygon vector container.
//!
//! Regions are polygon features with a stable integer key and a growing
//! map of named numeric attributes. The container is serialized with
//! ciborium. Geometry stays untouched for the whole lifetime of a vector;
//! aggregation passes only add fields.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::VectorError;

/// One polygon feature. Rings are closed implicitly (the last vertex
/// connects back to the first); holes are expressed through even-odd
/// winding over multiple rings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub key: i64,
    pub rings: Vec<Vec<(f64, f64)>>,
    pub attrs: BTreeMap<String, f64>,
}

impl Region {
    pub fn new(key: i64, rings: Vec<Vec<(f64, f64)>>) -> Self {
        Self {
            key,
            rings,
            attrs: BTreeMap::new(),
        }
    }

    /// Axis-aligned bounds over all rings, `None` for empty geometry.
    pub fn bbox(&self) -> Option<(f64, f64, f64, f64)> {
        let mut bounds: Option<(f64, f64, f64, f64)> = None;

        for &(x, y) in self.rings.iter().flatten() {
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }

        bounds
    }

    /// Even-odd point-in-polygon test with a bbox prefilter.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        match self.bbox() {
            Some((x0, y0, x1, y1)) if x >= x0 && x <= x1 && y >= y0 && y <= y1 => {}
            _ => return false,
        }

        let mut inside = false;
        for ring in &self.rings {
            if point_in_ring(ring, x, y) {
                inside = !inside;
            }
        }
        inside
    }
}

fn point_in_ring(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    let mut inside = false;
    let n = ring.len();

    for i in 0..n {
        let (x1, y1) = ring[i];
        let (x2, y2) = ring[(i + 1) % n];

        if (y1 > y) != (y2 > y) {
            let cross = (x2 - x1) * (y - y1) / (y2 - y1) + x1;
            if x < cross {
                inside = !inside;
            }
        }
    }

    inside
}

/// A set of polygon regions with unique integer keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionVector {
    regions: Vec<Region>,
}

impl RegionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region; its key must be unique within the vector.
    pub fn push(&mut self, region: Region) -> Result<(), VectorError> {
        if self.regions.iter().any(|r| r.key == region.key) {
            return Err(VectorError::DuplicateRegion(region.key));
        }
        self.regions.push(region);
        Ok(())
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.regions.iter().map(|r| r.key)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Set one named attribute on the region with the given key. Setting
    /// an existing field overwrites it; other fields and geometry are
    /// untouched.
    pub fn set_field(&mut self, key: i64, field: &str, value: f64) -> bool {
        match self.regions.iter_mut().find(|r| r.key == key) {
            Some(region) => {
                region.attrs.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub fn get_field(&self, key: i64, field: &str) -> Option<f64> {
        self.regions
            .iter()
            .find(|r| r.key == key)
            .and_then(|r| r.attrs.get(field))
            .copied()
    }

    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, VectorError> {
        let file = File::open(path.as_ref())?;
        Ok(ciborium::from_reader(BufReader::new(file))?)
    }

    pub fn save(&self, path: impl AsRef<Utf8Path>) -> Result<(), VectorError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        ciborium::into_writer(self, BufWriter::new(file))?;
        Ok(())
    }
}
