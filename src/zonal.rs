//! Zonal aggregation: fold a raster into per-region summary statistics.
//!
//! For every region the pass accumulates `(sum, count)` over the valid
//! pixels whose centers fall inside the region's polygon, then writes one
//! named field into the region's attribute record. Whole pixels only; no
//! partial-coverage weighting. A region without any covered valid pixel is
//! legitimate input: it receives `0.0` and a warning, never an error.

use std::collections::BTreeMap;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::warn;

use crate::error::RasterError;
use crate::raster::RasterHandle;
use crate::vector::RegionVector;

/// Aggregation kind for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Mean,
    Sum,
}

/// Running accumulator over the covered valid pixels of one region.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegionStats {
    pub sum: f64,
    pub count: u64,
}

impl RegionStats {
    fn merge(self, other: Self) -> Self {
        Self {
            sum: self.sum + other.sum,
            count: self.count + other.count,
        }
    }
}

/// Outcome of one aggregation pass: the per-region accumulators and the
/// keys of regions that had no covered valid pixels.
#[derive(Debug)]
pub struct AggregateOutcome {
    pub stats: BTreeMap<i64, RegionStats>,
    pub no_coverage: Vec<i64>,
}

/// Aggregate a raster into the vector, writing `field` on every region.
///
/// The raster is streamed block by block; blocks are folded in parallel
/// and merged. The vector itself is mutated on the calling thread only,
/// so concurrent passes over one vector are naturally serialized by the
/// `&mut` borrow.
pub fn aggregate(
    raster: &RasterHandle,
    vector: &mut RegionVector,
    field: &str,
    kind: AggKind,
) -> Result<AggregateOutcome, RasterError> {
    let meta = raster.meta().clone();

    let stats = raster
        .blocks()
        .par_iter()
        .try_fold(
            BTreeMap::<i64, RegionStats>::new,
            |mut acc, &window| -> Result<_, RasterError> {
                let tile = raster.read_block(window)?;

                for (i, (col, row)) in tile.window.positions().enumerate() {
                    if !tile.mask[i] {
                        continue;
                    }

                    let (x, y) = meta.cell_center(col, row);
                    for region in vector.regions() {
                        if region.contains(x, y) {
                            let entry = acc.entry(region.key).or_default();
                            entry.sum += tile.values[i];
                            entry.count += 1;
                            break;
                        }
                    }
                }

                Ok(acc)
            },
        )
        .try_reduce(BTreeMap::new, |mut a, b| {
            for (key, stats) in b {
                let entry = a.entry(key).or_default();
                *entry = entry.merge(stats);
            }
            Ok(a)
        })?;

    let mut no_coverage = vec![];
    let keys: Vec<i64> = vector.keys().collect();

    for key in keys {
        let stats = stats.get(&key).copied().unwrap_or_default();

        let value = match kind {
            AggKind::Sum => stats.sum,
            AggKind::Mean if stats.count > 0 => stats.sum / stats.count as f64,
            AggKind::Mean => 0.0,
        };

        if stats.count == 0 {
            warn!(region = key, field, "no coverage for region");
            no_coverage.push(key);
        }

        vector.set_field(key, field, value);
    }

    Ok(AggregateOutcome {
        stats,
        no_coverage,
    })
}
