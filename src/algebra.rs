//! Nodata-aware pixel algebra over aligned rasters.
//!
//! Every operator here streams block by block: read the input tiles, AND
//! their validity masks, fill the output with nodata, compute only over
//! the valid positions, write the block once. A user function is never
//! invoked with an invalid operand, so nodata can never contaminate a
//! result through NaN or overflow. Independent blocks of one output are
//! dispatched in parallel across the rayon pool; each block owns a
//! disjoint byte range of the output file.

use std::collections::BTreeMap;

use camino::Utf8Path;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::error::{AlgebraError, LookupError};
use crate::lookup::{SoilGroup, SoilLookup};
use crate::raster::{GridMeta, RasterHandle, ensure_aligned};

/// One input to a pixel operation: a raster band masked by its nodata
/// value, or a raw constant that is valid everywhere.
#[derive(Debug, Clone)]
pub enum Operand {
    Raster(RasterHandle),
    Constant(f64),
}

impl From<&RasterHandle> for Operand {
    fn from(raster: &RasterHandle) -> Self {
        Operand::Raster(raster.clone())
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Constant(value)
    }
}

/// How a reclassification treats a category code present in the raster
/// but absent from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclassifyMode {
    /// Leave the pixel as nodata.
    #[default]
    Lenient,
    /// Fail the operation with [`LookupError::UnknownCode`].
    Strict,
}

/// Apply a pure elementwise function over aligned operands, producing a
/// raster at `out_path` with nodata `out_nodata`. `f` receives one value
/// per operand, in declaration order, and only for pixels where every
/// raster operand is valid.
pub fn raster_calculator<F>(
    operands: &[Operand],
    f: F,
    out_path: impl AsRef<Utf8Path>,
    out_nodata: f64,
) -> Result<RasterHandle, AlgebraError>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    let rasters: Vec<&RasterHandle> = operands
        .iter()
        .filter_map(|op| match op {
            Operand::Raster(raster) => Some(raster),
            Operand::Constant(_) => None,
        })
        .collect();

    let reference = *rasters.first().ok_or(AlgebraError::NoRasterInput)?;
    ensure_aligned(&rasters)?;

    let meta = GridMeta {
        nodata: Some(out_nodata),
        ..reference.meta().clone()
    };
    let output = RasterHandle::create(out_path, meta)?;

    output
        .blocks()
        .par_iter()
        .try_for_each(|&window| -> Result<(), AlgebraError> {
            let tiles = rasters
                .iter()
                .map(|raster| raster.read_block(window))
                .collect::<Result<Vec<_>, _>>()?;

            let mut out = vec![out_nodata; window.len()];
            let mut args = vec![0.0; operands.len()];

            'pixel: for i in 0..window.len() {
                let mut tile_iter = tiles.iter();
                for (slot, operand) in operands.iter().enumerate() {
                    match operand {
                        Operand::Raster(_) => {
                            let tile = tile_iter.next().unwrap();
                            if !tile.mask[i] {
                                continue 'pixel;
                            }
                            args[slot] = tile.values[i];
                        }
                        Operand::Constant(value) => args[slot] = *value,
                    }
                }
                out[i] = f(&args);
            }

            output.write_block(window, &out)?;
            Ok(())
        })?;

    Ok(output)
}

/// Map category codes to values through a flat table, block by block.
///
/// The inner loop is a mask-per-code select over whole blocks rather than
/// a per-pixel table lookup. Codes absent from the table leave nodata in
/// [`Lenient`](ReclassifyMode::Lenient) mode and fail the operation in
/// [`Strict`](ReclassifyMode::Strict) mode.
pub fn reclassify(
    raster: &RasterHandle,
    table: &BTreeMap<i64, f64>,
    out_path: impl AsRef<Utf8Path>,
    out_nodata: f64,
    mode: ReclassifyMode,
) -> Result<RasterHandle, AlgebraError> {
    let meta = GridMeta {
        nodata: Some(out_nodata),
        ..raster.meta().clone()
    };
    let output = RasterHandle::create(out_path, meta)?;

    output
        .blocks()
        .par_iter()
        .try_for_each(|&window| -> Result<(), AlgebraError> {
            let tile = raster.read_block(window)?;
            let mut out = vec![out_nodata; window.len()];
            let mut hit = vec![false; window.len()];

            for (&code, &value) in table {
                let code = code as f64;
                for i in 0..window.len() {
                    if tile.mask[i] && tile.values[i] == code {
                        out[i] = value;
                        hit[i] = true;
                    }
                }
            }

            if mode == ReclassifyMode::Strict {
                for i in 0..window.len() {
                    if tile.mask[i] && !hit[i] {
                        return Err(LookupError::UnknownCode(tile.values[i] as i64).into());
                    }
                }
            }

            output.write_block(window, &out)?;
            Ok(())
        })?;

    Ok(output)
}

/// Map `(land-cover code, soil group)` pairs to ratios, block by block.
///
/// The select runs one mask per code per soil group, mirroring the flat
/// reclassify. A pixel whose land-cover code is unknown, or whose soil
/// value is not 1..=4, stays nodata in lenient mode.
pub fn soil_reclassify(
    lulc: &RasterHandle,
    soil: &RasterHandle,
    lookup: &SoilLookup,
    out_path: impl AsRef<Utf8Path>,
    out_nodata: f64,
    mode: ReclassifyMode,
) -> Result<RasterHandle, AlgebraError> {
    ensure_aligned(&[lulc, soil])?;

    let meta = GridMeta {
        nodata: Some(out_nodata),
        ..lulc.meta().clone()
    };
    let output = RasterHandle::create(out_path, meta)?;

    output
        .blocks()
        .par_iter()
        .try_for_each(|&window| -> Result<(), AlgebraError> {
            let lulc_tile = lulc.read_block(window)?;
            let soil_tile = soil.read_block(window)?;
            let mut out = vec![out_nodata; window.len()];
            let mut hit = vec![false; window.len()];

            for code in lookup.codes() {
                let code_value = code as f64;

                for group in SoilGroup::ALL {
                    let ratio = lookup.get(code, group)?;
                    let group_value = group.code() as f64;

                    for i in 0..window.len() {
                        if lulc_tile.mask[i]
                            && soil_tile.mask[i]
                            && lulc_tile.values[i] == code_value
                            && soil_tile.values[i] == group_value
                        {
                            out[i] = ratio;
                            hit[i] = true;
                        }
                    }
                }
            }

            if mode == ReclassifyMode::Strict {
                for i in 0..window.len() {
                    if !(lulc_tile.mask[i] && soil_tile.mask[i]) || hit[i] {
                        continue;
                    }
                    // Blame whichever side of the pair is unmapped.
                    let soil_code = soil_tile.values[i] as i64;
                    let code = match SoilGroup::from_code(soil_code) {
                        None => soil_code,
                        Some(_) => lulc_tile.values[i] as i64,
                    };
                    return Err(LookupError::UnknownCode(code).into());
                }
            }

            output.write_block(window, &out)?;
            Ok(())
        })?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::LookupTable;
    use crate::raster::GridMeta;
    use camino::Utf8PathBuf;

    const NODATA: f64 = -1.0;

    fn raster_with(dir: &tempfile::TempDir, name: &str, values: &[f64]) -> RasterHandle {
        let side = (values.len() as f64).sqrt() as usize;
        assert_eq!(side * side, values.len());

        let path = Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap();
        let meta = GridMeta::new(side, side).with_nodata(NODATA).with_block(2, 2);
        let raster = RasterHandle::create(path, meta).unwrap();
        let full = crate::raster::BlockWindow {
            col: 0,
            row: 0,
            width: side,
            height: side,
        };
        raster.write_block(full, values).unwrap();
        raster
    }

    fn out_path(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
    }

    #[test]
    fn nodata_propagates_through_sum() {
        let dir = tempfile::tempdir().unwrap();
        let a = raster_with(&dir, "a.grid", &[1.0, NODATA, 3.0, 4.0]);
        let b = raster_with(&dir, "b.grid", &[10.0, 20.0, NODATA, 40.0]);

        let out = raster_calculator(
            &[Operand::from(&a), Operand::from(&b)],
            |args| {
                assert!(args.iter().all(|v| *v != NODATA));
                args[0] + args[1]
            },
            out_path(&dir, "sum.grid"),
            NODATA,
        )
        .unwrap();

        let tile = out.read_all().unwrap();
        assert_eq!(tile.values, vec![11.0, NODATA, NODATA, 44.0]);
    }

    #[test]
    fn constants_do_not_mask() {
        let dir = tempfile::tempdir().unwrap();
        let a = raster_with(&dir, "a.grid", &[1.0, 2.0, NODATA, 4.0]);

        let out = raster_calculator(
            &[Operand::from(&a), Operand::from(0.5)],
            |args| args[0] * args[1],
            out_path(&dir, "scaled.grid"),
            NODATA,
        )
        .unwrap();

        let tile = out.read_all().unwrap();
        assert_eq!(tile.values, vec![0.5, 1.0, NODATA, 2.0]);
    }

    #[test]
    fn calculator_requires_a_raster_operand() {
        let dir = tempfile::tempdir().unwrap();
        let result = raster_calculator(
            &[Operand::from(1.0)],
            |args| args[0],
            out_path(&dir, "none.grid"),
            NODATA,
        );
        assert!(matches!(result, Err(AlgebraError::NoRasterInput)));
    }

    #[test]
    fn misaligned_operands_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let a = raster_with(&dir, "a.grid", &[1.0, 2.0, 3.0, 4.0]);

        let path = out_path(&dir, "b.grid");
        let b = RasterHandle::create(
            path,
            GridMeta::new(2, 2).with_nodata(NODATA).with_pixel_size(2.0, -2.0),
        )
        .unwrap();

        let result = raster_calculator(
            &[Operand::from(&a), Operand::from(&b)],
            |args| args[0],
            out_path(&dir, "out.grid"),
            NODATA,
        );
        assert!(matches!(result, Err(AlgebraError::Grid(_))));
    }

    #[test]
    fn reclassify_maps_known_codes_and_leaves_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let lulc = raster_with(&dir, "lulc.grid", &[1.0, 2.0, 9.0, NODATA]);
        let table = BTreeMap::from([(1, 0.3), (2, 0.7)]);

        let out = reclassify(
            &lulc,
            &table,
            out_path(&dir, "ratio.grid"),
            NODATA,
            ReclassifyMode::Lenient,
        )
        .unwrap();

        let tile = out.read_all().unwrap();
        assert_eq!(tile.values, vec![0.3, 0.7, NODATA, NODATA]);
    }

    #[test]
    fn strict_reclassify_rejects_unknown_codes() {
        let dir = tempfile::tempdir().unwrap();
        let lulc = raster_with(&dir, "lulc.grid", &[1.0, 9.0, 1.0, 1.0]);
        let table = BTreeMap::from([(1, 0.3)]);

        let result = reclassify(
            &lulc,
            &table,
            out_path(&dir, "ratio.grid"),
            NODATA,
            ReclassifyMode::Strict,
        );
        assert!(matches!(
            result,
            Err(AlgebraError::Lookup(LookupError::UnknownCode(9)))
        ));
    }

    #[test]
    fn strict_soil_reclassify_blames_the_unmapped_group() {
        let dir = tempfile::tempdir().unwrap();
        let lulc = raster_with(&dir, "lulc.grid", &[1.0, 1.0, 1.0, 1.0]);
        // Soil value 9 is not a hydrologic group.
        let soil = raster_with(&dir, "soil.grid", &[1.0, 9.0, 1.0, 1.0]);

        let rows = vec![BTreeMap::from([
            ("lucode".to_string(), 1.0),
            ("RC_A".to_string(), 0.3),
            ("RC_B".to_string(), 0.31),
            ("RC_C".to_string(), 0.32),
            ("RC_D".to_string(), 0.33),
        ])];
        let table = LookupTable::build(rows, "lucode").unwrap();
        let lookup = SoilLookup::from_table(&table, "RC_").unwrap();

        let result = soil_reclassify(
            &lulc,
            &soil,
            &lookup,
            out_path(&dir, "ratio.grid"),
            NODATA,
            ReclassifyMode::Strict,
        );
        assert!(matches!(
            result,
            Err(AlgebraError::Lookup(LookupError::UnknownCode(9)))
        ));
    }

    #[test]
    fn soil_reclassify_pairs_code_with_group() {
        let dir = tempfile::tempdir().unwrap();
        let lulc = raster_with(&dir, "lulc.grid", &[1.0, 2.0, 1.0, 2.0]);
        let soil = raster_with(&dir, "soil.grid", &[1.0, 1.0, 4.0, NODATA]);

        let rows = vec![
            BTreeMap::from([
                ("lucode".to_string(), 1.0),
                ("RC_A".to_string(), 0.3),
                ("RC_B".to_string(), 0.31),
                ("RC_C".to_string(), 0.32),
                ("RC_D".to_string(), 0.33),
            ]),
            BTreeMap::from([
                ("lucode".to_string(), 2.0),
                ("RC_A".to_string(), 0.7),
                ("RC_B".to_string(), 0.71),
                ("RC_C".to_string(), 0.72),
                ("RC_D".to_string(), 0.73),
            ]),
        ];
        let table = LookupTable::build(rows, "lucode").unwrap();
        let lookup = SoilLookup::from_table(&table, "RC_").unwrap();

        let out = soil_reclassify(
            &lulc,
            &soil,
            &lookup,
            out_path(&dir, "ratio.grid"),
            NODATA,
            ReclassifyMode::Lenient,
        )
        .unwrap();

        let tile = out.read_all().unwrap();
        assert_eq!(tile.values, vec![0.3, 0.7, 0.33, NODATA]);
    }
}
