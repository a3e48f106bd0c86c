//! The stormwater retention pipeline driver.
//!
//! Thin orchestration over the core: build the lookup tables, register the
//! model steps as tasks with their dependencies, and hand the graph to the
//! scheduler. The model computes, from pre-aligned land-cover, soil-group
//! and precipitation rasters:
//!
//! 1. retention and infiltration ratios per (land cover, soil group) pair,
//! 2. retention and infiltration volumes (ratio × precipitation × pixel
//!    area × 0.001, in m³/yr),
//! 3. avoided pollutant load per `EMC_*` pollutant (concentration reclass
//!    × 1000 × retention volume, in mg),
//! 4. optionally, retention value (volume × replacement cost),
//! 5. per-watershed aggregates written into a copy of the input vector.
//!
//! Reprojection and resampling happen upstream; the driver refuses to
//! schedule anything when the inputs do not already share one grid.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use tracing::info;

use crate::algebra::{Operand, ReclassifyMode, raster_calculator, reclassify, soil_reclassify};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::graph::{Handle, RunReport, Task, TaskGraph};
use crate::hash::Hash32;
use crate::lookup::{LookupTable, SoilLookup};
use crate::raster::{RasterHandle, ensure_aligned};
use crate::vector::RegionVector;
use crate::zonal::{AggKind, aggregate};

/// Output nodata for every derived raster.
pub const TARGET_NODATA: f64 = -1.0;

/// Pre-aligned inputs to the stormwater model.
pub struct StormwaterInputs {
    pub lulc: RasterHandle,
    pub soil_groups: RasterHandle,
    pub precipitation: RasterHandle,
    /// Biophysical table keyed by `lucode`, carrying `RC_A..RC_D`,
    /// `IR_A..IR_D` and any number of `EMC_*` columns.
    pub biophysical: LookupTable,
    pub watersheds: RegionVector,
}

/// Workspace layout of the pipeline outputs.
#[derive(Debug, Clone)]
pub struct StormwaterPaths {
    workspace: Utf8PathBuf,
}

impl StormwaterPaths {
    pub fn new(workspace: impl AsRef<Utf8Path>) -> Self {
        Self {
            workspace: workspace.as_ref().to_owned(),
        }
    }

    pub fn retention_ratio(&self) -> Utf8PathBuf {
        self.workspace.join("retention_ratio.grid")
    }

    pub fn retention_volume(&self) -> Utf8PathBuf {
        self.workspace.join("retention_volume.grid")
    }

    pub fn infiltration_ratio(&self) -> Utf8PathBuf {
        self.workspace.join("infiltration_ratio.grid")
    }

    pub fn infiltration_volume(&self) -> Utf8PathBuf {
        self.workspace.join("infiltration_volume.grid")
    }

    pub fn emc(&self, pollutant: &str) -> Utf8PathBuf {
        self.workspace.join(format!("intermediate/emc_{pollutant}.grid"))
    }

    pub fn avoided_load(&self, pollutant: &str) -> Utf8PathBuf {
        self.workspace
            .join(format!("avoided_pollutant_load_{pollutant}.grid"))
    }

    pub fn retention_value(&self) -> Utf8PathBuf {
        self.workspace.join("retention_value.grid")
    }

    pub fn results_vector(&self) -> Utf8PathBuf {
        self.workspace.join("watershed_results.vec")
    }
}

/// Run the whole model. Blocks until the task graph has settled; repeated
/// runs with unchanged inputs cache-skip every step.
pub fn execute(
    config: &PipelineConfig,
    inputs: StormwaterInputs,
) -> Result<RunReport, PipelineError> {
    eprintln!(
        "Running the {} model in {}.",
        style("stormwater").blue(),
        style(&config.workspace).yellow(),
    );

    ensure_aligned(&[&inputs.lulc, &inputs.soil_groups, &inputs.precipitation])?;

    let paths = StormwaterPaths::new(&config.workspace);
    let mode = match config.strict_reclassify {
        true => ReclassifyMode::Strict,
        false => ReclassifyMode::Lenient,
    };

    let retention_lookup = Arc::new(SoilLookup::from_table(&inputs.biophysical, "RC_")?);
    let infiltration_lookup = Arc::new(SoilLookup::from_table(&inputs.biophysical, "IR_")?);
    let pollutants = inputs.biophysical.suffixes_of("EMC_");

    info!(
        pollutants = pollutants.len(),
        watersheds = inputs.watersheds.len(),
        "registering stormwater tasks"
    );

    let mut graph = TaskGraph::new(config.graph_config())?;

    // Ratio tasks: two independent branches off the same inputs.
    let retention_ratio_task = add_ratio_task(
        &mut graph,
        "retention ratio",
        &inputs.lulc,
        &inputs.soil_groups,
        &retention_lookup,
        paths.retention_ratio(),
        mode,
    )?;
    let infiltration_ratio_task = add_ratio_task(
        &mut graph,
        "infiltration ratio",
        &inputs.lulc,
        &inputs.soil_groups,
        &infiltration_lookup,
        paths.infiltration_ratio(),
        mode,
    )?;

    // Volume tasks: ratio × precipitation × pixel area × 0.001.
    let retention_volume_task = add_volume_task(
        &mut graph,
        "retention volume",
        paths.retention_ratio(),
        &inputs.precipitation,
        paths.retention_volume(),
        retention_ratio_task,
    )?;
    let infiltration_volume_task = add_volume_task(
        &mut graph,
        "infiltration volume",
        paths.infiltration_ratio(),
        &inputs.precipitation,
        paths.infiltration_volume(),
        infiltration_ratio_task,
    )?;

    // Avoided pollutant load, one branch per EMC_* column.
    let mut load_tasks = vec![];
    for pollutant in &pollutants {
        let emc_map = inputs.biophysical.project(&format!("EMC_{pollutant}"))?;
        let emc_hash = Hash32::hash(format!("{emc_map:?}")).to_hex();

        let lulc = inputs.lulc.clone();
        let emc_path = paths.emc(pollutant);
        let emc_out = emc_path.clone();
        let emc_task = graph.add_task(
            Task::new(format!("emc reclass {pollutant}"), move || {
                reclassify(&lulc, &emc_map, &emc_out, TARGET_NODATA, mode)?;
                Ok(())
            })
            .arg(&emc_hash)
            .arg(inputs.lulc.path())
            .target(&emc_path),
            &[],
        )?;

        let load_path = paths.avoided_load(pollutant);
        let load_out = load_path.clone();
        let volume_path = paths.retention_volume();
        let emc_in = emc_path.clone();
        let load_task = graph.add_task(
            Task::new(format!("avoided pollutant {pollutant} load"), move || {
                let emc = RasterHandle::open(&emc_in)?;
                let volume = RasterHandle::open(&volume_path)?;
                // EMC (mg/L) * 1000 (L/m^3) * retention (m^3) = load (mg)
                raster_calculator(
                    &[Operand::from(&emc), Operand::from(&volume)],
                    |args| args[0] * 1000.0 * args[1],
                    &load_out,
                    TARGET_NODATA,
                )?;
                Ok(())
            })
            .arg(&emc_path)
            .arg(paths.retention_volume())
            .target(&load_path),
            &[emc_task, retention_volume_task],
        )?;

        load_tasks.push(load_task);
    }

    // Optional valuation.
    let valuation_task = match config.replacement_cost {
        Some(cost) => {
            let value_path = paths.retention_value();
            let value_out = value_path.clone();
            let volume_path = paths.retention_volume();
            let task = graph.add_task(
                Task::new("retention value", move || {
                    let volume = RasterHandle::open(&volume_path)?;
                    // retention (m^3) * replacement cost (currency/m^3)
                    raster_calculator(
                        &[Operand::from(&volume), Operand::from(cost)],
                        |args| args[0] * args[1],
                        &value_out,
                        TARGET_NODATA,
                    )?;
                    Ok(())
                })
                .arg(cost)
                .arg(paths.retention_volume())
                .target(&value_path),
                &[retention_volume_task],
            )?;
            Some(task)
        }
        None => None,
    };

    // Aggregation depends on every final raster.
    let mut aggregations: Vec<(Utf8PathBuf, String, AggKind)> = vec![
        (paths.retention_ratio(), "RR_mean".into(), AggKind::Mean),
        (paths.retention_volume(), "RV_sum".into(), AggKind::Sum),
        (paths.infiltration_ratio(), "IR_mean".into(), AggKind::Mean),
        (paths.infiltration_volume(), "IV_sum".into(), AggKind::Sum),
    ];
    for pollutant in &pollutants {
        aggregations.push((
            paths.avoided_load(pollutant),
            format!("avoided_{pollutant}"),
            AggKind::Sum,
        ));
    }
    if valuation_task.is_some() {
        aggregations.push((paths.retention_value(), "val_sum".into(), AggKind::Sum));
    }

    let mut aggregation_deps = vec![
        retention_ratio_task,
        retention_volume_task,
        infiltration_ratio_task,
        infiltration_volume_task,
    ];
    aggregation_deps.extend(load_tasks);
    aggregation_deps.extend(valuation_task);

    let field_args: Vec<String> = aggregations
        .iter()
        .map(|(path, field, _)| format!("{path}:{field}"))
        .collect();

    let watersheds = Arc::new(inputs.watersheds);
    let results_path = paths.results_vector();
    let results_out = results_path.clone();
    let mut aggregation_task = Task::new("aggregate to watersheds", move || {
        // Fresh copy of the input regions: aggregation only adds fields.
        let mut results = (*watersheds).clone();
        for (raster_path, field, kind) in &aggregations {
            let raster = RasterHandle::open(raster_path)?;
            aggregate(&raster, &mut results, field, *kind)?;
        }
        results.save(&results_out)?;
        Ok(())
    })
    .target(&results_path);
    for arg in field_args {
        aggregation_task = aggregation_task.arg(arg);
    }
    graph.add_task(aggregation_task, &aggregation_deps)?;

    let report = graph.execute()?;
    info!(
        executed = report.executed,
        cached = report.cached,
        "stormwater pipeline settled"
    );

    Ok(report)
}

fn add_ratio_task(
    graph: &mut TaskGraph,
    name: &str,
    lulc: &RasterHandle,
    soil: &RasterHandle,
    lookup: &Arc<SoilLookup>,
    out_path: Utf8PathBuf,
    mode: ReclassifyMode,
) -> Result<Handle, PipelineError> {
    let lulc = lulc.clone();
    let soil = soil.clone();
    let lookup = lookup.clone();
    let lookup_hash = Hash32::hash(format!("{:?}", lookup.as_ref())).to_hex();
    let out = out_path.clone();

    let handle = graph.add_task(
        Task::new(name, move || {
            soil_reclassify(&lulc, &soil, &lookup, &out, TARGET_NODATA, mode)?;
            Ok(())
        })
        .arg(lookup_hash)
        .target(&out_path),
        &[],
    )?;

    Ok(handle)
}

fn add_volume_task(
    graph: &mut TaskGraph,
    name: &str,
    ratio_path: Utf8PathBuf,
    precipitation: &RasterHandle,
    out_path: Utf8PathBuf,
    ratio_task: Handle,
) -> Result<Handle, PipelineError> {
    let precipitation = precipitation.clone();
    let precipitation_path = precipitation.path().to_owned();
    let pixel_area = precipitation.meta().pixel_area();
    let ratio_in = ratio_path.clone();
    let out = out_path.clone();

    let handle = graph.add_task(
        Task::new(name, move || {
            let ratio = RasterHandle::open(&ratio_in)?;
            // precipitation (mm/yr) * pixel area (m^2) * 0.001 (m/mm)
            // * ratio = volume (m^3/yr)
            raster_calculator(
                &[Operand::from(&ratio), Operand::from(&precipitation)],
                |args| args[0] * args[1] * pixel_area * 0.001,
                &out,
                TARGET_NODATA,
            )?;
            Ok(())
        })
        .arg(&ratio_path)
        .arg(precipitation_path)
        .target(&out_path),
        &[ratio_task],
    )?;

    Ok(handle)
}
