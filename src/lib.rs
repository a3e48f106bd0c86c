#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod algebra;
mod config;
mod error;
mod graph;
mod hash;
#[cfg(feature = "logging")]
mod logging;
mod lookup;
mod raster;
pub mod stormwater;
mod vector;
mod zonal;

pub use crate::algebra::{Operand, ReclassifyMode, raster_calculator, reclassify, soil_reclassify};
pub use crate::config::{GraphConfig, PipelineConfig};
pub use crate::error::*;
pub use crate::graph::{Handle, RunReport, Task, TaskGraph, TaskResult, TaskState};
pub use crate::hash::Hash32;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::lookup::{LookupTable, Row, SoilGroup, SoilLookup};
pub use crate::raster::{
    BlockWindow, DEFAULT_BLOCK, GridMeta, RasterHandle, Tile, ensure_aligned,
};
pub use crate::vector::{Region, RegionVector};
pub use crate::zonal::{AggKind, AggregateOutcome, RegionStats, aggregate};
