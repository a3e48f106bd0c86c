use camino::Utf8PathBuf;
use thiserror::Error;

use crate::hash::Hash32;

/// Errors raised while constructing a [`LookupTable`](crate::LookupTable)
/// or resolving codes against one.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Duplicate value '{0}' in key column '{1}'")]
    DuplicateKey(i64, String),

    #[error("Row for key '{0}' is missing required column '{1}'")]
    MissingColumn(i64, String),

    #[error("Code '{0}' is absent from the lookup table")]
    UnknownCode(i64),
}

/// A fatal precondition failure: rasters entering a pixel operation do not
/// share the same grid. Alignment is an upstream responsibility; the core
/// never broadcasts silently.
#[derive(Debug, Error)]
pub enum GridError {
    #[error(
        "Raster '{path}' does not match the reference grid: \
         expected {expected}, found {found}"
    )]
    Mismatch {
        path: Utf8PathBuf,
        expected: String,
        found: String,
    },
}

/// Errors surfaced while registering tasks, before any execution happens.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Adding task '{0}' would create a dependency cycle")]
    Cycle(String),

    #[error("Target '{path}' is already claimed by task '{producer}'")]
    DuplicateTarget {
        path: Utf8PathBuf,
        producer: String,
    },

    #[error("Unknown dependency handle passed to task '{0}'")]
    ForeignHandle(String),
}

/// A single failed task, captured once the graph has settled.
#[derive(Debug)]
pub struct TaskFailure {
    pub name: String,
    pub signature: Hash32,
    pub cause: anyhow::Error,
}

/// The aggregate outcome of a graph run in which at least one task failed.
/// Every failure is enumerated, not just the first one.
#[derive(Debug)]
pub struct ExecuteError {
    pub failures: Vec<TaskFailure>,
}

impl std::error::Error for ExecuteError {}

impl std::fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} task(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            writeln!(f, "  '{}': {:#}", failure.name, failure.cause)?;
        }
        Ok(())
    }
}

/// Errors from the built-in raster grid format.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Couldn't access raster file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("File '{0}' is not a rasterflow grid")]
    BadMagic(Utf8PathBuf),

    #[error("Unsupported grid format version {0}")]
    BadVersion(u16),

    #[error("Block window {0:?} is outside the raster extent")]
    WindowOutOfBounds(crate::raster::BlockWindow),
}

/// Errors from the built-in polygon vector container.
#[derive(Debug, Error)]
pub enum VectorError {
    #[error("Couldn't access vector file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't decode vector container.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't encode vector container.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Duplicate region key '{0}' in polygon vector")]
    DuplicateRegion(i64),
}

/// Errors from block-wise pixel algebra.
#[derive(Debug, Error)]
pub enum AlgebraError {
    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("A pixel operation needs at least one raster operand")]
    NoRasterInput,
}

/// Top-level error for the stormwater pipeline driver.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Algebra(#[from] AlgebraError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
