//! Built-in single-band raster grid with block-wise streaming access.
//!
//! The on-disk layout is a fixed binary header followed by row-major
//! little-endian `f64` samples. Blocks are read and written through seeks
//! into that flat payload, so a raster is never materialized whole.
//! Reprojection and resampling live upstream; this module only verifies
//! that rasters consumed together already share one grid.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{GridError, RasterError};

const MAGIC: &[u8; 4] = b"RFGR";
const VERSION: u16 = 1;
const HEADER_LEN: u64 = 80;

/// Default block shape, in pixels.
pub const DEFAULT_BLOCK: (usize, usize) = (256, 256);

/// Grid geometry and nodata convention of one raster layer.
#[derive(Debug, Clone, PartialEq)]
pub struct GridMeta {
    pub width: usize,
    pub height: usize,
    /// Pixel size (x, y). `y` is negative for north-up rasters.
    pub pixel_size: (f64, f64),
    /// World coordinates of the top-left corner.
    pub origin: (f64, f64),
    pub nodata: Option<f64>,
    /// Block shape (width, height) for streaming access.
    pub block: (usize, usize),
}

impl GridMeta {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixel_size: (1.0, -1.0),
            origin: (0.0, 0.0),
            nodata: None,
            block: DEFAULT_BLOCK,
        }
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    pub fn with_pixel_size(mut self, x: f64, y: f64) -> Self {
        self.pixel_size = (x, y);
        self
    }

    pub fn with_origin(mut self, x: f64, y: f64) -> Self {
        self.origin = (x, y);
        self
    }

    pub fn with_block(mut self, width: usize, height: usize) -> Self {
        self.block = (width.max(1), height.max(1));
        self
    }

    /// Area of one pixel in squared map units.
    pub fn pixel_area(&self) -> f64 {
        (self.pixel_size.0 * self.pixel_size.1).abs()
    }

    /// World coordinates of a pixel center.
    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin.0 + (col as f64 + 0.5) * self.pixel_size.0,
            self.origin.1 + (row as f64 + 0.5) * self.pixel_size.1,
        )
    }

    fn grid_signature(&self) -> String {
        format!(
            "{}x{} @ ({}, {}) px ({}, {})",
            self.width,
            self.height,
            self.origin.0,
            self.origin.1,
            self.pixel_size.0,
            self.pixel_size.1,
        )
    }

    /// Grid identity, ignoring nodata and block layout. Two rasters with
    /// equal geometry may still differ in nodata convention.
    fn same_grid(&self, other: &GridMeta) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.pixel_size == other.pixel_size
            && self.origin == other.origin
    }
}

/// A rectangular sub-window of a raster, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub col: usize,
    pub row: usize,
    pub width: usize,
    pub height: usize,
}

impl BlockWindow {
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate `(col, row)` positions of the window in row-major order.
    pub fn positions(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let (col, row, width) = (self.col, self.row, self.width);
        (0..self.len()).map(move |i| (col + i % width, row + i / width))
    }
}

/// One streamed unit of computation: block values plus the validity mask
/// derived from the raster's nodata value. Ephemeral, recomputed per pass.
#[derive(Debug, Clone)]
pub struct Tile {
    pub window: BlockWindow,
    pub values: Vec<f64>,
    pub mask: Vec<bool>,
}

impl Tile {
    pub(crate) fn new(window: BlockWindow, values: Vec<f64>, nodata: Option<f64>) -> Self {
        let mask = match nodata {
            Some(nodata) => values.iter().map(|&v| v != nodata).collect(),
            None => vec![true; values.len()],
        };
        Self {
            window,
            values,
            mask,
        }
    }
}

/// Metadata plus tiled access to one raster layer on disk.
#[derive(Debug, Clone)]
pub struct RasterHandle {
    path: Utf8PathBuf,
    meta: GridMeta,
}

impl RasterHandle {
    /// Create a raster file prefilled with its nodata value (or zero when
    /// it has none) and return a handle to it.
    pub fn create(path: impl AsRef<Utf8Path>, meta: GridMeta) -> Result<Self, RasterError> {
        let path = path.as_ref().to_owned();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;
        let mut out = BufWriter::new(file);
        write_header(&mut out, &meta)?;

        let fill = meta.nodata.unwrap_or(0.0).to_le_bytes();
        let mut row = Vec::with_capacity(meta.width * 8);
        for _ in 0..meta.width {
            row.extend_from_slice(&fill);
        }
        for _ in 0..meta.height {
            out.write_all(&row)?;
        }
        out.flush()?;

        Ok(Self { path, meta })
    }

    /// Open an existing raster file and read its header.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, RasterError> {
        let path = path.as_ref().to_owned();
        let mut file = File::open(&path)?;
        let meta = read_header(&mut file, &path)?;
        Ok(Self { path, meta })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn meta(&self) -> &GridMeta {
        &self.meta
    }

    pub fn nodata(&self) -> Option<f64> {
        self.meta.nodata
    }

    /// Iterate the block windows covering the raster, row-major. Edge
    /// blocks are clipped to the raster extent.
    pub fn blocks(&self) -> Vec<BlockWindow> {
        let (bw, bh) = self.meta.block;
        let mut windows = vec![];

        let mut row = 0;
        while row < self.meta.height {
            let height = bh.min(self.meta.height - row);
            let mut col = 0;
            while col < self.meta.width {
                let width = bw.min(self.meta.width - col);
                windows.push(BlockWindow {
                    col,
                    row,
                    width,
                    height,
                });
                col += bw;
            }
            row += bh;
        }

        windows
    }

    fn check_window(&self, window: BlockWindow) -> Result<(), RasterError> {
        let fits = window.col + window.width <= self.meta.width
            && window.row + window.height <= self.meta.height;
        if fits && !window.is_empty() {
            Ok(())
        } else {
            Err(RasterError::WindowOutOfBounds(window))
        }
    }

    /// Read one block into a [`Tile`] with its validity mask.
    pub fn read_block(&self, window: BlockWindow) -> Result<Tile, RasterError> {
        self.check_window(window)?;

        let mut file = File::open(&self.path)?;
        let mut values = Vec::with_capacity(window.len());
        let mut buffer = vec![0u8; window.width * 8];

        for r in 0..window.height {
            let index = (window.row + r) * self.meta.width + window.col;
            file.seek(SeekFrom::Start(HEADER_LEN + (index as u64) * 8))?;
            file.read_exact(&mut buffer)?;
            values.extend(
                buffer
                    .chunks_exact(8)
                    .map(|chunk| f64::from_le_bytes(chunk.try_into().unwrap())),
            );
        }

        Ok(Tile::new(window, values, self.meta.nodata))
    }

    /// Write one block in place. Exactly one contiguous write per block
    /// row; concurrent writers of disjoint windows never overlap.
    pub fn write_block(&self, window: BlockWindow, values: &[f64]) -> Result<(), RasterError> {
        self.check_window(window)?;
        debug_assert_eq!(values.len(), window.len());

        let mut file = File::options().write(true).open(&self.path)?;
        let mut buffer = Vec::with_capacity(window.width * 8);

        for r in 0..window.height {
            buffer.clear();
            for &value in &values[r * window.width..(r + 1) * window.width] {
                buffer.extend_from_slice(&value.to_le_bytes());
            }

            let index = (window.row + r) * self.meta.width + window.col;
            file.seek(SeekFrom::Start(HEADER_LEN + (index as u64) * 8))?;
            file.write_all(&buffer)?;
        }

        Ok(())
    }

    /// Read the full raster as one tile. Intended for small rasters and
    /// tests; pipeline code streams blocks instead.
    pub fn read_all(&self) -> Result<Tile, RasterError> {
        self.read_block(BlockWindow {
            col: 0,
            row: 0,
            width: self.meta.width,
            height: self.meta.height,
        })
    }
}

/// Verify that every raster shares the grid of the first one. A mismatch
/// is a fatal precondition failure, caught before any task is scheduled.
pub fn ensure_aligned(rasters: &[&RasterHandle]) -> Result<(), GridError> {
    let Some((reference, rest)) = rasters.split_first() else {
        return Ok(());
    };

    for raster in rest {
        if !reference.meta.same_grid(&raster.meta) {
            return Err(GridError::Mismatch {
                path: raster.path.clone(),
                expected: reference.meta.grid_signature(),
                found: raster.meta.grid_signature(),
            });
        }
    }

    Ok(())
}

fn write_header(out: &mut impl Write, meta: &GridMeta) -> std::io::Result<()> {
    out.write_all(MAGIC)?;
    out.write_all(&VERSION.to_le_bytes())?;
    out.write_all(&[0u8; 2])?;
    out.write_all(&(meta.width as u64).to_le_bytes())?;
    out.write_all(&(meta.height as u64).to_le_bytes())?;
    out.write_all(&meta.pixel_size.0.to_le_bytes())?;
    out.write_all(&meta.pixel_size.1.to_le_bytes())?;
    out.write_all(&meta.origin.0.to_le_bytes())?;
    out.write_all(&meta.origin.1.to_le_bytes())?;
    out.write_all(&[meta.nodata.is_some() as u8, 0, 0, 0, 0, 0, 0, 0])?;
    out.write_all(&meta.nodata.unwrap_or(0.0).to_le_bytes())?;
    out.write_all(&(meta.block.0 as u32).to_le_bytes())?;
    out.write_all(&(meta.block.1 as u32).to_le_bytes())?;
    Ok(())
}

fn read_header(file: &mut File, path: &Utf8Path) -> Result<GridMeta, RasterError> {
    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header)?;

    if &header[0..4] != MAGIC {
        return Err(RasterError::BadMagic(path.to_owned()));
    }

    let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
    if version != VERSION {
        return Err(RasterError::BadVersion(version));
    }

    let u64_at = |o: usize| u64::from_le_bytes(header[o..o + 8].try_into().unwrap());
    let f64_at = |o: usize| f64::from_le_bytes(header[o..o + 8].try_into().unwrap());
    let u32_at = |o: usize| u32::from_le_bytes(header[o..o + 4].try_into().unwrap());

    Ok(GridMeta {
        width: u64_at(8) as usize,
        height: u64_at(16) as usize,
        pixel_size: (f64_at(24), f64_at(32)),
        origin: (f64_at(40), f64_at(48)),
        nodata: (header[56] != 0).then(|| f64_at(64)),
        block: (u32_at(72) as usize, u32_at(76) as usize),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_raster(dir: &tempfile::TempDir, name: &str, meta: GridMeta) -> RasterHandle {
        let path = Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap();
        RasterHandle::create(path, meta).unwrap()
    }

    #[test]
    fn header_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = GridMeta::new(7, 5)
            .with_nodata(-1.0)
            .with_pixel_size(30.0, -30.0)
            .with_origin(1000.0, 2000.0)
            .with_block(4, 4);

        let raster = temp_raster(&dir, "a.grid", meta.clone());
        let opened = RasterHandle::open(raster.path()).unwrap();
        assert_eq!(opened.meta(), &meta);
    }

    #[test]
    fn create_prefills_with_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let raster = temp_raster(&dir, "a.grid", GridMeta::new(3, 3).with_nodata(-1.0));

        let tile = raster.read_all().unwrap();
        assert!(tile.values.iter().all(|&v| v == -1.0));
        assert!(tile.mask.iter().all(|&m| !m));
    }

    #[test]
    fn block_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let meta = GridMeta::new(6, 4).with_nodata(-1.0).with_block(4, 2);
        let raster = temp_raster(&dir, "a.grid", meta);

        let window = BlockWindow {
            col: 4,
            row: 2,
            width: 2,
            height: 2,
        };
        raster.write_block(window, &[1.0, 2.0, 3.0, 4.0]).unwrap();

        let tile = raster.read_block(window).unwrap();
        assert_eq!(tile.values, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(tile.mask.iter().all(|&m| m));

        // Pixels outside the window are untouched.
        let full = raster.read_all().unwrap();
        assert_eq!(full.values[0], -1.0);
        assert_eq!(full.values[2 * 6 + 4], 1.0);
    }

    #[test]
    fn blocks_cover_the_extent_with_clipped_edges() {
        let dir = tempfile::tempdir().unwrap();
        let raster = temp_raster(&dir, "a.grid", GridMeta::new(5, 3).with_block(2, 2));

        let blocks = raster.blocks();
        assert_eq!(blocks.len(), 6);
        assert_eq!(blocks.iter().map(BlockWindow::len).sum::<usize>(), 15);
        assert_eq!(blocks[2].width, 1);
        assert_eq!(blocks[3].height, 1);
    }

    #[test]
    fn out_of_bounds_window_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let raster = temp_raster(&dir, "a.grid", GridMeta::new(4, 4));

        let window = BlockWindow {
            col: 3,
            row: 0,
            width: 2,
            height: 1,
        };
        assert!(matches!(
            raster.read_block(window),
            Err(RasterError::WindowOutOfBounds(_))
        ));
    }

    #[test]
    fn alignment_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let a = temp_raster(&dir, "a.grid", GridMeta::new(4, 4));
        let b = temp_raster(&dir, "b.grid", GridMeta::new(4, 4));
        let c = temp_raster(&dir, "c.grid", GridMeta::new(4, 4).with_pixel_size(2.0, -2.0));

        assert!(ensure_aligned(&[&a, &b]).is_ok());
        assert!(matches!(
            ensure_aligned(&[&a, &b, &c]),
            Err(GridError::Mismatch { .. })
        ));
    }

    #[test]
    fn cell_centers_and_area() {
        let meta = GridMeta::new(4, 4)
            .with_pixel_size(10.0, -10.0)
            .with_origin(100.0, 200.0);
        assert_eq!(meta.cell_center(0, 0), (105.0, 195.0));
        assert_eq!(meta.cell_center(3, 1), (135.0, 185.0));
        assert_eq!(meta.pixel_area(), 100.0);
    }
}
