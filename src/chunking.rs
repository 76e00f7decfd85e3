use crate::error::{PnnError, Result};
use log::debug;

/// Pixel window in raster coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn x_end(&self) -> usize {
        self.x + self.width
    }

    pub fn y_end(&self) -> usize {
        self.y + self.height
    }

    pub fn offset(&self) -> (isize, isize) {
        (self.x as isize, self.y as isize)
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

/// A block of output pixels plus the (possibly larger) window that has to
/// be read to compute it.
#[derive(Debug, Clone, Copy)]
pub struct ChunkBounds {
    pub output: Window,
    pub read: Window,
}

impl ChunkBounds {
    pub fn pad_left(&self) -> usize {
        self.output.x - self.read.x
    }

    pub fn pad_top(&self) -> usize {
        self.output.y - self.read.y
    }
}

pub struct ChunkGrid {
    raster_width: usize,
    raster_height: usize,
    chunk_size: usize,
    padding: usize,
    pub chunks_x: usize,
    pub chunks_y: usize,
}

impl ChunkGrid {
    pub fn new(
        raster_width: usize,
        raster_height: usize,
        chunk_size: usize,
        padding: usize,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(PnnError::InvalidChunkSize(chunk_size));
        }

        let chunks_x = raster_width.div_ceil(chunk_size);
        let chunks_y = raster_height.div_ceil(chunk_size);

        debug!(
            "ChunkGrid: {}x{} raster, chunk_size={}, padding={} -> {}x{} chunks",
            raster_width, raster_height, chunk_size, padding, chunks_x, chunks_y
        );

        Ok(Self {
            raster_width,
            raster_height,
            chunk_size,
            padding,
            chunks_x,
            chunks_y,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks_x * self.chunks_y
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bounds(&self, index: usize) -> ChunkBounds {
        let col = index % self.chunks_x;
        let row = index / self.chunks_x;

        let x = col * self.chunk_size;
        let y = row * self.chunk_size;
        let x_end = (x + self.chunk_size).min(self.raster_width);
        let y_end = (y + self.chunk_size).min(self.raster_height);

        // padding is clipped at the raster edges
        let read_x = x.saturating_sub(self.padding);
        let read_y = y.saturating_sub(self.padding);
        let read_x_end = (x_end + self.padding).min(self.raster_width);
        let read_y_end = (y_end + self.padding).min(self.raster_height);

        ChunkBounds {
            output: Window {
                x,
                y,
                width: x_end - x,
                height: y_end - y,
            },
            read: Window {
                x: read_x,
                y: read_y,
                width: read_x_end - read_x,
                height: read_y_end - read_y,
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ChunkBounds> + '_ {
        (0..self.len()).map(move |index| self.bounds(index))
    }
}
