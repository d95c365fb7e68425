use std::io::{Read, Write};

use crate::error::CorticalError;
use crate::persist::{read_u64, write_u64};

/// Dimension tuple of up to five axes, ordered
/// `[width, height, depth, channels, batches]`.
///
/// Axes a given `N` does not carry read as extent 1, so a 3-dimensional window
/// shape and a 5-dimensional activation shape answer the same accessor
/// surface. Coordinates handed to the bounds checks and offset builders are
/// signed: padded kernels form out-of-range candidates first and test them
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape<const N: usize> {
    dim: [usize; N],
}

impl<const N: usize> Shape<N> {
    pub fn new(dim: [usize; N]) -> Self {
        Self { dim }
    }

    /// Shape with every axis zero; the shape of an unallocated buffer.
    pub fn empty() -> Self {
        Self { dim: [0; N] }
    }

    pub fn dims(&self) -> &[usize; N] {
        &self.dim
    }

    /// Extent of `axis` (0 = width), 1 for axes beyond `N`.
    pub fn dim(&self, axis: usize) -> usize {
        self.dim.get(axis).copied().unwrap_or(1)
    }

    pub fn width(&self) -> usize {
        self.dim(0)
    }

    pub fn height(&self) -> usize {
        self.dim(1)
    }

    pub fn depth(&self) -> usize {
        self.dim(2)
    }

    pub fn channels(&self) -> usize {
        self.dim(3)
    }

    pub fn batches(&self) -> usize {
        self.dim(4)
    }

    /// Total element count.
    pub fn volume(&self) -> usize {
        self.dim.iter().product()
    }

    /// Element count of one batch: the product of every axis but the last.
    pub fn spatial_volume(&self) -> usize {
        if N == 0 {
            return 1;
        }
        self.dim[..N - 1].iter().product()
    }

    pub fn within_width(&self, x: isize) -> bool {
        x >= 0 && x < self.width() as isize
    }

    pub fn within_height(&self, y: isize) -> bool {
        y >= 0 && y < self.height() as isize
    }

    pub fn within_depth(&self, z: isize) -> bool {
        z >= 0 && z < self.depth() as isize
    }

    pub fn within_channels(&self, c: isize) -> bool {
        c >= 0 && c < self.channels() as isize
    }

    pub fn within_batches(&self, b: isize) -> bool {
        b >= 0 && b < self.batches() as isize
    }

    // Incremental row-major offset builders. Each level folds one coordinate
    // into the parent offset and scales by the next-inner extent, so a kernel
    // caches the partial offset per loop nesting level:
    //   offset = ((((b*C + c)*Z + z)*Y + y)*X + x

    pub fn batch_index(&self, b: usize) -> isize {
        (b * self.channels()) as isize
    }

    pub fn channel_index(&self, parent: isize, c: isize) -> isize {
        (parent + c) * self.depth() as isize
    }

    pub fn depth_index(&self, parent: isize, z: isize) -> isize {
        (parent + z) * self.height() as isize
    }

    pub fn height_index(&self, parent: isize, y: isize) -> isize {
        (parent + y) * self.width() as isize
    }

    pub fn width_index(&self, parent: isize, x: isize) -> isize {
        parent + x
    }

    /// Full row-major offset of an in-range coordinate tuple, ordered like the
    /// dimension array (x first).
    pub fn offset(&self, coords: [usize; N]) -> usize {
        let mut offset = 0usize;
        for axis in (0..N).rev() {
            offset = offset * self.dim[axis] + coords[axis];
        }
        offset
    }

    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        for extent in self.dim {
            write_u64(writer, extent as u64)?;
        }
        Ok(())
    }

    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        let mut dim = [0usize; N];
        for extent in dim.iter_mut() {
            *extent = read_u64(reader)? as usize;
        }
        Ok(Self { dim })
    }
}

impl<const N: usize> From<[usize; N]> for Shape<N> {
    fn from(dim: [usize; N]) -> Self {
        Self::new(dim)
    }
}

/// Output extent of a down-sampling convolution or pooling along one axis:
/// `floor((in + 2*pad - dilation*(filter-1) - 1) / stride) + 1`, clamped at
/// zero for windows larger than the padded input.
pub fn convolved_extent(
    input: usize,
    padding: usize,
    filter: usize,
    dilation: usize,
    stride: usize,
) -> usize {
    let span = input as isize + 2 * padding as isize
        - dilation as isize * (filter as isize - 1)
        - 1;
    if span < 0 {
        return 0;
    }
    (span / stride as isize + 1) as usize
}

/// Output extent of an up-sampling (transposed) convolution along one axis;
/// the input is dilated by `input_dilation` before the filter sweep.
pub fn upsampled_extent(
    input: usize,
    input_dilation: usize,
    padding: usize,
    filter: usize,
    dilation: usize,
    stride: usize,
) -> usize {
    let span = (input_dilation * input) as isize + 2 * padding as isize
        - dilation as isize * (filter as isize - 1)
        - 1;
    if span < 0 {
        return 0;
    }
    (span / stride as isize + 1) as usize
}
