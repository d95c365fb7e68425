use std::io::{Read, Write};

use crate::descent::TrainingMode;
use crate::element::Element;
use crate::error::CorticalError;
use crate::layer::node::NodeLayer;
use crate::layer::{Layer, LayerKind};
use crate::persist::{expect_tag, read_u8, write_u8};
use crate::shape::{convolved_extent, Shape};

/// Window reduction applied by a pooling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingKind {
    Max,
    Average,
}

impl PoolingKind {
    pub fn tag(self) -> u8 {
        match self {
            PoolingKind::Max => 0,
            PoolingKind::Average => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CorticalError> {
        match tag {
            0 => Ok(PoolingKind::Max),
            1 => Ok(PoolingKind::Average),
            other => Err(CorticalError::InvalidConfiguration(format!(
                "unknown pooling tag {other}"
            ))),
        }
    }
}

/// Max/average pooling over a strided, dilated 3D window. Windows never pad;
/// the layer is channel-preserving and has no learnable parameters.
///
/// Backward passes overwrite rather than accumulate where windows overlap
/// (stride smaller than the window) — a later window's write wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolingLayer {
    kind: PoolingKind,
    pool: Shape<3>,
    stride: Shape<3>,
    dilation: Shape<3>,
}

impl PoolingLayer {
    pub fn new(
        kind: PoolingKind,
        pool: Shape<3>,
        stride: Shape<3>,
        dilation: Shape<3>,
    ) -> Result<Self, CorticalError> {
        for axis in 0..3 {
            if pool.dim(axis) == 0 || stride.dim(axis) == 0 || dilation.dim(axis) == 0 {
                return Err(CorticalError::InvalidConfiguration(
                    "pool, stride and dilation extents must be at least 1".to_string(),
                ));
            }
        }
        Ok(Self {
            kind,
            pool,
            stride,
            dilation,
        })
    }

    pub fn kind(&self) -> PoolingKind {
        self.kind
    }

    pub fn pool(&self) -> &Shape<3> {
        &self.pool
    }

    pub fn stride(&self) -> &Shape<3> {
        &self.stride
    }

    pub fn dilation(&self) -> &Shape<3> {
        &self.dilation
    }

    /// Window volume used by the average scaling.
    fn window_volume(&self) -> usize {
        self.pool.volume()
    }

    /// Output shape implied by the window configuration for a given input.
    pub fn output_shape(&self, input_shape: &Shape<5>) -> Shape<5> {
        let extent = |axis: usize| {
            convolved_extent(
                input_shape.dim(axis),
                0,
                self.pool.dim(axis),
                self.dilation.dim(axis),
                self.stride.dim(axis),
            )
        };
        Shape::new([
            extent(0),
            extent(1),
            extent(2),
            input_shape.channels(),
            input_shape.batches(),
        ])
    }

    fn check_shapes(
        &self,
        input_shape: &Shape<5>,
        output_shape: &Shape<5>,
        operation: &str,
    ) -> Result<(), CorticalError> {
        let expected = self.output_shape(input_shape);
        if *output_shape != expected {
            return Err(CorticalError::mismatched_shapes(
                expected.dims(),
                output_shape.dims(),
                operation,
            ));
        }
        Ok(())
    }

    /// Linear input offsets of one window, in forward scan order.
    fn window_offsets(
        &self,
        input_shape: &Shape<5>,
        in_b: isize,
        out_c: usize,
        out_z: usize,
        out_y: usize,
        out_x: usize,
        offsets: &mut Vec<usize>,
    ) {
        offsets.clear();
        let in_c_dim = (out_c % input_shape.channels()) as isize;
        let in_c = input_shape.channel_index(in_b, in_c_dim);

        for p_z in 0..self.pool.depth() {
            let in_z_dim = (out_z * self.stride.depth() + p_z * self.dilation.depth()) as isize;
            let in_z = input_shape.depth_index(in_c, in_z_dim);

            for p_y in 0..self.pool.height() {
                let in_y_dim =
                    (out_y * self.stride.height() + p_y * self.dilation.height()) as isize;
                let in_y = input_shape.height_index(in_z, in_y_dim);

                for p_x in 0..self.pool.width() {
                    let in_x_dim =
                        (out_x * self.stride.width() + p_x * self.dilation.width()) as isize;
                    offsets.push(input_shape.width_index(in_y, in_x_dim) as usize);
                }
            }
        }
    }

    /// Forward pass; fails with `MismatchedShapes` before touching any
    /// element if the output tensor does not match [`Self::output_shape`].
    pub fn forward<T: Element>(
        &self,
        input: &NodeLayer<T>,
        output: &mut NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        let input_shape = *input.shape();
        let output_shape = *output.shape();
        self.check_shapes(&input_shape, &output_shape, "pooling forward")?;

        let scale = T::one() / T::from_count(self.window_volume());
        let mut offsets = Vec::with_capacity(self.window_volume());

        for b in 0..output_shape.batches() {
            let out_b = output_shape.batch_index(b);
            let in_b = input_shape.batch_index(b);

            for c in 0..output_shape.channels() {
                let out_c = output_shape.channel_index(out_b, c as isize);

                for z in 0..output_shape.depth() {
                    let out_z = output_shape.depth_index(out_c, z as isize);

                    for y in 0..output_shape.height() {
                        let out_y = output_shape.height_index(out_z, y as isize);

                        for x in 0..output_shape.width() {
                            let out_index = output_shape.width_index(out_y, x as isize) as usize;
                            self.window_offsets(&input_shape, in_b, c, z, y, x, &mut offsets);

                            let value = match self.kind {
                                PoolingKind::Max => {
                                    let mut max = T::neg_infinity();
                                    for &offset in &offsets {
                                        let node = input.node(offset);
                                        if node > max {
                                            max = node;
                                        }
                                    }
                                    max
                                }
                                PoolingKind::Average => {
                                    let mut sum = T::zero();
                                    for &offset in &offsets {
                                        sum += input.node(offset);
                                    }
                                    sum * scale
                                }
                            };

                            *output.node_mut(out_index) = value;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Backward pass. Max replays the forward-order scan (first-seen maximum
    /// wins ties), zeroes every visited position, then routes the output
    /// delta to the arg-max. Average writes the uniformly scaled delta to
    /// every tap.
    pub fn backward<T: Element>(
        &self,
        input: &mut NodeLayer<T>,
        output: &NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        let input_shape = *input.shape();
        let output_shape = *output.shape();
        self.check_shapes(&input_shape, &output_shape, "pooling backward")?;

        if input.training_mode() == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: input.training_mode(),
            });
        }

        let scale = T::one() / T::from_count(self.window_volume());
        let mut offsets = Vec::with_capacity(self.window_volume());

        for b in 0..output_shape.batches() {
            let out_b = output_shape.batch_index(b);
            let in_b = input_shape.batch_index(b);

            for c in 0..output_shape.channels() {
                let out_c = output_shape.channel_index(out_b, c as isize);

                for z in 0..output_shape.depth() {
                    let out_z = output_shape.depth_index(out_c, z as isize);

                    for y in 0..output_shape.height() {
                        let out_y = output_shape.height_index(out_z, y as isize);

                        for x in 0..output_shape.width() {
                            let out_index = output_shape.width_index(out_y, x as isize) as usize;
                            let out_delta = output.delta(out_index);
                            self.window_offsets(&input_shape, in_b, c, z, y, x, &mut offsets);

                            match self.kind {
                                PoolingKind::Max => {
                                    let mut max_offset = offsets[0];
                                    let mut max = input.node(max_offset);
                                    for &offset in &offsets[1..] {
                                        let node = input.node(offset);
                                        if node > max {
                                            max = node;
                                            max_offset = offset;
                                        }
                                    }
                                    for &offset in &offsets {
                                        *input.delta_mut(offset) = T::zero();
                                    }
                                    *input.delta_mut(max_offset) = out_delta;
                                }
                                PoolingKind::Average => {
                                    let scaled = out_delta * scale;
                                    for &offset in &offsets {
                                        *input.delta_mut(offset) = scaled;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Pooling.tag())?;
        write_u8(writer, self.kind.tag())?;
        self.pool.save(writer)?;
        self.stride.save(writer)?;
        self.dilation.save(writer)?;
        Ok(())
    }

    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        expect_tag(reader, LayerKind::Pooling.tag(), "layer")?;
        let kind = PoolingKind::from_tag(read_u8(reader)?)?;
        let pool = Shape::<3>::load(reader)?;
        let stride = Shape::<3>::load(reader)?;
        let dilation = Shape::<3>::load(reader)?;
        Self::new(kind, pool, stride, dilation)
    }
}

impl Layer for PoolingLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Pooling
    }

    fn save_model(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        self.save(writer)
    }

    // No learnable parameters: model and state files are identical.
    fn save_state(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        self.save(writer)
    }
}

#[cfg(test)]
#[path = "pooling_test.rs"]
mod tests;
