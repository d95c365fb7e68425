use std::io::{Read, Write};

use log::{debug, warn};
use rand::Rng;

use crate::descent::{
    allocate_training_buffers, check_finite, descend_adam, descend_momentum, descend_plain,
    validate_adam_hyper, StepCounter, TrainingMode,
};
use crate::element::Element;
use crate::error::CorticalError;
use crate::init::{initialize, FillDistribution, Initialization};
use crate::layer::node::NodeLayer;
use crate::layer::{Layer, LayerKind};
use crate::persist::{expect_tag, read_u64, read_u8, write_u64, write_u8};
use crate::shape::{convolved_extent, upsampled_extent, Shape};
use crate::tensor::Tensor;

/// Down-sampling (ordinary) or up-sampling (transposed) filter sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Down,
    Up,
}

impl Sampling {
    pub fn tag(self) -> u8 {
        match self {
            Sampling::Down => 0,
            Sampling::Up => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CorticalError> {
        match tag {
            0 => Ok(Sampling::Down),
            1 => Ok(Sampling::Up),
            other => Err(CorticalError::InvalidConfiguration(format!(
                "unknown sampling tag {other}"
            ))),
        }
    }
}

/// How taps that land outside the tensor behave: contribute zero, or wrap
/// around the spatial extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Zero,
    Circular,
}

impl Boundary {
    pub fn tag(self) -> u8 {
        match self {
            Boundary::Zero => 0,
            Boundary::Circular => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CorticalError> {
        match tag {
            0 => Ok(Boundary::Zero),
            1 => Ok(Boundary::Circular),
            other => Err(CorticalError::InvalidConfiguration(format!(
                "unknown boundary tag {other}"
            ))),
        }
    }
}

/// How much padding the layer derives from its filter size and dilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingRule {
    /// No padding.
    Valid,
    /// Output spatial size equals input size (stride 1).
    Same,
    /// Output grows to include every partial overlap.
    Full,
    /// Caller-supplied explicit padding.
    Custom,
}

impl PaddingRule {
    pub fn tag(self) -> u8 {
        match self {
            PaddingRule::Valid => 0,
            PaddingRule::Same => 1,
            PaddingRule::Full => 2,
            PaddingRule::Custom => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CorticalError> {
        match tag {
            0 => Ok(PaddingRule::Valid),
            1 => Ok(PaddingRule::Same),
            2 => Ok(PaddingRule::Full),
            3 => Ok(PaddingRule::Custom),
            other => Err(CorticalError::InvalidConfiguration(format!(
                "unknown padding rule tag {other}"
            ))),
        }
    }
}

/// Strided, padded, dilated N-dimensional convolution layer.
///
/// The filter is 4-dimensional (width, height, depth, output channels); each
/// output channel sweeps one 3D kernel over the input channel
/// `c_out % input_channels`, so a filter with more channels than the input
/// broadcasts across channel groups. Configuration is immutable after
/// construction.
#[derive(Debug, Clone)]
pub struct ConvolutionLayer<T: Element> {
    sampling: Sampling,
    boundary: Boundary,
    padding_rule: PaddingRule,
    input_dilation: Shape<3>,
    padding: Shape<3>,
    inv_padding: Shape<3>,
    stride: Shape<3>,
    dilation: Shape<3>,
    filter: Tensor<T, 4>,
    jacobian: Tensor<T, 4>,
    momentum: Tensor<T, 4>,
    velocity: Tensor<T, 4>,
    mode: TrainingMode,
    steps: StepCounter,
    debug_checks: bool,
}

impl<T: Element> ConvolutionLayer<T> {
    /// Down-sampling layer with padding derived from `rule`.
    pub fn down_sample(
        filter_shape: Shape<4>,
        rule: PaddingRule,
        boundary: Boundary,
        stride: Shape<3>,
        dilation: Shape<3>,
    ) -> Result<Self, CorticalError> {
        if rule == PaddingRule::Custom {
            return Err(CorticalError::InvalidConfiguration(
                "custom padding requires explicit padding; use down_sample_custom".to_string(),
            ));
        }
        let (padding, inv_padding) = derived_padding(rule, &filter_shape, &dilation);
        Self::build(
            Sampling::Down,
            boundary,
            rule,
            Shape::new([1, 1, 1]),
            padding,
            inv_padding,
            stride,
            dilation,
            filter_shape,
        )
    }

    /// Down-sampling layer with caller-supplied padding.
    pub fn down_sample_custom(
        filter_shape: Shape<4>,
        padding: Shape<3>,
        boundary: Boundary,
        stride: Shape<3>,
        dilation: Shape<3>,
    ) -> Result<Self, CorticalError> {
        Self::build(
            Sampling::Down,
            boundary,
            PaddingRule::Custom,
            Shape::new([1, 1, 1]),
            padding,
            padding,
            stride,
            dilation,
            filter_shape,
        )
    }

    /// Up-sampling (transposed) layer: the input grid is dilated by
    /// `input_dilation` before the filter sweep.
    pub fn up_sample(
        filter_shape: Shape<4>,
        rule: PaddingRule,
        boundary: Boundary,
        input_dilation: Shape<3>,
        stride: Shape<3>,
        dilation: Shape<3>,
    ) -> Result<Self, CorticalError> {
        if rule == PaddingRule::Custom {
            return Err(CorticalError::InvalidConfiguration(
                "custom padding requires explicit padding; use up_sample_custom".to_string(),
            ));
        }
        let (padding, inv_padding) = derived_padding(rule, &filter_shape, &dilation);
        Self::build(
            Sampling::Up,
            boundary,
            rule,
            input_dilation,
            padding,
            inv_padding,
            stride,
            dilation,
            filter_shape,
        )
    }

    /// Up-sampling layer with caller-supplied padding.
    pub fn up_sample_custom(
        filter_shape: Shape<4>,
        input_dilation: Shape<3>,
        padding: Shape<3>,
        boundary: Boundary,
        stride: Shape<3>,
        dilation: Shape<3>,
    ) -> Result<Self, CorticalError> {
        Self::build(
            Sampling::Up,
            boundary,
            PaddingRule::Custom,
            input_dilation,
            padding,
            padding,
            stride,
            dilation,
            filter_shape,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        sampling: Sampling,
        boundary: Boundary,
        padding_rule: PaddingRule,
        input_dilation: Shape<3>,
        padding: Shape<3>,
        inv_padding: Shape<3>,
        stride: Shape<3>,
        dilation: Shape<3>,
        filter_shape: Shape<4>,
    ) -> Result<Self, CorticalError> {
        for axis in 0..3 {
            if stride.dim(axis) == 0 || dilation.dim(axis) == 0 || input_dilation.dim(axis) == 0 {
                return Err(CorticalError::InvalidConfiguration(
                    "stride, dilation and input dilation extents must be at least 1".to_string(),
                ));
            }
        }
        if filter_shape.volume() == 0 {
            return Err(CorticalError::InvalidConfiguration(
                "filter shape must have non-zero volume".to_string(),
            ));
        }

        // Valid padding never crosses a boundary on the way in, and its
        // backward scatter bounds-checks against the output; circular wrap
        // has nothing to act on there.
        let boundary = if padding_rule == PaddingRule::Valid && boundary == Boundary::Circular {
            warn!("valid padding ignores the circular boundary mode");
            Boundary::Zero
        } else {
            boundary
        };

        Ok(Self {
            sampling,
            boundary,
            padding_rule,
            input_dilation,
            padding,
            inv_padding,
            stride,
            dilation,
            filter: Tensor::new(filter_shape),
            jacobian: Tensor::unallocated(),
            momentum: Tensor::unallocated(),
            velocity: Tensor::unallocated(),
            mode: TrainingMode::Off,
            steps: StepCounter::new(),
            debug_checks: false,
        })
    }

    pub fn sampling(&self) -> Sampling {
        self.sampling
    }

    pub fn boundary(&self) -> Boundary {
        self.boundary
    }

    pub fn padding_rule(&self) -> PaddingRule {
        self.padding_rule
    }

    pub fn stride(&self) -> &Shape<3> {
        &self.stride
    }

    pub fn dilation(&self) -> &Shape<3> {
        &self.dilation
    }

    pub fn input_dilation(&self) -> &Shape<3> {
        &self.input_dilation
    }

    pub fn padding(&self) -> &Shape<3> {
        &self.padding
    }

    pub fn inverse_padding(&self) -> &Shape<3> {
        &self.inv_padding
    }

    pub fn filter(&self) -> &Tensor<T, 4> {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut Tensor<T, 4> {
        &mut self.filter
    }

    pub fn jacobian(&self) -> &Tensor<T, 4> {
        &self.jacobian
    }

    pub fn momentum_buffer(&self) -> &Tensor<T, 4> {
        &self.momentum
    }

    pub fn velocity_buffer(&self) -> &Tensor<T, 4> {
        &self.velocity
    }

    pub fn training_mode(&self) -> TrainingMode {
        self.mode
    }

    pub fn step_count(&self) -> u64 {
        self.steps.count()
    }

    /// Enables the NaN sweep after descent steps.
    pub fn set_debug_checks(&mut self, enabled: bool) {
        self.debug_checks = enabled;
    }

    pub fn fill_filter(&mut self, value: T) {
        self.filter.fill(value);
    }

    pub fn randomize_filter<R: Rng + ?Sized>(&mut self, rng: &mut R, min: T, max: T) {
        self.filter.randomize(rng, min, max);
    }

    /// Allocates or drops training buffers to match `mode`.
    pub fn set_training_mode(&mut self, mode: TrainingMode) {
        self.mode = mode;
        allocate_training_buffers(
            mode,
            *self.filter.shape(),
            &mut self.jacobian,
            &mut self.momentum,
            &mut self.velocity,
        );
    }

    /// Variance-scaled filter initialization from the surrounding layer
    /// shapes.
    pub fn initialize<R: Rng + ?Sized>(
        &mut self,
        input_shape: &Shape<5>,
        output_shape: &Shape<5>,
        initialization: Initialization,
        distribution: FillDistribution,
        rng: &mut R,
    ) -> Result<(), CorticalError> {
        initialize(
            &mut self.filter,
            input_shape.volume(),
            output_shape.volume(),
            initialization,
            distribution,
            rng,
        )
    }

    /// Output shape implied by the layer configuration for a given input.
    pub fn output_shape(&self, input_shape: &Shape<5>) -> Shape<5> {
        let filter_shape = self.filter.shape();
        let extent = |axis: usize| match self.sampling {
            Sampling::Down => convolved_extent(
                input_shape.dim(axis),
                self.padding.dim(axis),
                filter_shape.dim(axis),
                self.dilation.dim(axis),
                self.stride.dim(axis),
            ),
            Sampling::Up => upsampled_extent(
                input_shape.dim(axis),
                self.input_dilation.dim(axis),
                self.padding.dim(axis),
                filter_shape.dim(axis),
                self.dilation.dim(axis),
                self.stride.dim(axis),
            ),
        };
        Shape::new([
            extent(0),
            extent(1),
            extent(2),
            filter_shape.channels(),
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

    /// Input coordinate a forward tap reads from, or `None` when the tap
    /// contributes zero (out of range, or an up-sampling gap).
    fn tap_input_dim(&self, axis: usize, out_d: isize, f_d: isize, in_size: isize) -> Option<isize> {
        let stride = self.stride.dim(axis) as isize;
        let dilation = self.dilation.dim(axis) as isize;
        let padding = self.padding.dim(axis) as isize;

        let coordinate = match self.sampling {
            Sampling::Down => out_d * stride - padding + f_d * dilation,
            Sampling::Up => {
                let input_dilation = self.input_dilation.dim(axis) as isize;
                // Only the real (non-interpolated) grid points participate.
                if (out_d + f_d) % input_dilation != 0 {
                    return None;
                }
                (out_d / input_dilation) * stride - padding + f_d * dilation
            }
        };

        match self.boundary {
            Boundary::Zero => (coordinate >= 0 && coordinate < in_size).then_some(coordinate),
            Boundary::Circular => Some((coordinate + in_size) % in_size),
        }
    }

    /// Output coordinate the backward scatter reads delta from, or `None`
    /// when the tap contributes zero.
    fn tap_output_dim(&self, axis: usize, in_d: isize, f_d: isize, out_size: isize) -> Option<isize> {
        let stride = self.stride.dim(axis) as isize;
        let dilation = self.dilation.dim(axis) as isize;
        let inv_padding = self.inv_padding.dim(axis) as isize;

        let coordinate = match self.sampling {
            Sampling::Down => in_d * stride - inv_padding + f_d * dilation,
            Sampling::Up => {
                let input_dilation = self.input_dilation.dim(axis) as isize;
                (in_d * input_dilation) * stride - inv_padding + f_d * dilation
            }
        };

        match self.boundary {
            Boundary::Zero => (coordinate >= 0 && coordinate < out_size).then_some(coordinate),
            Boundary::Circular => Some((coordinate + out_size) % out_size),
        }
    }

    /// Forward pass: fails with `MismatchedShapes` before touching any
    /// element if the output tensor does not match [`Self::output_shape`].
    pub fn forward(
        &self,
        input: &NodeLayer<T>,
        output: &mut NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        let input_shape = *input.shape();
        let output_shape = *output.shape();
        self.check_shapes(&input_shape, &output_shape, "convolution forward")?;

        for b in 0..output_shape.batches() {
            let out_b = output_shape.batch_index(b);
            let in_b = input_shape.batch_index(b);

            for c_out in 0..output_shape.channels() {
                let out_c = output_shape.channel_index(out_b, c_out as isize);

                for z in 0..output_shape.depth() {
                    let out_z = output_shape.depth_index(out_c, z as isize);

                    for y in 0..output_shape.height() {
                        let out_y = output_shape.height_index(out_z, y as isize);

                        for x in 0..output_shape.width() {
                            let out_index = output_shape.width_index(out_y, x as isize) as usize;
                            *output.node_mut(out_index) = self.tap_sum(
                                input,
                                &input_shape,
                                in_b,
                                c_out,
                                z as isize,
                                y as isize,
                                x as isize,
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Accumulates every filter tap for one output position.
    fn tap_sum(
        &self,
        input: &NodeLayer<T>,
        input_shape: &Shape<5>,
        in_b: isize,
        c_out: usize,
        out_z: isize,
        out_y: isize,
        out_x: isize,
    ) -> T {
        let filter_shape = *self.filter.shape();
        let mut sum = T::zero();

        let filter_c = filter_shape.channel_index(0, c_out as isize);
        let in_c_dim = (c_out % input_shape.channels()) as isize;
        let in_c = input_shape.channel_index(in_b, in_c_dim);

        for f_z in 0..filter_shape.depth() {
            let filter_z = filter_shape.depth_index(filter_c, f_z as isize);
            let in_z = self
                .tap_input_dim(2, out_z, f_z as isize, input_shape.depth() as isize)
                .map(|z| input_shape.depth_index(in_c, z));

            for f_y in 0..filter_shape.height() {
                let filter_y = filter_shape.height_index(filter_z, f_y as isize);
                let in_y = in_z.and_then(|parent| {
                    self.tap_input_dim(1, out_y, f_y as isize, input_shape.height() as isize)
                        .map(|y| input_shape.height_index(parent, y))
                });

                for f_x in 0..filter_shape.width() {
                    let filter_index = filter_shape.width_index(filter_y, f_x as isize) as usize;
                    let value = in_y
                        .and_then(|parent| {
                            self.tap_input_dim(0, out_x, f_x as isize, input_shape.width() as isize)
                                .map(|x| input_shape.width_index(parent, x) as usize)
                        })
                        .map(|index| input.node(index))
                        .unwrap_or_else(T::zero);

                    sum += self.filter[filter_index] * value;
                }
            }
        }

        sum
    }

    /// Backward pass: accumulates the filter gradient into the jacobian and
    /// scatters the input delta. The caller must zero `input`'s delta before
    /// the first accumulation of a step.
    pub fn backward(
        &mut self,
        input: &mut NodeLayer<T>,
        output: &NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        let input_shape = *input.shape();
        let output_shape = *output.shape();
        self.check_shapes(&input_shape, &output_shape, "convolution backward")?;

        if self.mode == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: self.mode,
            });
        }
        if input.training_mode() == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: input.training_mode(),
            });
        }

        let filter_shape = *self.filter.shape();

        for b in 0..output_shape.batches() {
            let out_b = output_shape.batch_index(b);
            let in_b = input_shape.batch_index(b);

            // Pass 1: filter-gradient accumulation. Tap and output position
            // trade roles relative to forward.
            for f_c in 0..filter_shape.channels() {
                let filter_c = filter_shape.channel_index(0, f_c as isize);

                for f_z in 0..filter_shape.depth() {
                    let filter_z = filter_shape.depth_index(filter_c, f_z as isize);

                    for f_y in 0..filter_shape.height() {
                        let filter_y = filter_shape.height_index(filter_z, f_y as isize);

                        for f_x in 0..filter_shape.width() {
                            let filter_index =
                                filter_shape.width_index(filter_y, f_x as isize) as usize;
                            self.jacobian[filter_index] += filter_gradient_tap(
                                input,
                                output,
                                &self.stride,
                                &self.dilation,
                                in_b,
                                out_b,
                                f_c,
                                f_z as isize,
                                f_y as isize,
                                f_x as isize,
                            );
                        }
                    }
                }
            }

            // Pass 2: input-delta scatter, filter taps walked in reverse.
            for in_c in 0..input_shape.channels() {
                let in_c_idx = input_shape.channel_index(in_b, in_c as isize);

                for z in 0..input_shape.depth() {
                    let in_z = input_shape.depth_index(in_c_idx, z as isize);

                    for y in 0..input_shape.height() {
                        let in_y = input_shape.height_index(in_z, y as isize);

                        for x in 0..input_shape.width() {
                            let in_index = input_shape.width_index(in_y, x as isize) as usize;
                            let sum = self.delta_sum(
                                output,
                                &output_shape,
                                out_b,
                                z as isize,
                                y as isize,
                                x as isize,
                            );
                            *input.delta_mut(in_index) += sum;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Accumulates every filter tap's delta contribution for one input
    /// position.
    fn delta_sum(
        &self,
        output: &NodeLayer<T>,
        output_shape: &Shape<5>,
        out_b: isize,
        in_z: isize,
        in_y: isize,
        in_x: isize,
    ) -> T {
        let filter_shape = *self.filter.shape();
        let mut sum = T::zero();

        for f_c in 0..filter_shape.channels() {
            let filter_c = filter_shape.channel_index(0, f_c as isize);
            let out_c = output_shape.channel_index(out_b, f_c as isize);

            for f_z in (0..filter_shape.depth()).rev() {
                let filter_z = filter_shape.depth_index(filter_c, f_z as isize);
                let out_z = self
                    .tap_output_dim(2, in_z, f_z as isize, output_shape.depth() as isize)
                    .map(|z| output_shape.depth_index(out_c, z));

                for f_y in (0..filter_shape.height()).rev() {
                    let filter_y = filter_shape.height_index(filter_z, f_y as isize);
                    let out_y = out_z.and_then(|parent| {
                        self.tap_output_dim(1, in_y, f_y as isize, output_shape.height() as isize)
                            .map(|y| output_shape.height_index(parent, y))
                    });

                    for f_x in (0..filter_shape.width()).rev() {
                        let filter_index =
                            filter_shape.width_index(filter_y, f_x as isize) as usize;
                        let delta = out_y
                            .and_then(|parent| {
                                self.tap_output_dim(
                                    0,
                                    in_x,
                                    f_x as isize,
                                    output_shape.width() as isize,
                                )
                                .map(|x| output_shape.width_index(parent, x) as usize)
                            })
                            .map(|index| output.delta(index))
                            .unwrap_or_else(T::zero);

                        sum += self.filter[filter_index] * delta;
                    }
                }
            }
        }

        sum
    }

    /// Plain gradient-descent step on the filter.
    pub fn descend_plain(&mut self, batch_size: usize, step_size: T) -> Result<(), CorticalError> {
        if self.mode != TrainingMode::Normal {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: self.mode,
            });
        }
        descend_plain(&mut self.filter, &mut self.jacobian, batch_size, step_size);
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.filter, "convolution plain descent")?;
        }
        Ok(())
    }

    /// Momentum gradient-descent step on the filter.
    pub fn descend_momentum(
        &mut self,
        batch_size: usize,
        step_size: T,
        momentum_step: T,
    ) -> Result<(), CorticalError> {
        if self.mode != TrainingMode::Momentum {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Momentum,
                actual: self.mode,
            });
        }
        descend_momentum(
            &mut self.filter,
            &mut self.jacobian,
            &mut self.momentum,
            batch_size,
            step_size,
            momentum_step,
        );
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.filter, "convolution momentum descent")?;
        }
        Ok(())
    }

    /// Adam gradient-descent step on the filter.
    pub fn descend_adam(
        &mut self,
        batch_size: usize,
        step_size: T,
        beta1: T,
        beta2: T,
        epsilon: T,
    ) -> Result<(), CorticalError> {
        if self.mode != TrainingMode::Adam {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Adam,
                actual: self.mode,
            });
        }
        validate_adam_hyper(beta1, beta2, epsilon)?;
        descend_adam(
            &mut self.filter,
            &mut self.jacobian,
            &mut self.momentum,
            &mut self.velocity,
            batch_size,
            step_size,
            beta1,
            beta2,
            epsilon,
            self.steps.count(),
        );
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.filter, "convolution adam descent")?;
        }
        Ok(())
    }

    fn save_configuration<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Convolution.tag())?;
        write_u8(writer, self.sampling.tag())?;
        write_u8(writer, self.boundary.tag())?;
        write_u8(writer, self.padding_rule.tag())?;
        self.input_dilation.save(writer)?;
        self.padding.save(writer)?;
        self.inv_padding.save(writer)?;
        self.stride.save(writer)?;
        self.dilation.save(writer)?;
        Ok(())
    }

    /// Writes configuration and filter (no training buffers).
    pub fn save_model<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        self.save_configuration(writer)?;
        self.filter.save(writer)?;
        debug!("saved convolution model, filter {:?}", self.filter.shape().dims());
        Ok(())
    }

    /// Writes the model plus training buffers and the step counter.
    pub fn save_state<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        self.save_configuration(writer)?;
        self.filter.save(writer)?;
        write_u8(writer, self.mode.tag())?;
        self.jacobian.save(writer)?;
        self.momentum.save(writer)?;
        self.velocity.save(writer)?;
        write_u64(writer, self.steps.count())?;
        debug!("saved convolution state at step {}", self.steps.count());
        Ok(())
    }

    fn load_configured<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        expect_tag(reader, LayerKind::Convolution.tag(), "layer")?;
        let sampling = Sampling::from_tag(read_u8(reader)?)?;
        let boundary = Boundary::from_tag(read_u8(reader)?)?;
        let padding_rule = PaddingRule::from_tag(read_u8(reader)?)?;
        let input_dilation = Shape::<3>::load(reader)?;
        let padding = Shape::<3>::load(reader)?;
        let inv_padding = Shape::<3>::load(reader)?;
        let stride = Shape::<3>::load(reader)?;
        let dilation = Shape::<3>::load(reader)?;
        let filter = Tensor::<T, 4>::load(reader)?;

        let mut layer = Self::build(
            sampling,
            boundary,
            padding_rule,
            input_dilation,
            padding,
            inv_padding,
            stride,
            dilation,
            *filter.shape(),
        )?;
        layer.filter = filter;
        Ok(layer)
    }

    /// Reads a layer written by [`Self::save_model`].
    pub fn load_model<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        Self::load_configured(reader)
    }

    /// Reads a layer written by [`Self::save_state`].
    pub fn load_state<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        let mut layer = Self::load_configured(reader)?;
        layer.mode = TrainingMode::from_tag(read_u8(reader)?)?;
        layer.jacobian = Tensor::load(reader)?;
        layer.momentum = Tensor::load(reader)?;
        layer.velocity = Tensor::load(reader)?;
        layer.steps.set_count(read_u64(reader)?);
        Ok(layer)
    }
}

impl<T: Element> Layer for ConvolutionLayer<T> {
    fn kind(&self) -> LayerKind {
        LayerKind::Convolution
    }

    fn save_model(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        ConvolutionLayer::save_model(self, writer)
    }

    fn save_state(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        ConvolutionLayer::save_state(self, writer)
    }
}

/// Padding / inverse padding implied by a non-custom rule.
fn derived_padding(
    rule: PaddingRule,
    filter_shape: &Shape<4>,
    dilation: &Shape<3>,
) -> (Shape<3>, Shape<3>) {
    let reach = |axis: usize| filter_shape.dim(axis).saturating_sub(1) * dilation.dim(axis);
    match rule {
        PaddingRule::Valid | PaddingRule::Custom => (Shape::new([0, 0, 0]), Shape::new([0, 0, 0])),
        PaddingRule::Same => {
            let padding = Shape::new([reach(0) / 2, reach(1) / 2, reach(2) / 2]);
            (padding, padding)
        }
        PaddingRule::Full => (
            Shape::new([reach(0), reach(1), reach(2)]),
            Shape::new([0, 0, 0]),
        ),
    }
}

/// One filter tap of the gradient pass: correlates the input with the
/// output's incoming delta over every output position.
#[allow(clippy::too_many_arguments)]
fn filter_gradient_tap<T: Element>(
    input: &NodeLayer<T>,
    output: &NodeLayer<T>,
    stride: &Shape<3>,
    dilation: &Shape<3>,
    in_b: isize,
    out_b: isize,
    f_c: usize,
    f_z: isize,
    f_y: isize,
    f_x: isize,
) -> T {
    let input_shape = *input.shape();
    let output_shape = *output.shape();

    let out_c = output_shape.channel_index(out_b, f_c as isize);
    let in_c_dim = (f_c % input_shape.channels()) as isize;
    let in_c = input_shape.channel_index(in_b, in_c_dim);

    let mut accumulated = T::zero();

    for o_z in 0..output_shape.depth() {
        let out_z = output_shape.depth_index(out_c, o_z as isize);
        let in_z_dim = f_z * stride.depth() as isize + o_z as isize * dilation.depth() as isize;
        let in_z_bound = input_shape.within_depth(in_z_dim);
        let in_z = input_shape.depth_index(in_c, in_z_dim);

        for o_y in 0..output_shape.height() {
            let out_y = output_shape.height_index(out_z, o_y as isize);
            let in_y_dim =
                f_y * stride.height() as isize + o_y as isize * dilation.height() as isize;
            let in_y_bound = input_shape.within_height(in_y_dim) && in_z_bound;
            let in_y = input_shape.height_index(in_z, in_y_dim);

            for o_x in 0..output_shape.width() {
                let out_index = output_shape.width_index(out_y, o_x as isize) as usize;
                let in_x_dim =
                    f_x * stride.width() as isize + o_x as isize * dilation.width() as isize;
                let in_bound = input_shape.within_width(in_x_dim) && in_y_bound;

                let node = if in_bound {
                    let in_index = input_shape.width_index(in_y, in_x_dim) as usize;
                    input.node(in_index)
                } else {
                    T::zero()
                };

                accumulated += node * output.delta(out_index);
            }
        }
    }

    accumulated
}

#[cfg(test)]
#[path = "convolution_test.rs"]
mod tests;
