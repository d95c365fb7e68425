use std::io::{Read, Write};

use crate::descent::TrainingMode;
use crate::element::Element;
use crate::error::CorticalError;
use crate::layer::node::NodeLayer;
use crate::layer::{Layer, LayerKind};
use crate::persist::{expect_tag, write_u8};
use crate::shape::Shape;

/// Softmax over the flattened volume of each batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftmaxLayer;

impl SoftmaxLayer {
    pub fn new() -> Self {
        Self
    }

    fn check_shapes(
        input_shape: &Shape<5>,
        output_shape: &Shape<5>,
        operation: &str,
    ) -> Result<(), CorticalError> {
        if input_shape != output_shape {
            return Err(CorticalError::mismatched_shapes(
                input_shape.dims(),
                output_shape.dims(),
                operation,
            ));
        }
        Ok(())
    }

    /// Exponentiates and normalizes each batch. A sum that overflows to
    /// infinity collapses the batch to zero; a vanished sum saturates it.
    pub fn forward<T: Element>(
        &self,
        input: &NodeLayer<T>,
        output: &mut NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        let input_shape = *input.shape();
        let output_shape = *output.shape();
        Self::check_shapes(&input_shape, &output_shape, "softmax forward")?;

        let spatial = input_shape.spatial_volume();
        for batch in 0..input_shape.batches() {
            let base = batch * spatial;

            let mut sum = T::zero();
            for position in 0..spatial {
                let value = input.node(base + position).exp();
                *output.node_mut(base + position) = value;
                sum += value;
            }

            for position in 0..spatial {
                let index = base + position;
                if sum.is_finite() && sum != T::zero() {
                    *output.node_mut(index) = output.node(index) / sum;
                } else if sum == T::infinity() {
                    *output.node_mut(index) = T::zero();
                } else {
                    *output.node_mut(index) = T::max_value();
                }
            }
        }

        Ok(())
    }

    /// `in.delta = out.node * (indicator(out.delta > 0) - in.node)`.
    pub fn backward<T: Element>(
        &self,
        input: &mut NodeLayer<T>,
        output: &NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        let input_shape = *input.shape();
        let output_shape = *output.shape();
        Self::check_shapes(&input_shape, &output_shape, "softmax backward")?;

        if input.training_mode() == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: input.training_mode(),
            });
        }

        for index in 0..input.volume() {
            let indicator = if output.delta(index) > T::zero() {
                T::one()
            } else {
                T::zero()
            };
            let delta = output.node(index) * (indicator - input.node(index));
            *input.delta_mut(index) = delta;
        }

        Ok(())
    }

    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Softmax.tag())
    }

    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        expect_tag(reader, LayerKind::Softmax.tag(), "layer")?;
        Ok(Self)
    }
}

impl Layer for SoftmaxLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Softmax
    }

    fn save_model(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        self.save(writer)
    }

    fn save_state(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        self.save(writer)
    }
}
