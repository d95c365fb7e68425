use std::io::{Read, Write};

use crate::descent::TrainingMode;
use crate::element::Element;
use crate::error::CorticalError;
use crate::layer::node::NodeLayer;
use crate::layer::{Layer, LayerKind};
use crate::persist::{expect_tag, read_f64, read_u8, write_f64, write_u8};

/// Element-wise nonlinearity applied in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu,
    Elu,
}

impl Activation {
    pub fn tag(self) -> u8 {
        match self {
            Activation::Sigmoid => 0,
            Activation::Tanh => 1,
            Activation::Relu => 2,
            Activation::LeakyRelu => 3,
            Activation::Elu => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CorticalError> {
        match tag {
            0 => Ok(Activation::Sigmoid),
            1 => Ok(Activation::Tanh),
            2 => Ok(Activation::Relu),
            3 => Ok(Activation::LeakyRelu),
            4 => Ok(Activation::Elu),
            other => Err(CorticalError::InvalidConfiguration(format!(
                "unknown activation tag {other}"
            ))),
        }
    }
}

/// In-place activation layer.
///
/// The forward pass overwrites the node values, so the backward derivative is
/// evaluated at the *activated* value; every supported kind admits that form.
/// `coefficient` is the leak slope for leaky-relu and alpha for elu, unused
/// otherwise.
#[derive(Debug, Clone)]
pub struct ActivationLayer<T: Element> {
    kind: Activation,
    coefficient: T,
}

impl<T: Element> ActivationLayer<T> {
    pub fn new(kind: Activation) -> Self {
        let coefficient = match kind {
            Activation::LeakyRelu => T::from_config(0.01),
            _ => T::one(),
        };
        Self { kind, coefficient }
    }

    pub fn with_coefficient(kind: Activation, coefficient: T) -> Self {
        Self { kind, coefficient }
    }

    pub fn activation(&self) -> Activation {
        self.kind
    }

    pub fn coefficient(&self) -> T {
        self.coefficient
    }

    fn apply(&self, value: T) -> T {
        let a = self.coefficient;
        match self.kind {
            Activation::Sigmoid => T::one() / (T::one() + (-value).exp()),
            Activation::Tanh => value.tanh(),
            Activation::Relu => {
                if value > T::zero() {
                    value
                } else {
                    T::zero()
                }
            }
            Activation::LeakyRelu => {
                if value > T::zero() {
                    value
                } else {
                    a * value
                }
            }
            Activation::Elu => {
                if value > T::zero() {
                    value
                } else {
                    a * (value.exp() - T::one())
                }
            }
        }
    }

    /// Derivative at the activated value `y`.
    fn derivative(&self, y: T) -> T {
        let a = self.coefficient;
        match self.kind {
            Activation::Sigmoid => y * (T::one() - y),
            Activation::Tanh => T::one() - y * y,
            Activation::Relu => {
                if y > T::zero() {
                    T::one()
                } else {
                    T::zero()
                }
            }
            Activation::LeakyRelu => {
                if y > T::zero() {
                    T::one()
                } else {
                    a
                }
            }
            Activation::Elu => {
                if y > T::zero() {
                    T::one()
                } else {
                    y + a
                }
            }
        }
    }

    /// Maps every node through the activation in place.
    pub fn forward(&self, layer: &mut NodeLayer<T>) -> Result<(), CorticalError> {
        for index in 0..layer.volume() {
            *layer.node_mut(index) = self.apply(layer.node(index));
        }
        Ok(())
    }

    /// Multiplies the resident delta by the derivative at the activated node
    /// value.
    pub fn backward(&self, layer: &mut NodeLayer<T>) -> Result<(), CorticalError> {
        if layer.training_mode() == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: layer.training_mode(),
            });
        }
        for index in 0..layer.volume() {
            let gradient = self.derivative(layer.node(index)) * layer.delta(index);
            *layer.delta_mut(index) = gradient;
        }
        Ok(())
    }

    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Activation.tag())?;
        write_u8(writer, self.kind.tag())?;
        write_f64(writer, self.coefficient.to_f64().unwrap_or(0.0))?;
        Ok(())
    }

    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        expect_tag(reader, LayerKind::Activation.tag(), "layer")?;
        let kind = Activation::from_tag(read_u8(reader)?)?;
        let coefficient = T::from_config(read_f64(reader)?);
        Ok(Self { kind, coefficient })
    }
}

impl<T: Element> Layer for ActivationLayer<T> {
    fn kind(&self) -> LayerKind {
        LayerKind::Activation
    }

    fn save_model(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        self.save(writer)
    }

    fn save_state(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        self.save(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;
    use approx::assert_relative_eq;

    fn layer_with(values: Vec<f64>) -> NodeLayer<f64> {
        let mut layer =
            NodeLayer::from_vec(Shape::new([values.len(), 1, 1, 1, 1]), values).unwrap();
        layer.set_training_mode(TrainingMode::Normal);
        layer
    }

    #[test]
    fn sigmoid_forward_and_backward() {
        let activation = ActivationLayer::<f64>::new(Activation::Sigmoid);
        let mut nodes = layer_with(vec![0.0]);
        activation.forward(&mut nodes).unwrap();
        assert_relative_eq!(nodes.node(0), 0.5);

        *nodes.delta_mut(0) = 2.0;
        activation.backward(&mut nodes).unwrap();
        // y(1-y) at y=0.5
        assert_relative_eq!(nodes.delta(0), 0.25 * 2.0);
    }

    #[test]
    fn tanh_derivative_uses_activated_value() {
        let activation = ActivationLayer::<f64>::new(Activation::Tanh);
        let mut nodes = layer_with(vec![0.5]);
        activation.forward(&mut nodes).unwrap();
        let y = 0.5f64.tanh();
        assert_relative_eq!(nodes.node(0), y);

        *nodes.delta_mut(0) = 1.0;
        activation.backward(&mut nodes).unwrap();
        assert_relative_eq!(nodes.delta(0), 1.0 - y * y);
    }

    #[test]
    fn relu_zeroes_negative_nodes_and_gradients() {
        let activation = ActivationLayer::<f64>::new(Activation::Relu);
        let mut nodes = layer_with(vec![-1.0, 2.0]);
        activation.forward(&mut nodes).unwrap();
        assert_eq!(nodes.node(0), 0.0);
        assert_eq!(nodes.node(1), 2.0);

        *nodes.delta_mut(0) = 5.0;
        *nodes.delta_mut(1) = 5.0;
        activation.backward(&mut nodes).unwrap();
        assert_eq!(nodes.delta(0), 0.0);
        assert_eq!(nodes.delta(1), 5.0);
    }

    #[test]
    fn leaky_relu_keeps_a_leak() {
        let activation = ActivationLayer::with_coefficient(Activation::LeakyRelu, 0.1f64);
        let mut nodes = layer_with(vec![-2.0]);
        activation.forward(&mut nodes).unwrap();
        assert_relative_eq!(nodes.node(0), -0.2);

        *nodes.delta_mut(0) = 1.0;
        activation.backward(&mut nodes).unwrap();
        assert_relative_eq!(nodes.delta(0), 0.1);
    }

    #[test]
    fn elu_derivative_from_activated_value() {
        let alpha = 1.0f64;
        let activation = ActivationLayer::with_coefficient(Activation::Elu, alpha);
        let mut nodes = layer_with(vec![-1.0]);
        activation.forward(&mut nodes).unwrap();
        let y = alpha * ((-1.0f64).exp() - 1.0);
        assert_relative_eq!(nodes.node(0), y);

        *nodes.delta_mut(0) = 1.0;
        activation.backward(&mut nodes).unwrap();
        // d/dx elu at x<0 is alpha*e^x = y + alpha
        assert_relative_eq!(nodes.delta(0), y + alpha);
    }

    #[test]
    fn save_load_round_trip() {
        let activation = ActivationLayer::with_coefficient(Activation::LeakyRelu, 0.2f64);
        let mut buffer = Vec::new();
        activation.save(&mut buffer).unwrap();
        let loaded = ActivationLayer::<f64>::load(&mut buffer.as_slice()).unwrap();
        assert_eq!(loaded.activation(), Activation::LeakyRelu);
        assert_relative_eq!(loaded.coefficient(), 0.2);
    }
}
