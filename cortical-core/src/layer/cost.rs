use std::io::{Read, Write};

use crate::element::Element;
use crate::error::CorticalError;
use crate::layer::node::NodeLayer;
use crate::layer::{Layer, LayerKind};
use crate::persist::{expect_tag, read_u8, write_u8};
use crate::shape::Shape;

/// Element-wise cost function between a layer and a same-shaped target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostKind {
    MeanSquaredError,
    CategoricalCrossEntropy,
    HellingerDistance,
    KullbackLeibler,
    GeneralizedKullbackLeibler,
    ItakuraSaito,
}

impl CostKind {
    pub fn tag(self) -> u8 {
        match self {
            CostKind::MeanSquaredError => 0,
            CostKind::CategoricalCrossEntropy => 1,
            CostKind::HellingerDistance => 2,
            CostKind::KullbackLeibler => 3,
            CostKind::GeneralizedKullbackLeibler => 4,
            CostKind::ItakuraSaito => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CorticalError> {
        match tag {
            0 => Ok(CostKind::MeanSquaredError),
            1 => Ok(CostKind::CategoricalCrossEntropy),
            2 => Ok(CostKind::HellingerDistance),
            3 => Ok(CostKind::KullbackLeibler),
            4 => Ok(CostKind::GeneralizedKullbackLeibler),
            5 => Ok(CostKind::ItakuraSaito),
            other => Err(CorticalError::InvalidConfiguration(format!(
                "unknown cost tag {other}"
            ))),
        }
    }
}

/// Terminal cost layer: writes per-element cost values (forward) or cost
/// derivatives (backward) into the layer's delta buffer.
///
/// Derivatives follow the `param += step * jacobian` ascent convention used
/// by the descent rules: `mse' = target - value` moves the value toward the
/// target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostLayer {
    kind: CostKind,
}

impl CostLayer {
    pub fn new(kind: CostKind) -> Self {
        Self { kind }
    }

    pub fn cost_kind(&self) -> CostKind {
        self.kind
    }

    fn cost<T: Element>(&self, target: T, value: T) -> T {
        let guard = T::from_config(1e-8);
        match self.kind {
            CostKind::MeanSquaredError => (target - value) * (target - value),
            CostKind::CategoricalCrossEntropy => {
                let log = if value > T::zero() {
                    value.ln()
                } else {
                    guard.ln()
                };
                target * log
            }
            CostKind::HellingerDistance => {
                let diff = target.sqrt() - value.sqrt();
                diff * diff
            }
            CostKind::KullbackLeibler => target * ((target + guard) / (value + guard)).ln(),
            CostKind::GeneralizedKullbackLeibler => {
                target * ((target + guard) / (value + guard)).ln() - target + value
            }
            CostKind::ItakuraSaito => {
                let ratio = (target + guard) / (value + guard);
                ratio - ratio.ln() - T::one()
            }
        }
    }

    fn cost_derivative<T: Element>(&self, target: T, value: T) -> T {
        let guard = T::from_config(1e-8);
        match self.kind {
            CostKind::MeanSquaredError => target - value,
            CostKind::CategoricalCrossEntropy => {
                let log = if value > T::zero() {
                    value.ln()
                } else {
                    guard.ln()
                };
                -(target * log)
            }
            CostKind::HellingerDistance => {
                let sqrt2 = T::from_config(std::f64::consts::SQRT_2);
                (target.sqrt() - value.sqrt()) / (sqrt2 * target.sqrt() + guard)
            }
            CostKind::KullbackLeibler => -(value / (target + guard)),
            CostKind::GeneralizedKullbackLeibler => (target - value) / (target + guard),
            CostKind::ItakuraSaito => (target - value) / (target * target + guard),
        }
    }

    fn check_shapes(
        layer_shape: &Shape<5>,
        target_shape: &Shape<5>,
        operation: &str,
    ) -> Result<(), CorticalError> {
        if layer_shape != target_shape {
            return Err(CorticalError::mismatched_shapes(
                target_shape.dims(),
                layer_shape.dims(),
                operation,
            ));
        }
        Ok(())
    }

    /// Writes the per-element cost into the layer's delta.
    pub fn forward<T: Element>(
        &self,
        layer: &mut NodeLayer<T>,
        target: &NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        Self::check_shapes(layer.shape(), target.shape(), "cost forward")?;
        for index in 0..layer.volume() {
            let cost = self.cost(target.node(index), layer.node(index));
            *layer.delta_mut(index) = cost;
        }
        Ok(())
    }

    /// Writes the per-element cost derivative into the layer's delta.
    pub fn backward<T: Element>(
        &self,
        layer: &mut NodeLayer<T>,
        target: &NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        Self::check_shapes(layer.shape(), target.shape(), "cost backward")?;
        for index in 0..layer.volume() {
            let derivative = self.cost_derivative(target.node(index), layer.node(index));
            *layer.delta_mut(index) = derivative;
        }
        Ok(())
    }

    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Cost.tag())?;
        write_u8(writer, self.kind.tag())?;
        Ok(())
    }

    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        expect_tag(reader, LayerKind::Cost.tag(), "layer")?;
        let kind = CostKind::from_tag(read_u8(reader)?)?;
        Ok(Self { kind })
    }
}

impl Layer for CostLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Cost
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
    use crate::descent::TrainingMode;
    use approx::assert_relative_eq;

    fn pair(values: Vec<f64>, targets: Vec<f64>) -> (NodeLayer<f64>, NodeLayer<f64>) {
        let shape = Shape::new([values.len(), 1, 1, 1, 1]);
        let mut layer = NodeLayer::from_vec(shape, values).unwrap();
        layer.set_training_mode(TrainingMode::Normal);
        let target = NodeLayer::from_vec(shape, targets).unwrap();
        (layer, target)
    }

    #[test]
    fn mse_cost_and_derivative() {
        let cost = CostLayer::new(CostKind::MeanSquaredError);
        let (mut layer, target) = pair(vec![1.0, 3.0], vec![2.0, 1.0]);

        cost.forward(&mut layer, &target).unwrap();
        assert_relative_eq!(layer.delta(0), 1.0);
        assert_relative_eq!(layer.delta(1), 4.0);

        cost.backward(&mut layer, &target).unwrap();
        assert_relative_eq!(layer.delta(0), 1.0);
        assert_relative_eq!(layer.delta(1), -2.0);
    }

    #[test]
    fn cross_entropy_guards_nonpositive_values() {
        let cost = CostLayer::new(CostKind::CategoricalCrossEntropy);
        let (mut layer, target) = pair(vec![0.0], vec![1.0]);
        cost.backward(&mut layer, &target).unwrap();
        assert_relative_eq!(layer.delta(0), -(1e-8f64.ln()));
    }

    #[test]
    fn kl_derivative_matches_formula() {
        let cost = CostLayer::new(CostKind::KullbackLeibler);
        let (mut layer, target) = pair(vec![0.5], vec![0.25]);
        cost.backward(&mut layer, &target).unwrap();
        assert_relative_eq!(layer.delta(0), -(0.5 / (0.25 + 1e-8)), max_relative = 1e-9);
    }

    #[test]
    fn mismatched_target_is_rejected() {
        let cost = CostLayer::new(CostKind::MeanSquaredError);
        let mut layer = NodeLayer::<f64>::new(Shape::new([2, 1, 1, 1, 1]));
        layer.set_training_mode(TrainingMode::Normal);
        let target = NodeLayer::<f64>::new(Shape::new([3, 1, 1, 1, 1]));
        assert!(matches!(
            cost.forward(&mut layer, &target),
            Err(CorticalError::MismatchedShapes { .. })
        ));
    }

    #[test]
    fn save_load_round_trip() {
        let cost = CostLayer::new(CostKind::ItakuraSaito);
        let mut buffer = Vec::new();
        cost.save(&mut buffer).unwrap();
        let loaded = CostLayer::load(&mut buffer.as_slice()).unwrap();
        assert_eq!(loaded, cost);
    }
}
