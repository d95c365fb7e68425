use std::io::{Read, Write};

use rand::Rng;

use crate::descent::TrainingMode;
use crate::element::Element;
use crate::error::CorticalError;
use crate::layer::node::NodeLayer;
use crate::layer::{Layer, LayerKind};
use crate::persist::{expect_tag, read_f64, write_f64, write_u8};
use crate::shape::Shape;

/// Dropout over the per-batch volume.
///
/// A fresh boolean keep-mask is drawn on every forward pass at the configured
/// drop rate and applied to all batches; the backward pass applies the same
/// mask to the deltas without re-sampling.
#[derive(Debug, Clone)]
pub struct DropoutLayer {
    shape: Shape<4>,
    mask: Vec<bool>,
    rate: f64,
}

impl DropoutLayer {
    pub fn new(shape: Shape<4>, rate: f64) -> Result<Self, CorticalError> {
        if !(0.0..1.0).contains(&rate) {
            return Err(CorticalError::InvalidConfiguration(
                "dropout rate must be in [0, 1)".to_string(),
            ));
        }
        if shape.volume() == 0 {
            return Err(CorticalError::InvalidConfiguration(
                "dropout shape must have non-zero volume".to_string(),
            ));
        }
        Ok(Self {
            shape,
            mask: vec![true; shape.volume()],
            rate,
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn shape(&self) -> &Shape<4> {
        &self.shape
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    fn check_shapes<T: Element>(
        &self,
        layer: &NodeLayer<T>,
        operation: &str,
    ) -> Result<(), CorticalError> {
        if layer.shape().spatial_volume() != self.mask.len() {
            return Err(CorticalError::mismatched_shapes(
                self.shape.dims(),
                layer.shape().dims(),
                operation,
            ));
        }
        Ok(())
    }

    /// Redraws the keep-mask and zeroes dropped nodes in place.
    pub fn forward<T: Element, R: Rng + ?Sized>(
        &mut self,
        layer: &mut NodeLayer<T>,
        rng: &mut R,
    ) -> Result<(), CorticalError> {
        self.check_shapes(layer, "dropout forward")?;

        for keep in self.mask.iter_mut() {
            *keep = rng.gen::<f64>() >= self.rate;
        }

        let spatial = self.mask.len();
        for batch in 0..layer.shape().batches() {
            let base = batch * spatial;
            for position in 0..spatial {
                if !self.mask[position] {
                    *layer.node_mut(base + position) = T::zero();
                }
            }
        }
        Ok(())
    }

    /// Applies the current mask to the deltas.
    pub fn backward<T: Element>(&self, layer: &mut NodeLayer<T>) -> Result<(), CorticalError> {
        self.check_shapes(layer, "dropout backward")?;
        if layer.training_mode() == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: layer.training_mode(),
            });
        }

        let spatial = self.mask.len();
        for batch in 0..layer.shape().batches() {
            let base = batch * spatial;
            for position in 0..spatial {
                if !self.mask[position] {
                    *layer.delta_mut(base + position) = T::zero();
                }
            }
        }
        Ok(())
    }

    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Dropout.tag())?;
        self.shape.save(writer)?;
        write_f64(writer, self.rate)?;
        Ok(())
    }

    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        expect_tag(reader, LayerKind::Dropout.tag(), "layer")?;
        let shape = Shape::<4>::load(reader)?;
        let rate = read_f64(reader)?;
        Self::new(shape, rate)
    }
}

impl Layer for DropoutLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Dropout
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
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn rejects_out_of_range_rate() {
        assert!(DropoutLayer::new(Shape::new([2, 2, 1, 1]), 1.0).is_err());
        assert!(DropoutLayer::new(Shape::new([2, 2, 1, 1]), -0.1).is_err());
    }

    #[test]
    fn zero_rate_keeps_everything() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut dropout = DropoutLayer::new(Shape::new([2, 2, 1, 1]), 0.0).unwrap();
        let mut layer =
            NodeLayer::from_vec(Shape::new([2, 2, 1, 1, 1]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        dropout.forward(&mut layer, &mut rng).unwrap();
        assert_eq!(layer.nodes().as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn dropped_positions_zero_nodes_and_deltas() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut dropout = DropoutLayer::new(Shape::new([8, 8, 1, 1]), 0.5).unwrap();
        let mut layer = NodeLayer::<f64>::filled(Shape::new([8, 8, 1, 1, 1]), 1.0);
        layer.set_training_mode(TrainingMode::Normal);
        for index in 0..layer.volume() {
            *layer.delta_mut(index) = 2.0;
        }

        dropout.forward(&mut layer, &mut rng).unwrap();
        dropout.backward(&mut layer).unwrap();

        let dropped = dropout.mask().iter().filter(|&&keep| !keep).count();
        assert!(dropped > 0, "rate 0.5 over 64 positions should drop some");

        for (position, &keep) in dropout.mask().iter().enumerate() {
            if keep {
                assert_eq!(layer.node(position), 1.0);
                assert_eq!(layer.delta(position), 2.0);
            } else {
                assert_eq!(layer.node(position), 0.0);
                assert_eq!(layer.delta(position), 0.0);
            }
        }
    }

    #[test]
    fn mask_is_shared_across_batches() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut dropout = DropoutLayer::new(Shape::new([4, 4, 1, 1]), 0.5).unwrap();
        let mut layer = NodeLayer::<f64>::filled(Shape::new([4, 4, 1, 1, 3]), 1.0);
        dropout.forward(&mut layer, &mut rng).unwrap();

        let spatial = 16;
        for position in 0..spatial {
            let expected = if dropout.mask()[position] { 1.0 } else { 0.0 };
            for batch in 0..3 {
                assert_eq!(layer.node(batch * spatial + position), expected);
            }
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dropout = DropoutLayer::new(Shape::new([3, 3, 1, 2]), 0.25).unwrap();
        let mut buffer = Vec::new();
        dropout.save(&mut buffer).unwrap();
        let loaded = DropoutLayer::load(&mut buffer.as_slice()).unwrap();
        assert_eq!(loaded.shape(), dropout.shape());
        assert_eq!(loaded.rate(), 0.25);
    }
}
