pub mod activation;
pub mod bias;
pub mod convolution;
pub mod cost;
pub mod dense;
pub mod dropout;
pub mod node;
pub mod normalization;
pub mod pooling;
pub mod softmax;

pub use activation::{Activation, ActivationLayer};
pub use bias::BiasLayer;
pub use convolution::{Boundary, ConvolutionLayer, PaddingRule, Sampling};
pub use cost::{CostKind, CostLayer};
pub use dense::DenseLayer;
pub use dropout::DropoutLayer;
pub use node::NodeLayer;
pub use normalization::NormalizationLayer;
pub use pooling::{PoolingKind, PoolingLayer};
pub use softmax::SoftmaxLayer;

use std::io::Write;

use crate::error::CorticalError;

/// Persistence tag identifying a concrete layer in a model/state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Node,
    Bias,
    Dense,
    Convolution,
    Pooling,
    Activation,
    Normalization,
    Dropout,
    Softmax,
    Cost,
}

impl LayerKind {
    pub fn tag(self) -> u8 {
        match self {
            LayerKind::Node => 1,
            LayerKind::Bias => 2,
            LayerKind::Dense => 3,
            LayerKind::Convolution => 4,
            LayerKind::Pooling => 5,
            LayerKind::Activation => 6,
            LayerKind::Normalization => 7,
            LayerKind::Dropout => 8,
            LayerKind::Softmax => 9,
            LayerKind::Cost => 10,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CorticalError> {
        match tag {
            1 => Ok(LayerKind::Node),
            2 => Ok(LayerKind::Bias),
            3 => Ok(LayerKind::Dense),
            4 => Ok(LayerKind::Convolution),
            5 => Ok(LayerKind::Pooling),
            6 => Ok(LayerKind::Activation),
            7 => Ok(LayerKind::Normalization),
            8 => Ok(LayerKind::Dropout),
            9 => Ok(LayerKind::Softmax),
            10 => Ok(LayerKind::Cost),
            other => Err(CorticalError::InvalidConfiguration(format!(
                "unknown layer tag {other}"
            ))),
        }
    }
}

/// Common surface of every concrete layer: its kind plus the model/state
/// serialization hooks. Loading is a constructor concern and stays on the
/// concrete types.
pub trait Layer {
    fn kind(&self) -> LayerKind;

    /// Writes parameters and configuration (no training buffers).
    fn save_model(&self, writer: &mut dyn Write) -> Result<(), CorticalError>;

    /// Writes the model plus jacobian/momentum/velocity and the step counter.
    fn save_state(&self, writer: &mut dyn Write) -> Result<(), CorticalError>;
}
