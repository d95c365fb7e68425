use rand::Rng;

use crate::descent::TrainingMode;
use crate::element::Element;
use crate::error::CorticalError;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Activation buffer passed between layers: node values plus a same-shaped
/// error signal written by the downstream layer's backward pass.
///
/// The delta tensor exists only while a training mode is set; accumulating
/// backward passes require the caller to [`NodeLayer::zero_delta`] between
/// steps.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLayer<T: Element> {
    nodes: Tensor<T, 5>,
    delta: Tensor<T, 5>,
    mode: TrainingMode,
}

impl<T: Element> NodeLayer<T> {
    /// Zero-filled layer with no delta buffer.
    pub fn new(shape: Shape<5>) -> Self {
        Self {
            nodes: Tensor::new(shape),
            delta: Tensor::unallocated(),
            mode: TrainingMode::Off,
        }
    }

    pub fn filled(shape: Shape<5>, value: T) -> Self {
        Self {
            nodes: Tensor::filled(shape, value),
            delta: Tensor::unallocated(),
            mode: TrainingMode::Off,
        }
    }

    pub fn from_vec(shape: Shape<5>, data: Vec<T>) -> Result<Self, CorticalError> {
        Ok(Self {
            nodes: Tensor::from_vec(shape, data)?,
            delta: Tensor::unallocated(),
            mode: TrainingMode::Off,
        })
    }

    /// Allocates (or drops) the delta buffer to match the training mode.
    pub fn set_training_mode(&mut self, mode: TrainingMode) {
        self.mode = mode;
        match mode {
            TrainingMode::Off => self.delta.resize(Shape::empty()),
            _ => self.delta.resize(*self.nodes.shape()),
        }
    }

    pub fn training_mode(&self) -> TrainingMode {
        self.mode
    }

    pub fn shape(&self) -> &Shape<5> {
        self.nodes.shape()
    }

    pub fn volume(&self) -> usize {
        self.nodes.volume()
    }

    pub fn nodes(&self) -> &Tensor<T, 5> {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut Tensor<T, 5> {
        &mut self.nodes
    }

    pub fn delta_tensor(&self) -> &Tensor<T, 5> {
        &self.delta
    }

    pub fn node(&self, index: usize) -> T {
        self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut T {
        &mut self.nodes[index]
    }

    pub fn delta(&self, index: usize) -> T {
        self.delta[index]
    }

    pub fn delta_mut(&mut self, index: usize) -> &mut T {
        &mut self.delta[index]
    }

    pub fn fill_nodes(&mut self, value: T) {
        self.nodes.fill(value);
    }

    pub fn zero_nodes(&mut self) {
        self.nodes.zero();
    }

    pub fn zero_delta(&mut self) {
        self.delta.zero();
    }

    pub fn randomize_nodes<R: Rng + ?Sized>(&mut self, rng: &mut R, min: T, max: T) {
        self.nodes.randomize(rng, min, max);
    }
}
