// Core modules of the crate
pub mod element;
pub mod error;
pub mod shape;
pub mod tensor;

pub mod descent;
pub mod init;
pub mod layer;
pub mod persist;

// Re-export the types most callers touch directly
pub use element::Element;
pub use error::CorticalError;
pub use shape::Shape;
pub use tensor::Tensor;

pub use num_traits;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CorticalError>;
