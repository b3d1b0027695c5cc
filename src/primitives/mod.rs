//! Tensor Primitives
//!
//! Device selection, normalisation, distances, activations and losses shared
//! by the exemplar memory, the training loop and the NCM classifier.
//!
//! ## Submodules
//!
//! - [`tensor_ops`]: Device selection, L2 normalisation, distances, losses
//! - [`activations`]: Activation functions (sigmoid, relu)

mod activations;
mod tensor_ops;

// Re-export all primitives at module level
pub use activations::*;
pub use tensor_ops::*;
