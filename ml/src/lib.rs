//! Building blocks for radar nowcasting networks.
//!
//! Networks are described as an explicit [`graph::Graph`] of named operation
//! nodes. A graph can be inspected (shapes, parameter counts) without any
//! numeric work, and is turned into a runnable [`models::Model`] once it is
//! bound to its parameters.
pub mod activation_functions;
pub mod config;
pub mod convolutions;
pub mod graph;
mod graph_errors;
pub mod initializers;
pub mod models;
pub mod pooling;
pub mod recurrent;
pub mod regularization;
pub mod weight_loader;

pub use graph_errors::{GraphError, GraphResult};

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

/// Tensor type passed between the nodes of a graph. Layout is batch-first and channels-last
/// unless a layer states otherwise.
pub type Tensor = ndarray::ArrayD<ImagePrecision>;
