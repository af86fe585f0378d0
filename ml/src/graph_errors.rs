use ndarray::ShapeError;
use thiserror::Error;

use crate::{config::ConfigError, graph::Shape, weight_loader::WeightError};

pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Node {0} is defined more than once")]
    DuplicateNode(String),
    #[error("Node {node} references unknown input {input}")]
    UnknownInput { node: String, input: String },
    #[error("No node with name {0} found")]
    UnknownNode(String),
    #[error("Node {node} expects {expected} input(s), got {found}")]
    Arity {
        node: String,
        expected: &'static str,
        found: usize,
    },
    #[error("Node {node}: {reason}")]
    InvalidOperation { node: String, reason: &'static str },
    #[error("A graph needs exactly one input node, placed first")]
    MissingInput,
    #[error("Node {node} expects a tensor of rank {expected}, got shape {found}")]
    RankMismatch {
        node: String,
        expected: usize,
        found: Shape,
    },
    #[error("Node {node}: shapes {left} and {right} are incompatible along axis {axis}")]
    ShapeMismatch {
        node: String,
        left: Shape,
        right: Shape,
        axis: usize,
    },
    #[error("Node {node}: spatial extent {extent} is smaller than the window {window}")]
    SpatialTooSmall {
        node: String,
        extent: usize,
        window: usize,
    },
    #[error("Node {0}: a dimension exceeds the addressable size")]
    Overflow(String),
    #[error("Node {0}: the channel dimension has to be known")]
    UnknownChannels(String),
    #[error("Input of shape {found} does not fit the graph input {expected}")]
    InputShape { expected: Shape, found: Shape },
    #[error("Parameter {0} is missing")]
    MissingParameter(String),
    #[error("Parameter {name} has shape {found:?}, expected {expected:?}")]
    ParameterShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Invalid configuration:\n {0}")]
    Config(#[from] ConfigError),
    #[error("Could not load weights:\n {0}")]
    Weight(#[from] WeightError),
    #[error("Array operation failed:\n {0}")]
    Array(#[from] ShapeError),
    #[error("Graph description could not be (de)serialized:\n {0}")]
    Serialization(#[from] serde_json::Error),
}
