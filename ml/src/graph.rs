//! Explicit description of a network topology.
//!
//! A [`Graph`] is an ordered list of named [`Node`]s. Every node holds one [`Op`] and
//! references its inputs by name; inputs always appear earlier in the list, so the list
//! order is a topological order. Graphs are immutable once built and carry no weights,
//! they can be inspected, compared and serialized without any numeric work.
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use crate::{
    activation_functions::Activation,
    convolutions::{window_geometry, DataFormat, Padding},
    initializers::Initializer,
    GraphError, GraphResult,
};

/// Upper bound for filter counts, window sizes, strides and upsampling factors.
pub const MAX_HYPERPARAMETER: usize = 1 << 16;

/// Shape of a tensor. Dimensions that are only known once data arrives are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<Option<usize>>);

impl Shape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Shape(dims)
    }

    pub fn from_concrete(dims: &[usize]) -> Self {
        Shape(dims.iter().map(|&d| Some(d)).collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.0
    }

    /// Size of the given axis, None if it is unknown or out of range.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.0.get(axis).copied().flatten()
    }

    /// Fills the unknown dimensions of this shape with those of `other`.
    /// None if the ranks differ or a known dimension disagrees.
    pub fn refine(&self, other: &Shape) -> Option<Shape> {
        if self.rank() != other.rank() {
            return None;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| match (a, b) {
                (Some(x), Some(y)) if x != y => None,
                (Some(x), _) => Some(Some(*x)),
                (None, y) => Some(*y),
            })
            .collect::<Option<Vec<_>>>()
            .map(Shape)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self
            .0
            .iter()
            .map(|d| match d {
                Some(d) => d.to_string(),
                None => "None".to_string(),
            })
            .collect();
        write!(f, "({})", dims.join(", "))
    }
}

/// Operations a node can perform. Spatial layers work on channels-last tensors
/// (batch, [time,] height, width, channels) unless they carry a [`DataFormat`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// The graph input. Unknown dimensions are resolved by the data passed in.
    Input { shape: Shape },
    Conv2d {
        filters: usize,
        kernel_size: [usize; 2],
        strides: usize,
        padding: Padding,
        activation: Activation,
        initializer: Initializer,
    },
    Conv3d {
        filters: usize,
        kernel_size: [usize; 3],
        strides: usize,
        padding: Padding,
        data_format: DataFormat,
        activation: Activation,
        initializer: Initializer,
    },
    ConvLstm2d {
        filters: usize,
        kernel_size: [usize; 2],
        padding: Padding,
        return_sequences: bool,
        activation: Activation,
        recurrent_activation: Activation,
        initializer: Initializer,
        /// L2 coefficient for the input kernel
        kernel_regularizer: Option<f32>,
    },
    MaxPooling2d { pool_size: usize },
    UpSampling2d { size: usize },
    Dropout { rate: f32 },
    Concatenate { axis: usize },
    Activation(Activation),
}

/// A trainable tensor of the graph, e.g. the kernel of a convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    /// `<node>.kernel`, `<node>.recurrent_kernel` or `<node>.bias`
    pub name: String,
    pub shape: Vec<usize>,
    pub initializer: Initializer,
    /// Coefficient of the L2 penalty on this tensor, if any
    pub l2: Option<f32>,
}

impl ParamSpec {
    fn new(node: &str, suffix: &str, shape: Vec<usize>, initializer: Initializer) -> Self {
        Self {
            name: format!("{}.{}", node, suffix),
            shape,
            initializer,
            l2: None,
        }
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

fn expect_rank(node: &str, shape: &Shape, rank: usize) -> GraphResult<()> {
    if shape.rank() != rank {
        return Err(GraphError::RankMismatch {
            node: node.to_string(),
            expected: rank,
            found: shape.clone(),
        });
    }
    Ok(())
}

fn known_channels(node: &str, shape: &Shape, axis: usize) -> GraphResult<usize> {
    shape
        .dim(axis)
        .ok_or_else(|| GraphError::UnknownChannels(node.to_string()))
}

/// Output extent of a window sliding over a possibly unknown extent.
fn window_output(
    node: &str,
    extent: Option<usize>,
    window: usize,
    stride: usize,
    padding: Padding,
) -> GraphResult<Option<usize>> {
    match extent {
        None => Ok(None),
        Some(e) if e.checked_add(window).is_none() => {
            Err(GraphError::Overflow(node.to_string()))
        }
        Some(e) => window_geometry(e, window, stride, padding)
            .map(|(out, _, _)| Some(out))
            .ok_or_else(|| GraphError::SpatialTooSmall {
                node: node.to_string(),
                extent: e,
                window,
            }),
    }
}

/// Axes of a 3D convolution input: (spatial axes, channel axis)
fn conv3d_axes(data_format: DataFormat) -> ([usize; 3], usize) {
    match data_format {
        DataFormat::ChannelsLast => ([1, 2, 3], 4),
        DataFormat::ChannelsFirst => ([2, 3, 4], 1),
    }
}

fn in_range(sizes: &[usize]) -> bool {
    sizes.iter().all(|s| (1..=MAX_HYPERPARAMETER).contains(s))
}

fn check_activation(node: &str, activation: &Activation) -> GraphResult<()> {
    match activation {
        Activation::LeakyRelu { alpha } if !(*alpha >= 0.) => Err(GraphError::InvalidOperation {
            node: node.to_string(),
            reason: "the leaky relu slope has to be a non-negative number",
        }),
        _ => Ok(()),
    }
}

/// Number of elements of a tensor with the given dimensions.
fn checked_size(node: &str, dims: &[usize]) -> GraphResult<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| GraphError::Overflow(node.to_string()))
}

impl Op {
    /// Layer type as keras would name it.
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Input { .. } => "InputLayer",
            Op::Conv2d { .. } => "Conv2D",
            Op::Conv3d { .. } => "Conv3D",
            Op::ConvLstm2d { .. } => "ConvLSTM2D",
            Op::MaxPooling2d { .. } => "MaxPooling2D",
            Op::UpSampling2d { .. } => "UpSampling2D",
            Op::Dropout { .. } => "Dropout",
            Op::Concatenate { .. } => "Concatenate",
            Op::Activation(_) => "Activation",
        }
    }

    /// Number of output channels of layers with learned filters.
    pub fn filters(&self) -> Option<usize> {
        match self {
            Op::Conv2d { filters, .. }
            | Op::Conv3d { filters, .. }
            | Op::ConvLstm2d { filters, .. } => Some(*filters),
            _ => None,
        }
    }

    fn check_arity(&self, node: &str, found: usize) -> GraphResult<()> {
        let (ok, expected) = match self {
            Op::Input { .. } => (found == 0, "0"),
            Op::Concatenate { .. } => (found >= 2, "at least 2"),
            _ => (found == 1, "1"),
        };
        if ok {
            Ok(())
        } else {
            Err(GraphError::Arity {
                node: node.to_string(),
                expected,
                found,
            })
        }
    }

    /// Rejects sizes that would make the layer meaningless (zero filters, windows or
    /// strides, dropout rates outside of [0, 1)).
    fn check_hyperparameters(&self, node: &str) -> GraphResult<()> {
        let invalid = |reason| {
            Err(GraphError::InvalidOperation {
                node: node.to_string(),
                reason,
            })
        };
        match self {
            Op::Conv2d {
                filters,
                kernel_size,
                strides,
                activation,
                ..
            } => {
                if !in_range(&[*filters, *strides]) || !in_range(&kernel_size[..]) {
                    return invalid("filters, kernel size and strides have to lie in [1, 65536]");
                }
                check_activation(node, activation)?;
            }
            Op::Conv3d {
                filters,
                kernel_size,
                strides,
                activation,
                ..
            } => {
                if !in_range(&[*filters, *strides]) || !in_range(&kernel_size[..]) {
                    return invalid("filters, kernel size and strides have to lie in [1, 65536]");
                }
                check_activation(node, activation)?;
            }
            Op::ConvLstm2d {
                filters,
                kernel_size,
                kernel_regularizer,
                activation,
                recurrent_activation,
                ..
            } => {
                if !in_range(&[*filters]) || !in_range(&kernel_size[..]) {
                    return invalid("filters and kernel size have to lie in [1, 65536]");
                }
                if kernel_regularizer.map_or(false, |l2| !(l2 >= 0.)) {
                    return invalid("the L2 coefficient has to be a non-negative number");
                }
                check_activation(node, activation)?;
                check_activation(node, recurrent_activation)?;
            }
            Op::MaxPooling2d { pool_size: s } | Op::UpSampling2d { size: s } => {
                if !in_range(&[*s]) {
                    return invalid("window size has to lie in [1, 65536]");
                }
            }
            Op::Dropout { rate } => {
                if !(0.0..1.0).contains(rate) {
                    return invalid("dropout rate has to lie in [0, 1)");
                }
            }
            Op::Activation(activation) => check_activation(node, activation)?,
            Op::Input { .. } | Op::Concatenate { .. } => {}
        }
        Ok(())
    }

    /// Shape of the output of this operation, given the shapes of its inputs.
    pub fn output_shape(&self, node: &str, inputs: &[&Shape]) -> GraphResult<Shape> {
        self.check_arity(node, inputs.len())?;
        match self {
            Op::Input { shape } => Ok(shape.clone()),
            Op::Conv2d {
                filters,
                kernel_size,
                strides,
                padding,
                ..
            } => {
                let x = inputs[0];
                expect_rank(node, x, 4)?;
                known_channels(node, x, 3)?;
                Ok(Shape(vec![
                    x.dims()[0],
                    window_output(node, x.dims()[1], kernel_size[0], *strides, *padding)?,
                    window_output(node, x.dims()[2], kernel_size[1], *strides, *padding)?,
                    Some(*filters),
                ]))
            }
            Op::Conv3d {
                filters,
                kernel_size,
                strides,
                padding,
                data_format,
                ..
            } => {
                let x = inputs[0];
                expect_rank(node, x, 5)?;
                let (spatial, channel) = conv3d_axes(*data_format);
                known_channels(node, x, channel)?;
                let mut dims = x.dims().to_vec();
                for (axis, &k) in spatial.iter().zip(kernel_size.iter()) {
                    dims[*axis] = window_output(node, x.dims()[*axis], k, *strides, *padding)?;
                }
                dims[channel] = Some(*filters);
                Ok(Shape(dims))
            }
            Op::ConvLstm2d {
                filters,
                kernel_size,
                padding,
                return_sequences,
                ..
            } => {
                let x = inputs[0];
                expect_rank(node, x, 5)?;
                known_channels(node, x, 4)?;
                let height = window_output(node, x.dims()[2], kernel_size[0], 1, *padding)?;
                let width = window_output(node, x.dims()[3], kernel_size[1], 1, *padding)?;
                let mut dims = vec![x.dims()[0]];
                if *return_sequences {
                    dims.push(x.dims()[1]);
                }
                dims.extend_from_slice(&[height, width, Some(*filters)]);
                Ok(Shape(dims))
            }
            Op::MaxPooling2d { pool_size } => {
                let x = inputs[0];
                expect_rank(node, x, 4)?;
                let p = *pool_size;
                Ok(Shape(vec![
                    x.dims()[0],
                    window_output(node, x.dims()[1], p, p, Padding::Valid)?,
                    window_output(node, x.dims()[2], p, p, Padding::Valid)?,
                    x.dims()[3],
                ]))
            }
            Op::UpSampling2d { size } => {
                let x = inputs[0];
                expect_rank(node, x, 4)?;
                let scale = |extent: Option<usize>| match extent {
                    Some(e) => e
                        .checked_mul(*size)
                        .map(Some)
                        .ok_or_else(|| GraphError::Overflow(node.to_string())),
                    None => Ok(None),
                };
                Ok(Shape(vec![
                    x.dims()[0],
                    scale(x.dims()[1])?,
                    scale(x.dims()[2])?,
                    x.dims()[3],
                ]))
            }
            Op::Dropout { .. } | Op::Activation(_) => Ok(inputs[0].clone()),
            Op::Concatenate { axis } => concatenated_shape(node, inputs, *axis),
        }
    }

    /// Trainable tensors of this operation, given the shapes of its inputs.
    pub fn parameter_specs(&self, node: &str, inputs: &[&Shape]) -> GraphResult<Vec<ParamSpec>> {
        self.check_arity(node, inputs.len())?;
        let specs = match self {
            Op::Conv2d {
                filters,
                kernel_size,
                initializer,
                ..
            } => {
                let channels = known_channels(node, inputs[0], 3)?;
                let [kh, kw] = *kernel_size;
                vec![
                    ParamSpec::new(node, "kernel", vec![kh, kw, channels, *filters], *initializer),
                    ParamSpec::new(node, "bias", vec![*filters], Initializer::Zeros),
                ]
            }
            Op::Conv3d {
                filters,
                kernel_size,
                data_format,
                initializer,
                ..
            } => {
                let (_, channel) = conv3d_axes(*data_format);
                let channels = known_channels(node, inputs[0], channel)?;
                let [kd, kh, kw] = *kernel_size;
                vec![
                    ParamSpec::new(
                        node,
                        "kernel",
                        vec![kd, kh, kw, channels, *filters],
                        *initializer,
                    ),
                    ParamSpec::new(node, "bias", vec![*filters], Initializer::Zeros),
                ]
            }
            Op::ConvLstm2d {
                filters,
                kernel_size,
                initializer,
                kernel_regularizer,
                ..
            } => {
                let channels = known_channels(node, inputs[0], 4)?;
                let [kh, kw] = *kernel_size;
                let gates = 4 * filters;
                let mut kernel =
                    ParamSpec::new(node, "kernel", vec![kh, kw, channels, gates], *initializer);
                kernel.l2 = *kernel_regularizer;
                vec![
                    kernel,
                    ParamSpec::new(
                        node,
                        "recurrent_kernel",
                        vec![kh, kw, *filters, gates],
                        Initializer::Orthogonal,
                    ),
                    ParamSpec::new(node, "bias", vec![gates], Initializer::UnitForgetBias),
                ]
            }
            _ => Vec::new(),
        };
        for spec in &specs {
            checked_size(node, &spec.shape)?;
        }
        Ok(specs)
    }
}

fn concatenated_shape(node: &str, inputs: &[&Shape], axis: usize) -> GraphResult<Shape> {
    let first = inputs[0];
    if axis >= first.rank() {
        return Err(GraphError::RankMismatch {
            node: node.to_string(),
            expected: axis + 1,
            found: first.clone(),
        });
    }

    let mut dims = first.dims().to_vec();
    for other in &inputs[1..] {
        expect_rank(node, other, first.rank())?;
        for (d, (merged, next)) in dims.iter_mut().zip(other.dims()).enumerate() {
            if d == axis {
                *merged = match (*merged, *next) {
                    (Some(a), Some(b)) => Some(
                        a.checked_add(b)
                            .ok_or_else(|| GraphError::Overflow(node.to_string()))?,
                    ),
                    _ => None,
                };
                continue;
            }
            *merged = match (*merged, *next) {
                (Some(a), Some(b)) if a != b => {
                    return Err(GraphError::ShapeMismatch {
                        node: node.to_string(),
                        left: first.clone(),
                        right: (*other).clone(),
                        axis: d,
                    })
                }
                (Some(a), _) => Some(a),
                (None, b) => b,
            };
        }
    }
    Ok(Shape(dims))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<String>,
}

/// An immutable network topology with a single input and a single output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    output: String,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Shape the graph input is declared with.
    pub fn input_shape(&self) -> GraphResult<&Shape> {
        match self.nodes.first() {
            Some(Node {
                op: Op::Input { shape },
                ..
            }) => Ok(shape),
            _ => Err(GraphError::MissingInput),
        }
    }

    /// Checks the structure of the graph: one input node at the front, unique names,
    /// inputs defined before use, the right number of inputs per operation and a known
    /// output. Graphs from the builder are always valid, deserialized ones should be
    /// checked with this.
    pub fn validate(&self) -> GraphResult<()> {
        self.input_shape()?;
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if matches!(node.op, Op::Input { .. }) && !seen.is_empty() {
                return Err(GraphError::MissingInput);
            }
            node.op.check_arity(&node.name, node.inputs.len())?;
            node.op.check_hyperparameters(&node.name)?;
            for input in &node.inputs {
                if !seen.contains(input.as_str()) {
                    return Err(GraphError::UnknownInput {
                        node: node.name.clone(),
                        input: input.clone(),
                    });
                }
            }
            if !seen.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }
        if !seen.contains(self.output.as_str()) {
            return Err(GraphError::UnknownNode(self.output.clone()));
        }
        Ok(())
    }

    /// For every node, the positions of its inputs in the node list.
    pub(crate) fn input_indices(&self) -> GraphResult<Vec<Vec<usize>>> {
        let mut positions = HashMap::new();
        let mut indices = Vec::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            let node_inputs = node
                .inputs
                .iter()
                .map(|input| {
                    positions
                        .get(input.as_str())
                        .copied()
                        .ok_or_else(|| GraphError::UnknownInput {
                            node: node.name.clone(),
                            input: input.clone(),
                        })
                })
                .collect::<GraphResult<Vec<usize>>>()?;
            indices.push(node_inputs);
            positions.insert(node.name.as_str(), i);
        }
        Ok(indices)
    }

    pub(crate) fn output_index(&self) -> GraphResult<usize> {
        self.nodes
            .iter()
            .position(|n| n.name == self.output)
            .ok_or_else(|| GraphError::UnknownNode(self.output.clone()))
    }

    /// Propagates the given input shape through the graph and returns the output shape of
    /// every node, in node order. Dimensions the declared input fixes have to agree with
    /// `input`; dimensions left open by both stay open.
    pub fn infer_shapes(&self, input: &Shape) -> GraphResult<Vec<Shape>> {
        let declared = self.input_shape()?;
        let actual = declared
            .refine(input)
            .ok_or_else(|| GraphError::InputShape {
                expected: declared.clone(),
                found: input.clone(),
            })?;

        let input_indices = self.input_indices()?;
        let mut shapes: Vec<Shape> = Vec::with_capacity(self.nodes.len());
        for (node, indices) in self.nodes.iter().zip(input_indices.iter()) {
            let shape = match &node.op {
                Op::Input { .. } => actual.clone(),
                op => {
                    let inputs: Vec<&Shape> = indices.iter().map(|&i| &shapes[i]).collect();
                    op.output_shape(&node.name, &inputs)?
                }
            };
            shapes.push(shape);
        }
        Ok(shapes)
    }

    pub fn output_shape(&self, input: &Shape) -> GraphResult<Shape> {
        let index = self.output_index()?;
        let mut shapes = self.infer_shapes(input)?;
        Ok(shapes.swap_remove(index))
    }

    /// All trainable tensors of the graph, in node order.
    pub fn parameter_specs(&self) -> GraphResult<Vec<ParamSpec>> {
        let shapes = self.infer_shapes(self.input_shape()?)?;
        let input_indices = self.input_indices()?;
        let mut specs = Vec::new();
        for (node, indices) in self.nodes.iter().zip(input_indices.iter()) {
            let inputs: Vec<&Shape> = indices.iter().map(|&i| &shapes[i]).collect();
            specs.extend(node.op.parameter_specs(&node.name, &inputs)?);
        }
        Ok(specs)
    }

    pub fn parameter_count(&self) -> GraphResult<usize> {
        self.parameter_specs()?
            .iter()
            .try_fold(0usize, |total, spec| total.checked_add(spec.size()))
            .ok_or_else(|| GraphError::Overflow(self.name.clone()))
    }

    /// Layer by layer overview of the graph for the given input shape.
    pub fn summary(&self, input: &Shape) -> GraphResult<Summary> {
        let shapes = self.infer_shapes(input)?;
        let input_indices = self.input_indices()?;
        let mut layers = Vec::with_capacity(self.nodes.len());
        for ((node, indices), shape) in self.nodes.iter().zip(input_indices.iter()).zip(shapes.iter())
        {
            let inputs: Vec<&Shape> = indices.iter().map(|&i| &shapes[i]).collect();
            let parameters = node
                .op
                .parameter_specs(&node.name, &inputs)?
                .iter()
                .map(ParamSpec::size)
                .sum();
            layers.push(LayerSummary {
                name: node.name.clone(),
                kind: node.op.kind(),
                output: shape.clone(),
                parameters,
                inputs: node.inputs.clone(),
            });
        }
        Ok(Summary {
            name: self.name.clone(),
            layers,
        })
    }

    pub fn to_json(&self) -> GraphResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads a graph written by [`Graph::to_json`] and validates it.
    pub fn from_json(json: &str) -> GraphResult<Graph> {
        let graph: Graph = serde_json::from_str(json)?;
        graph.validate()?;
        Ok(graph)
    }
}

pub struct LayerSummary {
    pub name: String,
    pub kind: &'static str,
    pub output: Shape,
    pub parameters: usize,
    pub inputs: Vec<String>,
}

pub struct Summary {
    pub name: String,
    pub layers: Vec<LayerSummary>,
}

impl Summary {
    pub fn total_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.parameters).sum()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model: \"{}\"", self.name)?;
        writeln!(
            f,
            "{:<28}{:<30}{:>12}  {}",
            "Layer (type)", "Output Shape", "Param #", "Connected to"
        )?;
        for layer in &self.layers {
            writeln!(
                f,
                "{:<28}{:<30}{:>12}  {}",
                format!("{} ({})", layer.name, layer.kind),
                layer.output.to_string(),
                layer.parameters,
                layer.inputs.join(", ")
            )?;
        }
        write!(f, "Total params: {}", self.total_parameters())
    }
}

/// Assembles a [`Graph`] node by node. Names have to be unique and inputs have to exist
/// when a node is added.
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn add(&mut self, name: &str, op: Op, inputs: &[&str]) -> GraphResult<String> {
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(GraphError::DuplicateNode(name.to_string()));
        }
        if let Some(missing) = inputs
            .iter()
            .find(|input| !self.nodes.iter().any(|n| n.name == **input))
        {
            return Err(GraphError::UnknownInput {
                node: name.to_string(),
                input: missing.to_string(),
            });
        }
        if matches!(op, Op::Input { .. }) != self.nodes.is_empty() {
            return Err(GraphError::MissingInput);
        }
        op.check_arity(name, inputs.len())?;
        op.check_hyperparameters(name)?;

        self.nodes.push(Node {
            name: name.to_string(),
            op,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        });
        Ok(name.to_string())
    }

    pub fn input(&mut self, name: &str, shape: Shape) -> GraphResult<String> {
        self.add(name, Op::Input { shape }, &[])
    }

    /// Same-padded square convolution with stride 1 and He-normal initialization.
    pub fn conv2d(
        &mut self,
        name: &str,
        input: &str,
        filters: usize,
        kernel_size: usize,
        activation: Activation,
    ) -> GraphResult<String> {
        let op = Op::Conv2d {
            filters,
            kernel_size: [kernel_size; 2],
            strides: 1,
            padding: Padding::Same,
            activation,
            initializer: Initializer::HeNormal,
        };
        self.add(name, op, &[input])
    }

    /// Same-padded cubic 3D convolution with stride 1 and Glorot-uniform initialization.
    pub fn conv3d(
        &mut self,
        name: &str,
        input: &str,
        filters: usize,
        kernel_size: usize,
        data_format: DataFormat,
        activation: Activation,
    ) -> GraphResult<String> {
        let op = Op::Conv3d {
            filters,
            kernel_size: [kernel_size; 3],
            strides: 1,
            padding: Padding::Same,
            data_format,
            activation,
            initializer: Initializer::GlorotUniform,
        };
        self.add(name, op, &[input])
    }

    /// Same-padded ConvLSTM returning full sequences, with keras' default activations
    /// and an L2 penalty on the input kernel.
    pub fn conv_lstm(
        &mut self,
        name: &str,
        input: &str,
        filters: usize,
        kernel_size: usize,
        l2: f32,
    ) -> GraphResult<String> {
        let op = Op::ConvLstm2d {
            filters,
            kernel_size: [kernel_size; 2],
            padding: Padding::Same,
            return_sequences: true,
            activation: Activation::Tanh,
            recurrent_activation: Activation::HardSigmoid,
            initializer: Initializer::HeNormal,
            kernel_regularizer: Some(l2),
        };
        self.add(name, op, &[input])
    }

    pub fn max_pooling(&mut self, name: &str, input: &str, pool_size: usize) -> GraphResult<String> {
        self.add(name, Op::MaxPooling2d { pool_size }, &[input])
    }

    pub fn upsampling(&mut self, name: &str, input: &str, size: usize) -> GraphResult<String> {
        self.add(name, Op::UpSampling2d { size }, &[input])
    }

    pub fn dropout(&mut self, name: &str, input: &str, rate: f32) -> GraphResult<String> {
        self.add(name, Op::Dropout { rate }, &[input])
    }

    pub fn concatenate(&mut self, name: &str, inputs: &[&str], axis: usize) -> GraphResult<String> {
        self.add(name, Op::Concatenate { axis }, inputs)
    }

    pub fn activation(
        &mut self,
        name: &str,
        input: &str,
        activation: Activation,
    ) -> GraphResult<String> {
        self.add(name, Op::Activation(activation), &[input])
    }

    pub fn finish(self, output: &str) -> GraphResult<Graph> {
        let graph = Graph {
            name: self.name,
            nodes: self.nodes,
            output: output.to_string(),
        };
        graph.validate()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_graph() -> Graph {
        let mut b = GraphBuilder::new("small");
        let x = b
            .input("x", Shape::new(vec![None, None, None, Some(2)]))
            .unwrap();
        let conv = b.conv2d("conv", &x, 4, 3, Activation::Relu).unwrap();
        let pool = b.max_pooling("pool", &conv, 2).unwrap();
        let up = b.upsampling("up", &pool, 2).unwrap();
        let cat = b.concatenate("cat", &[&up, &conv], 3).unwrap();
        b.finish(&cat).unwrap()
    }

    #[test]
    fn test_shape_display() {
        let shape = Shape::new(vec![None, Some(256), Some(256), Some(4)]);
        assert_eq!(shape.to_string(), "(None, 256, 256, 4)");
    }

    #[test]
    fn test_shape_refine() {
        let declared = Shape::new(vec![None, None, Some(4)]);
        assert_eq!(
            declared.refine(&Shape::from_concrete(&[2, 8, 4])),
            Some(Shape::from_concrete(&[2, 8, 4]))
        );
        assert_eq!(declared.refine(&Shape::from_concrete(&[2, 8, 3])), None);
        assert_eq!(declared.refine(&Shape::from_concrete(&[2, 8])), None);
        assert_eq!(
            declared.refine(&Shape::new(vec![Some(1), None, None])),
            Some(Shape::new(vec![Some(1), None, Some(4)]))
        );
    }

    #[test]
    fn test_infer_shapes() {
        let graph = small_graph();
        let shapes = graph
            .infer_shapes(&Shape::new(vec![Some(3), Some(8), Some(6), Some(2)]))
            .unwrap();
        assert_eq!(shapes[1], Shape::from_concrete(&[3, 8, 6, 4]));
        assert_eq!(shapes[2], Shape::from_concrete(&[3, 4, 3, 4]));
        assert_eq!(shapes[4], Shape::from_concrete(&[3, 8, 6, 8]));
    }

    #[test]
    fn test_infer_shapes_with_unknown_dims() {
        let graph = small_graph();
        let out = graph.output_shape(graph.input_shape().unwrap()).unwrap();
        assert_eq!(out, Shape::new(vec![None, None, None, Some(8)]));
    }

    #[test]
    fn test_concatenation_mismatch() {
        let graph = small_graph();
        // 7 rows pool to 3 and upsample to 6
        let err = graph
            .infer_shapes(&Shape::from_concrete(&[1, 7, 6, 2]))
            .unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { axis: 1, .. }));
    }

    #[test]
    fn test_input_shape_mismatch() {
        let graph = small_graph();
        assert!(matches!(
            graph.infer_shapes(&Shape::from_concrete(&[1, 8, 8, 3])),
            Err(GraphError::InputShape { .. })
        ));
        assert!(matches!(
            graph.infer_shapes(&Shape::from_concrete(&[8, 8, 2])),
            Err(GraphError::InputShape { .. })
        ));
    }

    #[test]
    fn test_parameter_specs() {
        let graph = small_graph();
        let specs = graph.parameter_specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "conv.kernel");
        assert_eq!(specs[0].shape, vec![3, 3, 2, 4]);
        assert_eq!(specs[1].name, "conv.bias");
        assert_eq!(graph.parameter_count().unwrap(), 3 * 3 * 2 * 4 + 4);
    }

    #[test]
    fn test_conv_lstm_shapes() {
        let mut b = GraphBuilder::new("lstm");
        let x = b
            .input("x", Shape::new(vec![None, Some(5), None, None, Some(3)]))
            .unwrap();
        let lstm = b.conv_lstm("lstm", &x, 2, 3, 0.01).unwrap();
        let graph = b.finish(&lstm).unwrap();

        let out = graph
            .output_shape(&Shape::new(vec![Some(2), Some(5), Some(10), Some(12), Some(3)]))
            .unwrap();
        assert_eq!(out, Shape::from_concrete(&[2, 5, 10, 12, 2]));

        let specs = graph.parameter_specs().unwrap();
        assert_eq!(specs[0].shape, vec![3, 3, 3, 8]);
        assert_eq!(specs[0].l2, Some(0.01));
        assert_eq!(specs[1].shape, vec![3, 3, 2, 8]);
        assert_eq!(specs[1].initializer, Initializer::Orthogonal);
        assert_eq!(specs[2].shape, vec![8]);
    }

    #[test]
    fn test_builder_rejects_bad_topologies() {
        let mut b = GraphBuilder::new("bad");
        assert!(matches!(
            b.conv2d("conv", "x", 4, 3, Activation::Relu),
            Err(GraphError::UnknownInput { .. })
        ));
        let x = b
            .input("x", Shape::new(vec![None, None, None, Some(1)]))
            .unwrap();
        assert!(matches!(
            b.input("y", Shape::new(vec![None])),
            Err(GraphError::MissingInput)
        ));
        b.conv2d("conv", &x, 4, 3, Activation::Relu).unwrap();
        assert!(matches!(
            b.conv2d("conv", &x, 4, 3, Activation::Relu),
            Err(GraphError::DuplicateNode(_))
        ));
        assert!(matches!(
            b.concatenate("cat", &["conv"], 3),
            Err(GraphError::Arity { .. })
        ));
        assert!(matches!(
            b.dropout("drop", "conv", 1.5),
            Err(GraphError::InvalidOperation { .. })
        ));
        assert!(matches!(
            b.finish("nowhere"),
            Err(GraphError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_spatial_too_small() {
        let mut b = GraphBuilder::new("tiny");
        let x = b
            .input("x", Shape::new(vec![None, None, None, Some(1)]))
            .unwrap();
        let pool = b.max_pooling("pool", &x, 2).unwrap();
        let graph = b.finish(&pool).unwrap();
        assert!(matches!(
            graph.infer_shapes(&Shape::from_concrete(&[1, 1, 4, 1])),
            Err(GraphError::SpatialTooSmall { .. })
        ));
    }

    #[test]
    fn test_deserialized_hyperparameters_are_bounded() {
        let json = small_graph().to_json().unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["nodes"][1]["op"]["conv2d"]["strides"] = serde_json::json!(u64::MAX);
        assert!(matches!(
            Graph::from_json(&value.to_string()),
            Err(GraphError::InvalidOperation { .. })
        ));

        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["nodes"][3]["op"]["up_sampling2d"]["size"] = serde_json::json!(1u64 << 40);
        assert!(matches!(
            Graph::from_json(&value.to_string()),
            Err(GraphError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_rejects_nan_coefficients() {
        let mut b = GraphBuilder::new("nan");
        let x = b
            .input("x", Shape::new(vec![None, None, None, None, Some(1)]))
            .unwrap();
        assert!(matches!(
            b.conv_lstm("lstm", &x, 2, 3, f32::NAN),
            Err(GraphError::InvalidOperation { .. })
        ));
        assert!(matches!(
            b.activation("act", &x, Activation::LeakyRelu { alpha: f32::NAN }),
            Err(GraphError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_oversized_dimensions_overflow() {
        let huge = usize::MAX / 2 + 1;
        assert!(matches!(
            small_graph().infer_shapes(&Shape::from_concrete(&[1, usize::MAX, 4, 2])),
            Err(GraphError::Overflow(_))
        ));

        let mut b = GraphBuilder::new("wide");
        let x = b
            .input("x", Shape::new(vec![None, None, None, None]))
            .unwrap();
        let up = b.upsampling("up", &x, 2).unwrap();
        let graph = b.finish(&up).unwrap();
        assert!(matches!(
            graph.infer_shapes(&Shape::from_concrete(&[1, huge, 1, 1])),
            Err(GraphError::Overflow(_))
        ));

        let mut b = GraphBuilder::new("deep");
        let x = b
            .input("x", Shape::new(vec![None, None, None, None]))
            .unwrap();
        let cat = b.concatenate("cat", &[&x, &x], 3).unwrap();
        let graph = b.finish(&cat).unwrap();
        assert!(matches!(
            graph.infer_shapes(&Shape::from_concrete(&[1, 1, 1, huge])),
            Err(GraphError::Overflow(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_and_validation() {
        let graph = small_graph();
        let json = graph.to_json().unwrap();
        assert_eq!(Graph::from_json(&json).unwrap(), graph);

        // renaming the input collides with the name of the last node
        let broken = json.replacen("\"x\"", "\"cat\"", 2);
        assert!(Graph::from_json(&broken).is_err());
    }

    #[test]
    fn test_summary() {
        let graph = small_graph();
        let summary = graph
            .summary(&Shape::new(vec![None, Some(8), Some(8), Some(2)]))
            .unwrap();
        assert_eq!(summary.layers.len(), 5);
        assert_eq!(summary.layers[1].kind, "Conv2D");
        assert_eq!(summary.total_parameters(), 76);
        let table = summary.to_string();
        assert!(table.contains("conv (Conv2D)"));
        assert!(table.contains("(None, 8, 8, 8)"));
        assert!(table.ends_with("Total params: 76"));
    }
}
