//! The two nowcasting networks and the runnable [`Model`].
//!
//! [`rainnet`] and [`convlstm`] only describe topologies. A [`Model`] binds such a
//! graph to its parameters (freshly initialized, loaded or given) and runs it.
use log::{debug, info, trace};
use ndarray::*;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use serde_derive::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};

use crate::{
    activation_functions::Activation,
    config::{BuildContext, ModelConfig},
    convolutions::{Convolution3dLayer, ConvolutionLayer},
    graph::{Graph, GraphBuilder, Op, Shape, Summary},
    pooling::{MaxPoolingLayer, UpSamplingLayer},
    recurrent::ConvLstmLayer,
    regularization::{l2_penalty, DropoutLayer},
    weight_loader::{write_npz, WeightLoader},
    GraphError, GraphResult, Tensor, WeightPrecision,
};

pub use crate::weight_loader::Parameters;

/// Channel axis of the 4D feature maps in the U-Net.
const CHANNEL_AXIS: usize = 3;

/// Two same-padded relu convolutions named `<stage>f` and `<stage>s`; returns the second.
fn double_convolution(
    builder: &mut GraphBuilder,
    stage: &str,
    input: &str,
    filters: usize,
    kernel_size: usize,
) -> GraphResult<String> {
    let first = builder.conv2d(
        &format!("{}f", stage),
        input,
        filters,
        kernel_size,
        Activation::Relu,
    )?;
    builder.conv2d(
        &format!("{}s", stage),
        &first,
        filters,
        kernel_size,
        Activation::Relu,
    )
}

/// RainNet, a U-Net for radar nowcasting.
/// Ayzel, Scheffer, Heistermann 2020, <https://doi.org/10.5194/gmd-13-2631-2020>
///
/// Input (batch, height, width, look_back), output (batch, height, width, forecast).
/// Height and width stay open but have to be divisible by 16 for the skip connections to
/// line up. The encoder doubles the filters at each of its four stages starting from
/// `start_neurons`, the decoder mirrors it.
pub fn rainnet(config: &ModelConfig) -> GraphResult<Graph> {
    config.validate()?;
    let n = config.start_neurons;
    let k = config.kernel_size;
    let rate = config.constants.dropout_rate;
    let mut b = GraphBuilder::new("rainnet");

    let mut x = b.input(
        "inputs",
        Shape::new(vec![None, None, None, Some(config.look_back)]),
    )?;

    let mut skips = Vec::with_capacity(4);
    for stage in 1..=4 {
        let conv = double_convolution(&mut b, &format!("conv{}", stage), &x, n << (stage - 1), k)?;
        let pool_input = if stage == 4 {
            b.dropout("drop4", &conv, rate)?
        } else {
            conv.clone()
        };
        x = b.max_pooling(&format!("pool{}", stage), &pool_input, 2)?;
        skips.push(conv);
    }

    let bottleneck = double_convolution(&mut b, "conv5", &x, n << 4, k)?;
    x = b.dropout("drop5", &bottleneck, rate)?;

    for (stage, skip) in (6..=9).zip(skips.iter().rev()) {
        let upsampled = b.upsampling(&format!("up{}_upsampling", stage), &x, 2)?;
        let merged = b.concatenate(
            &format!("up{}", stage),
            &[upsampled.as_str(), skip.as_str()],
            CHANNEL_AXIS,
        )?;
        x = double_convolution(&mut b, &format!("conv{}", stage), &merged, n << (9 - stage), k)?;
    }

    let outputs = b.conv2d(
        "outputs",
        &x,
        config.forecast,
        1,
        config.output_mode.activation(),
    )?;
    let graph = b.finish(&outputs)?;
    debug!("Built rainnet with {} nodes", graph.nodes().len());
    Ok(graph)
}

/// Stack of four ConvLSTM layers with leaky relu in between, followed by a 3D convolution.
///
/// Input (batch, look_back, height, width, channels). The layers have `start_neurons`,
/// twice, twice and one filter(s) and all return full sequences. The head convolves with
/// `forecast` filters in `head_format`; with channels first the time axis acts as the
/// channel axis and the output is (batch, forecast, height, width, 1).
pub fn convlstm(config: &ModelConfig) -> GraphResult<Graph> {
    config.validate()?;
    let n = config.start_neurons;
    let c = &config.constants;
    let mut b = GraphBuilder::new("convlstm");

    let mut x = b.input(
        "inputs",
        Shape::new(vec![
            None,
            Some(config.look_back),
            None,
            None,
            Some(config.channels),
        ]),
    )?;

    for (i, &filters) in [n, 2 * n, 2 * n, 1].iter().enumerate() {
        let name = format!("convlstm{}", i + 1);
        let lstm = b.conv_lstm(&name, &x, filters, config.kernel_size, c.l2)?;
        x = b.activation(
            &format!("{}_leaky_relu", name),
            &lstm,
            Activation::LeakyRelu {
                alpha: c.leaky_alpha,
            },
        )?;
    }

    let predict = b.conv3d(
        "predict",
        &x,
        config.forecast,
        3,
        config.head_format,
        config.output_mode.activation(),
    )?;
    let graph = b.finish(&predict)?;
    debug!("Built convlstm with {} nodes", graph.nodes().len());
    Ok(graph)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Rainnet,
    Convlstm,
}

impl Architecture {
    pub fn build(self, config: &ModelConfig) -> GraphResult<Graph> {
        match self {
            Architecture::Rainnet => rainnet(config),
            Architecture::Convlstm => convlstm(config),
        }
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rainnet" => Ok(Architecture::Rainnet),
            "convlstm" => Ok(Architecture::Convlstm),
            other => Err(format!(
                "Unknown architecture {}, expected rainnet or convlstm",
                other
            )),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Rainnet => write!(f, "rainnet"),
            Architecture::Convlstm => write!(f, "convlstm"),
        }
    }
}

/// A node of the graph, ready to run.
enum Layer {
    Input,
    Convolution(ConvolutionLayer, Activation),
    Convolution3d(Convolution3dLayer, Activation),
    ConvLstm(ConvLstmLayer),
    MaxPooling(MaxPoolingLayer),
    UpSampling(UpSamplingLayer),
    Dropout(DropoutLayer),
    Concatenate(Axis),
    Activation(Activation),
}

fn parameter<D: Dimension>(
    parameters: &Parameters,
    node: &str,
    tensor: &str,
) -> GraphResult<Array<WeightPrecision, D>> {
    let name = format!("{}.{}", node, tensor);
    let weights = parameters
        .get(&name)
        .ok_or(GraphError::MissingParameter(name))?;
    Ok(weights.clone().into_dimensionality::<D>()?)
}

impl Layer {
    fn compile(name: &str, op: &Op, parameters: &Parameters) -> GraphResult<Layer> {
        let layer = match op {
            Op::Input { .. } => Layer::Input,
            Op::Conv2d {
                strides,
                padding,
                activation,
                ..
            } => Layer::Convolution(
                ConvolutionLayer::new(
                    parameter(parameters, name, "kernel")?,
                    parameter(parameters, name, "bias")?,
                    *strides,
                    *padding,
                )?,
                *activation,
            ),
            Op::Conv3d {
                strides,
                padding,
                data_format,
                activation,
                ..
            } => Layer::Convolution3d(
                Convolution3dLayer::new(
                    parameter(parameters, name, "kernel")?,
                    parameter(parameters, name, "bias")?,
                    *strides,
                    *padding,
                    *data_format,
                )?,
                *activation,
            ),
            Op::ConvLstm2d {
                padding,
                return_sequences,
                activation,
                recurrent_activation,
                ..
            } => Layer::ConvLstm(ConvLstmLayer::new(
                parameter(parameters, name, "kernel")?,
                parameter(parameters, name, "recurrent_kernel")?,
                parameter(parameters, name, "bias")?,
                *padding,
                *activation,
                *recurrent_activation,
                *return_sequences,
            )?),
            Op::MaxPooling2d { pool_size } => Layer::MaxPooling(MaxPoolingLayer::new(*pool_size)),
            Op::UpSampling2d { size } => Layer::UpSampling(UpSamplingLayer::new(*size)),
            Op::Dropout { rate } => Layer::Dropout(DropoutLayer::new(*rate)),
            Op::Concatenate { axis } => Layer::Concatenate(Axis(*axis)),
            Op::Activation(activation) => Layer::Activation(*activation),
        };
        Ok(layer)
    }

    fn apply(
        &self,
        args: &[&Tensor],
        input: &Tensor,
        rng: Option<&mut dyn RngCore>,
    ) -> GraphResult<Tensor> {
        let output = match self {
            Layer::Input => input.clone(),
            Layer::Convolution(conv, activation) => {
                let x = args[0].view().into_dimensionality::<Ix4>()?;
                activation.activate_inplace(conv.convolve(x)?).into_dyn()
            }
            Layer::Convolution3d(conv, activation) => {
                let x = args[0].view().into_dimensionality::<Ix5>()?;
                activation.activate_inplace(conv.convolve(x)?).into_dyn()
            }
            Layer::ConvLstm(lstm) => lstm.forward(args[0].view().into_dimensionality::<Ix5>()?)?,
            Layer::MaxPooling(pool) => pool
                .pool(args[0].view().into_dimensionality::<Ix4>()?)
                .into_dyn(),
            Layer::UpSampling(up) => up
                .upsample(args[0].view().into_dimensionality::<Ix4>()?)
                .into_dyn(),
            Layer::Dropout(dropout) => match rng {
                Some(rng) => dropout.forward_training(args[0].clone(), rng),
                None => dropout.forward(args[0].clone()),
            },
            Layer::Concatenate(axis) => {
                let views: Vec<_> = args.iter().map(|a| a.view()).collect();
                concatenate(*axis, &views)?
            }
            Layer::Activation(activation) => activation.activate(args[0]),
        };
        Ok(output)
    }
}

/// A graph bound to its parameters.
///
/// Construction checks that every parameter the graph needs is present with the expected
/// shape, so a model that exists can always run on inputs that fit its graph.
pub struct Model {
    graph: Graph,
    parameters: Parameters,
    layers: Vec<Layer>,
    inputs: Vec<Vec<usize>>,
    /// Index of the last node reading each node's output
    last_use: Vec<usize>,
    output: usize,
    /// (parameter name, L2 coefficient)
    penalties: Vec<(String, f32)>,
}

impl Model {
    pub fn new(graph: Graph, parameters: Parameters) -> GraphResult<Model> {
        graph.validate()?;
        let specs = graph.parameter_specs()?;
        for spec in &specs {
            let weights = parameters
                .get(&spec.name)
                .ok_or_else(|| GraphError::MissingParameter(spec.name.clone()))?;
            if weights.shape() != spec.shape.as_slice() {
                return Err(GraphError::ParameterShape {
                    name: spec.name.clone(),
                    expected: spec.shape.clone(),
                    found: weights.shape().to_vec(),
                });
            }
        }

        let layers = graph
            .nodes()
            .iter()
            .map(|node| {
                trace!("Compiling {} ({})", node.name, node.op.kind());
                Layer::compile(&node.name, &node.op, &parameters)
            })
            .collect::<GraphResult<Vec<_>>>()?;
        let inputs = graph.input_indices()?;
        let output = graph.output_index()?;

        let mut last_use: Vec<usize> = (0..inputs.len()).collect();
        for (consumer, node_inputs) in inputs.iter().enumerate() {
            for &i in node_inputs {
                last_use[i] = consumer;
            }
        }

        let penalties = specs
            .into_iter()
            .filter_map(|spec| spec.l2.map(|l2| (spec.name, l2)))
            .collect();

        Ok(Model {
            graph,
            parameters,
            layers,
            inputs,
            last_use,
            output,
            penalties,
        })
    }

    /// Initializes all parameters of the graph from the seed in `context`.
    pub fn initialize(graph: Graph, context: &BuildContext) -> GraphResult<Model> {
        let mut rng = StdRng::seed_from_u64(context.seed);
        let parameters: Parameters = graph
            .parameter_specs()?
            .into_iter()
            .map(|spec| {
                let weights = spec.initializer.initialize(&spec.shape, &mut rng)?;
                Ok((spec.name, weights))
            })
            .collect::<GraphResult<_>>()?;
        info!(
            "Initialized {} ({} parameters) with seed {}",
            graph.name(),
            parameters.values().map(|w| w.len()).sum::<usize>(),
            context.seed
        );
        Model::new(graph, parameters)
    }

    pub fn from_loader<L: WeightLoader>(graph: Graph, loader: &mut L) -> GraphResult<Model> {
        let mut parameters = Parameters::new();
        for spec in graph.parameter_specs()? {
            let weights = loader.get_weight(&spec.name, &spec.shape)?;
            parameters.insert(spec.name, weights);
        }
        info!("Loaded {} parameter tensors for {}", parameters.len(), graph.name());
        Model::new(graph, parameters)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.values().map(|w| w.len()).sum()
    }

    pub fn summary(&self, input: &Shape) -> GraphResult<Summary> {
        self.graph.summary(input)
    }

    /// Inference: dropout is the identity.
    pub fn forward_pass(&self, input: &Tensor) -> GraphResult<Tensor> {
        self.run(input, None)
    }

    /// Training mode forward pass: dropout layers draw their masks from `rng`.
    pub fn forward_pass_training<R: RngCore>(
        &self,
        input: &Tensor,
        rng: &mut R,
    ) -> GraphResult<Tensor> {
        self.run(input, Some(rng))
    }

    /// Sum of the L2 penalties of all regularized parameters.
    pub fn regularization_loss(&self) -> f32 {
        self.penalties
            .iter()
            .filter_map(|(name, l2)| self.parameters.get(name).map(|w| l2_penalty(w, *l2)))
            .sum()
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> GraphResult<()> {
        write_npz(path, &self.parameters)?;
        Ok(())
    }

    fn run(&self, input: &Tensor, mut rng: Option<&mut dyn RngCore>) -> GraphResult<Tensor> {
        // fails early, before any numeric work, if the input doesn't fit
        let shapes = self.graph.infer_shapes(&Shape::from_concrete(input.shape()))?;

        let mut values: Vec<Option<Tensor>> = vec![None; self.layers.len()];
        for (i, (layer, node)) in self.layers.iter().zip(self.graph.nodes()).enumerate() {
            let output = {
                let args = self.inputs[i]
                    .iter()
                    .map(|&j| {
                        values[j]
                            .as_ref()
                            .ok_or_else(|| GraphError::UnknownNode(self.graph.nodes()[j].name.clone()))
                    })
                    .collect::<GraphResult<Vec<_>>>()?;
                let rng = rng.as_mut().map(|r| &mut **r as &mut dyn RngCore);
                layer.apply(&args, input, rng)?
            };
            debug!("{} ({}): {:?}", node.name, node.op.kind(), output.shape());
            debug_assert_eq!(Shape::from_concrete(output.shape()), shapes[i]);

            for &j in &self.inputs[i] {
                if self.last_use[j] == i && j != self.output {
                    values[j] = None;
                }
            }
            values[i] = Some(output);
        }

        values[self.output]
            .take()
            .ok_or_else(|| GraphError::UnknownNode(self.graph.output().to_string()))
    }
}
