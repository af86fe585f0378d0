//! Command line interface to the nowcasting networks: inspect a topology, initialize
//! weights and run forecasts on radar frames.

use env_logger::Builder;
use log::{debug, info};
use ml::{
    config::{BuildContext, ConfigError, ModelConfig},
    graph::Graph,
    models::{Architecture, Model},
    weight_loader::{write_json, JsonWeightLoader, NpzWeightLoader},
};
use ndarray_npy::write_npy;
use nowcast::{
    check_graph_flags, export_graph, extension, load_graph, load_input, save_frames,
    with_spatial_size, NowcastResult,
};
use quicli::prelude::*;
use std::path::PathBuf;
use structopt::StructOpt;

/// Selects the network: an architecture with its configuration, or an exported graph
#[derive(Debug, StructOpt)]
struct ModelOpts {
    /// Architecture to build, rainnet (default) or convlstm
    #[structopt(short = "m", long = "model")]
    model: Option<Architecture>,
    /// JSON file with the model configuration. Flags below override its values.
    /// output_mode, head_format and the layer constants can only be set here
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<PathBuf>,
    /// Graph exported with `summary --export` (.json or .bin), used instead of building one.
    /// Can't be combined with the flags that describe the network
    #[structopt(short = "g", long = "graph", parse(from_os_str))]
    graph: Option<PathBuf>,
    /// Number of past frames fed to the network
    #[structopt(long = "look-back")]
    look_back: Option<usize>,
    /// Number of frames to predict
    #[structopt(long = "forecast")]
    forecast: Option<usize>,
    /// Channels per frame (ConvLSTM only)
    #[structopt(long = "channels")]
    channels: Option<usize>,
    /// Filters of the first layer
    #[structopt(long = "start-neurons")]
    start_neurons: Option<usize>,
    #[structopt(long = "kernel-size")]
    kernel_size: Option<usize>,
}

impl ModelOpts {
    fn config(&self) -> NowcastResult<ModelConfig> {
        let mut config = match &self.config {
            Some(path) => ModelConfig::from_json_file(path)?,
            None => ModelConfig::new(
                self.look_back.ok_or(ConfigError::MissingField("look_back"))?,
                self.forecast.ok_or(ConfigError::MissingField("forecast"))?,
                self.channels.unwrap_or(1),
            ),
        };
        if let Some(look_back) = self.look_back {
            config.look_back = look_back;
        }
        if let Some(forecast) = self.forecast {
            config.forecast = forecast;
        }
        if let Some(channels) = self.channels {
            config.channels = channels;
        }
        if let Some(start_neurons) = self.start_neurons {
            config.start_neurons = start_neurons;
        }
        if let Some(kernel_size) = self.kernel_size {
            config.kernel_size = kernel_size;
        }
        config.validate()?;
        Ok(config)
    }

    fn graph(&self) -> NowcastResult<Graph> {
        match &self.graph {
            Some(path) => {
                check_graph_flags(&[
                    ("--model", self.model.is_some()),
                    ("--config", self.config.is_some()),
                    ("--look-back", self.look_back.is_some()),
                    ("--forecast", self.forecast.is_some()),
                    ("--channels", self.channels.is_some()),
                    ("--start-neurons", self.start_neurons.is_some()),
                    ("--kernel-size", self.kernel_size.is_some()),
                ])?;
                load_graph(path)
            }
            None => {
                let config = self.config()?;
                let model = self.model.unwrap_or(Architecture::Rainnet);
                info!("Building {} from {:?}", model, config);
                Ok(model.build(&config)?)
            }
        }
    }
}

/// Prints the layers of a network with their output shapes and parameter counts
#[derive(Debug, StructOpt)]
struct SummaryOpts {
    #[structopt(flatten)]
    model: ModelOpts,
    /// Frame height to infer shapes for
    #[structopt(long = "height")]
    height: Option<usize>,
    /// Frame width to infer shapes for
    #[structopt(long = "width")]
    width: Option<usize>,
    /// Writes the graph description to this file (.json or .bin)
    #[structopt(short = "e", long = "export", parse(from_os_str))]
    export: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Writes freshly initialized weights of a network
#[derive(Debug, StructOpt)]
struct InitOpts {
    #[structopt(flatten)]
    model: ModelOpts,
    /// Seed of the weight initialization
    #[structopt(short = "s", long = "seed", default_value = "0")]
    seed: u64,
    /// Output path, .npz or .json
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: PathBuf,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Predicts future frames from past ones
#[derive(Debug, StructOpt)]
struct PredictOpts {
    #[structopt(flatten)]
    model: ModelOpts,
    /// Weights of the network, .npz or .json
    #[structopt(short = "w", long = "weights", parse(from_os_str))]
    weights: PathBuf,
    /// One .npy array or the past frames as images, oldest first
    #[structopt(parse(from_os_str))]
    inputs: Vec<PathBuf>,
    /// Output path of the forecast (.npy)
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: PathBuf,
    /// Additionally saves every forecast frame as PNG next to the output
    #[structopt(long = "png")]
    png: bool,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Precipitation nowcasting with neural networks.
#[derive(Debug, StructOpt)]
#[structopt(name = "nowcast")]
enum Nowcast {
    #[structopt(
        name = "summary",
        about = "Prints the layers of a network and optionally exports its graph."
    )]
    Summary(SummaryOpts),
    #[structopt(name = "init", about = "Writes randomly initialized weights of a network.")]
    Init(InitOpts),
    #[structopt(
        name = "predict",
        about = "Runs a network on past radar frames and writes the forecast."
    )]
    Predict(PredictOpts),
}

/// Trait for the subcommands that nowcast uses
trait NowcastOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

impl NowcastOpts for SummaryOpts {
    fn run(&self) -> CliResult {
        let graph = self.model.graph()?;
        let input = with_spatial_size(graph.input_shape()?, self.height, self.width);
        println!("{}", graph.summary(&input)?);

        if let Some(path) = &self.export {
            export_graph(&graph, path)?;
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl NowcastOpts for InitOpts {
    fn run(&self) -> CliResult {
        let graph = self.model.graph()?;
        let model = Model::initialize(graph, &BuildContext::new(self.seed))?;

        match extension(&self.output).as_str() {
            "json" => write_json(&self.output, model.parameters())?,
            _ => model.save_weights(&self.output)?,
        }
        info!(
            "Wrote {} parameters to {}",
            model.parameter_count(),
            self.output.display()
        );
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl NowcastOpts for PredictOpts {
    fn run(&self) -> CliResult {
        let graph = self.model.graph()?;
        let model = match extension(&self.weights).as_str() {
            "json" => Model::from_loader(graph, &mut JsonWeightLoader::new(&self.weights)?)?,
            _ => Model::from_loader(graph, &mut NpzWeightLoader::from_path(&self.weights)?)?,
        };

        let input = load_input(&self.inputs, model.graph().input_shape()?)?;
        info!("Predicting from input of shape {:?}", input.shape());
        let forecast = model.forward_pass(&input)?;

        write_npy(&self.output, &forecast)?;
        info!(
            "Wrote forecast of shape {:?} to {}",
            forecast.shape(),
            self.output.display()
        );
        if self.png {
            for path in save_frames(&forecast, &self.output)? {
                debug!("Wrote {}", path.display());
            }
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl NowcastOpts for Nowcast {
    fn run(&self) -> CliResult {
        match self {
            Nowcast::Summary(c) => c.run(),
            Nowcast::Init(c) => c.run(),
            Nowcast::Predict(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            Nowcast::Summary(c) => c.get_verbosity(),
            Nowcast::Init(c) => c.get_verbosity(),
            Nowcast::Predict(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = Nowcast::from_args();
    args.setup_env_logger()?;
    args.run()
}
