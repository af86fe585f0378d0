//! Hyperparameters of the nowcasting networks and the context passed into weight
//! initialization.
//!
//! Everything the builders need is carried explicitly here, there is no global state.
use serde_derive::{Deserialize, Serialize};
use std::{fs, path::Path};
use thiserror::Error;

use crate::{activation_functions::Activation, convolutions::DataFormat};

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} has to be larger than 0")]
    NotPositive(&'static str),
    #[error("Dropout rate has to lie in [0, 1), got {0}")]
    DropoutRate(f32),
    #[error("{0} may not be negative")]
    Negative(&'static str),
    #[error("Saving from within the builder is not supported, use Model::save_weights instead")]
    ModelSaveUnsupported,
    #[error("No value for {0} given")]
    MissingField(&'static str),
    #[error("Config file not readable. Filesystem reported error\n {0}.")]
    ConfigFileError(#[from] std::io::Error),
    #[error("Config file didn't have the correct format:\n {0}")]
    ConfigFormatError(#[from] serde_json::Error),
}

/// Activation of the last layer.
///
/// Regression predicts continuous intensities (linear output), segmentation predicts the
/// probability of exceeding an intensity threshold (sigmoid output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Regression,
    Segmentation,
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Regression
    }
}

impl OutputMode {
    pub fn activation(self) -> Activation {
        match self {
            OutputMode::Regression => Activation::Linear,
            OutputMode::Segmentation => Activation::Sigmoid,
        }
    }
}

/// Numeric constants of the layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConstants {
    /// Dropout rate after the deepest encoder stage and the bottleneck.
    pub dropout_rate: f32,
    /// Coefficient of the L2 penalty on the recurrent layers' input kernels.
    pub l2: f32,
    /// Negative slope of the leaky relu following each recurrent layer.
    pub leaky_alpha: f32,
}

impl Default for LayerConstants {
    fn default() -> Self {
        Self {
            dropout_rate: 0.5,
            l2: 0.01,
            leaky_alpha: 0.1,
        }
    }
}

fn default_start_neurons() -> usize {
    64
}

fn default_kernel_size() -> usize {
    3
}

/// The recurrent output is read with the time axis as channels, giving one output channel
/// per forecast step.
fn default_head_format() -> DataFormat {
    DataFormat::ChannelsFirst
}

/// Hyperparameter bundle shared by both architectures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of past radar scans fed into the network.
    pub look_back: usize,
    /// Number of future scans predicted.
    pub forecast: usize,
    /// Channels per scan. Only the recurrent network reads it.
    pub channels: usize,
    /// Number of filters of the shallowest stage.
    #[serde(default = "default_start_neurons")]
    pub start_neurons: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Layout in which the 3D head of the recurrent network reads the recurrent output.
    #[serde(default = "default_head_format")]
    pub head_format: DataFormat,
    /// Only `false` is accepted, persisting a model is up to the caller.
    #[serde(default)]
    pub model_save: bool,
    #[serde(default)]
    pub constants: LayerConstants,
}

impl ModelConfig {
    pub fn new(look_back: usize, forecast: usize, channels: usize) -> Self {
        Self {
            look_back,
            forecast,
            channels,
            start_neurons: default_start_neurons(),
            kernel_size: default_kernel_size(),
            output_mode: OutputMode::default(),
            head_format: default_head_format(),
            model_save: false,
            constants: LayerConstants::default(),
        }
    }

    pub fn with_start_neurons(mut self, start_neurons: usize) -> Self {
        self.start_neurons = start_neurons;
        self
    }

    pub fn with_kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    pub fn with_output_mode(mut self, output_mode: OutputMode) -> Self {
        self.output_mode = output_mode;
        self
    }

    pub fn with_head_format(mut self, head_format: DataFormat) -> Self {
        self.head_format = head_format;
        self
    }

    /// Reads a config from a JSON file. Omitted optional fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let raw_file = fs::read_to_string(path)?;
        let config: ModelConfig = serde_json::from_str(&raw_file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let sizes = [
            (self.look_back, "look_back"),
            (self.forecast, "forecast"),
            (self.channels, "channels"),
            (self.start_neurons, "start_neurons"),
            (self.kernel_size, "kernel_size"),
        ];
        for (value, name) in sizes.iter() {
            if *value == 0 {
                return Err(ConfigError::NotPositive(*name));
            }
        }
        if self.model_save {
            return Err(ConfigError::ModelSaveUnsupported);
        }

        let c = &self.constants;
        if !(0.0..1.0).contains(&c.dropout_rate) {
            return Err(ConfigError::DropoutRate(c.dropout_rate));
        }
        // written so that NaN is rejected too
        if !(c.l2 >= 0.0) {
            return Err(ConfigError::Negative("l2"));
        }
        if !(c.leaky_alpha >= 0.0) {
            return Err(ConfigError::Negative("leaky_alpha"));
        }
        Ok(())
    }
}

/// Caller supplied context for weight initialization. Two initializations with the same
/// context yield the same weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildContext {
    pub seed: u64,
}

impl BuildContext {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ModelConfig::new(4, 1, 1);
        assert_eq!(config.start_neurons, 64);
        assert_eq!(config.kernel_size, 3);
        assert_eq!(config.output_mode, OutputMode::Regression);
        assert_eq!(config.head_format, DataFormat::ChannelsFirst);
        assert_eq!(config.constants.dropout_rate, 0.5);
        assert_eq!(config.constants.l2, 0.01);
        assert_eq!(config.constants.leaky_alpha, 0.1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_model_save() {
        let mut config = ModelConfig::new(4, 1, 1);
        config.model_save = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ModelSaveUnsupported)
        ));
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let config = ModelConfig::new(4, 0, 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive("forecast"))
        ));
        let config = ModelConfig::new(4, 1, 1).with_kernel_size(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive("kernel_size"))
        ));
    }

    #[test]
    fn test_rejects_bad_dropout() {
        let mut config = ModelConfig::new(4, 1, 1);
        config.constants.dropout_rate = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DropoutRate(_))
        ));
    }

    #[test]
    fn test_rejects_nan_constants() {
        let mut config = ModelConfig::new(4, 1, 1);
        config.constants.l2 = f32::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Negative("l2"))
        ));
        let mut config = ModelConfig::new(4, 1, 1);
        config.constants.leaky_alpha = f32::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Negative("leaky_alpha"))
        ));
    }

    #[test]
    fn test_json_config() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.json");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "{{ \"look_back\": 6, \"forecast\": 3, \"channels\": 1, \"start_neurons\": 16, \
             \"output_mode\": \"segmentation\", \"constants\": {{ \"l2\": 0.001 }} }}"
        )
        .unwrap();

        let config = ModelConfig::from_json_file(&file_path).unwrap();
        assert_eq!(config.look_back, 6);
        assert_eq!(config.start_neurons, 16);
        assert_eq!(config.kernel_size, 3);
        assert_eq!(config.output_mode, OutputMode::Segmentation);
        assert_eq!(config.constants.l2, 0.001);
        assert_eq!(config.constants.dropout_rate, 0.5);

        drop(file);
        dir.close().unwrap();
    }

    #[test]
    fn test_json_config_missing_field() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.json");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "{{ \"look_back\": 6 }}").unwrap();

        assert!(matches!(
            ModelConfig::from_json_file(&file_path),
            Err(ConfigError::ConfigFormatError(_))
        ));

        drop(file);
        dir.close().unwrap();
    }
}
