use crate::WeightPrecision;
use ndarray::{ArrayD, IxDyn, ShapeError};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use serde_json::{self, Map, Value};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek};
use std::{fs, path::Path};
use thiserror::Error;

pub type WeightResult<T> = Result<T, WeightError>;

/// Trainable tensors of a model, keyed by `<node>.<tensor>`.
pub type Parameters = BTreeMap<String, ArrayD<WeightPrecision>>;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("No weights with name {0} found")]
    WeightKeyError(String),
    #[error("Weight file didn't have the correct format (required: JSON dict of pairs (key, flattened array of weights))")]
    WeightFormatError,
    #[error("Weight file not found. Filesystem reported error\n {0}.")]
    WeightFileNotFoundError(#[from] std::io::Error),
    #[error("Weight file not readable. Filesystem reported error\n {0}.")]
    WeightFileNpzError(#[from] ReadNpzError),
    #[error("Weight file not writable. Filesystem reported error\n {0}.")]
    WeightFileNpzWriteError(#[from] WriteNpzError),
    #[error("Wrong shape for weight {name}: expected {expected:?}, found {found:?}.")]
    WeightShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Wrong shape for weight:\n {0}.")]
    WeightShapeError(#[from] ShapeError),
}

/// Source of named weight tensors. Loaders check the stored shape against the shape the
/// model expects, a mismatch is an error and never silently reshaped.
pub trait WeightLoader {
    fn get_weight(
        &mut self,
        param_name: &str,
        shape: &[usize],
    ) -> WeightResult<ArrayD<WeightPrecision>>;
}

pub struct JsonWeightLoader {
    content: Map<String, Value>,
}

impl JsonWeightLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> WeightResult<JsonWeightLoader> {
        let raw_file = fs::read_to_string(path)?;
        Self::from_json(&raw_file)
    }

    pub fn from_json(raw: &str) -> WeightResult<JsonWeightLoader> {
        let parsed: Value = serde_json::from_str(raw).map_err(|_| WeightError::WeightFormatError)?;
        match parsed {
            Value::Object(content) => Ok(JsonWeightLoader { content }),
            _ => Err(WeightError::WeightFormatError),
        }
    }
}

impl WeightLoader for JsonWeightLoader {
    /// Returns weights with the given name from the weight loader. Weights are stored in a FLATTENED form
    /// (to facilitate working with JSON, as then all arrays have the same depth.)
    fn get_weight(
        &mut self,
        param_name: &str,
        shape: &[usize],
    ) -> WeightResult<ArrayD<WeightPrecision>> {
        let raw_arr = self
            .content
            .get(param_name)
            .ok_or_else(|| WeightError::WeightKeyError(param_name.to_string()))?;

        let raw_value_vector = match raw_arr {
            Value::Array(v) => v,
            _ => return Err(WeightError::WeightFormatError),
        };

        let weight_vector = raw_value_vector
            .iter()
            .map(|j| {
                j.as_f64()
                    .map(|v| v as WeightPrecision)
                    .ok_or(WeightError::WeightFormatError)
            })
            .collect::<WeightResult<Vec<_>>>()?;

        let expected: usize = shape.iter().product();
        if weight_vector.len() != expected {
            return Err(WeightError::WeightShapeMismatch {
                name: param_name.to_string(),
                expected: shape.to_vec(),
                found: vec![weight_vector.len()],
            });
        }

        Ok(ArrayD::from_shape_vec(IxDyn(shape), weight_vector)?)
    }
}

pub struct NpzWeightLoader<R>
where
    R: Seek + Read,
{
    handle: R,
}

impl NpzWeightLoader<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> WeightResult<NpzWeightLoader<std::fs::File>> {
        let handle = std::fs::File::open(path)?;
        Ok(NpzWeightLoader { handle })
    }
}

impl<'a> NpzWeightLoader<Cursor<&'a [u8]>> {
    pub fn from_buffer(bytes_array: &'a [u8]) -> WeightResult<NpzWeightLoader<Cursor<&'a [u8]>>> {
        Ok(NpzWeightLoader {
            handle: Cursor::new(bytes_array),
        })
    }
}

impl<R> WeightLoader for NpzWeightLoader<R>
where
    R: Seek + Read,
{
    fn get_weight(
        &mut self,
        param_name: &str,
        shape: &[usize],
    ) -> WeightResult<ArrayD<WeightPrecision>> {
        // The npz reader borrows the handle mutably, so it is recreated per weight
        let mut reader = NpzReader::new(&mut self.handle)?;

        let arr: ArrayD<WeightPrecision> = reader.by_name(param_name)?;

        if arr.shape() != shape {
            return Err(WeightError::WeightShapeMismatch {
                name: param_name.to_string(),
                expected: shape.to_vec(),
                found: arr.shape().to_vec(),
            });
        }
        Ok(arr)
    }
}

/// Writes all parameters into a single npz archive, one array per name.
pub fn write_npz<P: AsRef<Path>>(path: P, parameters: &Parameters) -> WeightResult<()> {
    let file = fs::File::create(path)?;
    let mut npz = NpzWriter::new(file);
    for (name, weights) in parameters {
        npz.add_array(name.as_str(), weights)?;
    }
    npz.finish()?;
    Ok(())
}

/// Writes all parameters as a JSON dict of flattened arrays, as read by [`JsonWeightLoader`].
pub fn write_json<P: AsRef<Path>>(path: P, parameters: &Parameters) -> WeightResult<()> {
    let content: Map<String, Value> = parameters
        .iter()
        .map(|(name, weights)| {
            let flat = weights
                .iter()
                .map(|&w| Value::from(w as f64))
                .collect::<Vec<_>>();
            (name.clone(), Value::Array(flat))
        })
        .collect();
    let raw = serde_json::to_string(&content).map_err(|_| WeightError::WeightFormatError)?;
    fs::write(path, raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use super::*;
    use ndarray::{array, Array1, Array2};
    use tempfile::tempdir;

    #[test]
    fn test_json_weight_loader() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.txt");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            // Rust escapes curly braces by doubling them
            "{{ \"arr1\": [0.0, 1e-3, 1.0], \"arr2\": [0.0, 1.0, 2.0, 3.0]}}"
        )
        .unwrap();

        let mut loader = JsonWeightLoader::new(file_path).unwrap();

        assert_eq!(
            loader.get_weight("arr1", &[3]).unwrap(),
            array![0.0f32, 1e-3, 1.0].into_dyn()
        );
        assert_eq!(
            loader.get_weight("arr2", &[2, 2]).unwrap(),
            array![[0.0f32, 1.0], [2.0, 3.0]].into_dyn()
        );
        assert!(matches!(
            loader.get_weight("arr2", &[3]),
            Err(WeightError::WeightShapeMismatch { .. })
        ));
        assert!(matches!(
            loader.get_weight("arr3", &[3]),
            Err(WeightError::WeightKeyError(_))
        ));

        drop(file);
        dir.close().unwrap();
    }

    #[test]
    fn test_json_weight_loader_rejects_non_dicts() {
        assert!(matches!(
            JsonWeightLoader::from_json("[1, 2, 3]"),
            Err(WeightError::WeightFormatError)
        ));
        let mut loader = JsonWeightLoader::from_json("{\"a\": [1, \"x\"]}").unwrap();
        assert!(matches!(
            loader.get_weight("a", &[2]),
            Err(WeightError::WeightFormatError)
        ));
    }

    #[test]
    fn test_npz_weight_loader() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.npz");
        let file = File::create(&file_path).unwrap();
        let mut npz = NpzWriter::new(file);
        let a: Array2<f32> = array![[1., 2., 3.], [4., 5., 6.]];
        let b: Array1<f32> = array![7., 8., 9.];
        npz.add_array("a", &a).unwrap();
        npz.add_array("b", &b).unwrap();
        npz.finish().unwrap();

        let mut loader = NpzWeightLoader::from_path(&file_path).unwrap();

        assert_eq!(loader.get_weight("a", &[2, 3]).unwrap(), a.into_dyn());
        assert_eq!(loader.get_weight("b", &[3]).unwrap(), b.into_dyn());
        assert!(matches!(
            loader.get_weight("a", &[3, 2]),
            Err(WeightError::WeightShapeMismatch { .. })
        ));

        let bytes = fs::read(&file_path).unwrap();
        let mut loader = NpzWeightLoader::from_buffer(&bytes).unwrap();
        assert_eq!(loader.get_weight("b", &[3]).unwrap().sum(), 24.);

        dir.close().unwrap();
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let mut parameters = Parameters::new();
        parameters.insert(
            "conv.kernel".to_string(),
            ArrayD::from_shape_fn(IxDyn(&[3, 3, 1, 2]), |i| i[0] as f32 - i[3] as f32 * 0.5),
        );
        parameters.insert("conv.bias".to_string(), array![0.25f32, -1.].into_dyn());

        let npz_path = dir.path().join("weights.npz");
        write_npz(&npz_path, &parameters).unwrap();
        let mut npz = NpzWeightLoader::from_path(&npz_path).unwrap();

        let json_path = dir.path().join("weights.json");
        write_json(&json_path, &parameters).unwrap();
        let mut json = JsonWeightLoader::new(&json_path).unwrap();

        for (name, weights) in &parameters {
            assert_eq!(&npz.get_weight(name, weights.shape()).unwrap(), weights);
            assert_eq!(&json.get_weight(name, weights.shape()).unwrap(), weights);
        }

        dir.close().unwrap();
    }
}
