//! Input and output handling of the command line interface: radar frames, numpy arrays
//! and exported graph descriptions.
use image::io::Reader as ImageReader;
use image::{GrayImage, ImageError};
use log::{debug, info};
use ml::{
    config::ConfigError,
    graph::{Graph, Shape},
    GraphError, Tensor,
};
use ndarray::{stack, Array2, ArrayView2, Axis, ErrorKind, Ix4, Ix5, ShapeError};
use ndarray_npy::{read_npy, ReadNpyError};
use nshare::ToNdarray2;
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NowcastError {
    #[error("Unsupported file type of {0:?}, expected one of: {1}")]
    UnsupportedFormat(PathBuf, &'static str),
    #[error("No input files given")]
    NoInput,
    #[error("Array of rank {found} can't be fed to a graph with input {expected}")]
    InputRank { expected: Shape, found: usize },
    #[error("Can't split an output of rank {0} into frames")]
    OutputRank(usize),
    #[error("Frames don't fit together:\n {0}")]
    Array(#[from] ShapeError),
    #[error("Could not process image:\n {0}")]
    Image(#[from] ImageError),
    #[error("Could not read numpy array:\n {0}")]
    Npy(#[from] ReadNpyError),
    #[error("Could not (de)serialize the graph:\n {0}")]
    Bincode(#[from] bincode::Error),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0} can't be combined with --graph, the graph file fixes the network")]
    GraphFlags(String),
    #[error("Filesystem reported error\n {0}")]
    Io(#[from] std::io::Error),
}

pub type NowcastResult<T> = Result<T, NowcastError>;

/// Lowercase file extension, empty if there is none.
pub fn extension(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Reads a radar frame as grayscale image, scaled to [0, 1]. Shape is (height, width).
pub fn load_frame(path: &Path) -> NowcastResult<Array2<f32>> {
    let frame = ImageReader::open(path)?
        .decode()?
        .to_luma8()
        .into_ndarray2();
    Ok(frame.mapv(|x| x as f32 / 255.0))
}

/// Stacks a sequence of frames into a single-sample batch for a graph with the given input:
/// (1, height, width, frames) for rank 4 inputs and (1, frames, height, width, 1) for
/// rank 5 inputs.
pub fn stack_frames(frames: &[Array2<f32>], input: &Shape) -> NowcastResult<Tensor> {
    if frames.is_empty() {
        return Err(NowcastError::NoInput);
    }
    let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
    match input.rank() {
        4 => Ok(stack(Axis(2), &views)?.insert_axis(Axis(0)).into_dyn()),
        5 => Ok(stack(Axis(0), &views)?
            .insert_axis(Axis(3))
            .insert_axis(Axis(0))
            .into_dyn()),
        _ => Err(NowcastError::InputRank {
            expected: input.clone(),
            found: 3,
        }),
    }
}

/// Loads the model input: either one `.npy` array, with or without the batch axis, or a
/// list of image frames in temporal order.
pub fn load_input(paths: &[PathBuf], input: &Shape) -> NowcastResult<Tensor> {
    match paths {
        [] => Err(NowcastError::NoInput),
        [single] if extension(single) == "npy" => {
            let array: Tensor = read_npy(single)?;
            debug!("Read array of shape {:?} from {}", array.shape(), single.display());
            if array.ndim() + 1 == input.rank() {
                Ok(array.insert_axis(Axis(0)))
            } else if array.ndim() == input.rank() {
                Ok(array)
            } else {
                Err(NowcastError::InputRank {
                    expected: input.clone(),
                    found: array.ndim(),
                })
            }
        }
        _ => {
            let frames = paths
                .iter()
                .map(|path| match extension(path).as_str() {
                    "png" | "jpg" | "jpeg" => load_frame(path),
                    _ => Err(NowcastError::UnsupportedFormat(
                        path.clone(),
                        "npy (single file), png, jpg",
                    )),
                })
                .collect::<NowcastResult<Vec<_>>>()?;
            debug!("Read {} frames", frames.len());
            stack_frames(&frames, input)
        }
    }
}

/// Turns output from neural net into a pixel value
pub fn to_pixel(x: &f32) -> u8 {
    (x.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Splits a model output into 2D frames, labelled by their indices.
/// Rank 4 outputs (batch, height, width, frames) give `<sample>_<frame>`,
/// rank 5 outputs (batch, time, height, width, channels) give `<sample>_<time>_<channel>`.
pub fn forecast_frames(output: &Tensor) -> NowcastResult<Vec<(String, ArrayView2<'_, f32>)>> {
    let mut frames = Vec::new();
    match output.ndim() {
        4 => {
            let view = output.view().into_dimensionality::<Ix4>()?;
            let (batch, _, _, count) = view.dim();
            for n in 0..batch {
                for f in 0..count {
                    let frame = view
                        .clone()
                        .index_axis_move(Axis(0), n)
                        .index_axis_move(Axis(2), f);
                    frames.push((format!("{}_{}", n, f), frame));
                }
            }
        }
        5 => {
            let view = output.view().into_dimensionality::<Ix5>()?;
            let (batch, time, _, _, channels) = view.dim();
            for n in 0..batch {
                for t in 0..time {
                    for c in 0..channels {
                        let frame = view
                            .clone()
                            .index_axis_move(Axis(0), n)
                            .index_axis_move(Axis(0), t)
                            .index_axis_move(Axis(2), c);
                        frames.push((format!("{}_{}_{}", n, t, c), frame));
                    }
                }
            }
        }
        rank => return Err(NowcastError::OutputRank(rank)),
    }
    Ok(frames)
}

pub fn frame_to_image(frame: ArrayView2<f32>) -> NowcastResult<GrayImage> {
    let (height, width) = frame.dim();
    GrayImage::from_raw(width as u32, height as u32, frame.iter().map(to_pixel).collect())
        .ok_or_else(|| ShapeError::from_kind(ErrorKind::IncompatibleShape).into())
}

/// Saves every frame of the output as `<stem>_<label>.png` next to `target`.
pub fn save_frames(output: &Tensor, target: &Path) -> NowcastResult<Vec<PathBuf>> {
    let stem = target
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or("forecast");
    let mut written = Vec::new();
    for (label, frame) in forecast_frames(output)? {
        let path = target.with_file_name(format!("{}_{}.png", stem, label));
        frame_to_image(frame)?.save(&path)?;
        written.push(path);
    }
    info!("Wrote {} forecast frames", written.len());
    Ok(written)
}

/// Reads a graph exported by [`export_graph`], as JSON (`.json`) or bincode (`.bin`).
pub fn load_graph(path: &Path) -> NowcastResult<Graph> {
    let graph = match extension(path).as_str() {
        "json" => Graph::from_json(&fs::read_to_string(path)?)?,
        "bin" => {
            let graph: Graph = bincode::deserialize(&fs::read(path)?)?;
            graph.validate()?;
            graph
        }
        _ => {
            return Err(NowcastError::UnsupportedFormat(
                path.to_path_buf(),
                "json, bin",
            ))
        }
    };
    info!("Loaded graph {} from {}", graph.name(), path.display());
    Ok(graph)
}

pub fn export_graph(graph: &Graph, path: &Path) -> NowcastResult<()> {
    match extension(path).as_str() {
        "json" => fs::write(path, graph.to_json()?)?,
        "bin" => fs::write(path, bincode::serialize(graph)?)?,
        _ => {
            return Err(NowcastError::UnsupportedFormat(
                path.to_path_buf(),
                "json, bin",
            ))
        }
    }
    info!("Exported graph {} to {}", graph.name(), path.display());
    Ok(())
}

/// Fails if any flag describing the network is given together with a graph file.
/// `flags` pairs each flag name with whether it was set.
pub fn check_graph_flags(flags: &[(&str, bool)]) -> NowcastResult<()> {
    let set: Vec<&str> = flags
        .iter()
        .filter(|(_, is_set)| *is_set)
        .map(|(name, _)| *name)
        .collect();
    if set.is_empty() {
        Ok(())
    } else {
        Err(NowcastError::GraphFlags(set.join(", ")))
    }
}

/// Fixes the spatial dimensions of a graph input shape, where given.
pub fn with_spatial_size(shape: &Shape, height: Option<usize>, width: Option<usize>) -> Shape {
    let mut dims = shape.dims().to_vec();
    let first_spatial = match shape.rank() {
        5 => 2,
        _ => 1,
    };
    for (offset, size) in [height, width].iter().enumerate() {
        if let (Some(size), Some(dim)) = (size, dims.get_mut(first_spatial + offset)) {
            *dim = Some(*size);
        }
    }
    Shape::new(dims)
}
