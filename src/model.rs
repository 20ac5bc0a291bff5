use ndarray::ArrayD;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

use crate::error::{Error, Result};

/// Capability interface over a loaded neural network: evaluate one input
/// tensor to one output tensor. The mel, embedding, and classifier models
/// differ only in the shapes and post-processing their stages apply, so a
/// single trait covers all of them (and lets tests substitute mocks).
pub trait Model: Send {
    fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>>;
}

/// ONNX Runtime backed model session.
pub struct OnnxModel {
    session: Session,
}

impl OnnxModel {
    /// Load a model file. Any failure here is fatal at startup; the
    /// pipeline refuses to start on a missing or malformed model.
    pub fn load(path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .with_inter_threads(1)?
            .commit_from_file(path)
            .map_err(|e| Error::ModelLoad {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(OnnxModel { session })
    }

    pub fn load_boxed(path: &Path) -> Result<Box<dyn Model>> {
        Ok(Box::new(Self::load(path)?))
    }
}

impl Model for OnnxModel {
    fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self.session.run(ort::inputs![tensor])?;
        let output: ndarray::ArrayViewD<f32> = outputs[0].try_extract_array()?;
        Ok(output.to_owned())
    }
}
