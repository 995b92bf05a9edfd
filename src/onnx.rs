use crate::network::Network;
use crate::{Error, Result};
use ndarray::{Array2, Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, LoggingLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;

/// Ensemble member backed by an `ONNX` Runtime session
///
/// The model must take one `f32` image batch and return one row of class scores per image.
pub struct OnnxNetwork {
    session: Session,
    name: String,
    channels_first: bool,
}

impl OnnxNetwork {
    /// Load a model from an `ONNX` file
    ///
    /// Set `channels_first` for models exported with `(batch, channels, height, width)` inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The `ONNX` runtime environment cannot be created
    /// - The model file cannot be loaded
    /// - The model has no inputs or outputs
    pub fn new<P: AsRef<Path>>(model_path: P, channels_first: bool) -> Result<Self> {
        let name = model_path
            .as_ref()
            .file_stem()
            .map_or_else(|| "onnx".to_string(), |stem| stem.to_string_lossy().into_owned());
        log::info!("Initializing ONNX member {} from {}", name, model_path.as_ref().display());

        let environment = Arc::new(
            Environment::builder()
                .with_name(&name)
                .with_log_level(LoggingLevel::Warning)
                .build()?,
        );

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)?;

        if session.inputs.is_empty() {
            return Err(Error::ModelError(format!("Model {name} has no inputs")));
        }
        if session.outputs.is_empty() {
            return Err(Error::ModelError(format!("Model {name} has no outputs")));
        }

        Ok(Self {
            session,
            name,
            channels_first,
        })
    }
}

impl Network for OnnxNetwork {
    fn predict(&self, batch: &Array4<f32>) -> Result<Array2<f32>> {
        let batch_size = batch.len_of(ndarray::Axis(0));
        let input = if self.channels_first {
            batch.view().permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned()
        } else {
            batch.clone()
        };

        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let scores = outputs
            .into_iter()
            .next()
            .ok_or_else(|| Error::ModelError(format!("No output from model {}", self.name)))?;
        let tensor = scores.try_extract::<f32>()?;
        let view = tensor.view();

        let total = view.len();
        if batch_size == 0 || total % batch_size != 0 {
            return Err(Error::ModelError(format!(
                "Model {} returned {} values for a batch of {}",
                self.name, total, batch_size
            )));
        }

        ndarray::Array1::from_iter(view.iter().copied())
            .into_shape((batch_size, total / batch_size))
            .map_err(|e| Error::ModelError(format!("Model {} output: {e}", self.name)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
