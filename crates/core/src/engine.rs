//! Inference engines behind the frame pipeline.

use std::path::PathBuf;

use half::f16;
use ndarray::{ArrayD, IxDyn};
use ort::session::Session;
use ort::value::{DynValue, Tensor};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::model_inspect::describe_onnx;
use crate::model_spec::{FeatureDescriptor, ModelDescription, ModelIOSpec, PortSpec, TensorSpec};
use crate::session::{build_session, SessionConfig};
use crate::types::{ElementType, PixelBuffer, TensorBuffer, TensorDesc, TensorLayout, ValueRange};

pub enum EngineInput {
    Tensor(TensorBuffer),
    Pixels(PixelBuffer),
}

#[derive(Debug)]
pub enum EngineOutput {
    Tensor(TensorBuffer),
    Pixels(PixelBuffer),
}

/// A loaded model that maps one input image to one output image.
pub trait InferenceEngine: Send {
    fn describe(&self) -> ModelDescription;

    /// Runs one prediction. `input` matches `spec.input`; the result must
    /// match the kind of `spec.output`.
    fn predict(&mut self, spec: &ModelIOSpec, input: EngineInput) -> Result<EngineOutput>;
}

/// ONNX Runtime session over a single style model.
pub struct OrtEngine {
    session: Session,
    description: ModelDescription,
    model_path: PathBuf,
}

impl OrtEngine {
    pub fn load(config: &SessionConfig) -> anyhow::Result<Self> {
        let description = describe_onnx(&config.model_path)?;
        let session = build_session(config)?;
        debug!(
            model = %config.model_path.display(),
            inputs = description.inputs.len(),
            outputs = description.outputs.len(),
            declared_range = ?description.declared_range,
            "Loaded style model"
        );
        Ok(Self {
            session,
            description,
            model_path: config.model_path.clone(),
        })
    }

    pub fn model_path(&self) -> &std::path::Path {
        &self.model_path
    }

    fn run_tensor(
        &mut self,
        input_spec: &TensorSpec,
        output_spec: &TensorSpec,
        tensor: &TensorBuffer,
    ) -> anyhow::Result<TensorBuffer> {
        let dims = IxDyn(&input_spec.dims());
        let input_value: DynValue = match tensor.desc().element {
            ElementType::F32 => {
                let values = tensor.with_f32(|values| values.to_vec())?;
                Tensor::from_array(ArrayD::from_shape_vec(dims, values)?)?.into_dyn()
            }
            ElementType::F16 => {
                let values = tensor.with_f16(|values| values.to_vec())?;
                Tensor::from_array(ArrayD::from_shape_vec(dims, values)?)?.into_dyn()
            }
        };

        let outputs = self
            .session
            .run(ort::inputs![input_spec.name.as_str() => &input_value])?;
        let output = &outputs[output_spec.name.as_str()];

        let buffer = match output_spec.element {
            ElementType::F32 => {
                let view = output.try_extract_array::<f32>()?;
                let desc = output_spec.desc_for_shape(view.shape())?;
                let values: Vec<f32> = view.iter().copied().collect();
                TensorBuffer::from_f32(desc, &values)?
            }
            ElementType::F16 => {
                let view = output.try_extract_array::<f16>()?;
                let desc = output_spec.desc_for_shape(view.shape())?;
                let values: Vec<f16> = view.iter().copied().collect();
                TensorBuffer::from_f16(desc, &values)?
            }
        };
        Ok(buffer)
    }
}

impl InferenceEngine for OrtEngine {
    fn describe(&self) -> ModelDescription {
        self.description.clone()
    }

    fn predict(&mut self, spec: &ModelIOSpec, input: EngineInput) -> Result<EngineOutput> {
        let (PortSpec::Tensor(input_spec), PortSpec::Tensor(output_spec)) =
            (&spec.input, &spec.output)
        else {
            return Err(PipelineError::InferenceFailed(
                "ONNX sessions only exchange tensors".to_string(),
            ));
        };
        let EngineInput::Tensor(tensor) = input else {
            return Err(PipelineError::InferenceFailed(
                "expected a tensor input".to_string(),
            ));
        };

        self.run_tensor(input_spec, output_spec, &tensor)
            .map(EngineOutput::Tensor)
            .map_err(|e| match e.downcast::<PipelineError>() {
                Ok(pipeline) => pipeline,
                Err(other) => PipelineError::InferenceFailed(format!("{other:#}")),
            })
    }
}

/// Passes the image through unchanged, converting only between the declared
/// input and output tensor formats. Useful without a GPU or a model file.
pub struct IdentityEngine {
    description: ModelDescription,
}

impl IdentityEngine {
    pub fn new(description: ModelDescription) -> Self {
        Self { description }
    }

    /// Identity over a batched NCHW tensor of the given extent.
    pub fn planar(width: u32, height: u32, element: ElementType, range: ValueRange) -> Self {
        let shape = [1, 3, i64::from(height), i64::from(width)];
        Self::new(ModelDescription {
            inputs: vec![FeatureDescriptor::tensor("input", element, &shape)],
            outputs: vec![FeatureDescriptor::tensor("output", element, &shape)],
            declared_range: Some(range),
        })
    }
}

fn relayout(values: &[f32], from: TensorLayout, to: TensorLayout, width: usize, height: usize) -> Vec<f32> {
    if from == to {
        return values.to_vec();
    }
    let mut out = vec![0.0; values.len()];
    for y in 0..height {
        for x in 0..width {
            for c in 0..3 {
                out[to.index(c, x, y, width, height)] = values[from.index(c, x, y, width, height)];
            }
        }
    }
    out
}

impl InferenceEngine for IdentityEngine {
    fn describe(&self) -> ModelDescription {
        self.description.clone()
    }

    fn predict(&mut self, spec: &ModelIOSpec, input: EngineInput) -> Result<EngineOutput> {
        match (input, &spec.output) {
            (EngineInput::Pixels(frame), PortSpec::Pixels { .. }) => Ok(EngineOutput::Pixels(frame)),
            (EngineInput::Tensor(tensor), PortSpec::Tensor(output_spec)) => {
                let from = *tensor.desc();
                let desc = TensorDesc::new(output_spec.layout, output_spec.element, from.width, from.height);
                if desc == from {
                    return Ok(EngineOutput::Tensor(tensor));
                }

                let values = relayout(
                    &tensor.to_f32_vec(),
                    from.layout,
                    desc.layout,
                    from.width as usize,
                    from.height as usize,
                );
                let converted = match desc.element {
                    ElementType::F32 => TensorBuffer::from_f32(desc, &values)?,
                    ElementType::F16 => {
                        let narrow: Vec<f16> = values.iter().map(|v| f16::from_f32(*v)).collect();
                        TensorBuffer::from_f16(desc, &narrow)?
                    }
                };
                Ok(EngineOutput::Tensor(converted))
            }
            _ => Err(PipelineError::InferenceFailed(
                "identity engine cannot convert between pixel and tensor ports".to_string(),
            )),
        }
    }
}
