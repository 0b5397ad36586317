//! Resolves a model's declared inputs and outputs into the single image port
//! layout the pipeline drives. Resolution happens once per loaded model.

use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::types::{ElementType, TensorDesc, TensorLayout, ValueRange};

/// What a model reports about one of its inputs or outputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureDescriptor {
    pub name: String,
    pub kind: FeatureKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Numeric tensor. `element` is `None` for types the pipeline cannot feed.
    /// Shape entries `<= 0` are dynamic.
    Tensor {
        element: Option<ElementType>,
        shape: Vec<i64>,
    },
    /// Native image port that takes pixels without tensor conversion.
    Image { width: u32, height: u32 },
    Other(String),
}

impl FeatureDescriptor {
    pub fn tensor(name: impl Into<String>, element: ElementType, shape: &[i64]) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Tensor {
                element: Some(element),
                shape: shape.to_vec(),
            },
        }
    }

    pub fn image(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Image { width, height },
        }
    }

    fn is_tensor(&self) -> bool {
        matches!(self.kind, FeatureKind::Tensor { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescription {
    pub inputs: Vec<FeatureDescriptor>,
    pub outputs: Vec<FeatureDescriptor>,
    /// Range convention found in model metadata, if any.
    pub declared_range: Option<ValueRange>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveOptions {
    /// Range configured by the caller. Cross-checked against the model.
    pub value_range: Option<ValueRange>,
    /// `(width, height)` substituted for dynamic spatial dimensions.
    pub fallback_size: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorSpec {
    pub name: String,
    pub layout: TensorLayout,
    pub element: ElementType,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Whether the model shape carries a leading batch axis of 1.
    pub batched: bool,
}

impl TensorSpec {
    pub fn desc(&self) -> TensorDesc {
        TensorDesc::new(self.layout, self.element, self.width, self.height)
    }

    /// Shape passed to the inference runtime.
    pub fn dims(&self) -> Vec<usize> {
        let (c, h, w) = (
            self.channels as usize,
            self.height as usize,
            self.width as usize,
        );
        let mut dims = match self.layout {
            TensorLayout::Planar => vec![c, h, w],
            TensorLayout::Interleaved => vec![h, w, c],
        };
        if self.batched {
            dims.insert(0, 1);
        }
        dims
    }

    /// Descriptor for a concrete runtime shape in this port's layout. Models
    /// with dynamic or scaled outputs report their real extent here.
    pub fn desc_for_shape(&self, shape: &[usize]) -> Result<TensorDesc> {
        let axes = match (self.batched, shape) {
            (true, [1, rest @ ..]) => rest,
            (false, axes) => axes,
            _ => {
                return Err(PipelineError::InferenceFailed(format!(
                    "output '{}' has shape {shape:?}, expected a leading batch of 1",
                    self.name
                )))
            }
        };
        let (height, width) = match (self.layout, axes) {
            (TensorLayout::Planar, [3, h, w]) => (*h, *w),
            (TensorLayout::Interleaved, [h, w, 3]) => (*h, *w),
            _ => {
                return Err(PipelineError::InferenceFailed(format!(
                    "output '{}' has shape {shape:?}, incompatible with {:?} layout",
                    self.name, self.layout
                )))
            }
        };
        if width == 0 || height == 0 {
            return Err(PipelineError::InferenceFailed(format!(
                "output '{}' has empty extent {shape:?}",
                self.name
            )));
        }
        Ok(TensorDesc::new(
            self.layout,
            self.element,
            width as u32,
            height as u32,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortSpec {
    Tensor(TensorSpec),
    Pixels { name: String, width: u32, height: u32 },
}

impl PortSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Tensor(spec) => &spec.name,
            Self::Pixels { name, .. } => name,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        match self {
            Self::Tensor(spec) => (spec.width, spec.height),
            Self::Pixels { width, height, .. } => (*width, *height),
        }
    }
}

/// Immutable description of how frames enter and leave the loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelIOSpec {
    pub input: PortSpec,
    pub output: PortSpec,
    pub value_range: ValueRange,
}

#[derive(Clone, Copy)]
enum Direction {
    Input,
    Output,
}

pub fn resolve_model_io(
    description: &ModelDescription,
    options: &ResolveOptions,
) -> Result<ModelIOSpec> {
    let input = resolve_port(&description.inputs, Direction::Input, options)?;
    let output = resolve_port(&description.outputs, Direction::Output, options)?;
    let value_range = resolve_value_range(options.value_range, description.declared_range)?;

    Ok(ModelIOSpec {
        input,
        output,
        value_range,
    })
}

/// Picks the range convention. A configured and a declared range must agree.
pub fn resolve_value_range(
    configured: Option<ValueRange>,
    declared: Option<ValueRange>,
) -> Result<ValueRange> {
    match (configured, declared) {
        (Some(configured), Some(declared)) if configured != declared => {
            Err(PipelineError::ValueRangeConflict {
                configured,
                declared,
            })
        }
        (Some(range), _) | (None, Some(range)) => Ok(range),
        (None, None) => Err(PipelineError::UnspecifiedValueRange),
    }
}

fn resolve_port(
    features: &[FeatureDescriptor],
    direction: Direction,
    options: &ResolveOptions,
) -> Result<PortSpec> {
    let tensors: Vec<&FeatureDescriptor> = features.iter().filter(|f| f.is_tensor()).collect();

    match tensors.as_slice() {
        [feature] => resolve_tensor(feature, options).map(PortSpec::Tensor),
        [] => {
            let image = features.iter().find_map(|f| match f.kind {
                FeatureKind::Image { width, height } => Some((f.name.clone(), width, height)),
                _ => None,
            });
            match (image, direction) {
                (Some((name, width, height)), _) if width > 0 && height > 0 => {
                    Ok(PortSpec::Pixels {
                        name,
                        width,
                        height,
                    })
                }
                (Some((name, width, height)), _) => Err(PipelineError::UnsupportedModelShape {
                    feature: name,
                    reason: format!("image port has empty extent {width}x{height}"),
                }),
                (None, Direction::Input) => Err(PipelineError::NoTensorInput),
                (None, Direction::Output) => Err(PipelineError::UnsupportedModelShape {
                    feature: "<outputs>".to_string(),
                    reason: "model exposes no tensor or image output".to_string(),
                }),
            }
        }
        many => {
            let names: Vec<&str> = many.iter().map(|f| f.name.as_str()).collect();
            let side = match direction {
                Direction::Input => "inputs",
                Direction::Output => "outputs",
            };
            Err(PipelineError::UnsupportedModelShape {
                feature: names.join(", "),
                reason: format!("expected exactly one tensor among {side}, found {}", names.len()),
            })
        }
    }
}

fn resolve_tensor(feature: &FeatureDescriptor, options: &ResolveOptions) -> Result<TensorSpec> {
    let FeatureKind::Tensor { element, shape } = &feature.kind else {
        return Err(PipelineError::UnsupportedModelShape {
            feature: feature.name.clone(),
            reason: "not a tensor".to_string(),
        });
    };
    let unsupported = |reason: String| PipelineError::UnsupportedModelShape {
        feature: feature.name.clone(),
        reason,
    };

    let element = element.ok_or_else(|| unsupported("element type must be float32 or float16".into()))?;

    let (batched, axes) = match shape.len() {
        3 => (false, &shape[..]),
        4 => {
            let batch = shape[0];
            if batch != 1 && batch > 0 {
                return Err(unsupported(format!("batch size {batch} is not 1")));
            }
            (true, &shape[1..])
        }
        rank => return Err(unsupported(format!("rank {rank} is not 3 or 4"))),
    };

    let channel_axes: Vec<usize> = axes
        .iter()
        .enumerate()
        .filter(|(_, dim)| **dim == 3)
        .map(|(i, _)| i)
        .collect();

    let (layout, height_dim, width_dim) = match channel_axes.as_slice() {
        [0] => (TensorLayout::Planar, axes[1], axes[2]),
        [2] => (TensorLayout::Interleaved, axes[0], axes[1]),
        [1] => {
            return Err(unsupported(format!(
                "channel axis of {shape:?} sits between the spatial axes"
            )))
        }
        [] => {
            return Err(PipelineError::AmbiguousLayout {
                shape: shape.clone(),
                reason: "no axis of size 3".to_string(),
            })
        }
        several => {
            return Err(PipelineError::AmbiguousLayout {
                shape: shape.clone(),
                reason: format!("{} axes of size 3", several.len()),
            })
        }
    };

    let (width, height) = if width_dim > 0 && height_dim > 0 {
        (width_dim as u32, height_dim as u32)
    } else {
        match options.fallback_size {
            Some((w, h)) if w > 0 && h > 0 => (
                if width_dim > 0 { width_dim as u32 } else { w },
                if height_dim > 0 { height_dim as u32 } else { h },
            ),
            _ => {
                return Err(unsupported(format!(
                    "dynamic spatial dimensions in {shape:?} need a configured fallback size"
                )))
            }
        }
    };

    Ok(TensorSpec {
        name: feature.name.clone(),
        layout,
        element,
        width,
        height,
        channels: 3,
        batched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(input: &[i64], output: &[i64]) -> ModelDescription {
        ModelDescription {
            inputs: vec![FeatureDescriptor::tensor("input", ElementType::F32, input)],
            outputs: vec![FeatureDescriptor::tensor("output", ElementType::F16, output)],
            declared_range: Some(ValueRange::Unit),
        }
    }

    fn resolve(description: &ModelDescription) -> Result<ModelIOSpec> {
        resolve_model_io(description, &ResolveOptions::default())
    }

    #[test]
    fn nchw_and_nhwc_resolve_to_expected_layouts() {
        let spec = resolve(&single(&[1, 3, 256, 320], &[1, 256, 320, 3])).unwrap();
        let PortSpec::Tensor(input) = &spec.input else {
            panic!("expected tensor input");
        };
        assert_eq!(input.layout, TensorLayout::Planar);
        assert_eq!((input.width, input.height), (320, 256));
        assert!(input.batched);
        assert_eq!(input.dims(), vec![1, 3, 256, 320]);

        let PortSpec::Tensor(output) = &spec.output else {
            panic!("expected tensor output");
        };
        assert_eq!(output.layout, TensorLayout::Interleaved);
        assert_eq!(output.element, ElementType::F16);
        assert_eq!(output.channels, 3);
        assert_eq!(spec.value_range, ValueRange::Unit);
    }

    #[test]
    fn rank_three_shapes_are_unbatched() {
        let spec = resolve(&single(&[64, 48, 3], &[3, 64, 48])).unwrap();
        let PortSpec::Tensor(input) = spec.input else {
            panic!("expected tensor input");
        };
        assert_eq!(input.layout, TensorLayout::Interleaved);
        assert!(!input.batched);
        assert_eq!(input.dims(), vec![64, 48, 3]);
    }

    #[test]
    fn zero_or_many_channel_axes_are_ambiguous() {
        let none = resolve(&single(&[1, 4, 256, 256], &[1, 3, 256, 256])).unwrap_err();
        assert!(matches!(none, PipelineError::AmbiguousLayout { .. }), "{none}");

        let two = resolve(&single(&[1, 3, 3, 256], &[1, 3, 256, 256])).unwrap_err();
        assert!(matches!(two, PipelineError::AmbiguousLayout { .. }), "{two}");

        let output = resolve(&single(&[1, 3, 64, 64], &[3, 3, 3])).unwrap_err();
        assert!(matches!(output, PipelineError::AmbiguousLayout { .. }));
    }

    #[test]
    fn middle_channel_axis_is_unsupported() {
        let err = resolve(&single(&[1, 256, 3, 256], &[1, 3, 256, 256])).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedModelShape { .. }), "{err}");
    }

    #[test]
    fn batch_other_than_one_is_unsupported() {
        let err = resolve(&single(&[2, 3, 64, 64], &[1, 3, 64, 64])).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedModelShape { .. }));

        // A dynamic batch is accepted and fed as 1.
        assert!(resolve(&single(&[-1, 3, 64, 64], &[-1, 3, 64, 64])).is_ok());
    }

    #[test]
    fn other_ranks_are_unsupported() {
        let err = resolve(&single(&[3, 64], &[1, 3, 64, 64])).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedModelShape { .. }));
        let err = resolve(&single(&[1, 1, 3, 64, 64], &[1, 3, 64, 64])).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedModelShape { .. }));
    }

    #[test]
    fn missing_tensor_input_is_reported() {
        let description = ModelDescription {
            inputs: vec![FeatureDescriptor {
                name: "tokens".into(),
                kind: FeatureKind::Other("sequence".into()),
            }],
            outputs: vec![FeatureDescriptor::tensor("out", ElementType::F32, &[1, 3, 8, 8])],
            declared_range: Some(ValueRange::Byte),
        };
        assert_eq!(resolve(&description).unwrap_err(), PipelineError::NoTensorInput);
    }

    #[test]
    fn two_tensor_inputs_are_unsupported() {
        let description = ModelDescription {
            inputs: vec![
                FeatureDescriptor::tensor("content", ElementType::F32, &[1, 3, 8, 8]),
                FeatureDescriptor::tensor("style", ElementType::F32, &[1, 3, 8, 8]),
            ],
            outputs: vec![FeatureDescriptor::tensor("out", ElementType::F32, &[1, 3, 8, 8])],
            declared_range: Some(ValueRange::Byte),
        };
        let err = resolve(&description).unwrap_err();
        let PipelineError::UnsupportedModelShape { feature, .. } = err else {
            panic!("expected unsupported shape, got {err}");
        };
        assert_eq!(feature, "content, style");
    }

    #[test]
    fn image_ports_bypass_tensor_conversion() {
        let description = ModelDescription {
            inputs: vec![FeatureDescriptor::image("image", 512, 512)],
            outputs: vec![FeatureDescriptor::image("stylized", 512, 512)],
            declared_range: None,
        };
        let options = ResolveOptions {
            value_range: Some(ValueRange::Byte),
            ..Default::default()
        };
        let spec = resolve_model_io(&description, &options).unwrap();
        assert_eq!(
            spec.input,
            PortSpec::Pixels {
                name: "image".into(),
                width: 512,
                height: 512
            }
        );
        assert_eq!(spec.output.size(), (512, 512));
    }

    #[test]
    fn dynamic_spatial_dims_use_fallback_size() {
        let description = single(&[1, 3, -1, -1], &[1, 3, -1, -1]);
        let err = resolve(&description).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedModelShape { .. }));

        let options = ResolveOptions {
            fallback_size: Some((640, 360)),
            ..Default::default()
        };
        let spec = resolve_model_io(&description, &options).unwrap();
        assert_eq!(spec.input.size(), (640, 360));
    }

    #[test]
    fn unsupported_element_type_is_rejected() {
        let description = ModelDescription {
            inputs: vec![FeatureDescriptor {
                name: "input".into(),
                kind: FeatureKind::Tensor {
                    element: None,
                    shape: vec![1, 3, 8, 8],
                },
            }],
            outputs: vec![FeatureDescriptor::tensor("out", ElementType::F32, &[1, 3, 8, 8])],
            declared_range: Some(ValueRange::Unit),
        };
        assert!(matches!(
            resolve(&description).unwrap_err(),
            PipelineError::UnsupportedModelShape { .. }
        ));
    }

    #[test]
    fn value_range_rules() {
        assert_eq!(
            resolve_value_range(None, None),
            Err(PipelineError::UnspecifiedValueRange)
        );
        assert_eq!(
            resolve_value_range(Some(ValueRange::Byte), None),
            Ok(ValueRange::Byte)
        );
        assert_eq!(
            resolve_value_range(None, Some(ValueRange::Unit)),
            Ok(ValueRange::Unit)
        );
        assert_eq!(
            resolve_value_range(Some(ValueRange::Unit), Some(ValueRange::Unit)),
            Ok(ValueRange::Unit)
        );
        assert_eq!(
            resolve_value_range(Some(ValueRange::Unit), Some(ValueRange::Byte)),
            Err(PipelineError::ValueRangeConflict {
                configured: ValueRange::Unit,
                declared: ValueRange::Byte
            })
        );
    }

    #[test]
    fn output_shape_maps_back_to_extent() {
        let spec = resolve(&single(&[1, 3, 64, 64], &[1, 3, -1, -1])).err();
        assert!(spec.is_some(), "dynamic output without fallback must fail");

        let options = ResolveOptions {
            fallback_size: Some((64, 64)),
            ..Default::default()
        };
        let spec = resolve_model_io(&single(&[1, 3, 64, 64], &[1, 3, -1, -1]), &options).unwrap();
        let PortSpec::Tensor(output) = spec.output else {
            panic!("expected tensor output");
        };
        let desc = output.desc_for_shape(&[1, 3, 128, 96]).unwrap();
        assert_eq!((desc.width, desc.height), (96, 128));
        assert!(output.desc_for_shape(&[1, 128, 96, 3]).is_err());
        assert!(output.desc_for_shape(&[3, 128, 96]).is_err());
    }
}
