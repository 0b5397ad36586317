use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use prost::Message;
use serde::Serialize;

use crate::model_spec::{FeatureDescriptor, FeatureKind, ModelDescription};
use crate::onnx_proto;
use crate::types::{ElementType, ValueRange};

/// Metadata key a model can set to declare its colour value range.
pub const VALUE_RANGE_METADATA_KEY: &str = "value_range";

#[derive(Debug, Clone, Serialize)]
pub struct TensorInfo {
    pub name: String,
    /// Readable element type such as "float32" or "int64". "unknown" for
    /// non-tensor values.
    pub data_type: String,
    /// `-1` marks a symbolic or missing dimension.
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub op_type: String,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInspection {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub domain: String,
    pub model_version: i64,
    pub doc_string: String,
    pub graph_name: String,
    pub metadata: BTreeMap<String, String>,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub nodes: Vec<GraphNode>,
    /// Sum of initializer element counts.
    pub param_count: u64,
    pub op_count: usize,
}

impl ModelInspection {
    pub fn declared_value_range(&self) -> Option<ValueRange> {
        self.metadata
            .get(VALUE_RANGE_METADATA_KEY)
            .and_then(|value| ValueRange::parse(value))
    }
}

fn data_type_name(dt: i32) -> String {
    match dt {
        1 => "float32".into(),
        2 => "uint8".into(),
        3 => "int8".into(),
        4 => "uint16".into(),
        5 => "int16".into(),
        6 => "int32".into(),
        7 => "int64".into(),
        8 => "string".into(),
        9 => "bool".into(),
        10 => "float16".into(),
        11 => "float64".into(),
        12 => "uint32".into(),
        13 => "uint64".into(),
        16 => "bfloat16".into(),
        _ => format!("unknown({dt})"),
    }
}

fn value_info_to_tensor(vi: &onnx_proto::ValueInfoProto) -> TensorInfo {
    use onnx_proto::tensor_shape_proto::dimension::Value as Dim;

    let (data_type, shape) = vi
        .r#type
        .as_ref()
        .and_then(|tp| tp.value.as_ref())
        .map(|onnx_proto::type_proto::Value::TensorType(t)| {
            let dims = t
                .shape
                .as_ref()
                .map(|s| {
                    s.dim
                        .iter()
                        .map(|d| match d.value {
                            Some(Dim::DimValue(v)) => v,
                            _ => -1,
                        })
                        .collect()
                })
                .unwrap_or_default();
            (data_type_name(t.elem_type), dims)
        })
        .unwrap_or_else(|| ("unknown".into(), vec![]));

    TensorInfo {
        name: vi.name.clone(),
        data_type,
        shape,
    }
}

fn tensor_element_count(dims: &[i64]) -> u64 {
    if dims.is_empty() {
        return 0;
    }
    dims.iter()
        .map(|&d| if d > 0 { d as u64 } else { 1 })
        .product()
}

/// Reads an ONNX file's graph signature and metadata without creating an
/// inference session.
pub fn inspect_onnx(path: &Path) -> Result<ModelInspection> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read ONNX file: {}", path.display()))?;

    inspect_onnx_bytes(&bytes)
        .with_context(|| format!("failed to inspect ONNX file: {}", path.display()))
}

pub fn inspect_onnx_bytes(bytes: &[u8]) -> Result<ModelInspection> {
    let model = onnx_proto::ModelProto::decode(bytes).context("failed to decode ONNX protobuf")?;

    let opset_version = model
        .opset_import
        .iter()
        .filter(|op| op.domain.is_empty() || op.domain == "ai.onnx")
        .map(|op| op.version)
        .max()
        .unwrap_or(0);

    let graph = model.graph.as_ref().context("ONNX model has no graph")?;

    // Initializers can be listed as graph inputs in older IR versions; those
    // are weights, not feeds.
    let weights: std::collections::HashSet<&str> =
        graph.initializer.iter().map(|t| t.name.as_str()).collect();
    let inputs: Vec<TensorInfo> = graph
        .input
        .iter()
        .filter(|vi| !weights.contains(vi.name.as_str()))
        .map(value_info_to_tensor)
        .collect();
    let outputs: Vec<TensorInfo> = graph.output.iter().map(value_info_to_tensor).collect();

    let nodes: Vec<GraphNode> = graph
        .node
        .iter()
        .map(|n| GraphNode {
            op_type: if n.domain.is_empty() {
                n.op_type.clone()
            } else {
                format!("{}::{}", n.domain, n.op_type)
            },
            name: n.name.clone(),
            inputs: n.input.clone(),
            outputs: n.output.clone(),
        })
        .collect();

    let param_count: u64 = graph
        .initializer
        .iter()
        .map(|t| tensor_element_count(&t.dims))
        .sum();

    let metadata = model
        .metadata_props
        .iter()
        .map(|entry| (entry.key.clone(), entry.value.clone()))
        .collect();

    Ok(ModelInspection {
        ir_version: model.ir_version,
        opset_version,
        producer_name: model.producer_name.clone(),
        producer_version: model.producer_version.clone(),
        domain: model.domain.clone(),
        model_version: model.model_version,
        doc_string: model.doc_string.clone(),
        graph_name: graph.name.clone(),
        metadata,
        inputs,
        outputs,
        op_count: graph.node.len(),
        nodes,
        param_count,
    })
}

fn tensor_feature(info: &TensorInfo) -> FeatureDescriptor {
    let kind = match info.data_type.as_str() {
        "float32" => FeatureKind::Tensor {
            element: Some(ElementType::F32),
            shape: info.shape.clone(),
        },
        "float16" => FeatureKind::Tensor {
            element: Some(ElementType::F16),
            shape: info.shape.clone(),
        },
        "unknown" => FeatureKind::Other("non-tensor value".into()),
        _ => FeatureKind::Tensor {
            element: None,
            shape: info.shape.clone(),
        },
    };
    FeatureDescriptor {
        name: info.name.clone(),
        kind,
    }
}

/// Converts an inspection into the feature list the IO resolver consumes.
pub fn describe_inspection(inspection: &ModelInspection) -> ModelDescription {
    ModelDescription {
        inputs: inspection.inputs.iter().map(tensor_feature).collect(),
        outputs: inspection.outputs.iter().map(tensor_feature).collect(),
        declared_range: inspection.declared_value_range(),
    }
}

pub fn describe_onnx(path: &Path) -> Result<ModelDescription> {
    inspect_onnx(path).map(|inspection| describe_inspection(&inspection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_spec::{resolve_model_io, PortSpec, ResolveOptions};
    use crate::types::TensorLayout;
    use onnx_proto::*;

    fn dim(value: i64) -> tensor_shape_proto::Dimension {
        tensor_shape_proto::Dimension {
            value: Some(tensor_shape_proto::dimension::Value::DimValue(value)),
        }
    }

    fn symbolic(name: &str) -> tensor_shape_proto::Dimension {
        tensor_shape_proto::Dimension {
            value: Some(tensor_shape_proto::dimension::Value::DimParam(name.into())),
        }
    }

    fn value_info(name: &str, elem_type: i32, dims: Vec<tensor_shape_proto::Dimension>) -> ValueInfoProto {
        ValueInfoProto {
            name: name.into(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type,
                    shape: Some(TensorShapeProto { dim: dims }),
                })),
            }),
        }
    }

    /// A style network stub: one float16 NCHW input, one Conv node, one
    /// float16 NCHW output, and a range declared in metadata.
    fn build_style_model_bytes(range: Option<&str>) -> Vec<u8> {
        let conv = NodeProto {
            input: vec!["image".into(), "weight".into()],
            output: vec!["stylized".into()],
            name: "conv_0".into(),
            op_type: "Conv".into(),
            domain: String::new(),
        };
        let weight = TensorProto {
            dims: vec![3, 3, 3, 3],
            data_type: 10,
            name: "weight".into(),
        };
        let graph = GraphProto {
            node: vec![conv],
            name: "mosaic".into(),
            initializer: vec![weight],
            input: vec![
                value_info("image", 10, vec![dim(1), dim(3), dim(224), dim(224)]),
                value_info("weight", 10, vec![dim(3), dim(3), dim(3), dim(3)]),
            ],
            output: vec![value_info(
                "stylized",
                10,
                vec![dim(1), dim(3), dim(224), dim(224)],
            )],
        };
        ModelProto {
            ir_version: 7,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 13,
            }],
            producer_name: "pytorch".into(),
            producer_version: "2.1".into(),
            domain: String::new(),
            model_version: 1,
            doc_string: String::new(),
            graph: Some(graph),
            metadata_props: range
                .map(|value| {
                    vec![StringStringEntryProto {
                        key: VALUE_RANGE_METADATA_KEY.into(),
                        value: value.into(),
                    }]
                })
                .unwrap_or_default(),
        }
        .encode_to_vec()
    }

    #[test]
    fn inspect_reads_signature_and_metadata() {
        let info = inspect_onnx_bytes(&build_style_model_bytes(Some("0-255"))).unwrap();

        assert_eq!(info.ir_version, 7);
        assert_eq!(info.opset_version, 13);
        assert_eq!(info.producer_name, "pytorch");
        assert_eq!(info.graph_name, "mosaic");
        assert_eq!(info.metadata.get("value_range").map(String::as_str), Some("0-255"));
        assert_eq!(info.declared_value_range(), Some(ValueRange::Byte));

        // The initializer listed among graph inputs is not a feed.
        assert_eq!(info.inputs.len(), 1);
        assert_eq!(info.inputs[0].name, "image");
        assert_eq!(info.inputs[0].data_type, "float16");
        assert_eq!(info.inputs[0].shape, vec![1, 3, 224, 224]);

        assert_eq!(info.outputs.len(), 1);
        assert_eq!(info.op_count, 1);
        assert_eq!(info.nodes[0].op_type, "Conv");
        assert_eq!(info.param_count, 81);
    }

    #[test]
    fn description_feeds_the_resolver() {
        let info = inspect_onnx_bytes(&build_style_model_bytes(Some("unit"))).unwrap();
        let description = describe_inspection(&info);
        assert_eq!(description.declared_range, Some(ValueRange::Unit));

        let spec = resolve_model_io(&description, &ResolveOptions::default()).unwrap();
        let PortSpec::Tensor(input) = spec.input else {
            panic!("expected a tensor input");
        };
        assert_eq!(input.element, ElementType::F16);
        assert_eq!(input.layout, TensorLayout::Planar);
        assert_eq!((input.width, input.height), (224, 224));
    }

    #[test]
    fn unknown_metadata_range_is_ignored() {
        let info = inspect_onnx_bytes(&build_style_model_bytes(Some("-1..1"))).unwrap();
        assert_eq!(info.declared_value_range(), None);
        let info = inspect_onnx_bytes(&build_style_model_bytes(None)).unwrap();
        assert!(info.metadata.is_empty());
    }

    #[test]
    fn integer_inputs_become_unsupported_tensors() {
        let info = TensorInfo {
            name: "ids".into(),
            data_type: "int64".into(),
            shape: vec![1, 3, 8, 8],
        };
        assert_eq!(
            tensor_feature(&info).kind,
            FeatureKind::Tensor {
                element: None,
                shape: vec![1, 3, 8, 8]
            }
        );
    }

    #[test]
    fn symbolic_dims_are_dynamic() {
        let vi = value_info("x", 1, vec![symbolic("batch"), dim(3), symbolic("h"), symbolic("w")]);
        let ti = value_info_to_tensor(&vi);
        assert_eq!(ti.data_type, "float32");
        assert_eq!(ti.shape, vec![-1, 3, -1, -1]);
    }

    #[test]
    fn inspect_file_and_invalid_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("style.onnx");
        std::fs::write(&path, build_style_model_bytes(Some("0-1"))).unwrap();

        let description = describe_onnx(&path).unwrap();
        assert_eq!(description.inputs.len(), 1);

        assert!(inspect_onnx_bytes(b"not a valid protobuf").is_err());
        assert!(inspect_onnx(&dir.path().join("missing.onnx")).is_err());
    }

    #[test]
    fn data_type_names() {
        assert_eq!(data_type_name(1), "float32");
        assert_eq!(data_type_name(10), "float16");
        assert_eq!(data_type_name(7), "int64");
        assert_eq!(data_type_name(999), "unknown(999)");
    }
}
