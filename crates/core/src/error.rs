use thiserror::Error;

use crate::types::ValueRange;

/// Errors raised while loading a model or converting a single frame.
///
/// Load-time variants are fatal to loading and go back to the caller.
/// Frame-time variants are recovered by presenting the original frame.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("model exposes no tensor-typed input")]
    NoTensorInput,

    #[error("ambiguous tensor layout for shape {shape:?}: {reason}")]
    AmbiguousLayout { shape: Vec<i64>, reason: String },

    #[error("unsupported model shape for '{feature}': {reason}")]
    UnsupportedModelShape { feature: String, reason: String },

    #[error("model value range is not specified in config or model metadata")]
    UnspecifiedValueRange,

    #[error("configured value range {configured} conflicts with model-declared range {declared}")]
    ValueRangeConflict {
        configured: ValueRange,
        declared: ValueRange,
    },

    #[error("compute resource unavailable: {0}")]
    ComputeResourceUnavailable(String),

    #[error("scratch allocation failed for role '{role}': {bytes} bytes")]
    AllocationFailed { role: String, bytes: usize },

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl PipelineError {
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::NoTensorInput
                | Self::AmbiguousLayout { .. }
                | Self::UnsupportedModelShape { .. }
                | Self::UnspecifiedValueRange
                | Self::ValueRangeConflict { .. }
        )
    }

    pub fn is_frame_recoverable(&self) -> bool {
        !self.is_load_error()
    }

    /// Short stable label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoTensorInput => "no_tensor_input",
            Self::AmbiguousLayout { .. } => "ambiguous_layout",
            Self::UnsupportedModelShape { .. } => "unsupported_model_shape",
            Self::UnspecifiedValueRange => "unspecified_value_range",
            Self::ValueRangeConflict { .. } => "value_range_conflict",
            Self::ComputeResourceUnavailable(_) => "compute_resource_unavailable",
            Self::AllocationFailed { .. } => "allocation_failed",
            Self::InferenceFailed(_) => "inference_failed",
            Self::InvalidFrame(_) => "invalid_frame",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_frame_errors_are_disjoint() {
        let load = [
            PipelineError::NoTensorInput,
            PipelineError::UnspecifiedValueRange,
            PipelineError::AmbiguousLayout {
                shape: vec![1, 3, 3, 8],
                reason: "two axes of size 3".into(),
            },
        ];
        for error in &load {
            assert!(error.is_load_error(), "{error}");
            assert!(!error.is_frame_recoverable(), "{error}");
        }

        let frame = [
            PipelineError::InferenceFailed("boom".into()),
            PipelineError::AllocationFailed {
                role: "preprocess".into(),
                bytes: 16,
            },
            PipelineError::ComputeResourceUnavailable("no device".into()),
        ];
        for error in &frame {
            assert!(error.is_frame_recoverable(), "{error}");
        }
    }

    #[test]
    fn conflict_message_names_both_ranges() {
        let error = PipelineError::ValueRangeConflict {
            configured: ValueRange::Unit,
            declared: ValueRange::Byte,
        };
        let text = error.to_string();
        assert!(text.contains("0-1"));
        assert!(text.contains("0-255"));
        assert_eq!(error.kind(), "value_range_conflict");
    }
}
