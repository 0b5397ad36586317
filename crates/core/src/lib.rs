//! Core crate for stylecast: real-time style transfer over a frame stream.

pub mod buffer_cache;
pub mod compute;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model_inspect;
pub mod model_spec;
mod onnx_proto;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod source;
pub mod types;
pub mod video_input;
