//! Latency benchmark client for TensorFlow Serving.
//!
//! Builds one `PredictRequest` from a feature schema, then sends it
//! repeatedly over a single gRPC channel and reports per-call round-trip
//! time together with the returned scores.

pub mod bench;
pub mod client;
pub mod proto;
pub mod request;
pub mod retry;
pub mod schema;
pub mod tensor;

pub use crate::bench::{report, report_schema, Bench, BenchConfig, IterationResult, OutputFormat, Summary};
pub use crate::client::{Client, ClientConfig, ClientError, Predictor};
pub use crate::request::{build_feature_request, ModelRef, Request};
pub use crate::retry::RetryPolicy;
pub use crate::schema::{Schema, SchemaError};
pub use crate::tensor::{DType, EncodeError, Shape, Tensor, Values};

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("predict call failed: {0}")]
    Rpc(tonic::Status),
    #[error("predict call failed after {attempts} attempts: {status}")]
    RetriesExhausted { attempts: u32, status: tonic::Status },
    #[error("response has no output named {0:?}")]
    MissingOutput(String),
    #[error("failed to write results")]
    Output(#[from] io::Error),
    #[error("failed to serialize results")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BenchError::MissingOutput("output1".to_string());
        assert_eq!(err.to_string(), "response has no output named \"output1\"");

        let err = BenchError::from(EncodeError::EmptyMatrix);
        assert_eq!(err.to_string(), "cannot encode a matrix without rows");
    }
}
