//! Protocol Buffer types for the TensorFlow Serving `PredictionService`.
#![allow(clippy::derive_partial_eq_without_eq, clippy::enum_variant_names)]

pub mod tensorflow {
    tonic::include_proto!("tensorflow");

    pub mod serving {
        tonic::include_proto!("tensorflow.serving");
    }
}

pub use tensorflow::serving::prediction_service_client::PredictionServiceClient;
/// Server side of the service, exported so tests can run an in-process fake server.
pub use tensorflow::serving::prediction_service_server::{PredictionService, PredictionServiceServer};
pub use tensorflow::serving::{model_spec, ModelSpec, PredictRequest, PredictResponse};
pub use tensorflow::{tensor_shape_proto, DataType, TensorProto, TensorShapeProto};
