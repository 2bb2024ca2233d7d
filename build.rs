//! Compiles the TensorFlow Serving Protocol Buffers into native Rust types.

use std::path::{Path, PathBuf};

type Error = Box<dyn std::error::Error>;
type Result<T, E = Error> = std::result::Result<T, E>;

fn main() -> Result<()> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("proto");

    generate_grpc_types(&root)?;

    Ok(())
}

/// Schema used for the `PredictionService/Predict` call
///
/// Creates:
///
/// - `tensorflow.rs`
/// - `tensorflow.serving.rs`
fn generate_grpc_types(root: &Path) -> Result<()> {
    let framework_path = root.join("tensorflow/core/framework");
    let apis_path = root.join("tensorflow_serving/apis");

    let proto_files = vec![
        framework_path.join("types.proto"),
        framework_path.join("tensor_shape.proto"),
        framework_path.join("tensor.proto"),
        apis_path.join("model.proto"),
        apis_path.join("predict.proto"),
        apis_path.join("prediction_service.proto"),
    ];

    // Tell cargo to recompile if any of these proto files are changed
    for proto_file in &proto_files {
        println!("cargo:rerun-if-changed={}", proto_file.display());
    }

    tonic_build::configure()
        .build_client(true)
        // Server stubs back the fake service in tests/predict_test.rs.
        .build_server(true)
        .compile(&proto_files, &[root])?;

    Ok(())
}
