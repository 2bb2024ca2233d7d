use std::collections::HashMap;

use crate::proto::{model_spec, ModelSpec, PredictRequest, TensorProto};
use crate::schema::Schema;
use crate::tensor::{encode_float_vector, encode_string_vector, EncodeError, Tensor};

pub const DEFAULT_MODEL: &str = "model";
pub const DEFAULT_SIGNATURE: &str = "pred";
/// Input key carrying the label tensor next to the schema features.
pub const LABEL_INPUT: &str = "label";

/// Which served model, version and signature a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub name: String,
    pub signature_name: String,
    /// Latest version when unset.
    pub version: Option<i64>,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            signature_name: DEFAULT_SIGNATURE.to_string(),
            version: None,
        }
    }
}

impl From<&ModelRef> for ModelSpec {
    fn from(model: &ModelRef) -> Self {
        ModelSpec {
            name: model.name.clone(),
            signature_name: model.signature_name.clone(),
            version_choice: model.version.map(model_spec::VersionChoice::Version),
        }
    }
}

/// Named input tensors for one predict call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    model: ModelRef,
    inputs: HashMap<String, Tensor>,
    output_filter: Vec<String>,
}

impl Request {
    pub fn new(model: ModelRef) -> Self {
        Self {
            model,
            inputs: HashMap::new(),
            output_filter: Vec::new(),
        }
    }

    /// Inserts an input, returning the tensor it replaced.
    pub fn insert_input(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.inputs.insert(name.into(), tensor)
    }

    pub fn with_input(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert_input(name, tensor);
        self
    }

    /// Restricts the response to the named outputs.
    pub fn with_output_filter(mut self, name: impl Into<String>) -> Self {
        self.output_filter.push(name.into());
        self
    }

    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    pub fn inputs(&self) -> &HashMap<String, Tensor> {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs.get(name)
    }

    pub fn to_proto(&self) -> PredictRequest {
        PredictRequest {
            model_spec: Some(ModelSpec::from(&self.model)),
            inputs: self
                .inputs
                .iter()
                .map(|(name, tensor)| (name.clone(), TensorProto::from(tensor)))
                .collect(),
            output_filter: self.output_filter.clone(),
        }
    }
}

/// Feeds the same string examples to every schema column and adds a float
/// `label` input. Both share the batch dimension, so their lengths must match.
pub fn build_feature_request<S: AsRef<str> + Sync>(
    model: ModelRef,
    schema: &Schema,
    examples: &[S],
    labels: &[f32],
) -> Result<Request, EncodeError> {
    if examples.len() != labels.len() {
        return Err(EncodeError::BatchMismatch {
            examples: examples.len(),
            labels: labels.len(),
        });
    }

    let features = encode_string_vector(examples);
    let mut request = Request::new(model);
    for column in schema.iter() {
        request.insert_input(column, features.clone());
    }
    request.insert_input(LABEL_INPUT, encode_float_vector(labels));
    Ok(request)
}
