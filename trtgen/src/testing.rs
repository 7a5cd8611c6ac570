//! Stub denoising module for tests of the export path.

use std::cell::Cell;

use anyhow::bail;
use tract_onnx::pb::{
    GraphProto, NodeProto, TensorShapeProto, TypeProto, ValueInfoProto,
    tensor_proto::DataType, tensor_shape_proto, tensor_shape_proto::dimension, type_proto,
};

use crate::{
    descriptor::NetworkDescriptor,
    inputs::SyntheticInputs,
    module::{self, DenoisingModule, expected_input_names},
};

/// In-memory stand-in for a host-loaded UNet. Declares the input set implied
/// by the descriptor it was built from and emits a one-node graph whose
/// value infos carry the literal dimensions of the tensors it was traced
/// with.
pub struct StubUnet {
    inputs: Vec<String>,
    training: bool,
    fail_trace: bool,
    traces: Cell<usize>,
    observed_training: Cell<Option<bool>>,
}

impl StubUnet {
    pub fn new(descriptor: &NetworkDescriptor) -> Self {
        Self {
            inputs: expected_input_names(descriptor)
                .into_iter()
                .map(str::to_string)
                .collect(),
            training: false,
            fail_trace: false,
            traces: Cell::new(0),
            observed_training: Cell::new(None),
        }
    }

    /// Variant whose trace always fails, for exercising the error path.
    pub fn failing(descriptor: &NetworkDescriptor) -> Self {
        Self {
            fail_trace: true,
            ..Self::new(descriptor)
        }
    }

    pub fn set_training_flag(&mut self, training: bool) {
        self.training = training;
    }

    pub fn training_flag(&self) -> bool {
        self.training
    }

    /// Value of the training flag at the moment of the last trace, if any.
    pub fn observed_training_during_trace(&self) -> Option<bool> {
        self.observed_training.get()
    }

    pub fn trace_count(&self) -> usize {
        self.traces.get()
    }
}

impl DenoisingModule for StubUnet {
    fn training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn input_names(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn trace(&self, inputs: &SyntheticInputs) -> anyhow::Result<GraphProto> {
        self.traces.set(self.traces.get() + 1);
        self.observed_training.set(Some(self.training));
        if self.fail_trace {
            bail!("stub module refuses to trace");
        }

        let mut graph_inputs = Vec::new();
        for name in &self.inputs {
            let dims = match name.as_str() {
                module::SAMPLE => inputs.sample.dims().to_vec(),
                module::TIMESTEPS => inputs.timesteps.dims().to_vec(),
                module::CONTEXT => inputs.context.dims().to_vec(),
                module::CONTROL => match &inputs.control {
                    Some(t) => t.dims().to_vec(),
                    None => bail!("stub module expected a control tensor"),
                },
                other => bail!("stub module has no input named '{other}'"),
            };
            graph_inputs.push(value_info(name, &dims));
        }

        Ok(GraphProto {
            name: "denoising".to_string(),
            node: vec![NodeProto {
                input: vec![module::SAMPLE.to_string()],
                output: vec![module::OUT_SAMPLE.to_string()],
                name: "unet".to_string(),
                op_type: "Identity".to_string(),
                ..Default::default()
            }],
            input: graph_inputs,
            output: vec![value_info(module::OUT_SAMPLE, inputs.sample.dims())],
            ..Default::default()
        })
    }
}

fn value_info(name: &str, dims: &[usize]) -> ValueInfoProto {
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: DataType::Float as i32,
                shape: Some(TensorShapeProto {
                    dim: dims
                        .iter()
                        .map(|&d| tensor_shape_proto::Dimension {
                            value: Some(dimension::Value::DimValue(d as i64)),
                            ..Default::default()
                        })
                        .collect(),
                }),
                ..Default::default()
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}
