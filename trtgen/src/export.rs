//! One-shot graph export: trace the loaded module over a synthetic input
//! set and serialize the captured graph as an opset-tagged ONNX file.

use std::{
    fs,
    ops::Deref,
    path::{Path, PathBuf},
};

use prost_tract_compat::Message;
use tract_onnx::pb::{
    GraphProto, ModelProto, OperatorSetIdProto, ValueInfoProto, tensor_shape_proto::dimension,
    type_proto,
};
use tracing::{debug, info};

use crate::{
    descriptor::NetworkDescriptor,
    error::{Error, Result},
    inputs::SyntheticInputs,
    module::{self, DenoisingModule, expected_input_names},
};

/// Opset the host form defaults to. Leave it alone unless you know what
/// you are doing.
pub const DEFAULT_OPSET_VERSION: i64 = 17;

/// ONNX IR version written into the exported model, matching opset 17-era
/// models.
const IR_VERSION: i64 = 8;

/// Axes that must stay dynamic in the exported graph. Leaving one at its
/// synthetic literal would pin the engine to that size forever.
const DYNAMIC_AXES: &[(&str, &[(usize, &str)])] = &[
    (module::SAMPLE, &[(0, "batch"), (2, "height"), (3, "width")]),
    (module::TIMESTEPS, &[(0, "batch")]),
    (module::CONTEXT, &[(0, "batch"), (1, "sequence")]),
    (module::CONTROL, &[(0, "batch"), (2, "height"), (3, "width")]),
    (module::OUT_SAMPLE, &[(0, "batch"), (2, "height"), (3, "width")]),
];

/// Trace `module` once and write the resulting graph to `output_path`.
///
/// The module is put into evaluation mode for the duration of the trace and
/// its previous train/eval flag is restored on every exit path, so the
/// host's model stays usable whether or not the export succeeds. Exactly one
/// file is written; parent directories are created as needed.
pub fn export<M>(
    module: &mut M,
    descriptor: &NetworkDescriptor,
    output_path: &Path,
    opset_version: i64,
) -> Result<PathBuf>
where
    M: DenoisingModule + ?Sized,
{
    check_module_inputs(module, descriptor)?;

    let inputs = SyntheticInputs::representative(descriptor)?;
    let mut graph = {
        let module = EvalMode::enter(module);
        module.trace(&inputs).map_err(|e| Error::Trace {
            reason: format!("{e:#}"),
        })?
    };

    check_traced_inputs(&graph, descriptor)?;
    mark_dynamic_axes(&mut graph);

    let model = ModelProto {
        ir_version: IR_VERSION,
        producer_name: "trtgen".to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: opset_version,
        }],
        graph: Some(graph),
        ..Default::default()
    };

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| Error::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(output_path, model.encode_to_vec()).map_err(|source| Error::Io {
        path: output_path.to_path_buf(),
        source,
    })?;

    info!("exported denoising graph to {}", output_path.display());
    Ok(output_path.to_path_buf())
}

/// Scoped eval-mode switch. Restores the previous training flag on drop,
/// which also covers the error paths out of the trace.
struct EvalMode<'a, M: DenoisingModule + ?Sized> {
    module: &'a mut M,
    was_training: bool,
}

impl<'a, M: DenoisingModule + ?Sized> EvalMode<'a, M> {
    fn enter(module: &'a mut M) -> Self {
        let was_training = module.training();
        module.set_training(false);
        Self {
            module,
            was_training,
        }
    }
}

impl<M: DenoisingModule + ?Sized> Deref for EvalMode<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.module
    }
}

impl<M: DenoisingModule + ?Sized> Drop for EvalMode<'_, M> {
    fn drop(&mut self) {
        self.module.set_training(self.was_training);
    }
}

/// The descriptor's conditioning variant must agree with the inputs the
/// module actually consumes. Tracing would not catch the disagreement; it
/// would silently capture an incomplete graph.
fn check_module_inputs<M>(module: &M, descriptor: &NetworkDescriptor) -> Result<()>
where
    M: DenoisingModule + ?Sized,
{
    let actual = module.input_names();
    let expected = expected_input_names(descriptor);

    let has_control = actual.iter().any(|n| n == module::CONTROL);
    if descriptor.conditioning.is_active() && !has_control {
        return Err(Error::Trace {
            reason: format!(
                "descriptor declares the control branch active but the module does \
                 not consume a '{}' input",
                module::CONTROL
            ),
        });
    }
    if !descriptor.conditioning.is_active() && has_control {
        return Err(Error::Trace {
            reason: format!(
                "module consumes a '{}' input but the descriptor declares \
                 conditioning inactive",
                module::CONTROL
            ),
        });
    }

    let mut actual_sorted = actual.clone();
    actual_sorted.sort();
    let mut expected_sorted: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    expected_sorted.sort();
    if actual_sorted != expected_sorted {
        return Err(Error::Trace {
            reason: format!("module inputs {actual:?} do not match the expected {expected:?}"),
        });
    }
    Ok(())
}

/// The traced graph must expose exactly the inputs the descriptor promised.
fn check_traced_inputs(graph: &GraphProto, descriptor: &NetworkDescriptor) -> Result<()> {
    let expected = expected_input_names(descriptor);
    for name in &expected {
        if !graph.input.iter().any(|i| i.name == *name) {
            return Err(Error::Trace {
                reason: format!("traced graph is missing the '{name}' input"),
            });
        }
    }
    for input in &graph.input {
        if !expected.iter().any(|n| *n == input.name) {
            return Err(Error::Trace {
                reason: format!("traced graph has an unexpected '{}' input", input.name),
            });
        }
    }
    Ok(())
}

fn mark_dynamic_axes(graph: &mut GraphProto) {
    for info in graph.input.iter_mut().chain(graph.output.iter_mut()) {
        let Some((_, axes)) = DYNAMIC_AXES.iter().find(|(name, _)| *name == info.name) else {
            continue;
        };
        for (axis, dim_name) in axes.iter() {
            set_dim_param(info, *axis, dim_name);
        }
        debug!("marked dynamic axes {:?} on '{}'", axes, info.name);
    }
}

fn set_dim_param(info: &mut ValueInfoProto, axis: usize, dim_name: &str) {
    let Some(type_proto::Value::TensorType(tensor)) =
        info.r#type.as_mut().and_then(|t| t.value.as_mut())
    else {
        return;
    };
    let Some(shape) = tensor.shape.as_mut() else {
        return;
    };
    if let Some(dim) = shape.dim.get_mut(axis) {
        dim.value = Some(dimension::Value::DimParam(dim_name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use prost_tract_compat::Message;
    use tract_onnx::pb::{ModelProto, tensor_shape_proto::dimension};

    use super::export;
    use crate::{
        Error,
        descriptor::{Conditioning, NetworkDescriptor},
        testing::StubUnet,
    };

    fn dim_params(model: &ModelProto, input: &str) -> Vec<Option<String>> {
        let graph = model.graph.as_ref().unwrap();
        let info = graph
            .input
            .iter()
            .find(|i| i.name == input)
            .unwrap_or_else(|| panic!("missing input {input}"));
        let Some(tract_onnx::pb::type_proto::Value::TensorType(tensor)) =
            info.r#type.as_ref().and_then(|t| t.value.as_ref())
        else {
            panic!("missing tensor type on {input}");
        };
        tensor
            .shape
            .as_ref()
            .unwrap()
            .dim
            .iter()
            .map(|d| match &d.value {
                Some(dimension::Value::DimParam(p)) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn writes_opset_tagged_model_with_dynamic_axes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("v1-5.onnx");
        let descriptor = NetworkDescriptor::stable_diffusion("v1-5");
        let mut module = StubUnet::new(&descriptor);

        let written = export(&mut module, &descriptor, &path, 17).unwrap();
        assert_eq!(written, path);

        let bytes = std::fs::read(&path).unwrap();
        let model = ModelProto::decode(&bytes[..]).unwrap();
        assert_eq!(model.opset_import[0].version, 17);

        assert_eq!(
            dim_params(&model, "sample"),
            vec![
                Some("batch".into()),
                None,
                Some("height".into()),
                Some("width".into())
            ]
        );
        assert_eq!(dim_params(&model, "timesteps"), vec![Some("batch".into())]);
        assert_eq!(
            dim_params(&model, "context"),
            vec![Some("batch".into()), Some("sequence".into()), None]
        );
    }

    #[test]
    fn restores_training_flag_on_success_and_failure() {
        let descriptor = NetworkDescriptor::stable_diffusion("v1-5");
        let dir = tempfile::tempdir().unwrap();

        let mut module = StubUnet::new(&descriptor);
        module.set_training_flag(true);
        export(&mut module, &descriptor, &dir.path().join("a.onnx"), 17).unwrap();
        assert!(module.training_flag());
        assert_eq!(module.observed_training_during_trace(), Some(false));

        let mut failing = StubUnet::failing(&descriptor);
        failing.set_training_flag(true);
        let err = export(&mut failing, &descriptor, &dir.path().join("b.onnx"), 17).unwrap_err();
        assert!(matches!(err, Error::Trace { .. }));
        assert!(failing.training_flag());
        assert!(!dir.path().join("b.onnx").exists());
    }

    #[test]
    fn conditioning_mismatch_fails_before_tracing() {
        let dir = tempfile::tempdir().unwrap();
        let plain = NetworkDescriptor::stable_diffusion("v1-5");
        let conditioned =
            plain.clone().with_conditioning(Conditioning::Active { channels: 3 });

        // Module built without the control input, descriptor says active.
        let mut module = StubUnet::new(&plain);
        let err = export(&mut module, &conditioned, &dir.path().join("c.onnx"), 17).unwrap_err();
        assert!(matches!(err, Error::Trace { .. }));
        assert!(err.to_string().contains("control"));
        assert_eq!(module.trace_count(), 0);

        // Module built with the control input, descriptor says inactive.
        let mut module = StubUnet::new(&conditioned);
        let err = export(&mut module, &plain, &dir.path().join("d.onnx"), 17).unwrap_err();
        assert!(matches!(err, Error::Trace { .. }));
        assert_eq!(module.trace_count(), 0);
    }

    #[test]
    fn control_input_round_trips_when_conditioning_active() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = NetworkDescriptor::stable_diffusion("v1-5")
            .with_conditioning(Conditioning::Active { channels: 3 });
        let mut module = StubUnet::new(&descriptor);
        let path = dir.path().join("ctrl.onnx");

        export(&mut module, &descriptor, &path, 17).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let model = ModelProto::decode(&bytes[..]).unwrap();
        assert_eq!(
            dim_params(&model, "control"),
            vec![
                Some("batch".into()),
                None,
                Some("height".into()),
                Some("width".into())
            ]
        );
    }
}
