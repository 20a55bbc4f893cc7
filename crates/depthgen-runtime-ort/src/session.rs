use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use half::f16;
use ndarray::ArrayD;
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};

use crate::provider::{build_session_for_provider, ProviderChoice};

pub(crate) type NamedInput = (Cow<'static, str>, SessionInputValue<'static>);

/// One loaded graph plus the element types its inputs were exported with.
///
/// Inputs are built from `f32` arrays and converted to whatever the graph declares, so fp16 and
/// fp32 exports run through the same code. Outputs come back as `f32` either way.
pub(crate) struct ModelSession {
    label: &'static str,
    session: Mutex<Session>,
    input_types: HashMap<String, TensorElementType>,
    output_names: Vec<String>,
}

impl ModelSession {
    pub(crate) fn load(label: &'static str, model_file: &Path, provider: ProviderChoice) -> Result<Self> {
        let session = build_session_for_provider(model_file, provider)
            .with_context(|| format!("loading {} from {}", label, model_file.display()))?;
        let input_types = session
            .inputs
            .iter()
            .filter_map(|input| match &input.input_type {
                ValueType::Tensor { ty, .. } => Some((input.name.clone(), *ty)),
                _ => None,
            })
            .collect();
        let output_names = session.outputs.iter().map(|output| output.name.clone()).collect();
        tracing::debug!(model = label, path = %model_file.display(), provider = provider.label(), "session ready");
        Ok(Self {
            label,
            session: Mutex::new(session),
            input_types,
            output_names,
        })
    }

    pub(crate) fn has_input(&self, name: &str) -> bool {
        self.input_types.contains_key(name)
    }

    pub(crate) fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub(crate) fn input(&self, name: impl Into<Cow<'static, str>>, array: ArrayD<f32>) -> Result<NamedInput> {
        let name = name.into();
        let value: DynValue = match self.input_types.get(name.as_ref()) {
            Some(TensorElementType::Float16) => Tensor::from_array(array.mapv(f16::from_f32))?.into_dyn(),
            Some(TensorElementType::Int64) => Tensor::from_array(array.mapv(|v| v as i64))?.into_dyn(),
            Some(TensorElementType::Int32) => Tensor::from_array(array.mapv(|v| v as i32))?.into_dyn(),
            Some(TensorElementType::Float32) | None => Tensor::from_array(array)?.into_dyn(),
            Some(other) => return Err(anyhow!("{} input {} has unsupported type {:?}", self.label, name, other)),
        };
        Ok((name, SessionInputValue::from(value)))
    }

    /// Runs the graph and returns the named outputs in the order asked for.
    pub(crate) fn run(&self, inputs: Vec<NamedInput>, output_names: &[&str]) -> Result<Vec<ArrayD<f32>>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("{} session lock poisoned", self.label))?;
        let outputs = session.run(inputs).with_context(|| format!("running {}", self.label))?;
        output_names
            .iter()
            .map(|name| {
                let value = outputs
                    .get(*name)
                    .ok_or_else(|| anyhow!("{} returned no output named {}", self.label, name))?;
                extract_f32(value)
            })
            .collect()
    }

    pub(crate) fn run_first(&self, inputs: Vec<NamedInput>) -> Result<ArrayD<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("{} session lock poisoned", self.label))?;
        let outputs = session.run(inputs).with_context(|| format!("running {}", self.label))?;
        if outputs.len() == 0 {
            return Err(anyhow!("{} returned no outputs", self.label));
        }
        extract_f32(&outputs[0])
    }
}

fn extract_f32(value: &DynValue) -> Result<ArrayD<f32>> {
    if let Ok(view) = value.try_extract_array::<f32>() {
        return Ok(view.to_owned());
    }
    let view = value.try_extract_array::<f16>()?;
    Ok(view.mapv(f32::from))
}
