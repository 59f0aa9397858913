//! Runs one module function on several backends and compares the results.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::check::{CheckRecorder, CheckReport};
use crate::config::RuntimeConfig;
use crate::hal::{
    ensure_drivers_registered, has_driver, list_drivers, BufferView, Device, DeviceDescriptor,
    HalError, HalResult, HostTensor,
};
use crate::module::CompiledModule;
use crate::vm::{standard_registry, Context, Value};

/// Host-side argument or result, independent of any device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostValue {
    I32(i32),
    I64(i64),
    F32(f32),
    Tensor(HostTensor),
}

impl HostValue {
    pub fn to_value(&self, device: &dyn Device) -> HalResult<Value> {
        Ok(match self {
            HostValue::I32(v) => Value::I32(*v),
            HostValue::I64(v) => Value::I64(*v),
            HostValue::F32(v) => Value::F32(*v),
            HostValue::Tensor(tensor) => {
                Value::BufferView(BufferView::from_host(device.allocator(), tensor)?)
            }
        })
    }

    pub fn from_value(value: &Value) -> HalResult<Self> {
        Ok(match value {
            Value::I32(v) => HostValue::I32(*v),
            Value::I64(v) => HostValue::I64(*v),
            Value::F32(v) => HostValue::F32(*v),
            Value::BufferView(view) => HostValue::Tensor(view.to_host()?),
        })
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::I32(v) => write!(f, "{v}i32"),
            HostValue::I64(v) => write!(f, "{v}i64"),
            HostValue::F32(v) => write!(f, "{v}f32"),
            HostValue::Tensor(tensor) => {
                write!(f, "{}{:?}", tensor.element_type, tensor.shape)?;
                if tensor.element_type.is_float() {
                    write!(f, " {:?}", tensor.to_f64_vec())
                } else {
                    write!(f, " {:?}", tensor.to_i64_vec())
                }
            }
        }
    }
}

/// Validates a comma-separated backend list against the driver registry.
pub fn parse_target_backends(list: &str) -> HalResult<Vec<String>> {
    ensure_drivers_registered();
    let mut backends = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let descriptor = DeviceDescriptor::parse(entry)?;
        if !has_driver(&descriptor.driver) {
            return Err(HalError::invalid_argument(format!(
                "unknown backend '{}' (valid: {})",
                descriptor.driver,
                list_drivers().join(", ")
            )));
        }
        backends.push(descriptor.to_string());
    }
    if backends.is_empty() {
        return Err(HalError::invalid_argument(format!(
            "no target backends given (valid: {})",
            list_drivers().join(", ")
        )));
    }
    Ok(backends)
}

#[derive(Debug, Clone)]
pub struct BackendRun {
    pub backend: String,
    pub values: Vec<HostValue>,
    pub checks: CheckReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disagreement {
    pub lhs: String,
    pub rhs: String,
    pub result: usize,
    pub detail: String,
}

impl fmt::Display for Disagreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vs {} result #{}: {}",
            self.lhs, self.rhs, self.result, self.detail
        )
    }
}

/// Per-backend results of one function, in backend order.
#[derive(Debug, Clone, Default)]
pub struct MultiResults {
    pub runs: Vec<BackendRun>,
}

impl MultiResults {
    pub fn get(&self, backend: &str) -> Option<&BackendRun> {
        self.runs.iter().find(|run| run.backend == backend)
    }

    /// Every pairwise mismatch. Floats pass when `|a-b| <= atol + rtol*|b|`.
    pub fn collect_disagreements(&self, rtol: f64, atol: f64) -> Vec<Disagreement> {
        let mut disagreements = Vec::new();
        for (i, lhs) in self.runs.iter().enumerate() {
            for rhs in &self.runs[i + 1..] {
                let disagree = |result: usize, detail: String| Disagreement {
                    lhs: lhs.backend.clone(),
                    rhs: rhs.backend.clone(),
                    result,
                    detail,
                };
                if lhs.values.len() != rhs.values.len() {
                    disagreements.push(disagree(
                        0,
                        format!(
                            "{} results vs {}",
                            lhs.values.len(),
                            rhs.values.len()
                        ),
                    ));
                    continue;
                }
                for (index, (a, b)) in lhs.values.iter().zip(&rhs.values).enumerate() {
                    if let Some(detail) = compare_values(a, b, rtol, atol) {
                        disagreements.push(disagree(index, detail));
                    }
                }
            }
        }
        disagreements
    }

    pub fn assert_all_close(&self, rtol: f64, atol: f64) -> HalResult<()> {
        let disagreements = self.collect_disagreements(rtol, atol);
        if disagreements.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = disagreements.iter().map(ToString::to_string).collect();
        Err(HalError::execution(format!(
            "backends disagree:\n{}",
            lines.join("\n")
        )))
    }

    pub fn assert_all_equal(&self) -> HalResult<()> {
        self.assert_all_close(0.0, 0.0)
    }
}

fn close(a: f64, b: f64, rtol: f64, atol: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    a == b || (a - b).abs() <= atol + rtol * b.abs()
}

fn compare_values(a: &HostValue, b: &HostValue, rtol: f64, atol: f64) -> Option<String> {
    match (a, b) {
        (HostValue::I32(x), HostValue::I32(y)) => (x != y).then(|| format!("{x} != {y}")),
        (HostValue::I64(x), HostValue::I64(y)) => (x != y).then(|| format!("{x} != {y}")),
        (HostValue::F32(x), HostValue::F32(y)) => (!close(f64::from(*x), f64::from(*y), rtol, atol))
            .then(|| format!("{x} vs {y}")),
        (HostValue::Tensor(x), HostValue::Tensor(y)) => compare_tensors(x, y, rtol, atol),
        _ => Some(format!("kind mismatch: {a} vs {b}")),
    }
}

fn compare_tensors(a: &HostTensor, b: &HostTensor, rtol: f64, atol: f64) -> Option<String> {
    if a.element_type != b.element_type || a.shape != b.shape {
        return Some(format!(
            "{}{:?} vs {}{:?}",
            a.element_type, a.shape, b.element_type, b.shape
        ));
    }
    let mismatches: Vec<usize> = if a.element_type.is_float() {
        a.to_f64_vec()
            .into_iter()
            .zip(b.to_f64_vec())
            .enumerate()
            .filter(|(_, (x, y))| !close(*x, *y, rtol, atol))
            .map(|(index, _)| index)
            .collect()
    } else {
        a.to_i64_vec()
            .into_iter()
            .zip(b.to_i64_vec())
            .enumerate()
            .filter(|(_, (x, y))| x != y)
            .map(|(index, _)| index)
            .collect()
    };
    let first = *mismatches.first()?;
    Some(format!(
        "{} of {} elements differ, first at index {first}",
        mismatches.len(),
        a.element_count()
    ))
}

/// Loads `module` on each backend, invokes `function` and collects host results.
pub fn run_on_backends(
    module: &CompiledModule,
    function: &str,
    args: &[HostValue],
    backends: &[String],
) -> HalResult<MultiResults> {
    ensure_drivers_registered();
    let max_mismatches = RuntimeConfig::global().check_max_mismatches;
    let mut results = MultiResults::default();
    for backend in backends {
        let _span = tracing::debug_span!("backend_run", backend = %backend, function).entered();
        let device = DeviceDescriptor::parse(backend)?.create_device()?;
        let recorder = Arc::new(CheckRecorder::new(max_mismatches));
        let registry = standard_registry(recorder.clone())?;
        let context = Context::load(device.clone(), &registry, module.clone())?;
        let inputs = args
            .iter()
            .map(|arg| arg.to_value(device.as_ref()))
            .collect::<HalResult<Vec<_>>>()?;
        let outputs = context.invoke(function, &inputs)?;
        let values = outputs
            .iter()
            .map(HostValue::from_value)
            .collect::<HalResult<Vec<_>>>()?;
        tracing::debug!(results = values.len(), "backend run complete");
        results.runs.push(BackendRun {
            backend: backend.clone(),
            values,
            checks: recorder.take_report(),
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(backend: &str, values: Vec<HostValue>) -> BackendRun {
        BackendRun {
            backend: backend.to_string(),
            values,
            checks: CheckReport::default(),
        }
    }

    #[test]
    fn float_tensors_compare_with_tolerance() {
        let results = MultiResults {
            runs: vec![
                run("a", vec![HostValue::Tensor(HostTensor::from_f32(&[2], &[1.0, 2.0]))]),
                run("b", vec![HostValue::Tensor(HostTensor::from_f32(&[2], &[1.0, 2.001]))]),
            ],
        };
        assert!(results.assert_all_close(0.0, 1e-2).is_ok());
        let strict = results.collect_disagreements(0.0, 1e-6);
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].lhs, "a");
        assert_eq!(strict[0].rhs, "b");
        assert!(strict[0].detail.contains("first at index 1"));
        assert!(results.assert_all_equal().is_err());
    }

    #[test]
    fn integers_must_match_exactly() {
        let results = MultiResults {
            runs: vec![
                run("a", vec![HostValue::I32(3)]),
                run("b", vec![HostValue::I32(3)]),
                run("c", vec![HostValue::I32(4)]),
            ],
        };
        let disagreements = results.collect_disagreements(1.0, 1.0);
        let pairs: Vec<(&str, &str)> = disagreements
            .iter()
            .map(|d| (d.lhs.as_str(), d.rhs.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a", "c"), ("b", "c")]);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let results = MultiResults {
            runs: vec![
                run("a", vec![HostValue::Tensor(HostTensor::from_i32(&[2], &[1, 2]))]),
                run("b", vec![HostValue::Tensor(HostTensor::from_i32(&[1, 2], &[1, 2]))]),
            ],
        };
        let disagreements = results.collect_disagreements(0.0, 0.0);
        assert_eq!(disagreements.len(), 1);
        assert!(disagreements[0].detail.contains("[1, 2]"));
    }

    #[test]
    fn unknown_backend_lists_valid_names() {
        let err = parse_target_backends("definitely-not-a-driver").unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert!(err.to_string().contains("valid:"));
        assert!(parse_target_backends(" , ").is_err());
    }
}
