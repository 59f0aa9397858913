use std::fmt;

use crate::hal::{BufferView, HalError, HalResult};
use crate::module::ValueKind;

/// A VM register value.
#[derive(Clone, Debug)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    BufferView(BufferView),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::F32(_) => ValueKind::F32,
            Value::BufferView(_) => ValueKind::BufferView,
        }
    }

    pub fn as_i32(&self) -> HalResult<i32> {
        match self {
            Value::I32(value) => Ok(*value),
            other => Err(kind_mismatch(ValueKind::I32, other)),
        }
    }

    pub fn as_i64(&self) -> HalResult<i64> {
        match self {
            Value::I64(value) => Ok(*value),
            other => Err(kind_mismatch(ValueKind::I64, other)),
        }
    }

    pub fn as_f32(&self) -> HalResult<f32> {
        match self {
            Value::F32(value) => Ok(*value),
            other => Err(kind_mismatch(ValueKind::F32, other)),
        }
    }

    pub fn as_buffer_view(&self) -> HalResult<&BufferView> {
        match self {
            Value::BufferView(view) => Ok(view),
            other => Err(kind_mismatch(ValueKind::BufferView, other)),
        }
    }
}

fn kind_mismatch(expected: ValueKind, actual: &Value) -> HalError {
    HalError::invalid_argument(format!("expected {expected} value, got {}", actual.kind()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(value) => write!(f, "{value}:i32"),
            Value::I64(value) => write!(f, "{value}:i64"),
            Value::F32(value) => write!(f, "{value}:f32"),
            Value::BufferView(view) => {
                let dims: Vec<String> = view.shape().iter().map(|d| d.to_string()).collect();
                write!(f, "buffer_view<{}x{}>", dims.join("x"), view.element_type())
            }
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::F32(value)
    }
}

impl From<BufferView> for Value {
    fn from(view: BufferView) -> Self {
        Value::BufferView(view)
    }
}
