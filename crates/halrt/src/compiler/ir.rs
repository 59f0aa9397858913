//! Minimal SSA-style IR the import bridge rewrites.
//!
//! Operations are identified by dotted names (`check.expect_eq`, `vm.call`);
//! the prefix before the first dot is the dialect. Values are indices into
//! [`Function::values`], which records each value's type. Serializable so that
//! sources can be written as JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hal::ElementType;
use crate::module::ExecutableDef;

pub type ValueId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub element_type: ElementType,
    pub shape: Vec<usize>,
}

impl TensorType {
    pub fn new(element_type: ElementType, shape: &[usize]) -> Self {
        Self {
            element_type,
            shape: shape.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    I1,
    I32,
    I64,
    F32,
    Index,
    Tensor(TensorType),
    BufferView,
}

impl Type {
    pub fn tensor(element_type: ElementType, shape: &[usize]) -> Self {
        Type::Tensor(TensorType::new(element_type, shape))
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Type::Tensor(_))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::I1 => f.write_str("i1"),
            Type::I32 => f.write_str("i32"),
            Type::I64 => f.write_str("i64"),
            Type::F32 => f.write_str("f32"),
            Type::Index => f.write_str("index"),
            Type::BufferView => f.write_str("!hal.buffer_view"),
            Type::Tensor(tensor) => {
                f.write_str("tensor<")?;
                for dim in &tensor.shape {
                    write!(f, "{dim}x")?;
                }
                write!(f, "{}>", tensor.element_type)
            }
        }
    }
}

/// Dense literal; values are stored as `f64` and encoded per element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseElements {
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl DenseElements {
    pub fn new(element_type: ElementType, shape: &[usize], values: Vec<f64>) -> Self {
        Self {
            element_type,
            shape: shape.to_vec(),
            values,
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Little-endian bytes in the element type's layout. A single value splats.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        let count = self.element_count();
        let values: Vec<f64> = match self.values.len() {
            n if n == count => self.values.clone(),
            1 => vec![self.values[0]; count],
            _ => return None,
        };
        let mut bytes = Vec::with_capacity(count * self.element_type.size_in_bytes());
        for value in values {
            match self.element_type {
                ElementType::I1 | ElementType::U8 => bytes.push(value as u8),
                ElementType::I8 => bytes.push(value as i8 as u8),
                ElementType::I32 => bytes.extend_from_slice(&(value as i32).to_le_bytes()),
                ElementType::I64 => bytes.extend_from_slice(&(value as i64).to_le_bytes()),
                ElementType::F32 => bytes.extend_from_slice(&(value as f32).to_le_bytes()),
                ElementType::F64 => bytes.extend_from_slice(&value.to_le_bytes()),
            }
        }
        Some(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Dense(DenseElements),
}

impl Attribute {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Attribute::Float(value) => Some(*value),
            Attribute::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Attribute::Ints(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_dense(&self) -> Option<&DenseElements> {
        match self {
            Attribute::Dense(dense) => Some(dense),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub operands: Vec<ValueId>,
    #[serde(default)]
    pub results: Vec<ValueId>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl Operation {
    pub fn new(name: impl Into<String>, operands: Vec<ValueId>, results: Vec<ValueId>) -> Self {
        Self {
            name: name.into(),
            operands,
            results,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: Attribute) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn dialect(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Parameter values, in order. Builders allocate them as values `0..n`.
    pub params: Vec<ValueId>,
    pub results: Vec<Type>,
    pub values: Vec<Type>,
    pub body: Vec<Operation>,
}

impl Function {
    pub fn value_type(&self, value: ValueId) -> Option<&Type> {
        self.values.get(value as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceModule {
    pub name: String,
    pub functions: Vec<Function>,
    #[serde(default)]
    pub executables: Vec<ExecutableDef>,
}

impl SourceModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            executables: Vec::new(),
        }
    }
}

pub struct FunctionBuilder {
    function: Function,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, params: &[Type]) -> Self {
        Self {
            function: Function {
                name: name.into(),
                params: (0..params.len() as ValueId).collect(),
                results: Vec::new(),
                values: params.to_vec(),
                body: Vec::new(),
            },
        }
    }

    pub fn param(&self, index: usize) -> ValueId {
        self.function.params[index]
    }

    pub fn add_value(&mut self, ty: Type) -> ValueId {
        self.function.values.push(ty);
        (self.function.values.len() - 1) as ValueId
    }

    pub fn op(
        &mut self,
        name: &str,
        operands: &[ValueId],
        result_types: &[Type],
        attributes: &[(&str, Attribute)],
    ) -> Vec<ValueId> {
        let results: Vec<ValueId> = result_types
            .iter()
            .map(|ty| self.add_value(ty.clone()))
            .collect();
        let mut op = Operation::new(name, operands.to_vec(), results.clone());
        for (key, value) in attributes {
            op.attributes.insert((*key).to_string(), value.clone());
        }
        self.function.body.push(op);
        results
    }

    /// `std.constant` producing a value of `ty`.
    pub fn constant(&mut self, value: Attribute, ty: Type) -> ValueId {
        self.op("std.constant", &[], &[ty], &[("value", value)])[0]
    }

    pub fn dense_f32(&mut self, shape: &[usize], values: &[f32]) -> ValueId {
        let dense = DenseElements::new(
            ElementType::F32,
            shape,
            values.iter().map(|v| f64::from(*v)).collect(),
        );
        self.constant(Attribute::Dense(dense), Type::tensor(ElementType::F32, shape))
    }

    pub fn finish(mut self, returns: &[ValueId]) -> Function {
        self.function.results = returns
            .iter()
            .map(|value| self.function.values[*value as usize].clone())
            .collect();
        self.function
            .body
            .push(Operation::new("std.return", returns.to_vec(), Vec::new()));
        self.function
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_types_print_like_mlir() {
        assert_eq!(Type::tensor(ElementType::F32, &[2, 3]).to_string(), "tensor<2x3xf32>");
        assert_eq!(Type::tensor(ElementType::I32, &[]).to_string(), "tensor<i32>");
    }

    #[test]
    fn dense_splat_expands() {
        let dense = DenseElements::new(ElementType::I32, &[3], vec![7.0]);
        assert_eq!(
            dense.to_bytes().unwrap(),
            [7i32, 7, 7].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>()
        );
        let bad = DenseElements::new(ElementType::I32, &[3], vec![1.0, 2.0]);
        assert!(bad.to_bytes().is_none());
    }

    #[test]
    fn source_modules_parse_from_json() {
        let json = r#"{
            "name": "demo",
            "functions": [{
                "name": "main",
                "params": [],
                "results": [],
                "values": ["i1"],
                "body": [
                    {"name": "std.constant", "results": [0], "attributes": {"value": {"int": 1}}},
                    {"name": "check.expect_true", "operands": [0]},
                    {"name": "std.return"}
                ]
            }]
        }"#;
        let module: SourceModule = serde_json::from_str(json).unwrap();
        assert_eq!(module.functions[0].body.len(), 3);
        assert_eq!(module.functions[0].body[1].dialect(), "check");
    }
}
