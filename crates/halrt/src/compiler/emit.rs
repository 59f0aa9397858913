use std::collections::HashMap;

use super::imports::ImportSymbolTable;
use super::ir::{Attribute, Function, Operation, SourceModule, ValueId};
use super::types::value_kind;
use super::{ConversionError, ConversionResult, OpLocation};
use crate::module::{self, CompiledModule, Instruction, Register, ValueKind};

/// Serializes VM-form functions into a loadable module.
///
/// Registers are assigned densely: parameters first, then every op result in
/// definition order. Imports are declared on first use.
pub fn emit_module(
    source: &SourceModule,
    imports: &ImportSymbolTable,
) -> ConversionResult<CompiledModule> {
    let mut module = CompiledModule::new(source.name.clone());
    module.executables = source.executables.clone();
    for function in &source.functions {
        let emitted = emit_function(function, imports, &mut module)?;
        module.functions.push(emitted);
    }
    module
        .verify()
        .map_err(|err| ConversionError::Emission {
            location: OpLocation::new(&source.name, None, "module"),
            detail: err.to_string(),
        })?;
    Ok(module)
}

struct FunctionEmitter<'a> {
    function: &'a Function,
    registers: HashMap<ValueId, Register>,
}

impl<'a> FunctionEmitter<'a> {
    fn error(&self, index: Option<usize>, op: &str, detail: impl Into<String>) -> ConversionError {
        ConversionError::Emission {
            location: OpLocation::new(&self.function.name, index, op),
            detail: detail.into(),
        }
    }

    fn kind(&self, index: Option<usize>, op: &str, value: ValueId) -> ConversionResult<ValueKind> {
        self.function
            .value_type(value)
            .and_then(value_kind)
            .ok_or_else(|| self.error(index, op, format!("value %{value} has no VM register kind")))
    }

    fn define(&mut self, value: ValueId) -> Register {
        let next = self.registers.len() as Register;
        *self.registers.entry(value).or_insert(next)
    }

    fn use_value(&self, index: usize, op: &Operation, value: ValueId) -> ConversionResult<Register> {
        self.registers
            .get(&value)
            .copied()
            .ok_or_else(|| self.error(Some(index), &op.name, format!("value %{value} used before definition")))
    }

    fn uses(&self, index: usize, op: &Operation) -> ConversionResult<Vec<Register>> {
        op.operands
            .iter()
            .map(|value| self.use_value(index, op, *value))
            .collect()
    }

    fn single_result(&mut self, index: usize, op: &Operation) -> ConversionResult<Register> {
        match op.results.as_slice() {
            [result] => Ok(self.define(*result)),
            _ => Err(self.error(Some(index), &op.name, "constant must produce exactly one value")),
        }
    }
}

fn emit_function(
    function: &Function,
    imports: &ImportSymbolTable,
    module: &mut CompiledModule,
) -> ConversionResult<module::Function> {
    let mut emitter = FunctionEmitter {
        function,
        registers: HashMap::new(),
    };
    let mut params = Vec::with_capacity(function.params.len());
    for param in &function.params {
        params.push(emitter.kind(None, "signature", *param)?);
        emitter.define(*param);
    }
    let results = function
        .results
        .iter()
        .map(|ty| {
            value_kind(ty).ok_or_else(|| {
                emitter.error(None, "signature", format!("result type {ty} has no VM register kind"))
            })
        })
        .collect::<ConversionResult<Vec<_>>>()?;

    let mut body = Vec::with_capacity(function.body.len());
    for (index, op) in function.body.iter().enumerate() {
        let instruction = match op.name.as_str() {
            "vm.const.i32" => {
                let value = op
                    .attr("value")
                    .and_then(Attribute::as_int)
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(|| emitter.error(Some(index), &op.name, "needs an i32 'value'"))?;
                Instruction::ConstI32 {
                    dst: emitter.single_result(index, op)?,
                    value,
                }
            }
            "vm.const.i64" => {
                let value = op
                    .attr("value")
                    .and_then(Attribute::as_int)
                    .ok_or_else(|| emitter.error(Some(index), &op.name, "needs an integer 'value'"))?;
                Instruction::ConstI64 {
                    dst: emitter.single_result(index, op)?,
                    value,
                }
            }
            "vm.const.f32" => {
                let value = op
                    .attr("value")
                    .and_then(Attribute::as_float)
                    .ok_or_else(|| emitter.error(Some(index), &op.name, "needs a float 'value'"))?;
                Instruction::ConstF32 {
                    dst: emitter.single_result(index, op)?,
                    value: value as f32,
                }
            }
            "vm.const.buffer_view" => {
                let dense = op
                    .attr("value")
                    .and_then(Attribute::as_dense)
                    .ok_or_else(|| emitter.error(Some(index), &op.name, "needs a dense 'value'"))?;
                let data = dense.to_bytes().ok_or_else(|| {
                    emitter.error(Some(index), &op.name, "dense value count does not match shape")
                })?;
                Instruction::ConstBufferView {
                    dst: emitter.single_result(index, op)?,
                    element_type: dense.element_type,
                    shape: dense.shape.clone(),
                    data,
                }
            }
            "vm.call" => {
                let callee = op
                    .attr("callee")
                    .and_then(Attribute::as_str)
                    .ok_or_else(|| emitter.error(Some(index), &op.name, "needs a 'callee'"))?;
                let signature = imports.lookup(callee).ok_or_else(|| {
                    ConversionError::UnresolvedImport {
                        location: OpLocation::new(&function.name, Some(index), &op.name),
                        name: callee.to_string(),
                    }
                })?;
                let import = module
                    .import_ordinal(callee, signature)
                    .map_err(|err| emitter.error(Some(index), &op.name, err.to_string()))?;
                let args = emitter.uses(index, op)?;
                let call_results = op
                    .results
                    .iter()
                    .map(|value| emitter.define(*value))
                    .collect();
                Instruction::Call {
                    import,
                    args,
                    results: call_results,
                }
            }
            "vm.return" => {
                let kinds = op
                    .operands
                    .iter()
                    .map(|value| emitter.kind(Some(index), &op.name, *value))
                    .collect::<ConversionResult<Vec<_>>>()?;
                if kinds != results {
                    return Err(emitter.error(
                        Some(index),
                        &op.name,
                        "returned values do not match the function results",
                    ));
                }
                Instruction::Return {
                    values: emitter.uses(index, op)?,
                }
            }
            other => {
                return Err(emitter.error(
                    Some(index),
                    other,
                    "only vm.* ops can be emitted; run the VM conversion stage first",
                ))
            }
        };
        body.push(instruction);
    }
    if !matches!(body.last(), Some(Instruction::Return { .. })) {
        return Err(emitter.error(None, "body", "function does not end in vm.return"));
    }

    Ok(module::Function {
        name: function.name.clone(),
        params,
        results,
        register_count: emitter.registers.len() as u32,
        body,
    })
}
