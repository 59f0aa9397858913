use std::collections::{BTreeSet, HashMap};

use super::imports::ImportSymbolTable;
use super::ir::{Function, Operation, Type, ValueId};
use super::pattern::FrozenPatternSet;
use super::types::{value_kind, TypeConverter};
use super::{ConversionError, ConversionResult, OpLocation};
use crate::module::ExecutableDef;

/// Which ops and value types may remain after a stage.
pub struct ConversionTarget {
    legal_dialects: Option<BTreeSet<String>>,
    illegal_dialects: BTreeSet<String>,
    legal_type: fn(&Type) -> bool,
}

impl ConversionTarget {
    /// Everything is legal until restricted.
    pub fn new() -> Self {
        Self {
            legal_dialects: None,
            illegal_dialects: BTreeSet::new(),
            legal_type: |_| true,
        }
    }

    pub fn with_legal_dialects(mut self, dialects: &[&str]) -> Self {
        self.legal_dialects = Some(dialects.iter().map(|d| d.to_string()).collect());
        self
    }

    pub fn with_illegal_dialect(mut self, dialect: &str) -> Self {
        self.illegal_dialects.insert(dialect.to_string());
        self
    }

    pub fn with_legal_types(mut self, legal_type: fn(&Type) -> bool) -> Self {
        self.legal_type = legal_type;
        self
    }

    /// After the HAL stage: no tensors and no `flow.*` ops.
    pub fn hal() -> Self {
        Self::new()
            .with_illegal_dialect("flow")
            .with_legal_types(|ty| !ty.is_tensor())
    }

    /// After the VM stage: only `vm.*` ops over VM register kinds.
    pub fn vm() -> Self {
        Self::new()
            .with_legal_dialects(&["vm"])
            .with_legal_types(|ty| value_kind(ty).is_some())
    }

    pub fn is_legal_type(&self, ty: &Type) -> bool {
        (self.legal_type)(ty)
    }

    pub fn is_legal(&self, op: &Operation, values: &[Type]) -> bool {
        let dialect = op.dialect();
        if self.illegal_dialects.contains(dialect) {
            return false;
        }
        if let Some(legal) = &self.legal_dialects {
            if !legal.contains(dialect) {
                return false;
            }
        }
        op.operands
            .iter()
            .chain(op.results.iter())
            .all(|value| match values.get(*value as usize) {
                Some(ty) => self.is_legal_type(ty),
                None => false,
            })
    }
}

impl Default for ConversionTarget {
    fn default() -> Self {
        Self::new()
    }
}

/// State a pattern sees while rewriting one op.
pub struct RewriteContext<'a> {
    function: &'a str,
    index: usize,
    op_name: &'a str,
    values: &'a mut Vec<Type>,
    mapping: &'a mut HashMap<ValueId, ValueId>,
    converter: &'a TypeConverter,
    imports: &'a ImportSymbolTable,
    executables: &'a [ExecutableDef],
    emitted: Vec<Operation>,
}

impl<'a> RewriteContext<'a> {
    pub fn location(&self) -> OpLocation {
        OpLocation::new(self.function, Some(self.index), self.op_name)
    }

    pub fn illegal(&self, detail: impl Into<String>) -> ConversionError {
        ConversionError::IllegalOperation {
            location: self.location(),
            detail: detail.into(),
        }
    }

    pub fn imports(&self) -> &'a ImportSymbolTable {
        self.imports
    }

    pub fn executables(&self) -> &'a [ExecutableDef] {
        self.executables
    }

    pub fn value_type(&self, value: ValueId) -> ConversionResult<&Type> {
        self.values
            .get(value as usize)
            .ok_or_else(|| self.illegal(format!("use of undefined value %{value}")))
    }

    pub fn convert_type(&self, ty: &Type) -> ConversionResult<Type> {
        self.converter
            .convert(ty)
            .ok_or_else(|| ConversionError::TypeConversion {
                location: self.location(),
                ty: ty.to_string(),
                detail: "no conversion rule applies".to_string(),
            })
    }

    /// The converted value standing in for source operand `value`.
    pub fn operand(&self, value: ValueId) -> ConversionResult<ValueId> {
        let source_type = self.value_type(value)?;
        let expected = self.convert_type(source_type)?;
        let mapped = self.mapping.get(&value).copied().unwrap_or(value);
        let actual = self.value_type(mapped)?;
        if *actual != expected {
            return Err(ConversionError::TypeConversion {
                location: self.location(),
                ty: source_type.to_string(),
                detail: format!("operand %{value} was not converted to {expected}"),
            });
        }
        Ok(mapped)
    }

    pub fn operands(&self, values: &[ValueId]) -> ConversionResult<Vec<ValueId>> {
        values.iter().map(|value| self.operand(*value)).collect()
    }

    pub fn new_value(&mut self, ty: Type) -> ValueId {
        self.values.push(ty);
        (self.values.len() - 1) as ValueId
    }

    /// Value that replaces source result `value`; reused when its type survives.
    pub fn replace_result(&mut self, value: ValueId) -> ConversionResult<ValueId> {
        let source_type = self.value_type(value)?.clone();
        let converted = self.convert_type(&source_type)?;
        if converted == source_type {
            return Ok(value);
        }
        let replacement = self.new_value(converted);
        self.mapping.insert(value, replacement);
        Ok(replacement)
    }

    pub fn emit(&mut self, op: Operation) {
        self.emitted.push(op);
    }
}

/// Rewrites `function` until every op is legal for `target`.
///
/// Legal ops are kept with their operands remapped. Each illegal op is handed
/// to the matching patterns in benefit order; the first one that succeeds
/// replaces it. An illegal op no pattern rewrites fails the whole conversion.
pub fn apply_conversion(
    function: &mut Function,
    target: &ConversionTarget,
    patterns: &FrozenPatternSet,
    converter: &TypeConverter,
    imports: &ImportSymbolTable,
    executables: &[ExecutableDef],
) -> ConversionResult<()> {
    let signature_error = |ty: &Type| ConversionError::TypeConversion {
        location: OpLocation::new(&function.name, None, "signature"),
        ty: ty.to_string(),
        detail: "no conversion rule applies".to_string(),
    };
    let mut values = function.values.clone();
    for param in &function.params {
        let slot = values
            .get_mut(*param as usize)
            .ok_or_else(|| ConversionError::IllegalOperation {
                location: OpLocation::new(&function.name, None, "signature"),
                detail: format!("parameter %{param} is not a defined value"),
            })?;
        let converted = converter
            .convert(slot)
            .ok_or_else(|| signature_error(&*slot))?;
        *slot = converted;
    }
    let results = function
        .results
        .iter()
        .map(|ty| converter.convert(ty).ok_or_else(|| signature_error(ty)))
        .collect::<ConversionResult<Vec<_>>>()?;

    let mut mapping = HashMap::new();
    let mut body = Vec::with_capacity(function.body.len());
    for (index, op) in function.body.iter().enumerate() {
        if target.is_legal(op, &values) {
            let mut kept = op.clone();
            for operand in kept.operands.iter_mut() {
                if let Some(mapped) = mapping.get(operand) {
                    *operand = *mapped;
                }
            }
            body.push(kept);
            continue;
        }

        let location = OpLocation::new(&function.name, Some(index), &op.name);
        let mut replaced = None;
        for pattern in patterns.matching(&op.name) {
            let mut ctx = RewriteContext {
                function: &function.name,
                index,
                op_name: &op.name,
                values: &mut values,
                mapping: &mut mapping,
                converter,
                imports,
                executables,
                emitted: Vec::new(),
            };
            if pattern.match_and_rewrite(op, &mut ctx)? {
                replaced = Some(ctx.emitted);
                break;
            }
        }
        let Some(emitted) = replaced else {
            return Err(ConversionError::IllegalOperation {
                location,
                detail: "no conversion pattern applies".to_string(),
            });
        };
        for new_op in emitted {
            if !target.is_legal(&new_op, &values) {
                return Err(ConversionError::IllegalOperation {
                    location,
                    detail: format!("rewrite produced illegal op '{}'", new_op.name),
                });
            }
            tracing::trace!(function = %function.name, index, from = %op.name, to = %new_op.name, "rewrote op");
            body.push(new_op);
        }
    }

    function.values = values;
    function.results = results;
    function.body = body;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{Attribute, FunctionBuilder};
    use crate::compiler::pattern::PatternSet;
    use crate::hal::ElementType;

    #[test]
    fn hal_target_rejects_tensors_and_flow() {
        let target = ConversionTarget::hal();
        let values = vec![Type::tensor(ElementType::F32, &[2]), Type::BufferView];
        assert!(!target.is_legal(&Operation::new("check.expect_eq", vec![0, 0], vec![]), &values));
        assert!(target.is_legal(&Operation::new("check.expect_eq", vec![1, 1], vec![]), &values));
        assert!(!target.is_legal(&Operation::new("flow.dispatch", vec![1], vec![]), &values));
    }

    #[test]
    fn vm_target_only_accepts_vm_dialect() {
        let target = ConversionTarget::vm();
        let values = vec![Type::I32];
        assert!(target.is_legal(&Operation::new("vm.call", vec![0], vec![]), &values));
        assert!(!target.is_legal(&Operation::new("check.expect_true", vec![0], vec![]), &values));
        assert!(!target.is_legal(&Operation::new("vm.call", vec![3], vec![]), &values));
    }

    #[test]
    fn illegal_op_without_pattern_names_its_location() {
        let mut builder = FunctionBuilder::new("main", &[]);
        let flag = builder.constant(Attribute::Int(1), Type::I1);
        builder.op("check.expect_true", &[flag], &[], &[]);
        let mut function = builder.finish(&[]);

        let err = apply_conversion(
            &mut function,
            &ConversionTarget::vm(),
            &PatternSet::new().freeze(),
            &TypeConverter::vm(),
            &ImportSymbolTable::new(),
            &[],
        )
        .unwrap_err();
        match err {
            ConversionError::IllegalOperation { location, .. } => {
                assert_eq!(location.function, "main");
                assert_eq!(location.index, Some(0));
                assert_eq!(location.op, "std.constant");
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
