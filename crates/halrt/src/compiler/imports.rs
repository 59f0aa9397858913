use std::collections::BTreeMap;

use super::conversion::RewriteContext;
use super::ir::{Attribute, Operation, Type, ValueId};
use super::pattern::ConversionPattern;
use super::types::value_kind;
use super::{ConversionError, ConversionResult};
use crate::check::CheckKind;
use crate::module::{Signature, ValueKind};
use crate::vm::{self, ImportRegistry};

/// Import signatures visible to the compiler.
#[derive(Debug, Clone, Default)]
pub struct ImportSymbolTable {
    symbols: BTreeMap<String, Signature>,
}

impl ImportSymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `check.*` and `hal.*` imports the runtime ships with.
    pub fn standard() -> Self {
        let mut table = Self::new();
        for kind in CheckKind::ALL {
            table.declare(kind.import_name(), kind.signature());
        }
        table
            .declare(vm::BUFFER_VIEW_ALLOCATE, vm::buffer_view_allocate_signature())
            .declare(vm::BUFFER_VIEW_COPY, vm::buffer_view_copy_signature())
            .declare(vm::DEVICE_DISPATCH, vm::device_dispatch_signature());
        table
    }

    /// Mirrors a runtime registry so compiled calls match what load will resolve.
    pub fn from_registry(registry: &ImportRegistry) -> Self {
        let mut table = Self::new();
        for (name, signature) in registry.declarations() {
            table.declare(name, signature.clone());
        }
        table
    }

    pub fn declare(&mut self, name: impl Into<String>, signature: Signature) -> &mut Self {
        self.symbols.insert(name.into(), signature);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&Signature> {
        self.symbols.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Attribute lowered into a constant call argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttrOperand {
    I32(&'static str),
    /// Integer list of exactly this many `i32` arguments.
    I32Array(&'static str, usize),
    /// Integer list of any length as `i64` arguments.
    I64List(&'static str),
    F32 {
        name: &'static str,
        default: Option<f32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrPlacement {
    Leading,
    Trailing,
}

/// Rewrites `root` into a `vm.call` of `import`.
///
/// Operands are converted in order; attribute-derived constants are placed
/// before or after them. The call's argument kinds must fit the import's
/// declared signature.
pub struct VmImportOpConversion {
    root: String,
    import: String,
    attrs: Vec<AttrOperand>,
    placement: AttrPlacement,
}

impl VmImportOpConversion {
    pub fn new(root: impl Into<String>, import: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            import: import.into(),
            attrs: Vec::new(),
            placement: AttrPlacement::Trailing,
        }
    }

    pub fn with_attrs(mut self, placement: AttrPlacement, attrs: Vec<AttrOperand>) -> Self {
        self.placement = placement;
        self.attrs = attrs;
        self
    }

    fn materialize(
        &self,
        op: &Operation,
        attr: AttrOperand,
        ctx: &mut RewriteContext<'_>,
    ) -> ConversionResult<Vec<ValueId>> {
        match attr {
            AttrOperand::I32(name) => {
                let value = int_attr(op, name, ctx)?;
                Ok(vec![const_i32(ctx, name, value)?])
            }
            AttrOperand::I32Array(name, len) => {
                let values = ints_attr(op, name, ctx)?;
                if values.len() != len {
                    return Err(ctx.illegal(format!(
                        "attribute '{name}' needs {len} values, got {}",
                        values.len()
                    )));
                }
                values
                    .into_iter()
                    .map(|value| const_i32(ctx, name, value))
                    .collect()
            }
            AttrOperand::I64List(name) => {
                let values = ints_attr(op, name, ctx)?;
                Ok(values
                    .into_iter()
                    .map(|value| {
                        let dst = ctx.new_value(Type::I64);
                        ctx.emit(
                            Operation::new("vm.const.i64", vec![], vec![dst])
                                .with_attr("value", Attribute::Int(value)),
                        );
                        dst
                    })
                    .collect())
            }
            AttrOperand::F32 { name, default } => {
                let value = match (op.attr(name), default) {
                    (Some(attr), _) => attr
                        .as_float()
                        .ok_or_else(|| ctx.illegal(format!("attribute '{name}' must be a float")))?,
                    (None, Some(default)) => f64::from(default),
                    (None, None) => {
                        return Err(ctx.illegal(format!("missing attribute '{name}'")));
                    }
                };
                let dst = ctx.new_value(Type::F32);
                ctx.emit(
                    Operation::new("vm.const.f32", vec![], vec![dst])
                        .with_attr("value", Attribute::Float(value)),
                );
                Ok(vec![dst])
            }
        }
    }
}

impl ConversionPattern for VmImportOpConversion {
    fn root(&self) -> &str {
        &self.root
    }

    fn match_and_rewrite(
        &self,
        op: &Operation,
        ctx: &mut RewriteContext<'_>,
    ) -> ConversionResult<bool> {
        let signature = ctx.imports().lookup(&self.import).cloned().ok_or_else(|| {
            ConversionError::UnresolvedImport {
                location: ctx.location(),
                name: self.import.clone(),
            }
        })?;

        let operands = ctx.operands(&op.operands)?;
        let mut attr_values = Vec::new();
        for attr in &self.attrs {
            attr_values.extend(self.materialize(op, *attr, ctx)?);
        }
        let args = match self.placement {
            AttrPlacement::Leading => [attr_values, operands].concat(),
            AttrPlacement::Trailing => [operands, attr_values].concat(),
        };

        let kinds = kinds_of(ctx, &args)?;
        let mismatch = |ctx: &RewriteContext<'_>, actual: &[Option<ValueKind>]| {
            ConversionError::SignatureMismatch {
                location: ctx.location(),
                import: self.import.clone(),
                expected: signature.to_string(),
                actual: describe(actual),
            }
        };
        let arg_kinds: Option<Vec<ValueKind>> = kinds.iter().copied().collect();
        match arg_kinds {
            Some(arg_kinds) if signature.accepts(&arg_kinds) => {}
            _ => return Err(mismatch(ctx, &kinds)),
        }

        let mut results = Vec::with_capacity(op.results.len());
        for result in &op.results {
            results.push(ctx.replace_result(*result)?);
        }
        let result_kinds = kinds_of(ctx, &results)?;
        let expected_results: Vec<Option<ValueKind>> =
            signature.results.iter().copied().map(Some).collect();
        if result_kinds != expected_results {
            return Err(ConversionError::SignatureMismatch {
                location: ctx.location(),
                import: self.import.clone(),
                expected: signature.to_string(),
                actual: format!("results {}", describe(&result_kinds)),
            });
        }

        ctx.emit(
            Operation::new("vm.call", args, results)
                .with_attr("callee", Attribute::Str(self.import.clone())),
        );
        Ok(true)
    }
}

fn kinds_of(ctx: &RewriteContext<'_>, values: &[ValueId]) -> ConversionResult<Vec<Option<ValueKind>>> {
    values
        .iter()
        .map(|value| ctx.value_type(*value).map(value_kind))
        .collect()
}

fn describe(kinds: &[Option<ValueKind>]) -> String {
    kinds
        .iter()
        .map(|kind| kind.map_or("?", ValueKind::name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn int_attr(op: &Operation, name: &str, ctx: &RewriteContext<'_>) -> ConversionResult<i64> {
    op.attr(name)
        .ok_or_else(|| ctx.illegal(format!("missing attribute '{name}'")))?
        .as_int()
        .ok_or_else(|| ctx.illegal(format!("attribute '{name}' must be an integer")))
}

fn ints_attr(op: &Operation, name: &str, ctx: &RewriteContext<'_>) -> ConversionResult<Vec<i64>> {
    op.attr(name)
        .ok_or_else(|| ctx.illegal(format!("missing attribute '{name}'")))?
        .as_ints()
        .map(<[i64]>::to_vec)
        .ok_or_else(|| ctx.illegal(format!("attribute '{name}' must be an integer list")))
}

fn const_i32(ctx: &mut RewriteContext<'_>, name: &str, value: i64) -> ConversionResult<ValueId> {
    let value = i32::try_from(value)
        .map_err(|_| ctx.illegal(format!("attribute '{name}' value {value} does not fit in i32")))?;
    let dst = ctx.new_value(Type::I32);
    ctx.emit(
        Operation::new("vm.const.i32", vec![], vec![dst])
            .with_attr("value", Attribute::Int(i64::from(value))),
    );
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_covers_check_and_hal_imports() {
        let table = ImportSymbolTable::standard();
        assert_eq!(table.len(), 8);
        assert_eq!(
            table.lookup("check.expect_almost_eq"),
            Some(&CheckKind::ExpectAlmostEq.signature())
        );
        assert!(table.contains("hal.device.dispatch"));
    }

    #[test]
    fn registry_mirror_matches_registered_signatures() {
        let mut registry = ImportRegistry::new();
        registry.register_module(&vm::HalModule).unwrap();
        let table = ImportSymbolTable::from_registry(&registry);
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.lookup(vm::BUFFER_VIEW_COPY),
            Some(&vm::buffer_view_copy_signature())
        );
    }
}
