//! Tensor and dispatch lowering into `hal.*` ops, and `hal.*`/`std.*` into VM form.

use super::conversion::RewriteContext;
use super::imports::{AttrOperand, AttrPlacement, VmImportOpConversion};
use super::ir::{Attribute, DenseElements, Operation, Type, ValueId};
use super::pattern::{ConversionPattern, PatternSet};
use super::{ConversionError, ConversionResult};
use crate::vm;

/// Re-emits `root` unchanged except for converted operand and result types.
pub struct RetypeOperandsPattern {
    root: String,
}

impl RetypeOperandsPattern {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

impl ConversionPattern for RetypeOperandsPattern {
    fn root(&self) -> &str {
        &self.root
    }

    fn match_and_rewrite(
        &self,
        op: &Operation,
        ctx: &mut RewriteContext<'_>,
    ) -> ConversionResult<bool> {
        let operands = ctx.operands(&op.operands)?;
        let mut results = Vec::with_capacity(op.results.len());
        for result in &op.results {
            results.push(ctx.replace_result(*result)?);
        }
        let mut rewritten = Operation::new(op.name.clone(), operands, results);
        rewritten.attributes = op.attributes.clone();
        ctx.emit(rewritten);
        Ok(true)
    }
}

/// Dense literal checked against the tensor type it initializes.
fn dense_for_result(
    op: &Operation,
    ctx: &RewriteContext<'_>,
) -> ConversionResult<(ValueId, DenseElements)> {
    let [result] = op.results.as_slice() else {
        return Err(ctx.illegal("constant must produce exactly one value"));
    };
    let dense = op
        .attr("value")
        .and_then(Attribute::as_dense)
        .ok_or_else(|| ctx.illegal("tensor constant needs a dense 'value' attribute"))?;
    if let Type::Tensor(tensor) = ctx.value_type(*result)? {
        if tensor.element_type != dense.element_type || tensor.shape != dense.shape {
            return Err(ConversionError::TypeConversion {
                location: ctx.location(),
                ty: Type::Tensor(tensor.clone()).to_string(),
                detail: "dense literal does not match the result type".to_string(),
            });
        }
    }
    if dense.to_bytes().is_none() {
        return Err(ctx.illegal(format!(
            "dense literal has {} values for {} elements",
            dense.values.len(),
            dense.element_count()
        )));
    }
    Ok((*result, dense.clone()))
}

struct TensorConstantToHal;

impl ConversionPattern for TensorConstantToHal {
    fn root(&self) -> &str {
        "std.constant"
    }

    fn match_and_rewrite(
        &self,
        op: &Operation,
        ctx: &mut RewriteContext<'_>,
    ) -> ConversionResult<bool> {
        let (result, dense) = dense_for_result(op, ctx)?;
        let view = ctx.replace_result(result)?;
        ctx.emit(
            Operation::new("hal.buffer_view.constant", vec![], vec![view])
                .with_attr("value", Attribute::Dense(dense)),
        );
        Ok(true)
    }
}

/// Allocates a buffer view shaped like tensor value `value`.
fn allocate_like(ctx: &mut RewriteContext<'_>, value: ValueId) -> ConversionResult<ValueId> {
    let Type::Tensor(tensor) = ctx.value_type(value)?.clone() else {
        return Err(ConversionError::TypeConversion {
            location: ctx.location(),
            ty: ctx.value_type(value)?.to_string(),
            detail: "only tensor results can be allocated".to_string(),
        });
    };
    let view = ctx.replace_result(value)?;
    ctx.emit(
        Operation::new("hal.buffer_view.allocate", vec![], vec![view])
            .with_attr("element_type", Attribute::Int(i64::from(tensor.element_type.code())))
            .with_attr(
                "shape",
                Attribute::Ints(tensor.shape.iter().map(|d| *d as i64).collect()),
            ),
    );
    Ok(view)
}

/// `flow.dispatch` becomes result allocations plus one `hal.device.dispatch`.
struct DispatchToHal;

impl ConversionPattern for DispatchToHal {
    fn root(&self) -> &str {
        "flow.dispatch"
    }

    fn match_and_rewrite(
        &self,
        op: &Operation,
        ctx: &mut RewriteContext<'_>,
    ) -> ConversionResult<bool> {
        let name = op
            .attr("executable")
            .and_then(Attribute::as_str)
            .ok_or_else(|| ctx.illegal("missing attribute 'executable'"))?;
        let entry_name = op
            .attr("entry_point")
            .and_then(Attribute::as_str)
            .ok_or_else(|| ctx.illegal("missing attribute 'entry_point'"))?;
        let workgroups = op
            .attr("workgroups")
            .and_then(Attribute::as_ints)
            .ok_or_else(|| ctx.illegal("missing attribute 'workgroups'"))?
            .to_vec();

        let executables = ctx.executables();
        let executable_ordinal = executables
            .iter()
            .position(|def| def.name == name)
            .ok_or_else(|| ctx.illegal(format!("unknown executable '{name}'")))?;
        let executable = &executables[executable_ordinal];
        let entry_ordinal = executable
            .entry_point_ordinal(entry_name)
            .ok_or_else(|| {
                ctx.illegal(format!("executable '{name}' has no entry point '{entry_name}'"))
            })?;
        let expected_bindings = executable.entry_points[entry_ordinal].binding_count;
        let bindings = op.operands.len() + op.results.len();
        if bindings != expected_bindings {
            return Err(ctx.illegal(format!(
                "entry point '{entry_name}' takes {expected_bindings} bindings, dispatch passes {bindings}"
            )));
        }

        let mut operands = ctx.operands(&op.operands)?;
        for result in &op.results {
            operands.push(allocate_like(ctx, *result)?);
        }
        ctx.emit(
            Operation::new("hal.device.dispatch", operands, vec![])
                .with_attr("executable", Attribute::Int(executable_ordinal as i64))
                .with_attr("entry_point", Attribute::Int(entry_ordinal as i64))
                .with_attr("workgroups", Attribute::Ints(workgroups)),
        );
        Ok(true)
    }
}

/// `flow.copy` becomes an allocation plus `hal.buffer_view.copy`.
struct CopyToHal;

impl ConversionPattern for CopyToHal {
    fn root(&self) -> &str {
        "flow.copy"
    }

    fn match_and_rewrite(
        &self,
        op: &Operation,
        ctx: &mut RewriteContext<'_>,
    ) -> ConversionResult<bool> {
        let ([source], [result]) = (op.operands.as_slice(), op.results.as_slice()) else {
            return Err(ctx.illegal("copy takes one operand and produces one value"));
        };
        if ctx.value_type(*source)? != ctx.value_type(*result)? {
            return Err(ctx.illegal("copy must preserve the tensor type"));
        }
        let source = ctx.operand(*source)?;
        let target = allocate_like(ctx, *result)?;
        ctx.emit(Operation::new("hal.buffer_view.copy", vec![source, target], vec![]));
        Ok(true)
    }
}

/// Constants become `vm.const.*` according to their converted type.
struct ConstantToVm {
    root: &'static str,
}

impl ConversionPattern for ConstantToVm {
    fn root(&self) -> &str {
        self.root
    }

    fn match_and_rewrite(
        &self,
        op: &Operation,
        ctx: &mut RewriteContext<'_>,
    ) -> ConversionResult<bool> {
        let [result] = op.results.as_slice() else {
            return Err(ctx.illegal("constant must produce exactly one value"));
        };
        let source_type = ctx.value_type(*result)?.clone();
        let value = op
            .attr("value")
            .ok_or_else(|| ctx.illegal("missing attribute 'value'"))?
            .clone();
        let dst = ctx.replace_result(*result)?;
        let converted = ctx.value_type(dst)?.clone();
        let (name, attr) = match (&converted, &value) {
            (Type::I32, Attribute::Int(v)) => {
                if i32::try_from(*v).is_err() {
                    return Err(ctx.illegal(format!("constant {v} does not fit in i32")));
                }
                if source_type == Type::I1 && !(0..=1).contains(v) {
                    return Err(ctx.illegal(format!("i1 constant must be 0 or 1, got {v}")));
                }
                ("vm.const.i32", value.clone())
            }
            (Type::I64, Attribute::Int(_)) => ("vm.const.i64", value.clone()),
            (Type::F32, Attribute::Float(_) | Attribute::Int(_)) => (
                "vm.const.f32",
                Attribute::Float(value.as_float().unwrap_or_default()),
            ),
            (Type::BufferView, Attribute::Dense(_)) => {
                let (_, dense) = dense_for_result(op, ctx)?;
                ("vm.const.buffer_view", Attribute::Dense(dense))
            }
            _ => {
                return Err(ConversionError::TypeConversion {
                    location: ctx.location(),
                    ty: source_type.to_string(),
                    detail: "constant value does not match its type".to_string(),
                });
            }
        };
        ctx.emit(Operation::new(name, vec![], vec![dst]).with_attr("value", attr));
        Ok(true)
    }
}

struct ReturnToVm;

impl ConversionPattern for ReturnToVm {
    fn root(&self) -> &str {
        "std.return"
    }

    fn match_and_rewrite(
        &self,
        op: &Operation,
        ctx: &mut RewriteContext<'_>,
    ) -> ConversionResult<bool> {
        let operands = ctx.operands(&op.operands)?;
        ctx.emit(Operation::new("vm.return", operands, vec![]));
        Ok(true)
    }
}

pub fn populate_flow_to_hal_patterns(patterns: &mut PatternSet) {
    patterns
        .add(TensorConstantToHal)
        .add(DispatchToHal)
        .add(CopyToHal)
        .add(RetypeOperandsPattern::new("std.return"));
}

pub fn populate_std_to_vm_patterns(patterns: &mut PatternSet) {
    patterns
        .add(ConstantToVm {
            root: "std.constant",
        })
        .add(ReturnToVm);
}

pub fn populate_hal_to_vm_patterns(patterns: &mut PatternSet) {
    patterns
        .add(ConstantToVm {
            root: "hal.buffer_view.constant",
        })
        .add(
            VmImportOpConversion::new("hal.buffer_view.allocate", vm::BUFFER_VIEW_ALLOCATE)
                .with_attrs(
                    AttrPlacement::Leading,
                    vec![AttrOperand::I32("element_type"), AttrOperand::I64List("shape")],
                ),
        )
        .add(VmImportOpConversion::new(
            "hal.buffer_view.copy",
            vm::BUFFER_VIEW_COPY,
        ))
        .add(
            VmImportOpConversion::new("hal.device.dispatch", vm::DEVICE_DISPATCH).with_attrs(
                AttrPlacement::Leading,
                vec![
                    AttrOperand::I32("executable"),
                    AttrOperand::I32("entry_point"),
                    AttrOperand::I32Array("workgroups", 3),
                ],
            ),
        );
}
