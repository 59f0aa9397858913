//! Lowering for the `check` dialect.
//!
//! Ops keep their `check.*` names through the HAL stage with tensor operands
//! retyped to buffer views; the VM stage turns each into a `vm.call` of the
//! import with the same name. `check.expect_almost_eq` carries its tolerance
//! as an optional `tolerance` attribute passed as a trailing `f32`.

use super::hal::RetypeOperandsPattern;
use super::imports::{AttrOperand, AttrPlacement, VmImportOpConversion};
use super::pattern::PatternSet;
use crate::check::{CheckKind, DEFAULT_TOLERANCE};

pub fn populate_check_to_hal_patterns(patterns: &mut PatternSet) {
    for kind in CheckKind::ALL {
        patterns.add(RetypeOperandsPattern::new(kind.import_name()));
    }
}

pub fn populate_check_to_vm_patterns(patterns: &mut PatternSet) {
    for kind in CheckKind::ALL {
        let conversion = VmImportOpConversion::new(kind.import_name(), kind.import_name());
        let conversion = match kind {
            CheckKind::ExpectAlmostEq => conversion.with_attrs(
                AttrPlacement::Trailing,
                vec![AttrOperand::F32 {
                    name: "tolerance",
                    default: Some(DEFAULT_TOLERANCE),
                }],
            ),
            _ => conversion,
        };
        patterns.add(conversion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::conversion::{apply_conversion, ConversionTarget};
    use crate::compiler::imports::ImportSymbolTable;
    use crate::compiler::ir::{Attribute, FunctionBuilder, Type};
    use crate::compiler::types::TypeConverter;
    use crate::compiler::ConversionError;
    use crate::compiler::hal::populate_std_to_vm_patterns;

    fn vm_patterns() -> crate::compiler::pattern::FrozenPatternSet {
        let mut patterns = PatternSet::new();
        populate_std_to_vm_patterns(&mut patterns);
        populate_check_to_vm_patterns(&mut patterns);
        patterns.freeze()
    }

    #[test]
    fn almost_eq_gets_default_tolerance_operand() {
        let mut builder = FunctionBuilder::new("main", &[]);
        let lhs = builder.dense_f32(&[2], &[1.0, 2.0]);
        let rhs = builder.dense_f32(&[2], &[1.0, 2.0]);
        builder.op("check.expect_almost_eq", &[lhs, rhs], &[], &[]);
        let mut function = builder.finish(&[]);

        apply_conversion(
            &mut function,
            &ConversionTarget::vm(),
            &vm_patterns(),
            &TypeConverter::vm(),
            &ImportSymbolTable::standard(),
            &[],
        )
        .unwrap();

        let names: Vec<&str> = function.body.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "vm.const.buffer_view",
                "vm.const.buffer_view",
                "vm.const.f32",
                "vm.call",
                "vm.return"
            ]
        );
        let tolerance = &function.body[2];
        assert_eq!(
            tolerance.attr("value"),
            Some(&Attribute::Float(f64::from(DEFAULT_TOLERANCE)))
        );
        let call = &function.body[3];
        assert_eq!(call.operands.len(), 3);
        assert_eq!(call.operands[2], tolerance.results[0]);
    }

    #[test]
    fn missing_import_is_reported_with_its_name() {
        let mut builder = FunctionBuilder::new("main", &[]);
        let flag = builder.constant(Attribute::Int(0), Type::I1);
        builder.op("check.expect_false", &[flag], &[], &[]);
        let mut function = builder.finish(&[]);

        let err = apply_conversion(
            &mut function,
            &ConversionTarget::vm(),
            &vm_patterns(),
            &TypeConverter::vm(),
            &ImportSymbolTable::new(),
            &[],
        )
        .unwrap_err();
        match err {
            ConversionError::UnresolvedImport { name, location } => {
                assert_eq!(name, "check.expect_false");
                assert_eq!(location.index, Some(1));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn wrong_operand_kind_is_a_signature_mismatch() {
        let mut builder = FunctionBuilder::new("main", &[]);
        let view = builder.dense_f32(&[1], &[1.0]);
        builder.op("check.expect_true", &[view], &[], &[]);
        let mut function = builder.finish(&[]);

        let err = apply_conversion(
            &mut function,
            &ConversionTarget::vm(),
            &vm_patterns(),
            &TypeConverter::vm(),
            &ImportSymbolTable::standard(),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ConversionError::SignatureMismatch { .. }), "{err}");
        assert!(err.to_string().contains("buffer_view"));
    }
}
