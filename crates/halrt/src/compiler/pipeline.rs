use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::check::{populate_check_to_hal_patterns, populate_check_to_vm_patterns};
use super::conversion::{apply_conversion, ConversionTarget};
use super::emit::emit_module;
use super::hal::{
    populate_flow_to_hal_patterns, populate_hal_to_vm_patterns, populate_std_to_vm_patterns,
};
use super::imports::ImportSymbolTable;
use super::ir::SourceModule;
use super::pattern::PatternSet;
use super::types::TypeConverter;
use super::ConversionResult;
use crate::hal::{HalError, HalResult};
use crate::module::CompiledModule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipeline {
    /// Device-targeting: tensors and dispatches lower through `hal.*`.
    Hal,
    /// Portable: only scalar, buffer view and check ops; dispatches are rejected.
    Vm,
}

impl Pipeline {
    pub fn name(self) -> &'static str {
        match self {
            Pipeline::Hal => "hal",
            Pipeline::Vm => "vm",
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pipeline {
    type Err = HalError;

    fn from_str(s: &str) -> HalResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hal" => Ok(Pipeline::Hal),
            "vm" => Ok(Pipeline::Vm),
            other => Err(HalError::invalid_argument(format!(
                "unknown pipeline '{other}' (expected 'hal' or 'vm')"
            ))),
        }
    }
}

struct Stage {
    name: &'static str,
    target: ConversionTarget,
    converter: TypeConverter,
    patterns: PatternSet,
}

impl Stage {
    fn hal() -> Self {
        let mut patterns = PatternSet::new();
        populate_flow_to_hal_patterns(&mut patterns);
        populate_check_to_hal_patterns(&mut patterns);
        Self {
            name: "hal",
            target: ConversionTarget::hal(),
            converter: TypeConverter::hal(),
            patterns,
        }
    }

    fn vm() -> Self {
        let mut patterns = PatternSet::new();
        populate_std_to_vm_patterns(&mut patterns);
        populate_hal_to_vm_patterns(&mut patterns);
        populate_check_to_vm_patterns(&mut patterns);
        Self {
            name: "vm",
            target: ConversionTarget::vm(),
            converter: TypeConverter::vm(),
            patterns,
        }
    }

    fn run(self, module: &mut SourceModule, imports: &ImportSymbolTable) -> ConversionResult<()> {
        let _span = tracing::debug_span!("conversion_stage", stage = self.name, module = %module.name)
            .entered();
        let patterns = self.patterns.freeze();
        for function in module.functions.iter_mut() {
            apply_conversion(
                function,
                &self.target,
                &patterns,
                &self.converter,
                imports,
                &module.executables,
            )
            .map_err(|err| {
                tracing::debug!(function = %function.name, error = %err, "conversion failed");
                err
            })?;
        }
        tracing::debug!(functions = module.functions.len(), "stage complete");
        Ok(())
    }
}

pub fn compile(
    source: &SourceModule,
    pipeline: Pipeline,
    imports: &ImportSymbolTable,
) -> ConversionResult<CompiledModule> {
    let mut module = source.clone();
    if pipeline == Pipeline::Hal {
        Stage::hal().run(&mut module, imports)?;
    }
    Stage::vm().run(&mut module, imports)?;
    let compiled = emit_module(&module, imports)?;
    tracing::info!(
        module = %compiled.name,
        pipeline = %pipeline,
        functions = compiled.functions.len(),
        imports = compiled.imports.len(),
        "module compiled"
    );
    Ok(compiled)
}

pub fn compile_hal(
    source: &SourceModule,
    imports: &ImportSymbolTable,
) -> ConversionResult<CompiledModule> {
    compile(source, Pipeline::Hal, imports)
}

pub fn compile_vm(
    source: &SourceModule,
    imports: &ImportSymbolTable,
) -> ConversionResult<CompiledModule> {
    compile(source, Pipeline::Vm, imports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{Attribute, FunctionBuilder, Type};
    use crate::compiler::ConversionError;
    use crate::hal::{ElementType, EntryPointDef};
    use crate::module::{ExecutableDef, Instruction, ValueKind};

    fn add_module() -> SourceModule {
        let mut module = SourceModule::new("add");
        module.executables.push(
            ExecutableDef::new("kernels", vec![EntryPointDef::new("add", 3, [64, 1, 1])])
                .with_section("interp-bytecode", b"unused".to_vec()),
        );
        let tensor = Type::tensor(ElementType::F32, &[4]);
        let mut builder = FunctionBuilder::new("main", &[tensor.clone(), tensor.clone()]);
        let (lhs, rhs) = (builder.param(0), builder.param(1));
        let sum = builder.op(
            "flow.dispatch",
            &[lhs, rhs],
            &[tensor],
            &[
                ("executable", Attribute::Str("kernels".into())),
                ("entry_point", Attribute::Str("add".into())),
                ("workgroups", Attribute::Ints(vec![1, 1, 1])),
            ],
        )[0];
        let expected = builder.dense_f32(&[4], &[2.0, 4.0, 6.0, 8.0]);
        builder.op(
            "check.expect_almost_eq",
            &[sum, expected],
            &[],
            &[("tolerance", Attribute::Float(1e-3))],
        );
        module.functions.push(builder.finish(&[sum]));
        module
    }

    #[test]
    fn hal_pipeline_lowers_dispatch_and_checks_to_imports() {
        let compiled = compile_hal(&add_module(), &ImportSymbolTable::standard()).unwrap();
        let names: Vec<&str> = compiled.imports.iter().map(|decl| decl.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "hal.buffer_view.allocate",
                "hal.device.dispatch",
                "check.expect_almost_eq"
            ]
        );
        let main = compiled.function("main").unwrap();
        assert_eq!(main.params, vec![ValueKind::BufferView, ValueKind::BufferView]);
        assert_eq!(main.results, vec![ValueKind::BufferView]);
        assert!(matches!(main.body.last(), Some(Instruction::Return { values }) if values.len() == 1));
        compiled.verify().unwrap();
    }

    #[test]
    fn portable_pipeline_rejects_dispatch() {
        let err = compile_vm(&add_module(), &ImportSymbolTable::standard()).unwrap_err();
        match err {
            ConversionError::IllegalOperation { location, .. } => {
                assert_eq!(location.op, "flow.dispatch");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn dispatch_binding_count_is_validated() {
        let mut module = add_module();
        module.executables[0].entry_points[0].binding_count = 2;
        let err = compile_hal(&module, &ImportSymbolTable::standard()).unwrap_err();
        assert!(err.to_string().contains("takes 2 bindings"), "{err}");
    }

    #[test]
    fn portable_pipeline_compiles_scalar_checks() {
        let mut module = SourceModule::new("scalars");
        let mut builder = FunctionBuilder::new("main", &[]);
        let yes = builder.constant(Attribute::Int(1), Type::I1);
        builder.op("check.expect_true", &[yes], &[], &[]);
        module.functions.push(builder.finish(&[]));

        let compiled = compile_vm(&module, &ImportSymbolTable::standard()).unwrap();
        let main = compiled.function("main").unwrap();
        assert_eq!(
            main.body,
            vec![
                Instruction::ConstI32 { dst: 0, value: 1 },
                Instruction::Call {
                    import: 0,
                    args: vec![0],
                    results: vec![]
                },
                Instruction::Return { values: vec![] },
            ]
        );
        assert_eq!(main.register_count, 1);
    }

    #[test]
    fn pipeline_names_parse() {
        assert_eq!("HAL".parse::<Pipeline>().unwrap(), Pipeline::Hal);
        assert!("llvm".parse::<Pipeline>().is_err());
    }
}
