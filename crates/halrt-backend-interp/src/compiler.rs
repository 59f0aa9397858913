use std::any::Any;

use halrt::hal::{
    ExecutableCompiler, ExecutableSpec, HalError, HalResult, PreparedExecutable,
    FORMAT_INTERP_BYTECODE,
};

use crate::bytecode::{Kernel, Op, Program, MAX_REGISTERS};

/// Verified program with kernels ordered by entry point ordinal.
#[derive(Debug)]
pub struct InterpProgram {
    kernels: Vec<Kernel>,
}

impl InterpProgram {
    pub fn kernel(&self, entry_point: usize) -> HalResult<&Kernel> {
        self.kernels.get(entry_point).ok_or_else(|| {
            HalError::invalid_argument(format!(
                "entry point ordinal {entry_point} out of range ({} kernels)",
                self.kernels.len()
            ))
        })
    }
}

impl PreparedExecutable for InterpProgram {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn verify_kernel(kernel: &Kernel) -> HalResult<()> {
    if usize::from(kernel.registers) > MAX_REGISTERS {
        return Err(HalError::resource_exhausted(format!(
            "kernel '{}' needs {} registers, interpreter provides {MAX_REGISTERS}",
            kernel.name, kernel.registers
        )));
    }
    if kernel.code.is_empty() {
        return Err(HalError::compilation(format!("kernel '{}' has no code", kernel.name)));
    }
    for (pc, op) in kernel.code.iter().enumerate() {
        if let Some(reg) = op.registers().find(|reg| *reg >= kernel.registers) {
            return Err(HalError::compilation(format!(
                "kernel '{}' pc {pc}: register r{reg} outside of {} declared registers",
                kernel.name, kernel.registers
            )));
        }
        if let Some(binding) = op.binding() {
            if usize::from(binding) >= kernel.bindings.len() {
                return Err(HalError::compilation(format!(
                    "kernel '{}' pc {pc}: binding b{binding} outside of {} bindings",
                    kernel.name,
                    kernel.bindings.len()
                )));
            }
        }
    }
    if !matches!(kernel.code.last(), Some(Op::Halt) | Some(Op::Trap { .. })) {
        return Err(HalError::compilation(format!(
            "kernel '{}' does not end with halt or trap",
            kernel.name
        )));
    }
    Ok(())
}

/// Decodes and verifies `interp-bytecode` executables.
#[derive(Debug, Default)]
pub struct InterpCompiler;

impl ExecutableCompiler for InterpCompiler {
    fn formats(&self) -> &[&'static str] {
        &[FORMAT_INTERP_BYTECODE]
    }

    fn prepare(&self, spec: &ExecutableSpec) -> HalResult<Box<dyn PreparedExecutable>> {
        if !self.can_prepare(&spec.format) {
            return Err(HalError::compilation(format!(
                "interpreter cannot prepare format '{}'",
                spec.format
            )));
        }
        let mut program = Program::decode(&spec.data)?;
        let mut kernels = Vec::with_capacity(spec.entry_points.len());
        for entry in &spec.entry_points {
            let position = program
                .kernels
                .iter()
                .position(|kernel| kernel.name == entry.name)
                .ok_or_else(|| {
                    HalError::compilation(format!(
                        "{}: entry point '{}' has no kernel",
                        spec.fingerprint, entry.name
                    ))
                })?;
            let kernel = program.kernels.swap_remove(position);
            if kernel.bindings.len() != entry.binding_count {
                return Err(HalError::compilation(format!(
                    "{}: kernel '{}' declares {} bindings, entry point expects {}",
                    spec.fingerprint,
                    entry.name,
                    kernel.bindings.len(),
                    entry.binding_count
                )));
            }
            verify_kernel(&kernel)?;
            kernels.push(kernel);
        }
        tracing::debug!(
            fingerprint = %spec.fingerprint,
            kernels = kernels.len(),
            "interpreter program verified"
        );
        Ok(Box::new(InterpProgram { kernels }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use halrt::hal::{ElementType, EntryPointDef};

    fn spec(data: Vec<u8>, entries: Vec<EntryPointDef>) -> ExecutableSpec {
        ExecutableSpec::new("m", "e", FORMAT_INTERP_BYTECODE, data, entries)
    }

    #[test]
    fn kernels_follow_entry_point_order() {
        let data = assemble("kernel a f32\nend\nkernel b f32 f32\nend\n").unwrap();
        let prepared = InterpCompiler
            .prepare(&spec(
                data,
                vec![EntryPointDef::new("b", 2, [1, 1, 1]), EntryPointDef::new("a", 1, [1, 1, 1])],
            ))
            .unwrap();
        let program = prepared.as_any().downcast_ref::<InterpProgram>().unwrap();
        assert_eq!(program.kernel(0).unwrap().name, "b");
        assert_eq!(program.kernel(1).unwrap().name, "a");
        assert!(program.kernel(2).is_err());
    }

    #[test]
    fn binding_count_mismatch_is_compilation_failure() {
        let data = assemble("kernel a f32\nend\n").unwrap();
        let err = InterpCompiler
            .prepare(&spec(data, vec![EntryPointDef::new("a", 2, [1, 1, 1])]))
            .err()
            .unwrap();
        assert_eq!(err.code(), "compilation_failure");
    }

    #[test]
    fn register_pressure_is_resource_exhausted() {
        let program = Program {
            kernels: vec![Kernel {
                name: "big".into(),
                bindings: vec![ElementType::F32],
                registers: (MAX_REGISTERS + 1) as u16,
                code: vec![Op::Halt],
            }],
        };
        let err = InterpCompiler
            .prepare(&spec(
                program.encode().unwrap(),
                vec![EntryPointDef::new("big", 1, [1, 1, 1])],
            ))
            .err()
            .unwrap();
        assert_eq!(err.code(), "resource_exhausted");
    }

    #[test]
    fn hand_built_out_of_range_binding_is_rejected() {
        let program = Program {
            kernels: vec![Kernel {
                name: "k".into(),
                bindings: vec![ElementType::F32],
                registers: 1,
                code: vec![Op::Load { dst: 0, binding: 4 }, Op::Halt],
            }],
        };
        let err = InterpCompiler
            .prepare(&spec(program.encode().unwrap(), vec![EntryPointDef::new("k", 1, [1, 1, 1])]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("binding b4"));
    }
}
