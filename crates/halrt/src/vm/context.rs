use std::sync::Arc;

use super::imports::{CallContext, ImportBinding, ImportRegistry};
use super::value::Value;
use crate::hal::{
    BufferView, Device, Executable, ExecutableSpec, HalError, HalResult, HostTensor,
};
use crate::module::{CompiledModule, ExecutableDef, Function, Instruction, ValueKind};

/// A module loaded against one device: imports resolved, executables prepared.
pub struct Context {
    device: Arc<dyn Device>,
    module: Arc<CompiledModule>,
    imports: Vec<ImportBinding>,
    executables: Vec<Executable>,
}

impl Context {
    /// Resolves every import and prepares every executable.
    ///
    /// Import resolution happens first, so a module with an unresolved import
    /// fails before any executable is compiled or any work is submitted.
    pub fn load(
        device: Arc<dyn Device>,
        registry: &ImportRegistry,
        module: CompiledModule,
    ) -> HalResult<Self> {
        let _span = tracing::debug_span!("vm_load", module = %module.name).entered();
        module.verify()?;

        let imports = module
            .imports
            .iter()
            .map(|decl| registry.resolve(decl))
            .collect::<HalResult<Vec<_>>>()?;
        tracing::debug!(count = imports.len(), "imports resolved");

        let executables = module
            .executables
            .iter()
            .map(|def| prepare_executable(device.as_ref(), &module.name, def))
            .collect::<HalResult<Vec<_>>>()?;

        Ok(Self {
            device,
            module: Arc::new(module),
            imports,
            executables,
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    pub fn executables(&self) -> &[Executable] {
        &self.executables
    }

    pub fn function(&self, name: &str) -> HalResult<&Function> {
        self.module.function(name).ok_or_else(|| {
            HalError::invalid_argument(format!(
                "module '{}' has no function '{name}'",
                self.module.name
            ))
        })
    }

    /// Runs a function synchronously on the calling thread.
    pub fn invoke(&self, name: &str, args: &[Value]) -> HalResult<Vec<Value>> {
        let function = self.function(name)?;
        let arg_kinds: Vec<ValueKind> = args.iter().map(Value::kind).collect();
        if arg_kinds != function.params {
            return Err(HalError::invalid_argument(format!(
                "function '{name}' expects arguments {:?}, got {:?}",
                function.params, arg_kinds
            )));
        }
        let _span = tracing::debug_span!("vm_invoke", function = name).entered();

        let mut registers: Vec<Option<Value>> = vec![None; function.register_count as usize];
        for (slot, arg) in registers.iter_mut().zip(args) {
            *slot = Some(arg.clone());
        }
        let call_context = CallContext {
            device: &self.device,
            executables: &self.executables,
        };

        for (pc, instruction) in function.body.iter().enumerate() {
            match instruction {
                Instruction::ConstI32 { dst, value } => {
                    registers[*dst as usize] = Some(Value::I32(*value));
                }
                Instruction::ConstI64 { dst, value } => {
                    registers[*dst as usize] = Some(Value::I64(*value));
                }
                Instruction::ConstF32 { dst, value } => {
                    registers[*dst as usize] = Some(Value::F32(*value));
                }
                Instruction::ConstBufferView {
                    dst,
                    element_type,
                    shape,
                    data,
                } => {
                    let host = HostTensor {
                        element_type: *element_type,
                        shape: shape.clone(),
                        data: data.clone(),
                    };
                    let view = BufferView::from_host(self.device.allocator(), &host)?;
                    registers[*dst as usize] = Some(Value::BufferView(view));
                }
                Instruction::Call {
                    import,
                    args,
                    results,
                } => {
                    let binding = &self.imports[*import as usize];
                    let call_args = read_registers(&registers, args, name, pc)?;
                    let kinds: Vec<ValueKind> = call_args.iter().map(Value::kind).collect();
                    if !binding.signature.accepts(&kinds) {
                        return Err(HalError::invalid_argument(format!(
                            "call to '{}' at {name}:{pc} passes {kinds:?}, signature is {}",
                            binding.name, binding.signature
                        )));
                    }
                    let outputs = (binding.function)(&call_context, &call_args)?;
                    if outputs.len() != results.len() {
                        return Err(HalError::execution(format!(
                            "import '{}' returned {} values, {} expected",
                            binding.name,
                            outputs.len(),
                            results.len()
                        )));
                    }
                    for (dst, value) in results.iter().zip(outputs) {
                        registers[*dst as usize] = Some(value);
                    }
                }
                Instruction::Return { values } => {
                    let values = read_registers(&registers, values, name, pc)?;
                    let kinds: Vec<ValueKind> = values.iter().map(Value::kind).collect();
                    if kinds != function.results {
                        return Err(HalError::execution(format!(
                            "function '{name}' returned {kinds:?}, declared {:?}",
                            function.results
                        )));
                    }
                    return Ok(values);
                }
            }
        }
        if function.results.is_empty() {
            Ok(Vec::new())
        } else {
            Err(HalError::execution(format!(
                "function '{name}' fell off the end without returning"
            )))
        }
    }
}

fn read_registers(
    registers: &[Option<Value>],
    indices: &[u32],
    function: &str,
    pc: usize,
) -> HalResult<Vec<Value>> {
    indices
        .iter()
        .map(|reg| {
            registers[*reg as usize].clone().ok_or_else(|| {
                HalError::execution(format!("{function}:{pc} reads unset register r{reg}"))
            })
        })
        .collect()
}

/// Prepares the first section whose format the device can compile.
fn prepare_executable(
    device: &dyn Device,
    module: &str,
    def: &ExecutableDef,
) -> HalResult<Executable> {
    let cache = device.executable_cache();
    let (format, data) = def
        .sections
        .iter()
        .find(|(format, _)| cache.can_prepare_format(format))
        .ok_or_else(|| {
            let formats: Vec<&str> = def.sections.keys().map(String::as_str).collect();
            HalError::compilation(format!(
                "executable '{}' has no section for device '{}' (sections: {})",
                def.name,
                device.info().name,
                formats.join(", ")
            ))
        })?;
    let spec = ExecutableSpec::new(module, &def.name, format, data.clone(), def.entry_points.clone());
    cache.create_executable(&spec)
}
