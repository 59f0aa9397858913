//! Compiled module format consumed by the VM.
//!
//! A module carries its import table, register-based functions and the
//! executables they dispatch, each with one code section per backend format.
//! On disk it is a 4-byte magic, a little-endian version and a `bincode` payload.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hal::{ElementType, EntryPointDef, HalError, HalResult};

pub const MODULE_MAGIC: [u8; 4] = *b"HRTM";
pub const MODULE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    I32,
    I64,
    F32,
    BufferView,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::F32 => "f32",
            ValueKind::BufferView => "buffer_view",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Calling convention of an import: fixed parameters, optional variadic tail, results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<ValueKind>,
    pub variadic: Option<ValueKind>,
    pub results: Vec<ValueKind>,
}

impl Signature {
    pub fn new(params: impl Into<Vec<ValueKind>>, results: impl Into<Vec<ValueKind>>) -> Self {
        Self {
            params: params.into(),
            variadic: None,
            results: results.into(),
        }
    }

    pub fn with_variadic(mut self, kind: ValueKind) -> Self {
        self.variadic = Some(kind);
        self
    }

    /// Whether a call with these argument kinds fits the signature.
    pub fn accepts(&self, args: &[ValueKind]) -> bool {
        if args.len() < self.params.len() {
            return false;
        }
        let (fixed, rest) = args.split_at(self.params.len());
        if fixed != self.params.as_slice() {
            return false;
        }
        match self.variadic {
            Some(kind) => rest.iter().all(|arg| *arg == kind),
            None => rest.is_empty(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params: Vec<String> = self.params.iter().map(|k| k.to_string()).collect();
        if let Some(kind) = self.variadic {
            params.push(format!("{kind}..."));
        }
        let results: Vec<&str> = self.results.iter().map(|k| k.name()).collect();
        write!(f, "({}) -> ({})", params.join(", "), results.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDecl {
    pub name: String,
    pub signature: Signature,
}

pub type Register = u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    ConstI32 {
        dst: Register,
        value: i32,
    },
    ConstI64 {
        dst: Register,
        value: i64,
    },
    ConstF32 {
        dst: Register,
        value: f32,
    },
    /// Dense constant materialized into a fresh buffer view on every execution.
    ConstBufferView {
        dst: Register,
        element_type: ElementType,
        shape: Vec<usize>,
        data: Vec<u8>,
    },
    Call {
        import: u32,
        args: Vec<Register>,
        results: Vec<Register>,
    },
    Return {
        values: Vec<Register>,
    },
}

/// Register-based function. Parameters occupy registers `0..params.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<ValueKind>,
    pub results: Vec<ValueKind>,
    pub register_count: u32,
    pub body: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableDef {
    pub name: String,
    pub entry_points: Vec<EntryPointDef>,
    /// Code per executable format (`interp-bytecode`, `dylib-c`, ...).
    pub sections: BTreeMap<String, Vec<u8>>,
}

impl ExecutableDef {
    pub fn new(name: impl Into<String>, entry_points: Vec<EntryPointDef>) -> Self {
        Self {
            name: name.into(),
            entry_points,
            sections: BTreeMap::new(),
        }
    }

    pub fn with_section(mut self, format: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.sections.insert(format.into(), data.into());
        self
    }

    pub fn entry_point_ordinal(&self, name: &str) -> Option<usize> {
        self.entry_points.iter().position(|entry| entry.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledModule {
    pub name: String,
    pub imports: Vec<ImportDecl>,
    pub functions: Vec<Function>,
    pub executables: Vec<ExecutableDef>,
}

impl CompiledModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
            functions: Vec::new(),
            executables: Vec::new(),
        }
    }

    /// Returns the ordinal of the import, adding it if absent.
    pub fn import_ordinal(&mut self, name: &str, signature: &Signature) -> HalResult<u32> {
        if let Some(index) = self.imports.iter().position(|decl| decl.name == name) {
            if &self.imports[index].signature != signature {
                return Err(HalError::invalid_argument(format!(
                    "import '{name}' declared twice with different signatures"
                )));
            }
            return Ok(index as u32);
        }
        self.imports.push(ImportDecl {
            name: name.to_string(),
            signature: signature.clone(),
        });
        Ok((self.imports.len() - 1) as u32)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn executable_ordinal(&self, name: &str) -> Option<usize> {
        self.executables.iter().position(|exe| exe.name == name)
    }

    /// Structural checks: register bounds and import ordinals.
    pub fn verify(&self) -> HalResult<()> {
        for function in &self.functions {
            let check_reg = |reg: Register| -> HalResult<()> {
                if reg >= function.register_count {
                    return Err(HalError::invalid_argument(format!(
                        "function '{}' uses register {reg} but declares {}",
                        function.name, function.register_count
                    )));
                }
                Ok(())
            };
            if function.params.len() > function.register_count as usize {
                return Err(HalError::invalid_argument(format!(
                    "function '{}' has more parameters than registers",
                    function.name
                )));
            }
            for instruction in &function.body {
                match instruction {
                    Instruction::ConstI32 { dst, .. }
                    | Instruction::ConstI64 { dst, .. }
                    | Instruction::ConstF32 { dst, .. }
                    | Instruction::ConstBufferView { dst, .. } => check_reg(*dst)?,
                    Instruction::Call {
                        import,
                        args,
                        results,
                    } => {
                        if *import as usize >= self.imports.len() {
                            return Err(HalError::invalid_argument(format!(
                                "function '{}' calls import ordinal {import} of {}",
                                function.name,
                                self.imports.len()
                            )));
                        }
                        for reg in args.iter().chain(results) {
                            check_reg(*reg)?;
                        }
                    }
                    Instruction::Return { values } => {
                        for reg in values {
                            check_reg(*reg)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> HalResult<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|err| HalError::invalid_argument(format!("module encoding failed: {err}")))?;
        let mut bytes = Vec::with_capacity(8 + payload.len());
        bytes.extend_from_slice(&MODULE_MAGIC);
        bytes.extend_from_slice(&MODULE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> HalResult<Self> {
        if bytes.len() < 8 || bytes[..4] != MODULE_MAGIC {
            return Err(HalError::invalid_argument("not a compiled module (bad magic)"));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != MODULE_VERSION {
            return Err(HalError::invalid_argument(format!(
                "unsupported module version {version} (expected {MODULE_VERSION})"
            )));
        }
        let module: CompiledModule = bincode::deserialize(&bytes[8..])
            .map_err(|err| HalError::invalid_argument(format!("malformed module payload: {err}")))?;
        module.verify()?;
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variadic_signatures_accept_tails() {
        let sig = Signature::new([ValueKind::I32], [ValueKind::BufferView]).with_variadic(ValueKind::I64);
        assert!(sig.accepts(&[ValueKind::I32]));
        assert!(sig.accepts(&[ValueKind::I32, ValueKind::I64, ValueKind::I64]));
        assert!(!sig.accepts(&[ValueKind::I32, ValueKind::F32]));
        assert!(!sig.accepts(&[]));
        assert_eq!(sig.to_string(), "(i32, i64...) -> (buffer_view)");
    }

    #[test]
    fn encoded_module_survives_decoding() {
        let mut module = CompiledModule::new("m");
        let ordinal = module
            .import_ordinal("check.expect_true", &Signature::new([ValueKind::I32], []))
            .unwrap();
        module.functions.push(Function {
            name: "main".into(),
            params: vec![],
            results: vec![],
            register_count: 1,
            body: vec![
                Instruction::ConstI32 { dst: 0, value: 1 },
                Instruction::Call {
                    import: ordinal,
                    args: vec![0],
                    results: vec![],
                },
                Instruction::Return { values: vec![] },
            ],
        });
        let bytes = module.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"HRTM");
        assert_eq!(CompiledModule::from_bytes(&bytes).unwrap(), module);
    }

    #[test]
    fn malformed_blobs_are_rejected() {
        assert!(matches!(
            CompiledModule::from_bytes(b"nope"),
            Err(HalError::InvalidArgument(_))
        ));
        let mut bytes = CompiledModule::new("m").to_bytes().unwrap();
        bytes[4] = 9;
        assert!(CompiledModule::from_bytes(&bytes).is_err());
        let mut truncated = CompiledModule::new("m").to_bytes().unwrap();
        truncated.truncate(10);
        assert!(CompiledModule::from_bytes(&truncated).is_err());
    }

    #[test]
    fn verify_rejects_out_of_range_registers() {
        let mut module = CompiledModule::new("m");
        module.functions.push(Function {
            name: "f".into(),
            params: vec![],
            results: vec![],
            register_count: 1,
            body: vec![Instruction::ConstI32 { dst: 3, value: 0 }],
        });
        assert!(module.verify().is_err());
    }

    #[test]
    fn conflicting_import_signatures_are_rejected() {
        let mut module = CompiledModule::new("m");
        module
            .import_ordinal("x", &Signature::new([ValueKind::I32], []))
            .unwrap();
        assert!(module
            .import_ordinal("x", &Signature::new([ValueKind::I64], []))
            .is_err());
    }
}
