//! Interpreter bytecode: `HIBC` magic, little-endian `u16` version, bincode body.

use halrt::hal::{ElementType, HalError, HalResult};
use serde::{Deserialize, Serialize};

pub const BYTECODE_MAGIC: [u8; 4] = *b"HIBC";
pub const BYTECODE_VERSION: u16 = 1;
/// Register file size of one invocation.
pub const MAX_REGISTERS: usize = 64;

pub type Reg = u16;
pub type Slot = u16;

/// One instruction. Registers hold `f64`; loads and stores address the
/// element at the current invocation index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Load { dst: Reg, binding: Slot },
    Store { binding: Slot, src: Reg },
    Const { dst: Reg, value: f64 },
    Index { dst: Reg },
    Add { dst: Reg, lhs: Reg, rhs: Reg },
    Sub { dst: Reg, lhs: Reg, rhs: Reg },
    Mul { dst: Reg, lhs: Reg, rhs: Reg },
    Div { dst: Reg, lhs: Reg, rhs: Reg },
    Max { dst: Reg, lhs: Reg, rhs: Reg },
    Min { dst: Reg, lhs: Reg, rhs: Reg },
    Neg { dst: Reg, src: Reg },
    Abs { dst: Reg, src: Reg },
    Copy { dst: Reg, src: Reg },
    /// Ends the invocation when its index is past the binding's last element.
    Guard { binding: Slot },
    Trap { code: u32 },
    Halt,
}

impl Op {
    pub fn registers(&self) -> impl Iterator<Item = Reg> {
        let regs: [Option<Reg>; 3] = match *self {
            Op::Load { dst, .. } | Op::Const { dst, .. } | Op::Index { dst } => [Some(dst), None, None],
            Op::Store { src, .. } => [Some(src), None, None],
            Op::Add { dst, lhs, rhs }
            | Op::Sub { dst, lhs, rhs }
            | Op::Mul { dst, lhs, rhs }
            | Op::Div { dst, lhs, rhs }
            | Op::Max { dst, lhs, rhs }
            | Op::Min { dst, lhs, rhs } => [Some(dst), Some(lhs), Some(rhs)],
            Op::Neg { dst, src } | Op::Abs { dst, src } | Op::Copy { dst, src } => {
                [Some(dst), Some(src), None]
            }
            Op::Guard { .. } | Op::Trap { .. } | Op::Halt => [None, None, None],
        };
        regs.into_iter().flatten()
    }

    pub fn binding(&self) -> Option<Slot> {
        match *self {
            Op::Load { binding, .. } | Op::Store { binding, .. } | Op::Guard { binding } => {
                Some(binding)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub name: String,
    /// Element type of each binding, in binding order.
    pub bindings: Vec<ElementType>,
    pub registers: u16,
    pub code: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub kernels: Vec<Kernel>,
}

impl Program {
    pub fn kernel(&self, name: &str) -> Option<&Kernel> {
        self.kernels.iter().find(|kernel| kernel.name == name)
    }

    pub fn encode(&self) -> HalResult<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|err| HalError::invalid_argument(format!("bytecode encode failed: {err}")))?;
        let mut bytes = Vec::with_capacity(body.len() + 6);
        bytes.extend_from_slice(&BYTECODE_MAGIC);
        bytes.extend_from_slice(&BYTECODE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> HalResult<Self> {
        if bytes.len() < 6 || bytes[..4] != BYTECODE_MAGIC {
            return Err(HalError::compilation("not interpreter bytecode (bad magic)"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != BYTECODE_VERSION {
            return Err(HalError::compilation(format!(
                "unsupported bytecode version {version} (expected {BYTECODE_VERSION})"
            )));
        }
        bincode::deserialize(&bytes[6..])
            .map_err(|err| HalError::compilation(format!("malformed bytecode: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_foreign_blobs() {
        let err = Program::decode(b"\x7fELF....").unwrap_err();
        assert_eq!(err.code(), "compilation_failure");

        let mut bytes = Program::default().encode().unwrap();
        bytes[4] = 9;
        assert!(Program::decode(&bytes).unwrap_err().to_string().contains("version 9"));
    }

    #[test]
    fn op_register_and_binding_accessors() {
        let op = Op::Add { dst: 2, lhs: 0, rhs: 1 };
        assert_eq!(op.registers().collect::<Vec<_>>(), vec![2, 0, 1]);
        assert_eq!(op.binding(), None);
        assert_eq!(Op::Store { binding: 3, src: 1 }.binding(), Some(3));
    }
}
