//! Text assembler for interpreter kernels.
//!
//! ```text
//! # c = a + b
//! kernel add f32 f32 f32
//!   guard b2
//!   load r0, b0
//!   load r1, b1
//!   add r2, r0, r1
//!   store b2, r2
//! end
//! ```
//!
//! Kernel headers list one element type per binding. `end` appends a `halt`
//! when the body does not already end with one.

use halrt::hal::{ElementType, HalError};
use thiserror::Error;

use crate::bytecode::{Kernel, Op, Program, Reg, Slot};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct AssembleError {
    pub line: usize,
    pub message: String,
}

impl From<AssembleError> for HalError {
    fn from(err: AssembleError) -> Self {
        HalError::compilation(format!("assembly failed: {err}"))
    }
}

struct Line<'a> {
    number: usize,
    tokens: Vec<&'a str>,
}

impl Line<'_> {
    fn error(&self, message: impl Into<String>) -> AssembleError {
        AssembleError {
            line: self.number,
            message: message.into(),
        }
    }

    fn expect_operands(&self, count: usize) -> Result<(), AssembleError> {
        let found = self.tokens.len() - 1;
        if found != count {
            return Err(self.error(format!(
                "'{}' takes {count} operands, found {found}",
                self.tokens[0]
            )));
        }
        Ok(())
    }

    fn operand(&self, index: usize) -> &str {
        self.tokens[index + 1]
    }

    fn register(&self, index: usize) -> Result<Reg, AssembleError> {
        let token = self.operand(index);
        token
            .strip_prefix('r')
            .and_then(|digits| digits.parse::<Reg>().ok())
            .ok_or_else(|| self.error(format!("expected a register like r0, found '{token}'")))
    }

    fn binding(&self, index: usize) -> Result<Slot, AssembleError> {
        let token = self.operand(index);
        token
            .strip_prefix('b')
            .and_then(|digits| digits.parse::<Slot>().ok())
            .ok_or_else(|| self.error(format!("expected a binding like b0, found '{token}'")))
    }
}

fn parse_op(line: &Line<'_>) -> Result<Op, AssembleError> {
    let binary = |make: fn(Reg, Reg, Reg) -> Op| -> Result<Op, AssembleError> {
        line.expect_operands(3)?;
        Ok(make(line.register(0)?, line.register(1)?, line.register(2)?))
    };
    let unary = |make: fn(Reg, Reg) -> Op| -> Result<Op, AssembleError> {
        line.expect_operands(2)?;
        Ok(make(line.register(0)?, line.register(1)?))
    };
    match line.tokens[0] {
        "load" => {
            line.expect_operands(2)?;
            Ok(Op::Load {
                dst: line.register(0)?,
                binding: line.binding(1)?,
            })
        }
        "store" => {
            line.expect_operands(2)?;
            Ok(Op::Store {
                binding: line.binding(0)?,
                src: line.register(1)?,
            })
        }
        "const" => {
            line.expect_operands(2)?;
            let literal = line.operand(1);
            let value = literal
                .parse::<f64>()
                .map_err(|_| line.error(format!("invalid constant '{literal}'")))?;
            Ok(Op::Const {
                dst: line.register(0)?,
                value,
            })
        }
        "index" => {
            line.expect_operands(1)?;
            Ok(Op::Index {
                dst: line.register(0)?,
            })
        }
        "add" => binary(|dst, lhs, rhs| Op::Add { dst, lhs, rhs }),
        "sub" => binary(|dst, lhs, rhs| Op::Sub { dst, lhs, rhs }),
        "mul" => binary(|dst, lhs, rhs| Op::Mul { dst, lhs, rhs }),
        "div" => binary(|dst, lhs, rhs| Op::Div { dst, lhs, rhs }),
        "max" => binary(|dst, lhs, rhs| Op::Max { dst, lhs, rhs }),
        "min" => binary(|dst, lhs, rhs| Op::Min { dst, lhs, rhs }),
        "neg" => unary(|dst, src| Op::Neg { dst, src }),
        "abs" => unary(|dst, src| Op::Abs { dst, src }),
        "copy" => unary(|dst, src| Op::Copy { dst, src }),
        "guard" => {
            line.expect_operands(1)?;
            Ok(Op::Guard {
                binding: line.binding(0)?,
            })
        }
        "trap" => {
            line.expect_operands(1)?;
            let literal = line.operand(0);
            let code = literal
                .parse::<u32>()
                .map_err(|_| line.error(format!("invalid trap code '{literal}'")))?;
            Ok(Op::Trap { code })
        }
        "halt" => {
            line.expect_operands(0)?;
            Ok(Op::Halt)
        }
        other => Err(line.error(format!("unknown instruction '{other}'"))),
    }
}

fn finish_kernel(mut kernel: Kernel) -> Kernel {
    if kernel.code.last() != Some(&Op::Halt) {
        kernel.code.push(Op::Halt);
    }
    kernel.registers = kernel
        .code
        .iter()
        .flat_map(Op::registers)
        .max()
        .map_or(0, |max| max + 1);
    kernel
}

pub fn assemble_program(source: &str) -> Result<Program, AssembleError> {
    let mut program = Program::default();
    let mut current: Option<Kernel> = None;
    for (index, raw) in source.lines().enumerate() {
        let text = raw.split('#').next().unwrap_or_default();
        let tokens: Vec<&str> = text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .collect();
        if tokens.is_empty() {
            continue;
        }
        let line = Line {
            number: index + 1,
            tokens,
        };
        match (line.tokens[0], current.as_mut()) {
            ("kernel", None) => {
                let name = line
                    .tokens
                    .get(1)
                    .ok_or_else(|| line.error("kernel needs a name"))?;
                if program.kernel(name).is_some() {
                    return Err(line.error(format!("kernel '{name}' defined twice")));
                }
                let bindings = line.tokens[2..]
                    .iter()
                    .map(|ty| {
                        ElementType::parse(ty)
                            .map_err(|_| line.error(format!("unknown element type '{ty}'")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                current = Some(Kernel {
                    name: name.to_string(),
                    bindings,
                    registers: 0,
                    code: Vec::new(),
                });
            }
            ("kernel", Some(open)) => {
                return Err(line.error(format!("kernel '{}' is missing 'end'", open.name)));
            }
            ("end", Some(_)) => {
                line.expect_operands(0)?;
                if let Some(kernel) = current.take() {
                    program.kernels.push(finish_kernel(kernel));
                }
            }
            (_, None) => return Err(line.error("instruction outside of a kernel")),
            (_, Some(kernel)) => kernel.code.push(parse_op(&line)?),
        }
    }
    if let Some(open) = current {
        return Err(AssembleError {
            line: source.lines().count(),
            message: format!("kernel '{}' is missing 'end'", open.name),
        });
    }
    Ok(program)
}

/// Assembles `source` straight into an `interp-bytecode` section.
pub fn assemble(source: &str) -> halrt::hal::HalResult<Vec<u8>> {
    assemble_program(source)?.encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_kernel_and_counts_registers() {
        let program = assemble_program(
            "kernel scale f32 f32\n  load r0, b0\n  const r3, 2.5\n  mul r1, r0, r3\n  store b1, r1\nend\n",
        )
        .unwrap();
        let kernel = &program.kernels[0];
        assert_eq!(kernel.name, "scale");
        assert_eq!(kernel.bindings, vec![ElementType::F32, ElementType::F32]);
        assert_eq!(kernel.registers, 4);
        assert_eq!(kernel.code.last(), Some(&Op::Halt));
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = assemble_program("kernel k f32\n\n  frobnicate r0\nend").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("frobnicate"));

        let err = assemble_program("kernel k f32\n  load r0, b0\n").unwrap_err();
        assert!(err.message.contains("missing 'end'"));
    }

    #[test]
    fn assembly_errors_become_compilation_failures() {
        let err = assemble("load r0, b0").unwrap_err();
        assert_eq!(err.code(), "compilation_failure");
    }
}
