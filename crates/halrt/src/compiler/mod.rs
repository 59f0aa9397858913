//! Import bridge: lowers check and flow ops into VM import calls.
//!
//! Compilation runs one or two conversion stages followed by emission:
//! the HAL pipeline first rewrites tensors into buffer views and dispatches
//! into `hal.*` ops, then the VM stage turns every remaining op into
//! `vm.const.*`, `vm.call` or `vm.return`. The VM-only pipeline skips the
//! HAL stage and therefore rejects device dispatches.

mod check;
mod conversion;
mod emit;
mod hal;
mod imports;
pub mod ir;
mod pattern;
mod pipeline;
mod types;

use std::fmt;

use thiserror::Error;

pub use check::{populate_check_to_hal_patterns, populate_check_to_vm_patterns};
pub use conversion::{apply_conversion, ConversionTarget, RewriteContext};
pub use emit::emit_module;
pub use hal::{
    populate_flow_to_hal_patterns, populate_hal_to_vm_patterns, populate_std_to_vm_patterns,
    RetypeOperandsPattern,
};
pub use imports::{AttrOperand, AttrPlacement, ImportSymbolTable, VmImportOpConversion};
pub use pattern::{ConversionPattern, FrozenPatternSet, PatternSet};
pub use pipeline::{compile, compile_hal, compile_vm, Pipeline};
pub use types::{value_kind, TypeConverter};

/// Where a conversion failure happened: function, op position and op name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpLocation {
    pub function: String,
    pub index: Option<usize>,
    pub op: String,
}

impl OpLocation {
    pub fn new(function: impl Into<String>, index: Option<usize>, op: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            index,
            op: op.into(),
        }
    }
}

impl fmt::Display for OpLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "@{}[{}] '{}'", self.function, index, self.op),
            None => write!(f, "@{} '{}'", self.function, self.op),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConversionError {
    #[error("{location}: unresolved import '{name}'")]
    UnresolvedImport { location: OpLocation, name: String },
    #[error("{location}: cannot convert type {ty}: {detail}")]
    TypeConversion {
        location: OpLocation,
        ty: String,
        detail: String,
    },
    #[error("{location}: illegal operation: {detail}")]
    IllegalOperation { location: OpLocation, detail: String },
    #[error("{location}: call to '{import}' passes ({actual}) but the import expects {expected}")]
    SignatureMismatch {
        location: OpLocation,
        import: String,
        expected: String,
        actual: String,
    },
    #[error("{location}: emission failed: {detail}")]
    Emission { location: OpLocation, detail: String },
}

impl ConversionError {
    pub fn location(&self) -> &OpLocation {
        match self {
            ConversionError::UnresolvedImport { location, .. }
            | ConversionError::TypeConversion { location, .. }
            | ConversionError::IllegalOperation { location, .. }
            | ConversionError::SignatureMismatch { location, .. }
            | ConversionError::Emission { location, .. } => location,
        }
    }
}

pub type ConversionResult<T> = Result<T, ConversionError>;
