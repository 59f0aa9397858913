//! Import dispatch table: qualified name + signature to native implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::value::Value;
use crate::hal::{Device, Executable, HalError, HalResult};
use crate::module::{ImportDecl, Signature};

/// State a native import sees while running: the device the module is bound
/// to and the module's prepared executables, by ordinal.
pub struct CallContext<'a> {
    pub device: &'a Arc<dyn Device>,
    pub executables: &'a [Executable],
}

impl CallContext<'_> {
    pub fn executable(&self, ordinal: i32) -> HalResult<&Executable> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|index| self.executables.get(index))
            .ok_or_else(|| {
                HalError::invalid_argument(format!(
                    "executable ordinal {ordinal} out of range ({} executables)",
                    self.executables.len()
                ))
            })
    }
}

pub type ImportFn = Arc<dyn Fn(&CallContext<'_>, &[Value]) -> HalResult<Vec<Value>> + Send + Sync>;

#[derive(Clone)]
pub struct ImportBinding {
    pub name: String,
    pub signature: Signature,
    pub function: ImportFn,
}

impl fmt::Debug for ImportBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportBinding")
            .field("name", &self.name)
            .field("signature", &self.signature.to_string())
            .finish()
    }
}

/// A group of imports registered together (`hal.*`, `check.*`).
pub trait NativeModule {
    fn name(&self) -> &str;

    fn register(&self, registry: &mut ImportRegistry) -> HalResult<()>;
}

/// Registration table consulted at module load. Immutable once handed to a context.
#[derive(Default, Clone)]
pub struct ImportRegistry {
    bindings: BTreeMap<String, ImportBinding>,
}

impl ImportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one import. Each qualified name may be registered once.
    pub fn register_import<F>(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        function: F,
    ) -> HalResult<()>
    where
        F: Fn(&CallContext<'_>, &[Value]) -> HalResult<Vec<Value>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.bindings.contains_key(&name) {
            return Err(HalError::invalid_argument(format!(
                "import '{name}' is already registered"
            )));
        }
        tracing::debug!(import = %name, signature = %signature, "import registered");
        self.bindings.insert(
            name.clone(),
            ImportBinding {
                name,
                signature,
                function: Arc::new(function),
            },
        );
        Ok(())
    }

    pub fn register_module(&mut self, module: &dyn NativeModule) -> HalResult<()> {
        tracing::debug!(module = module.name(), "registering native module");
        module.register(self)
    }

    /// Resolves a module's import declaration by exact name and signature.
    pub fn resolve(&self, decl: &ImportDecl) -> HalResult<ImportBinding> {
        let binding = self.bindings.get(&decl.name).ok_or_else(|| {
            HalError::unresolved_import(&decl.name, "no import registered under this name")
        })?;
        if binding.signature != decl.signature {
            return Err(HalError::unresolved_import(
                &decl.name,
                format!(
                    "module expects {} but the registered import has {}",
                    decl.signature, binding.signature
                ),
            ));
        }
        Ok(binding.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Name and signature of every registered import, sorted by name.
    pub fn declarations(&self) -> impl Iterator<Item = (&str, &Signature)> {
        self.bindings
            .values()
            .map(|binding| (binding.name.as_str(), &binding.signature))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ValueKind;

    fn noop(_: &CallContext<'_>, _: &[Value]) -> HalResult<Vec<Value>> {
        Ok(Vec::new())
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ImportRegistry::new();
        let sig = Signature::new([ValueKind::I32], []);
        registry.register_import("a.b", sig.clone(), noop).unwrap();
        assert!(matches!(
            registry.register_import("a.b", sig, noop),
            Err(HalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn resolution_matches_name_and_signature() {
        let mut registry = ImportRegistry::new();
        registry
            .register_import("a.b", Signature::new([ValueKind::I32], []), noop)
            .unwrap();

        let ok = ImportDecl {
            name: "a.b".into(),
            signature: Signature::new([ValueKind::I32], []),
        };
        assert_eq!(registry.resolve(&ok).unwrap().name, "a.b");

        let wrong_sig = ImportDecl {
            name: "a.b".into(),
            signature: Signature::new([ValueKind::F32], []),
        };
        match registry.resolve(&wrong_sig) {
            Err(HalError::UnresolvedImport { name, detail }) => {
                assert_eq!(name, "a.b");
                assert!(detail.contains("(f32) -> ()"));
            }
            other => panic!("unexpected resolution {other:?}"),
        }

        let missing = ImportDecl {
            name: "a.c".into(),
            signature: Signature::new([], []),
        };
        assert!(matches!(
            registry.resolve(&missing),
            Err(HalError::UnresolvedImport { .. })
        ));
    }
}
