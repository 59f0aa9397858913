use super::ir::Type;
use crate::module::ValueKind;

type ConversionRule = Box<dyn Fn(&Type) -> Option<Type> + Send + Sync>;

/// Maps source types to the types a lowering stage produces.
///
/// Rules are tried most-recently-added first; the first rule returning
/// `Some` wins. Converters must be idempotent on their own outputs.
pub struct TypeConverter {
    rules: Vec<ConversionRule>,
}

impl TypeConverter {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_conversion<F>(&mut self, rule: F) -> &mut Self
    where
        F: Fn(&Type) -> Option<Type> + Send + Sync + 'static,
    {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn convert(&self, ty: &Type) -> Option<Type> {
        self.rules.iter().rev().find_map(|rule| rule(ty))
    }

    /// HAL stage: tensors become buffer views, everything else is untouched.
    pub fn hal() -> Self {
        let mut converter = Self::new();
        converter
            .add_conversion(|ty| Some(ty.clone()))
            .add_conversion(|ty| ty.is_tensor().then_some(Type::BufferView));
        converter
    }

    /// VM stage: only the VM's register kinds survive.
    pub fn vm() -> Self {
        let mut converter = Self::new();
        converter.add_conversion(|ty| match ty {
            Type::I1 | Type::I32 => Some(Type::I32),
            Type::I64 | Type::Index => Some(Type::I64),
            Type::F32 => Some(Type::F32),
            Type::Tensor(_) | Type::BufferView => Some(Type::BufferView),
        });
        converter
    }
}

impl Default for TypeConverter {
    fn default() -> Self {
        Self::new()
    }
}

/// VM register kind of an already-converted type.
pub fn value_kind(ty: &Type) -> Option<ValueKind> {
    match ty {
        Type::I32 => Some(ValueKind::I32),
        Type::I64 => Some(ValueKind::I64),
        Type::F32 => Some(ValueKind::F32),
        Type::BufferView => Some(ValueKind::BufferView),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ElementType;

    #[test]
    fn vm_converter_narrows_to_register_kinds() {
        let vm = TypeConverter::vm();
        assert_eq!(vm.convert(&Type::I1), Some(Type::I32));
        assert_eq!(vm.convert(&Type::Index), Some(Type::I64));
        assert_eq!(
            vm.convert(&Type::tensor(ElementType::F32, &[4])),
            Some(Type::BufferView)
        );
    }

    #[test]
    fn hal_converter_only_touches_tensors() {
        let hal = TypeConverter::hal();
        assert_eq!(hal.convert(&Type::I1), Some(Type::I1));
        assert_eq!(
            hal.convert(&Type::tensor(ElementType::I32, &[2])),
            Some(Type::BufferView)
        );
    }

    #[test]
    fn empty_converter_rejects_everything() {
        assert_eq!(TypeConverter::new().convert(&Type::I32), None);
    }
}
