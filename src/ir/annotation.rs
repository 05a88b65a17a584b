//! The annotation model.
//!
//! Annotation sets hang off classes, fields, methods and method parameters.
//! Encoded values are the typed constants that appear both as annotation
//! elements and as static field initializers.

use crate::ir::entities::{FieldId, MethodId, StringId, TypeId};

/// A typed constant value.
#[derive(Clone, PartialEq, Debug)]
pub enum EncodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(StringId),
    Type(TypeId),
    Field(FieldId),
    Method(MethodId),
    /// An enum constant, referenced through its static field.
    Enum(FieldId),
    Array(Vec<EncodedValue>),
    Annotation(Box<Annotation>),
    Null,
}

/// Annotation retention, mirroring the on-disk visibility byte.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Visibility {
    Build,
    Runtime,
    System,
}

/// A single annotation: its type and an ordered list of named elements.
#[derive(Clone, PartialEq, Debug)]
pub struct Annotation {
    pub ty: TypeId,
    pub visibility: Visibility,
    pub elements: Vec<(StringId, EncodedValue)>,
}

impl Annotation {
    pub fn new(ty: TypeId, visibility: Visibility) -> Self {
        Self {
            ty,
            visibility,
            elements: Vec::new(),
        }
    }

    /// Look up an element value by name.
    pub fn element(&self, name: StringId) -> Option<&EncodedValue> {
        self.elements
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }
}

/// An ordered set of annotations.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct AnnotationSet {
    pub annotations: Vec<Annotation>,
}

impl AnnotationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// Find the annotation of the given type, if present.
    pub fn get(&self, ty: TypeId) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.ty == ty)
    }

    pub fn push(&mut self, anno: Annotation) {
        self.annotations.push(anno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::DexContext;

    #[test]
    fn lookup_by_type_and_name() {
        let ctx = DexContext::new();
        let anno_ty = ctx.get_or_make_type("Lcom/example/Anno;");
        let name = ctx.get_or_make_string("value");
        let mut anno = Annotation::new(anno_ty, Visibility::Runtime);
        anno.elements.push((name, EncodedValue::Int(42)));

        let mut set = AnnotationSet::new();
        set.push(anno);

        let found = set.get(anno_ty).expect("annotation present");
        assert_eq!(found.element(name), Some(&EncodedValue::Int(42)));
        assert_eq!(set.get(ctx.known().object), None);
    }
}
