//! Type descriptor utilities.
//!
//! Descriptors use the JVM syntax: `I` for int, `J` for long,
//! `Ljava/lang/String;` for classes, `[I` for arrays. The first byte of the
//! descriptor fully determines the primitive/reference/array split, so most
//! predicates here are single-byte checks.

use crate::ir::entities::TypeId;
use crate::ir::DexContext;

/// Returns true iff `descriptor` is a syntactically valid type descriptor.
pub fn is_valid_descriptor(descriptor: &str) -> bool {
    let bytes = descriptor.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    let mut i = 0;
    while i < bytes.len() && bytes[i] == b'[' {
        i += 1;
    }
    if i == bytes.len() {
        return false;
    }
    match bytes[i] {
        b'Z' | b'B' | b'S' | b'C' | b'I' | b'J' | b'F' | b'D' | b'V' => i + 1 == bytes.len(),
        b'L' => {
            // At least "LX;", terminated by a semicolon, no empty segments.
            if i + 3 > bytes.len() || bytes[bytes.len() - 1] != b';' {
                return false;
            }
            let body = &descriptor[i + 1..descriptor.len() - 1];
            !body.is_empty() && body.split('/').all(|seg| !seg.is_empty())
        }
        _ => false,
    }
}

impl DexContext {
    pub fn is_primitive(&self, ty: TypeId) -> bool {
        !matches!(self.type_shorty_byte(ty), b'L' | b'[')
    }

    /// True for long and double, which occupy a register pair.
    pub fn is_wide_type(&self, ty: TypeId) -> bool {
        matches!(self.type_shorty_byte(ty), b'J' | b'D')
    }

    pub fn is_array(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'['
    }

    pub fn is_object(&self, ty: TypeId) -> bool {
        matches!(self.type_shorty_byte(ty), b'L' | b'[')
    }

    pub fn is_integral(&self, ty: TypeId) -> bool {
        matches!(self.type_shorty_byte(ty), b'Z' | b'B' | b'S' | b'C' | b'I')
    }

    pub fn is_int(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'I'
    }

    pub fn is_char(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'C'
    }

    pub fn is_short(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'S'
    }

    pub fn is_boolean(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'Z'
    }

    pub fn is_byte(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'B'
    }

    pub fn is_long(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'J'
    }

    pub fn is_float(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'F'
    }

    pub fn is_double(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'D'
    }

    pub fn is_void(&self, ty: TypeId) -> bool {
        self.type_shorty_byte(ty) == b'V'
    }

    /// The shorty character of a type; arrays collapse to `L`.
    pub fn type_shorty(&self, ty: TypeId) -> char {
        match self.type_shorty_byte(ty) {
            b'[' => 'L',
            b => b as char,
        }
    }

    /// The component type of an array, one level deep: `[[I` -> `[I`.
    pub fn array_component(&self, ty: TypeId) -> Option<TypeId> {
        if !self.is_array(ty) {
            return None;
        }
        let desc = self.type_descriptor(ty);
        Some(self.get_or_make_type(&desc[1..]))
    }

    /// The ultimate element type of an array: `[[I` -> `I`.
    pub fn array_element(&self, ty: TypeId) -> Option<TypeId> {
        if !self.is_array(ty) {
            return None;
        }
        let desc = self.type_descriptor(ty);
        Some(self.get_or_make_type(desc.trim_start_matches('[')))
    }

    /// `ty` itself unless it is an array, in which case its element type.
    pub fn element_type_if_array(&self, ty: TypeId) -> TypeId {
        self.array_element(ty).unwrap_or(ty)
    }

    pub fn array_level(&self, ty: TypeId) -> u32 {
        let desc = self.type_descriptor(ty);
        desc.bytes().take_while(|&b| b == b'[').count() as u32
    }

    pub fn make_array_type(&self, ty: TypeId) -> TypeId {
        let desc = self.type_descriptor(ty);
        self.get_or_make_type(&format!("[{desc}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_validity() {
        assert!(is_valid_descriptor("I"));
        assert!(is_valid_descriptor("V"));
        assert!(is_valid_descriptor("[[J"));
        assert!(is_valid_descriptor("Ljava/lang/Object;"));
        assert!(is_valid_descriptor("[Ljava/lang/String;"));
        assert!(!is_valid_descriptor(""));
        assert!(!is_valid_descriptor("X"));
        assert!(!is_valid_descriptor("["));
        assert!(!is_valid_descriptor("II"));
        assert!(!is_valid_descriptor("L;"));
        assert!(!is_valid_descriptor("Ljava//lang;"));
        assert!(!is_valid_descriptor("Ljava/lang/Object"));
    }

    #[test]
    fn predicates() {
        let ctx = DexContext::new();
        let int = ctx.get_or_make_type("I");
        let long = ctx.get_or_make_type("J");
        let obj = ctx.known().object;
        let arr = ctx.get_or_make_type("[[I");
        assert!(ctx.is_primitive(int));
        assert!(ctx.is_wide_type(long));
        assert!(!ctx.is_wide_type(int));
        assert!(ctx.is_object(obj));
        assert!(ctx.is_object(arr) && ctx.is_array(arr));
        assert_eq!(ctx.type_shorty(arr), 'L');
    }

    #[test]
    fn array_helpers() {
        let ctx = DexContext::new();
        let arr2 = ctx.get_or_make_type("[[I");
        let arr1 = ctx.get_or_make_type("[I");
        let int = ctx.get_or_make_type("I");
        assert_eq!(ctx.array_component(arr2), Some(arr1));
        assert_eq!(ctx.array_element(arr2), Some(int));
        assert_eq!(ctx.array_level(arr2), 2);
        assert_eq!(ctx.make_array_type(arr1), arr2);
        assert_eq!(ctx.array_component(int), None);
        assert_eq!(ctx.element_type_if_array(int), int);
    }
}
