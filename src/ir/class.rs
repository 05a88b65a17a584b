//! Class, field and method definitions, and the pass scope.
//!
//! A [`Scope`] is the ordered list of classes a pass operates on. Classes
//! are *internal* (bodies owned by this process, mutable) or *external*
//! (signature only). Method bodies sit behind a mutex: during a pass each
//! worker exclusively owns the bodies it is processing, while signature
//! reads stay lock-free. Adding or removing classes and methods during a
//! pass is forbidden; such changes are batched between passes.

use cranelift_entity::PrimaryMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::ir::annotation::AnnotationSet;
use crate::ir::code::IrCode;
use crate::ir::entities::{ClassId, FieldId, MethodId, ProtoId, StringId, TypeId};
use crate::ir::{DexContext, EncodedValue};

/// Class/member access flags, using the dex encoding.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const PUBLIC: Self = Self(0x1);
    pub const PRIVATE: Self = Self(0x2);
    pub const PROTECTED: Self = Self(0x4);
    pub const STATIC: Self = Self(0x8);
    pub const FINAL: Self = Self(0x10);
    pub const SYNCHRONIZED: Self = Self(0x20);
    pub const VOLATILE: Self = Self(0x40);
    pub const TRANSIENT: Self = Self(0x80);
    pub const NATIVE: Self = Self(0x100);
    pub const INTERFACE: Self = Self(0x200);
    pub const ABSTRACT: Self = Self(0x400);
    pub const SYNTHETIC: Self = Self(0x1000);
    pub const ANNOTATION: Self = Self(0x2000);
    pub const ENUM: Self = Self(0x4000);
    pub const CONSTRUCTOR: Self = Self(0x10000);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_public(self) -> bool {
        self.contains(Self::PUBLIC)
    }

    pub fn is_private(self) -> bool {
        self.contains(Self::PRIVATE)
    }

    pub fn is_static(self) -> bool {
        self.contains(Self::STATIC)
    }

    pub fn is_final(self) -> bool {
        self.contains(Self::FINAL)
    }

    pub fn is_volatile(self) -> bool {
        self.contains(Self::VOLATILE)
    }

    pub fn is_interface(self) -> bool {
        self.contains(Self::INTERFACE)
    }

    pub fn is_abstract(self) -> bool {
        self.contains(Self::ABSTRACT)
    }

    pub fn is_native(self) -> bool {
        self.contains(Self::NATIVE)
    }

    pub fn is_enum(self) -> bool {
        self.contains(Self::ENUM)
    }

    pub fn is_constructor(self) -> bool {
        self.contains(Self::CONSTRUCTOR)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// A field definition.
pub struct FieldDef {
    field: FieldId,
    access: AccessFlags,
    anno: Option<AnnotationSet>,
    /// Encoded constant value; static fields only.
    value: Option<EncodedValue>,
}

impl FieldDef {
    pub fn new(field: FieldId, access: AccessFlags) -> Self {
        Self {
            field,
            access,
            anno: None,
            value: None,
        }
    }

    pub fn with_value(mut self, value: EncodedValue) -> Self {
        assert!(
            self.access.is_static(),
            "encoded constants are for static fields only"
        );
        self.value = Some(value);
        self
    }

    pub fn with_annotations(mut self, anno: AnnotationSet) -> Self {
        self.anno = Some(anno);
        self
    }

    pub fn field(&self) -> FieldId {
        self.field
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn annotations(&self) -> Option<&AnnotationSet> {
        self.anno.as_ref()
    }

    pub fn value(&self) -> Option<&EncodedValue> {
        self.value.as_ref()
    }
}

/// A method definition. The body is absent for abstract and native
/// methods; such methods are skipped by every transformation.
pub struct MethodDef {
    method: MethodId,
    access: AccessFlags,
    anno: Option<AnnotationSet>,
    param_annos: FxHashMap<u32, AnnotationSet>,
    code: Mutex<Option<IrCode>>,
}

impl MethodDef {
    pub fn new(method: MethodId, access: AccessFlags) -> Self {
        Self {
            method,
            access,
            anno: None,
            param_annos: FxHashMap::default(),
            code: Mutex::new(None),
        }
    }

    pub fn with_code_body(mut self, code: IrCode) -> Self {
        self.code = Mutex::new(Some(code));
        self
    }

    pub fn with_annotations(mut self, anno: AnnotationSet) -> Self {
        self.anno = Some(anno);
        self
    }

    pub fn with_param_annotations(mut self, param: u32, anno: AnnotationSet) -> Self {
        self.param_annos.insert(param, anno);
        self
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn is_static(&self) -> bool {
        self.access.is_static()
    }

    pub fn annotations(&self) -> Option<&AnnotationSet> {
        self.anno.as_ref()
    }

    pub fn param_annotations(&self, param: u32) -> Option<&AnnotationSet> {
        self.param_annos.get(&param)
    }

    pub fn has_code(&self) -> bool {
        self.code.lock().is_some()
    }

    /// Run `f` with exclusive access to the body. Returns `None` for
    /// bodyless (abstract/native) methods.
    ///
    /// The lock scope is the worker-exclusivity contract: no other worker
    /// may observe the body while `f` runs.
    pub fn with_code<R>(&self, f: impl FnOnce(&mut IrCode) -> R) -> Option<R> {
        let mut guard = self.code.lock();
        guard.as_mut().map(f)
    }
}

/// A class definition.
pub struct DexClass {
    ty: TypeId,
    /// Absent only for the root object type.
    super_ty: Option<TypeId>,
    interfaces: Vec<TypeId>,
    access: AccessFlags,
    anno: Option<AnnotationSet>,
    sfields: Vec<FieldDef>,
    ifields: Vec<FieldDef>,
    dmethods: Vec<MethodDef>,
    vmethods: Vec<MethodDef>,
    external: bool,
}

impl DexClass {
    pub fn new(ty: TypeId, super_ty: Option<TypeId>, access: AccessFlags) -> Self {
        Self {
            ty,
            super_ty,
            interfaces: Vec::new(),
            access,
            anno: None,
            sfields: Vec::new(),
            ifields: Vec::new(),
            dmethods: Vec::new(),
            vmethods: Vec::new(),
            external: false,
        }
    }

    /// Mark this class as external: only its signature is known and its
    /// members must not be mutated.
    pub fn set_external(&mut self) {
        self.external = true;
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn super_class(&self) -> Option<TypeId> {
        self.super_ty
    }

    pub fn interfaces(&self) -> &[TypeId] {
        &self.interfaces
    }

    pub fn add_interface(&mut self, intf: TypeId) {
        self.interfaces.push(intf);
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn is_interface(&self) -> bool {
        self.access.is_interface()
    }

    pub fn annotations(&self) -> Option<&AnnotationSet> {
        self.anno.as_ref()
    }

    pub fn set_annotations(&mut self, anno: AnnotationSet) {
        self.anno = Some(anno);
    }

    pub fn sfields(&self) -> &[FieldDef] {
        &self.sfields
    }

    pub fn ifields(&self) -> &[FieldDef] {
        &self.ifields
    }

    pub fn add_field(&mut self, def: FieldDef) {
        if def.access().is_static() {
            self.sfields.push(def);
        } else {
            self.ifields.push(def);
        }
    }

    /// Direct methods: private, static, or constructors.
    pub fn dmethods(&self) -> &[MethodDef] {
        &self.dmethods
    }

    pub fn vmethods(&self) -> &[MethodDef] {
        &self.vmethods
    }

    pub fn add_method(&mut self, ctx: &DexContext, def: MethodDef) {
        let name = ctx.method(def.method()).name;
        let direct = def.access().is_static()
            || def.access().is_private()
            || def.access().is_constructor()
            || is_init_name(ctx, name);
        if direct {
            self.dmethods.push(def);
        } else {
            self.vmethods.push(def);
        }
    }

    pub fn all_methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.dmethods.iter().chain(self.vmethods.iter())
    }

    pub fn all_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.sfields.iter().chain(self.ifields.iter())
    }

    /// Find a direct method with the given name and proto.
    pub fn find_dmethod(
        &self,
        ctx: &DexContext,
        name: StringId,
        proto: ProtoId,
    ) -> Option<&MethodDef> {
        self.dmethods.iter().find(|m| {
            let data = ctx.method(m.method());
            data.name == name && data.proto == proto
        })
    }

    /// Find a virtual method with the given name and proto.
    pub fn find_vmethod(
        &self,
        ctx: &DexContext,
        name: StringId,
        proto: ProtoId,
    ) -> Option<&MethodDef> {
        self.vmethods.iter().find(|m| {
            let data = ctx.method(m.method());
            data.name == name && data.proto == proto
        })
    }

    /// Find a field definition with the given name and type in either
    /// field list.
    pub fn find_field(
        &self,
        ctx: &DexContext,
        name: StringId,
        ty: TypeId,
    ) -> Option<&FieldDef> {
        self.all_fields().find(|f| {
            let data = ctx.field(f.field());
            data.name == name && data.ty == ty
        })
    }
}

fn is_init_name(ctx: &DexContext, name: StringId) -> bool {
    let s = ctx.string(name);
    &*s == "<init>" || &*s == "<clinit>"
}

/// An ordered sequence of classes processed by a pass.
pub struct Scope {
    classes: PrimaryMap<ClassId, DexClass>,
    by_type: FxHashMap<TypeId, ClassId>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            classes: PrimaryMap::new(),
            by_type: FxHashMap::default(),
        }
    }

    pub fn add_class(&mut self, class: DexClass) -> ClassId {
        let ty = class.ty();
        let id = self.classes.push(class);
        let prev = self.by_type.insert(ty, id);
        assert!(prev.is_none(), "duplicate class definition for {ty}");
        id
    }

    /// Look up the class defining `ty`, if it is in scope.
    pub fn class(&self, ty: TypeId) -> Option<&DexClass> {
        self.by_type.get(&ty).map(|&id| &self.classes[id])
    }

    pub fn class_by_id(&self, id: ClassId) -> &DexClass {
        &self.classes[id]
    }

    pub fn classes(&self) -> impl Iterator<Item = &DexClass> {
        self.classes.values()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.len() == 0
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}
