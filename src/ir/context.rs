//! The process-scoped interner.
//!
//! Types, strings, protos, field references and method references are
//! globally interned: two references denote the same entity iff their
//! handles are equal. The tables are append-only and internally
//! synchronized, so workers may create new interned entities mid-pass
//! without external locking.

use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::ir::entities::{FieldId, MethodId, ProtoId, StringId, TypeId};

/// A method signature: return type plus ordered parameter types.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProtoData {
    pub rtype: TypeId,
    pub args: Arc<[TypeId]>,
}

/// A field reference: declaring type, name, field type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FieldData {
    pub class: TypeId,
    pub name: StringId,
    pub ty: TypeId,
}

/// A method reference: declaring type, name, proto.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MethodData {
    pub class: TypeId,
    pub name: StringId,
    pub proto: ProtoId,
}

#[derive(Copy, Clone)]
pub(crate) struct TypeData {
    pub name: StringId,
    /// First byte of the descriptor, used by the type predicates without
    /// touching the string table.
    pub shorty: u8,
}

#[derive(Default)]
struct StringTable {
    map: FxHashMap<Arc<str>, StringId>,
    arena: Vec<Arc<str>>,
}

#[derive(Default)]
struct TypeTable {
    map: FxHashMap<StringId, TypeId>,
    arena: Vec<TypeData>,
}

#[derive(Default)]
struct ProtoTable {
    map: FxHashMap<ProtoData, ProtoId>,
    arena: Vec<ProtoData>,
}

#[derive(Default)]
struct FieldTable {
    map: FxHashMap<FieldData, FieldId>,
    arena: Vec<FieldData>,
}

#[derive(Default)]
struct MethodTable {
    map: FxHashMap<MethodData, MethodId>,
    arena: Vec<MethodData>,
}

/// Frequently used types and members, interned once at context creation.
pub struct WellKnown {
    pub object: TypeId,
    pub class: TypeId,
    pub string: TypeId,
    pub string_builder: TypeId,
    pub throwable: TypeId,
    pub runtime_exception: TypeId,
    pub boolean_class: TypeId,
    pub enum_class: TypeId,

    pub sb_init: MethodId,
    pub sb_init_string: MethodId,
    pub sb_append_string: MethodId,
    pub sb_append_char: MethodId,
    pub sb_append_int: MethodId,
    pub sb_append_boolean: MethodId,
    pub sb_append_long: MethodId,
    pub string_length: MethodId,
    pub string_equals: MethodId,
    pub string_valueof_boolean: MethodId,
    pub string_valueof_char: MethodId,
    pub string_valueof_int: MethodId,
    pub class_get_simple_name: MethodId,
    pub boolean_valueof: MethodId,
    pub boolean_booleanvalue: MethodId,
    pub enum_equals: MethodId,
    pub runtime_exception_init: MethodId,

    pub boolean_true: FieldId,
    pub boolean_false: FieldId,
}

/// The interner. One per process; shared by reference between all workers.
pub struct DexContext {
    strings: RwLock<StringTable>,
    types: RwLock<TypeTable>,
    protos: RwLock<ProtoTable>,
    fields: RwLock<FieldTable>,
    methods: RwLock<MethodTable>,
    known: OnceLock<WellKnown>,
}

impl DexContext {
    pub fn new() -> Self {
        let ctx = Self {
            strings: RwLock::new(StringTable::default()),
            types: RwLock::new(TypeTable::default()),
            protos: RwLock::new(ProtoTable::default()),
            fields: RwLock::new(FieldTable::default()),
            methods: RwLock::new(MethodTable::default()),
            known: OnceLock::new(),
        };
        // Warm the cache so handle comparisons against well-known entities
        // never race with interning.
        let _ = ctx.known();
        ctx
    }

    /// The well-known entity cache.
    pub fn known(&self) -> &WellKnown {
        self.known.get_or_init(|| self.intern_well_known())
    }

    // ---------------- strings ----------------

    pub fn get_or_make_string(&self, s: &str) -> StringId {
        if let Some(id) = self.get_string(s) {
            return id;
        }
        let mut table = self.strings.write();
        if let Some(&id) = table.map.get(s) {
            return id;
        }
        let id = StringId::from_u32(table.arena.len() as u32);
        let arc: Arc<str> = Arc::from(s);
        table.arena.push(arc.clone());
        table.map.insert(arc, id);
        id
    }

    pub fn get_string(&self, s: &str) -> Option<StringId> {
        self.strings.read().map.get(s).copied()
    }

    pub fn string(&self, id: StringId) -> Arc<str> {
        self.strings.read().arena[id.as_u32() as usize].clone()
    }

    // ---------------- types ----------------

    pub fn get_or_make_type(&self, descriptor: &str) -> TypeId {
        debug_assert!(
            crate::ir::types::is_valid_descriptor(descriptor),
            "invalid type descriptor: {descriptor:?}"
        );
        let name = self.get_or_make_string(descriptor);
        let shorty = descriptor.as_bytes()[0];
        let mut table = self.types.write();
        if let Some(&id) = table.map.get(&name) {
            return id;
        }
        let id = TypeId::from_u32(table.arena.len() as u32);
        table.arena.push(TypeData { name, shorty });
        table.map.insert(name, id);
        id
    }

    pub fn get_type(&self, descriptor: &str) -> Option<TypeId> {
        let name = self.get_string(descriptor)?;
        self.types.read().map.get(&name).copied()
    }

    pub fn type_name(&self, ty: TypeId) -> StringId {
        self.types.read().arena[ty.as_u32() as usize].name
    }

    pub fn type_descriptor(&self, ty: TypeId) -> Arc<str> {
        self.string(self.type_name(ty))
    }

    pub(crate) fn type_shorty_byte(&self, ty: TypeId) -> u8 {
        self.types.read().arena[ty.as_u32() as usize].shorty
    }

    // ---------------- protos ----------------

    pub fn get_or_make_proto(&self, rtype: TypeId, args: &[TypeId]) -> ProtoId {
        let key = ProtoData {
            rtype,
            args: Arc::from(args),
        };
        let mut table = self.protos.write();
        if let Some(&id) = table.map.get(&key) {
            return id;
        }
        let id = ProtoId::from_u32(table.arena.len() as u32);
        table.arena.push(key.clone());
        table.map.insert(key, id);
        id
    }

    pub fn get_proto(&self, rtype: TypeId, args: &[TypeId]) -> Option<ProtoId> {
        let key = ProtoData {
            rtype,
            args: Arc::from(args),
        };
        self.protos.read().map.get(&key).copied()
    }

    pub fn proto(&self, id: ProtoId) -> ProtoData {
        self.protos.read().arena[id.as_u32() as usize].clone()
    }

    // ---------------- field references ----------------

    pub fn get_or_make_field(&self, class: TypeId, name: StringId, ty: TypeId) -> FieldId {
        let key = FieldData { class, name, ty };
        let mut table = self.fields.write();
        if let Some(&id) = table.map.get(&key) {
            return id;
        }
        let id = FieldId::from_u32(table.arena.len() as u32);
        table.arena.push(key);
        table.map.insert(key, id);
        id
    }

    pub fn get_field(&self, class: TypeId, name: StringId, ty: TypeId) -> Option<FieldId> {
        self.fields
            .read()
            .map
            .get(&FieldData { class, name, ty })
            .copied()
    }

    pub fn field(&self, id: FieldId) -> FieldData {
        self.fields.read().arena[id.as_u32() as usize]
    }

    // ---------------- method references ----------------

    pub fn get_or_make_method(&self, class: TypeId, name: StringId, proto: ProtoId) -> MethodId {
        let key = MethodData { class, name, proto };
        let mut table = self.methods.write();
        if let Some(&id) = table.map.get(&key) {
            return id;
        }
        let id = MethodId::from_u32(table.arena.len() as u32);
        table.arena.push(key);
        table.map.insert(key, id);
        id
    }

    pub fn get_method(&self, class: TypeId, name: StringId, proto: ProtoId) -> Option<MethodId> {
        self.methods
            .read()
            .map
            .get(&MethodData { class, name, proto })
            .copied()
    }

    pub fn method(&self, id: MethodId) -> MethodData {
        self.methods.read().arena[id.as_u32() as usize]
    }

    /// Convenience constructor for a method reference from descriptors,
    /// e.g. `make_method("Ljava/lang/String;", "length", &[], "I")`.
    pub fn make_method(
        &self,
        class: &str,
        name: &str,
        args: &[&str],
        rtype: &str,
    ) -> MethodId {
        let class = self.get_or_make_type(class);
        let name = self.get_or_make_string(name);
        let args: Vec<TypeId> = args.iter().map(|a| self.get_or_make_type(a)).collect();
        let rtype = self.get_or_make_type(rtype);
        let proto = self.get_or_make_proto(rtype, &args);
        self.get_or_make_method(class, name, proto)
    }

    /// Convenience constructor for a field reference from descriptors.
    pub fn make_field(&self, class: &str, name: &str, ty: &str) -> FieldId {
        let class = self.get_or_make_type(class);
        let name = self.get_or_make_string(name);
        let ty = self.get_or_make_type(ty);
        self.get_or_make_field(class, name, ty)
    }

    fn intern_well_known(&self) -> WellKnown {
        let object = self.get_or_make_type("Ljava/lang/Object;");
        let class = self.get_or_make_type("Ljava/lang/Class;");
        let string = self.get_or_make_type("Ljava/lang/String;");
        let string_builder = self.get_or_make_type("Ljava/lang/StringBuilder;");
        let throwable = self.get_or_make_type("Ljava/lang/Throwable;");
        let runtime_exception = self.get_or_make_type("Ljava/lang/RuntimeException;");
        let boolean_class = self.get_or_make_type("Ljava/lang/Boolean;");
        let enum_class = self.get_or_make_type("Ljava/lang/Enum;");

        let sb = "Ljava/lang/StringBuilder;";
        let s = "Ljava/lang/String;";
        WellKnown {
            object,
            class,
            string,
            string_builder,
            throwable,
            runtime_exception,
            boolean_class,
            enum_class,

            sb_init: self.make_method(sb, "<init>", &[], "V"),
            sb_init_string: self.make_method(sb, "<init>", &[s], "V"),
            sb_append_string: self.make_method(sb, "append", &[s], sb),
            sb_append_char: self.make_method(sb, "append", &["C"], sb),
            sb_append_int: self.make_method(sb, "append", &["I"], sb),
            sb_append_boolean: self.make_method(sb, "append", &["Z"], sb),
            sb_append_long: self.make_method(sb, "append", &["J"], sb),
            string_length: self.make_method(s, "length", &[], "I"),
            string_equals: self.make_method(s, "equals", &["Ljava/lang/Object;"], "Z"),
            string_valueof_boolean: self.make_method(s, "valueOf", &["Z"], s),
            string_valueof_char: self.make_method(s, "valueOf", &["C"], s),
            string_valueof_int: self.make_method(s, "valueOf", &["I"], s),
            class_get_simple_name: self.make_method(
                "Ljava/lang/Class;",
                "getSimpleName",
                &[],
                s,
            ),
            boolean_valueof: self.make_method(
                "Ljava/lang/Boolean;",
                "valueOf",
                &["Z"],
                "Ljava/lang/Boolean;",
            ),
            boolean_booleanvalue: self.make_method(
                "Ljava/lang/Boolean;",
                "booleanValue",
                &[],
                "Z",
            ),
            enum_equals: self.make_method(
                "Ljava/lang/Enum;",
                "equals",
                &["Ljava/lang/Object;"],
                "Z",
            ),
            runtime_exception_init: self.make_method(
                "Ljava/lang/RuntimeException;",
                "<init>",
                &[],
                "V",
            ),

            boolean_true: self.make_field(
                "Ljava/lang/Boolean;",
                "TRUE",
                "Ljava/lang/Boolean;",
            ),
            boolean_false: self.make_field(
                "Ljava/lang/Boolean;",
                "FALSE",
                "Ljava/lang/Boolean;",
            ),
        }
    }
}

impl Default for DexContext {
    fn default() -> Self {
        Self::new()
    }
}
