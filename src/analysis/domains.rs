//! The abstract domains.
//!
//! Every domain here is a complete lattice of finite height with the
//! operations of [`AbstractDomain`]. The register-level domains are small
//! enums; the environments map registers to them with an implicit default
//! of top for unmentioned registers.

use rustc_hash::FxHashMap;

use crate::analysis::fixpoint::AbstractDomain;
use crate::ir::entities::{FieldId, InsnUid, TypeId};
use crate::ir::insn::Reg;

// ---------------------------------------------------------------- signed

/// A sign interval over the non-constant integers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SignInterval {
    Ltz,
    Lez,
    Gez,
    Gtz,
    Nez,
}

/// Sign-set representation: (may be negative, may be zero, may be
/// positive). Used to compute joins and meets.
type Signs = (bool, bool, bool);

/// The signed-constant domain: bottom, a single 64-bit value, a sign
/// interval, or top.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SignedConstantDomain {
    Bottom,
    Constant(i64),
    Interval(SignInterval),
    Top,
}

use SignedConstantDomain as Scd;

impl SignInterval {
    fn signs(self) -> Signs {
        match self {
            SignInterval::Ltz => (true, false, false),
            SignInterval::Lez => (true, true, false),
            SignInterval::Gez => (false, true, true),
            SignInterval::Gtz => (false, false, true),
            SignInterval::Nez => (true, false, true),
        }
    }

    pub fn contains(self, value: i64) -> bool {
        let (neg, zero, pos) = self.signs();
        if value < 0 {
            neg
        } else if value == 0 {
            zero
        } else {
            pos
        }
    }
}

impl Scd {
    fn signs(self) -> Signs {
        match self {
            Scd::Bottom => (false, false, false),
            Scd::Constant(c) => (c < 0, c == 0, c > 0),
            Scd::Interval(i) => i.signs(),
            Scd::Top => (true, true, true),
        }
    }

    /// The least element covering exactly the given sign set. A pure-zero
    /// set is the constant 0; single-sign sets stay intervals.
    fn from_signs(signs: Signs) -> Self {
        match signs {
            (false, false, false) => Scd::Bottom,
            (false, true, false) => Scd::Constant(0),
            (true, false, false) => Scd::Interval(SignInterval::Ltz),
            (false, false, true) => Scd::Interval(SignInterval::Gtz),
            (true, true, false) => Scd::Interval(SignInterval::Lez),
            (false, true, true) => Scd::Interval(SignInterval::Gez),
            (true, false, true) => Scd::Interval(SignInterval::Nez),
            (true, true, true) => Scd::Top,
        }
    }

    pub fn constant(self) -> Option<i64> {
        match self {
            Scd::Constant(c) => Some(c),
            _ => None,
        }
    }
}

impl AbstractDomain for Scd {
    fn bottom() -> Self {
        Scd::Bottom
    }

    fn top() -> Self {
        Scd::Top
    }

    fn is_bottom(&self) -> bool {
        *self == Scd::Bottom
    }

    fn is_top(&self) -> bool {
        *self == Scd::Top
    }

    fn leq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Scd::Bottom, _) => true,
            (_, Scd::Top) => true,
            (Scd::Constant(a), Scd::Constant(b)) => a == b,
            (Scd::Constant(c), Scd::Interval(i)) => i.contains(c),
            (Scd::Interval(a), Scd::Interval(b)) => {
                let (an, az, ap) = a.signs();
                let (bn, bz, bp) = b.signs();
                (!an || bn) && (!az || bz) && (!ap || bp)
            }
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        if self.leq(other) {
            *self = *other;
        } else if !other.leq(self) {
            *self = Self::from_signs(union(self.signs(), other.signs()));
        }
    }

    fn meet_with(&mut self, other: &Self) {
        if other.leq(self) {
            *self = *other;
        } else if !self.leq(other) {
            // Comparable pairs are handled above; what remains is two
            // incomparable intervals, or a constant against something that
            // excludes it.
            *self = match (*self, *other) {
                (Scd::Interval(a), Scd::Interval(b)) => {
                    Self::from_signs(intersect(a.signs(), b.signs()))
                }
                _ => Scd::Bottom,
            };
        }
    }
}

fn union(a: Signs, b: Signs) -> Signs {
    (a.0 || b.0, a.1 || b.1, a.2 || b.2)
}

fn intersect(a: Signs, b: Signs) -> Signs {
    (a.0 && b.0, a.1 && b.1, a.2 && b.2)
}

/// A binary operation evaluated over the signed-constant domain.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ScdBinop {
    Add,
    /// `rhs - lhs`, matching the reversed-subtract literal form.
    Rsub,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

impl Scd {
    /// Apply a binary operation, returning the narrowest representable
    /// result. `wide` selects 64-bit semantics; otherwise results are
    /// truncated to 32 bits. Division or remainder by a known zero is
    /// bottom.
    pub fn apply_binop(op: ScdBinop, lhs: Scd, rhs: Scd, wide: bool) -> Scd {
        if lhs.is_bottom() || rhs.is_bottom() {
            return Scd::Bottom;
        }
        if matches!(op, ScdBinop::Div | ScdBinop::Rem) && rhs == Scd::Constant(0) {
            return Scd::Bottom;
        }
        if let (Some(a), Some(b)) = (lhs.constant(), rhs.constant()) {
            let shift_mask = if wide { 0x3f } else { 0x1f };
            let value = match op {
                ScdBinop::Add => a.wrapping_add(b),
                ScdBinop::Rsub => b.wrapping_sub(a),
                ScdBinop::Sub => a.wrapping_sub(b),
                ScdBinop::Mul => a.wrapping_mul(b),
                ScdBinop::Div => a.wrapping_div(b),
                ScdBinop::Rem => a.wrapping_rem(b),
                ScdBinop::And => a & b,
                ScdBinop::Or => a | b,
                ScdBinop::Xor => a ^ b,
                ScdBinop::Shl => {
                    if wide {
                        a.wrapping_shl((b & shift_mask) as u32)
                    } else {
                        ((a as i32).wrapping_shl((b & shift_mask) as u32)) as i64
                    }
                }
                ScdBinop::Shr => {
                    if wide {
                        a.wrapping_shr((b & shift_mask) as u32)
                    } else {
                        ((a as i32).wrapping_shr((b & shift_mask) as u32)) as i64
                    }
                }
                ScdBinop::Ushr => {
                    if wide {
                        ((a as u64).wrapping_shr((b & shift_mask) as u32)) as i64
                    } else {
                        ((a as u32).wrapping_shr((b & shift_mask) as u32)) as i64
                    }
                }
            };
            let value = if wide { value } else { value as i32 as i64 };
            return Scd::Constant(value);
        }
        // Sign arithmetic for the few cases where it is exact.
        let (ln, lz, lp) = lhs.signs();
        let (rn, rz, rp) = rhs.signs();
        match op {
            ScdBinop::Add => {
                // Both sides non-negative, or both non-positive.
                if !ln && !rn {
                    if !lz || !rz {
                        // At least one side strictly positive.
                        if (!lz && !ln) || (!rz && !rn) {
                            return Scd::Interval(SignInterval::Gtz);
                        }
                    }
                    return Scd::Interval(SignInterval::Gez);
                }
                if !lp && !rp {
                    if (!lz && !lp) || (!rz && !rp) {
                        return Scd::Interval(SignInterval::Ltz);
                    }
                    return Scd::Interval(SignInterval::Lez);
                }
                Scd::Top
            }
            ScdBinop::Mul => {
                // Sign-definite operands.
                let l_pos = !ln && !lz && lp;
                let l_neg = ln && !lz && !lp;
                let r_pos = !rn && !rz && rp;
                let r_neg = rn && !rz && !rp;
                if (l_pos && r_pos) || (l_neg && r_neg) {
                    Scd::Interval(SignInterval::Gtz)
                } else if (l_pos && r_neg) || (l_neg && r_pos) {
                    Scd::Interval(SignInterval::Ltz)
                } else {
                    Scd::Top
                }
            }
            _ => Scd::Top,
        }
    }
}

// ---------------------------------------------------------------- nullness

/// Nullness of a reference value.
///
/// ```text
///         TOP (nullable)
///        /      \
///    IS_NULL   NOT_NULL
///        \      /
///     UNINITIALIZED
///           |
///         BOTTOM
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Nullness {
    Bottom,
    /// The elements of a newly allocated array: neither null nor not-null
    /// yet.
    Uninitialized,
    IsNull,
    NotNull,
    Top,
}

impl Nullness {
    fn height(self) -> u8 {
        match self {
            Nullness::Bottom => 0,
            Nullness::Uninitialized => 1,
            Nullness::IsNull | Nullness::NotNull => 2,
            Nullness::Top => 3,
        }
    }
}

impl AbstractDomain for Nullness {
    fn bottom() -> Self {
        Nullness::Bottom
    }

    fn top() -> Self {
        Nullness::Top
    }

    fn is_bottom(&self) -> bool {
        *self == Nullness::Bottom
    }

    fn is_top(&self) -> bool {
        *self == Nullness::Top
    }

    fn leq(&self, other: &Self) -> bool {
        *self == *other || self.height() < other.height()
    }

    fn join_with(&mut self, other: &Self) {
        if self.leq(other) {
            *self = *other;
        } else if !other.leq(self) {
            // The only incomparable pair is {IS_NULL, NOT_NULL}.
            *self = Nullness::Top;
        }
    }

    fn meet_with(&mut self, other: &Self) {
        if other.leq(self) {
            *self = *other;
        } else if !self.leq(other) {
            *self = Nullness::Uninitialized;
        }
    }
}

// ---------------------------------------------------------------- singleton

/// The constant-abstract-domain of field references: tracks values known
/// to be a specific singleton object (an enum constant, `Boolean.TRUE`).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SingletonObjectDomain {
    Bottom,
    Value(FieldId),
    Top,
}

impl AbstractDomain for SingletonObjectDomain {
    fn bottom() -> Self {
        SingletonObjectDomain::Bottom
    }

    fn top() -> Self {
        SingletonObjectDomain::Top
    }

    fn is_bottom(&self) -> bool {
        *self == SingletonObjectDomain::Bottom
    }

    fn is_top(&self) -> bool {
        *self == SingletonObjectDomain::Top
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (SingletonObjectDomain::Bottom, _) => true,
            (_, SingletonObjectDomain::Top) => true,
            (SingletonObjectDomain::Value(a), SingletonObjectDomain::Value(b)) => a == b,
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        if self.leq(other) {
            *self = *other;
        } else if !other.leq(self) {
            *self = SingletonObjectDomain::Top;
        }
    }

    fn meet_with(&mut self, other: &Self) {
        if other.leq(self) {
            *self = *other;
        } else if !self.leq(other) {
            *self = SingletonObjectDomain::Bottom;
        }
    }
}

// ---------------------------------------------------------------- arrays

/// Per-array value vector, bounded by the allocation length.
#[derive(Clone, PartialEq, Debug)]
pub enum ConstantArrayDomain {
    Bottom,
    Values(Vec<SignedConstantDomain>),
    Top,
}

impl ConstantArrayDomain {
    pub fn new(length: i64) -> Self {
        if length < 0 {
            // Negative allocation throws; no array to track.
            return ConstantArrayDomain::Bottom;
        }
        // Fresh arrays are zero-initialized.
        ConstantArrayDomain::Values(vec![Scd::Constant(0); length as usize])
    }

    /// The tracked value at `index`. Out-of-bounds accesses throw at
    /// runtime, so they are bottom here.
    pub fn get(&self, index: i64) -> SignedConstantDomain {
        match self {
            ConstantArrayDomain::Bottom => Scd::Bottom,
            ConstantArrayDomain::Top => Scd::Top,
            ConstantArrayDomain::Values(values) => {
                if index < 0 || index as usize >= values.len() {
                    Scd::Bottom
                } else {
                    values[index as usize]
                }
            }
        }
    }

    pub fn set(&mut self, index: i64, value: SignedConstantDomain) {
        if let ConstantArrayDomain::Values(values) = self {
            if index >= 0 && (index as usize) < values.len() {
                values[index as usize] = value;
            }
        }
    }
}

impl AbstractDomain for ConstantArrayDomain {
    fn bottom() -> Self {
        ConstantArrayDomain::Bottom
    }

    fn top() -> Self {
        ConstantArrayDomain::Top
    }

    fn is_bottom(&self) -> bool {
        *self == ConstantArrayDomain::Bottom
    }

    fn is_top(&self) -> bool {
        *self == ConstantArrayDomain::Top
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstantArrayDomain::Bottom, _) => true,
            (_, ConstantArrayDomain::Top) => true,
            (ConstantArrayDomain::Values(a), ConstantArrayDomain::Values(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.leq(y))
            }
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        match (&mut *self, other) {
            (ConstantArrayDomain::Bottom, _) => *self = other.clone(),
            (_, ConstantArrayDomain::Bottom) => {}
            (ConstantArrayDomain::Top, _) | (_, ConstantArrayDomain::Top) => {
                *self = ConstantArrayDomain::Top
            }
            (ConstantArrayDomain::Values(a), ConstantArrayDomain::Values(b)) => {
                if a.len() != b.len() {
                    *self = ConstantArrayDomain::Top;
                } else {
                    for (x, y) in a.iter_mut().zip(b) {
                        x.join_with(y);
                    }
                }
            }
        }
    }

    fn meet_with(&mut self, other: &Self) {
        match (&mut *self, other) {
            (ConstantArrayDomain::Top, _) => *self = other.clone(),
            (_, ConstantArrayDomain::Top) => {}
            (ConstantArrayDomain::Bottom, _) | (_, ConstantArrayDomain::Bottom) => {
                *self = ConstantArrayDomain::Bottom
            }
            (ConstantArrayDomain::Values(a), ConstantArrayDomain::Values(b)) => {
                if a.len() != b.len() {
                    *self = ConstantArrayDomain::Bottom;
                } else {
                    for (x, y) in a.iter_mut().zip(b) {
                        x.meet_with(y);
                    }
                }
            }
        }
    }
}

/// An abstract pointer to a tracked array: the identity of the allocating
/// instruction.
pub type HeapPointer = InsnUid;

/// The abstract heap: tracked arrays by pointer. A pointer missing from
/// the map is top (escaped or unknown).
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ConstantHeap {
    arrays: FxHashMap<HeapPointer, ConstantArrayDomain>,
}

impl ConstantHeap {
    pub fn get(&self, ptr: HeapPointer) -> ConstantArrayDomain {
        self.arrays
            .get(&ptr)
            .cloned()
            .unwrap_or(ConstantArrayDomain::Top)
    }

    pub fn set(&mut self, ptr: HeapPointer, value: ConstantArrayDomain) {
        if value.is_top() {
            self.arrays.remove(&ptr);
        } else {
            self.arrays.insert(ptr, value);
        }
    }

    /// Widen the pointed-to slot to top: the array escaped.
    pub fn escape(&mut self, ptr: HeapPointer) {
        self.arrays.remove(&ptr);
    }

    pub fn join_with(&mut self, other: &Self) {
        self.arrays.retain(|ptr, value| {
            match other.arrays.get(ptr) {
                Some(other_value) => {
                    value.join_with(other_value);
                    !value.is_top()
                }
                // Top on the other side.
                None => false,
            }
        });
    }

    pub fn leq(&self, other: &Self) -> bool {
        other
            .arrays
            .iter()
            .all(|(ptr, value)| self.get(*ptr).leq(value))
    }
}

// ---------------------------------------------------------------- ir types

/// The register type lattice used by type inference.
///
/// `Zero` is the null/zero constant, compatible with both references and
/// numbers; `Const*` are numeric constants whose int/float (or long/double)
/// interpretation is not yet fixed; wide values are tracked as separate
/// first/second halves; `Scalar*` are the give-up points of the numeric
/// sub-lattices.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum IrType {
    Bottom = 0,
    Zero = 1,
    Const = 2,
    Const1 = 3,
    Const2 = 4,
    Reference = 5,
    Int = 6,
    Float = 7,
    Long1 = 8,
    Long2 = 9,
    Double1 = 10,
    Double2 = 11,
    Scalar = 12,
    Scalar1 = 13,
    Scalar2 = 14,
    Top = 15,
}

/// Principal up-sets (ancestors including self) as bitmasks, indexed by
/// discriminant. `join(a, b)` is the unique element whose up-set is the
/// intersection of the operands' up-sets.
const IR_UP: [u16; 16] = {
    const fn bit(i: u8) -> u16 {
        1 << i
    }
    let top = bit(15);
    let scalar = bit(12) | top;
    let scalar1 = bit(13) | top;
    let scalar2 = bit(14) | top;
    let reference = bit(5) | top;
    let int = bit(6) | scalar;
    let float = bit(7) | scalar;
    let long1 = bit(8) | scalar1;
    let long2 = bit(9) | scalar2;
    let double1 = bit(10) | scalar1;
    let double2 = bit(11) | scalar2;
    let konst = bit(2) | int | float;
    let konst1 = bit(3) | long1 | double1;
    let konst2 = bit(4) | long2 | double2;
    let zero = bit(1) | reference | konst;
    let bottom = 0xffff;
    [
        bottom, zero, konst, konst1, konst2, reference, int, float, long1, long2, double1,
        double2, scalar, scalar1, scalar2, top,
    ]
};

/// Principal down-sets (descendants including self).
const IR_DOWN: [u16; 16] = {
    let mut down = [0u16; 16];
    let mut i = 0;
    while i < 16 {
        let mut j = 0;
        while j < 16 {
            if IR_UP[j] & (1 << i) != 0 {
                down[i] |= 1 << j;
            }
            j += 1;
        }
        i += 1;
    }
    down
};

const IR_ALL: [IrType; 16] = [
    IrType::Bottom,
    IrType::Zero,
    IrType::Const,
    IrType::Const1,
    IrType::Const2,
    IrType::Reference,
    IrType::Int,
    IrType::Float,
    IrType::Long1,
    IrType::Long2,
    IrType::Double1,
    IrType::Double2,
    IrType::Scalar,
    IrType::Scalar1,
    IrType::Scalar2,
    IrType::Top,
];

impl IrType {
    fn up(self) -> u16 {
        IR_UP[self as usize]
    }

    fn down(self) -> u16 {
        IR_DOWN[self as usize]
    }

    pub fn join(self, other: Self) -> Self {
        let mask = self.up() & other.up();
        for t in IR_ALL {
            if t.up() == mask {
                return t;
            }
        }
        unreachable!("IrType join of {self:?} and {other:?} not principal")
    }

    pub fn meet(self, other: Self) -> Self {
        let mask = self.down() & other.down();
        for t in IR_ALL {
            if t.down() == mask {
                return t;
            }
        }
        unreachable!("IrType meet of {self:?} and {other:?} not principal")
    }

    pub fn leq(self, other: Self) -> bool {
        // a <= b iff b's principal filter is contained in a's.
        self.up() & other.up() == other.up()
    }
}

/// The integral sub-lattice refining `IrType::Int` for verifier-fidelity
/// narrowing. Char is unsigned and therefore not below Short.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum IntType {
    Bottom = 0,
    Boolean = 1,
    Byte = 2,
    Char = 3,
    Short = 4,
    Int = 5,
    Top = 6,
}

const INT_UP: [u8; 7] = {
    const fn bit(i: u8) -> u8 {
        1 << i
    }
    let top = bit(6);
    let int = bit(5) | top;
    let short = bit(4) | int;
    let char_ = bit(3) | int;
    let byte = bit(2) | short;
    let boolean = bit(1) | byte | char_;
    let bottom = 0x7f;
    [bottom, boolean, byte, char_, short, int, top]
};

const INT_DOWN: [u8; 7] = {
    let mut down = [0u8; 7];
    let mut i = 0;
    while i < 7 {
        let mut j = 0;
        while j < 7 {
            if INT_UP[j] & (1 << i) != 0 {
                down[i] |= 1 << j;
            }
            j += 1;
        }
        i += 1;
    }
    down
};

const INT_ALL: [IntType; 7] = [
    IntType::Bottom,
    IntType::Boolean,
    IntType::Byte,
    IntType::Char,
    IntType::Short,
    IntType::Int,
    IntType::Top,
];

impl IntType {
    fn up(self) -> u8 {
        INT_UP[self as usize]
    }

    fn down(self) -> u8 {
        INT_DOWN[self as usize]
    }

    pub fn join(self, other: Self) -> Self {
        let mask = self.up() & other.up();
        for t in INT_ALL {
            if t.up() == mask {
                return t;
            }
        }
        unreachable!()
    }

    pub fn meet(self, other: Self) -> Self {
        let mask = self.down() & other.down();
        for t in INT_ALL {
            if t.down() == mask {
                return t;
            }
        }
        unreachable!()
    }

    pub fn leq(self, other: Self) -> bool {
        self.up() & other.up() == other.up()
    }
}

// ---------------------------------------------------------------- dex type

/// The best known concrete reference type of a register.
///
/// Joining two distinct class types gives up to top rather than walking
/// the hierarchy; catch-type joins, where precision matters, are merged
/// explicitly with scope access by the type inference.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DexTypeDomain {
    Bottom,
    Null,
    Ty(TypeId),
    Top,
}

impl DexTypeDomain {
    pub fn get(self) -> Option<TypeId> {
        match self {
            DexTypeDomain::Ty(ty) => Some(ty),
            _ => None,
        }
    }
}

impl AbstractDomain for DexTypeDomain {
    fn bottom() -> Self {
        DexTypeDomain::Bottom
    }

    fn top() -> Self {
        DexTypeDomain::Top
    }

    fn is_bottom(&self) -> bool {
        *self == DexTypeDomain::Bottom
    }

    fn is_top(&self) -> bool {
        *self == DexTypeDomain::Top
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (DexTypeDomain::Bottom, _) => true,
            (_, DexTypeDomain::Top) => true,
            (DexTypeDomain::Null, _) => true,
            (DexTypeDomain::Ty(a), DexTypeDomain::Ty(b)) => a == b,
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        if self.leq(other) {
            *self = *other;
        } else if !other.leq(self) {
            *self = DexTypeDomain::Top;
        }
    }

    fn meet_with(&mut self, other: &Self) {
        if other.leq(self) {
            *self = *other;
        } else if !self.leq(other) {
            *self = DexTypeDomain::Bottom;
        }
    }
}

// ---------------------------------------------------------------- registers

/// A per-register environment over any domain, with an implicit default of
/// top for unmentioned registers and a distinguished bottom element for
/// unreachable states.
#[derive(Clone, Debug)]
pub struct RegEnvironment<D: AbstractDomain> {
    map: FxHashMap<Reg, D>,
    is_bottom: bool,
}

impl<D: AbstractDomain + PartialEq> Default for RegEnvironment<D> {
    fn default() -> Self {
        Self::top()
    }
}

impl<D: AbstractDomain> RegEnvironment<D> {
    pub fn get(&self, reg: Reg) -> D {
        if self.is_bottom {
            return D::bottom();
        }
        self.map.get(&reg).cloned().unwrap_or_else(D::top)
    }

    pub fn set(&mut self, reg: Reg, value: D) {
        if self.is_bottom {
            return;
        }
        if value.is_bottom() {
            self.set_to_bottom();
            return;
        }
        if value.is_top() {
            self.map.remove(&reg);
        } else {
            self.map.insert(reg, value);
        }
    }

    pub fn update(&mut self, reg: Reg, f: impl FnOnce(D) -> D) {
        let value = self.get(reg);
        self.set(reg, f(value));
    }

    pub fn set_to_bottom(&mut self) {
        self.map.clear();
        self.is_bottom = true;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Reg, &D)> {
        self.map.iter().map(|(&r, d)| (r, d))
    }
}

impl<D: AbstractDomain + PartialEq> AbstractDomain for RegEnvironment<D> {
    fn bottom() -> Self {
        Self {
            map: FxHashMap::default(),
            is_bottom: true,
        }
    }

    fn top() -> Self {
        Self {
            map: FxHashMap::default(),
            is_bottom: false,
        }
    }

    fn is_bottom(&self) -> bool {
        self.is_bottom
    }

    fn is_top(&self) -> bool {
        !self.is_bottom && self.map.is_empty()
    }

    fn leq(&self, other: &Self) -> bool {
        if self.is_bottom {
            return true;
        }
        if other.is_bottom {
            return false;
        }
        other.map.iter().all(|(reg, d)| self.get(*reg).leq(d))
    }

    fn join_with(&mut self, other: &Self) {
        if other.is_bottom {
            return;
        }
        if self.is_bottom {
            *self = other.clone();
            return;
        }
        // Pointwise join; registers absent on either side are top.
        self.map.retain(|reg, value| {
            match other.map.get(reg) {
                Some(other_value) => {
                    value.join_with(other_value);
                    !value.is_top()
                }
                None => false,
            }
        });
    }

    fn meet_with(&mut self, other: &Self) {
        if self.is_bottom {
            return;
        }
        if other.is_bottom {
            self.set_to_bottom();
            return;
        }
        for (reg, other_value) in &other.map {
            let mut value = self.get(*reg);
            value.meet_with(other_value);
            if value.is_bottom() {
                self.set_to_bottom();
                return;
            }
            self.set(*reg, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_constant_lattice_basics() {
        let c5 = Scd::Constant(5);
        let c0 = Scd::Constant(0);
        let gtz = Scd::Interval(SignInterval::Gtz);
        let gez = Scd::Interval(SignInterval::Gez);

        assert!(c5.leq(&gtz));
        assert!(!c0.leq(&gtz));
        assert!(c0.leq(&gez));
        assert!(gtz.leq(&gez));

        let mut j = c5;
        j.join_with(&c0);
        assert_eq!(j, gez);

        let mut m = gez;
        m.meet_with(&Scd::Interval(SignInterval::Lez));
        assert_eq!(m, c0);

        let mut m2 = gtz;
        m2.meet_with(&Scd::Interval(SignInterval::Ltz));
        assert!(m2.is_bottom());
    }

    #[test]
    fn signed_constant_binops() {
        let c = |v| Scd::Constant(v);
        assert_eq!(Scd::apply_binop(ScdBinop::Add, c(2), c(3), false), c(5));
        assert_eq!(Scd::apply_binop(ScdBinop::Rsub, c(2), c(10), false), c(8));
        assert_eq!(Scd::apply_binop(ScdBinop::Div, c(7), c(0), false), Scd::Bottom);
        assert_eq!(Scd::apply_binop(ScdBinop::Rem, c(7), c(0), false), Scd::Bottom);
        // 32-bit truncation.
        assert_eq!(
            Scd::apply_binop(ScdBinop::Add, c(i32::MAX as i64), c(1), false),
            c(i32::MIN as i64)
        );
        // Shift masking.
        assert_eq!(Scd::apply_binop(ScdBinop::Shl, c(1), c(33), false), c(2));
        assert_eq!(Scd::apply_binop(ScdBinop::Ushr, c(-1), c(28), false), c(15));
        // Sign rules.
        let gtz = Scd::Interval(SignInterval::Gtz);
        assert_eq!(Scd::apply_binop(ScdBinop::Add, gtz, gtz, false), gtz);
        assert_eq!(Scd::apply_binop(ScdBinop::Mul, gtz, gtz, false), gtz);
    }

    #[test]
    fn nullness_diagram() {
        let mut j = Nullness::IsNull;
        j.join_with(&Nullness::NotNull);
        assert_eq!(j, Nullness::Top);

        let mut m = Nullness::IsNull;
        m.meet_with(&Nullness::NotNull);
        assert_eq!(m, Nullness::Uninitialized);

        assert!(Nullness::Uninitialized.leq(&Nullness::IsNull));
        assert!(!Nullness::IsNull.leq(&Nullness::NotNull));
    }

    #[test]
    fn ir_type_joins() {
        use IrType::*;
        assert_eq!(Zero.join(Const), Const);
        assert_eq!(Zero.join(Reference), Reference);
        assert_eq!(Int.join(Float), Scalar);
        assert_eq!(Const.join(Int), Int);
        assert_eq!(Reference.join(Int), Top);
        assert_eq!(Long1.join(Double1), Scalar1);
        assert_eq!(Scalar.join(Reference), Top);
        assert_eq!(Bottom.join(Zero), Zero);
    }

    #[test]
    fn ir_type_meets() {
        use IrType::*;
        assert_eq!(Reference.meet(Int), Zero);
        assert_eq!(Scalar.meet(Int), Int);
        assert_eq!(Int.meet(Float), Const);
        assert_eq!(Top.meet(Reference), Reference);
    }

    #[test]
    fn int_type_lattice() {
        use IntType::*;
        assert!(Boolean.leq(Char));
        assert!(Boolean.leq(Byte));
        assert!(Byte.leq(Short));
        assert!(!Char.leq(Short));
        assert_eq!(Char.join(Byte), Int);
        assert_eq!(Byte.join(Boolean), Byte);
        assert_eq!(Char.meet(Short), Boolean);
    }

    #[test]
    fn reg_environment_join() {
        let mut a: RegEnvironment<Scd> = RegEnvironment::top();
        a.set(0, Scd::Constant(1));
        a.set(1, Scd::Constant(2));
        let mut b: RegEnvironment<Scd> = RegEnvironment::top();
        b.set(0, Scd::Constant(1));
        b.set(1, Scd::Constant(3));
        a.join_with(&b);
        assert_eq!(a.get(0), Scd::Constant(1));
        assert_eq!(a.get(1), Scd::Interval(SignInterval::Gtz));
        assert_eq!(a.get(2), Scd::Top);

        let bottom = RegEnvironment::<Scd>::bottom();
        assert!(bottom.leq(&a));
        a.join_with(&bottom);
        assert!(!a.is_bottom());
    }

    #[test]
    fn array_domain_tracking() {
        let mut arr = ConstantArrayDomain::new(2);
        arr.set(0, Scd::Constant(7));
        assert_eq!(arr.get(0), Scd::Constant(7));
        // Unwritten elements read as zero; out of bounds throws.
        assert_eq!(arr.get(1), Scd::Constant(0));
        assert_eq!(arr.get(5), Scd::Bottom);

        let mut heap = ConstantHeap::default();
        let ptr = crate::ir::entities::InsnUid::from_u32(0);
        heap.set(ptr, arr);
        assert_eq!(heap.get(ptr).get(0), Scd::Constant(7));
        heap.escape(ptr);
        assert!(heap.get(ptr).is_top());
    }
}
