//! Forward type inference over the per-register type environment.
//!
//! Each register carries an [`IrType`], an [`IntType`] refinement for
//! integral values, the best known concrete reference type, and an
//! optional typedef annotation. The per-opcode contracts follow a
//! refine-then-set discipline: source registers are narrowed by what the
//! read requires (an incompatible read bottoms the environment, marking
//! the code unreachable), then destinations are assigned. The analysis is
//! sound against a partial program: unresolved referents yield top.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::domains::{DexTypeDomain, IntType, IrType, RegEnvironment};
use crate::analysis::fixpoint::{AbstractDomain, FixpointAnalyzer, FixpointIterator};
use crate::cfg::{ControlFlowGraph, EdgeKind};
use crate::ir::entities::{Block, InsnUid, TypeId};
use crate::ir::insn::{Insn, Opcode, Reg, RESULT_REGISTER};
use crate::ir::{DexContext, Scope};

/// `IrType` as an abstract domain element.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TypeDomain(pub IrType);

impl AbstractDomain for TypeDomain {
    fn bottom() -> Self {
        TypeDomain(IrType::Bottom)
    }

    fn top() -> Self {
        TypeDomain(IrType::Top)
    }

    fn is_bottom(&self) -> bool {
        self.0 == IrType::Bottom
    }

    fn is_top(&self) -> bool {
        self.0 == IrType::Top
    }

    fn leq(&self, other: &Self) -> bool {
        self.0.leq(other.0)
    }

    fn join_with(&mut self, other: &Self) {
        self.0 = self.0.join(other.0);
    }

    fn meet_with(&mut self, other: &Self) {
        self.0 = self.0.meet(other.0);
    }
}

/// `IntType` as an abstract domain element.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct IntTypeDomain(pub IntType);

impl AbstractDomain for IntTypeDomain {
    fn bottom() -> Self {
        IntTypeDomain(IntType::Bottom)
    }

    fn top() -> Self {
        IntTypeDomain(IntType::Top)
    }

    fn is_bottom(&self) -> bool {
        self.0 == IntType::Bottom
    }

    fn is_top(&self) -> bool {
        self.0 == IntType::Top
    }

    fn leq(&self, other: &Self) -> bool {
        self.0.leq(other.0)
    }

    fn join_with(&mut self, other: &Self) {
        self.0 = self.0.join(other.0);
    }

    fn meet_with(&mut self, other: &Self) {
        self.0 = self.0.meet(other.0);
    }
}

/// The per-register type state.
#[derive(Clone, Debug)]
pub struct TypeEnvironment {
    types: RegEnvironment<TypeDomain>,
    int_types: RegEnvironment<IntTypeDomain>,
    dex_types: RegEnvironment<DexTypeDomain>,
    annos: RegEnvironment<DexTypeDomain>,
}

impl TypeEnvironment {
    pub fn get_type(&self, reg: Reg) -> IrType {
        self.types.get(reg).0
    }

    pub fn get_int_type(&self, reg: Reg) -> IntType {
        self.int_types.get(reg).0
    }

    pub fn get_dex_type(&self, reg: Reg) -> Option<TypeId> {
        self.dex_types.get(reg).get()
    }

    pub fn get_dex_type_domain(&self, reg: Reg) -> DexTypeDomain {
        self.dex_types.get(reg)
    }

    pub fn get_annotation(&self, reg: Reg) -> Option<TypeId> {
        self.annos.get(reg).get()
    }

    pub fn set_type(&mut self, reg: Reg, ty: IrType) {
        self.types.set(reg, TypeDomain(ty));
    }

    pub fn set_int_type(&mut self, reg: Reg, ty: IntType) {
        self.int_types.set(reg, IntTypeDomain(ty));
    }

    pub fn set_dex_type(&mut self, reg: Reg, ty: DexTypeDomain) {
        self.dex_types.set(reg, ty);
    }

    pub fn reset_dex_type(&mut self, reg: Reg) {
        self.dex_types.set(reg, DexTypeDomain::Top);
    }

    pub fn set_annotation(&mut self, reg: Reg, anno: DexTypeDomain) {
        self.annos.set(reg, anno);
    }

    pub fn set_to_bottom(&mut self) {
        self.types.set_to_bottom();
        self.int_types.set_to_bottom();
        self.dex_types.set_to_bottom();
        self.annos.set_to_bottom();
    }
}

impl AbstractDomain for TypeEnvironment {
    fn bottom() -> Self {
        Self {
            types: RegEnvironment::bottom(),
            int_types: RegEnvironment::bottom(),
            dex_types: RegEnvironment::bottom(),
            annos: RegEnvironment::bottom(),
        }
    }

    fn top() -> Self {
        Self {
            types: RegEnvironment::top(),
            int_types: RegEnvironment::top(),
            dex_types: RegEnvironment::top(),
            annos: RegEnvironment::top(),
        }
    }

    fn is_bottom(&self) -> bool {
        self.types.is_bottom()
    }

    fn is_top(&self) -> bool {
        self.types.is_top() && self.int_types.is_top() && self.dex_types.is_top()
    }

    fn leq(&self, other: &Self) -> bool {
        self.types.leq(&other.types)
            && self.int_types.leq(&other.int_types)
            && self.dex_types.leq(&other.dex_types)
            && self.annos.leq(&other.annos)
    }

    fn join_with(&mut self, other: &Self) {
        self.types.join_with(&other.types);
        self.int_types.join_with(&other.int_types);
        self.dex_types.join_with(&other.dex_types);
        self.annos.join_with(&other.annos);
    }

    fn meet_with(&mut self, other: &Self) {
        self.types.meet_with(&other.types);
        self.int_types.meet_with(&other.int_types);
        self.dex_types.meet_with(&other.dex_types);
        self.annos.meet_with(&other.annos);
    }
}

/// The type inference pass state: configuration plus the computed
/// environments.
pub struct TypeInference<'a> {
    ctx: &'a DexContext,
    scope: &'a Scope,
    /// Typedef annotation types to track through the registers; empty
    /// disables annotation flow.
    typedef_annos: FxHashSet<TypeId>,
}

/// The computed result: per-block states plus the environment *before*
/// each instruction.
pub struct TypeInferenceResult {
    entry_states: FxHashMap<Block, TypeEnvironment>,
    exit_states: FxHashMap<Block, TypeEnvironment>,
    before_insn: FxHashMap<InsnUid, TypeEnvironment>,
}

impl TypeInferenceResult {
    pub fn entry_state_at(&self, block: Block) -> TypeEnvironment {
        self.entry_states
            .get(&block)
            .cloned()
            .unwrap_or_else(TypeEnvironment::bottom)
    }

    pub fn exit_state_at(&self, block: Block) -> TypeEnvironment {
        self.exit_states
            .get(&block)
            .cloned()
            .unwrap_or_else(TypeEnvironment::bottom)
    }

    /// The environment immediately before the given instruction, or `None`
    /// if the instruction was unreachable.
    pub fn environment_before(&self, insn: InsnUid) -> Option<&TypeEnvironment> {
        self.before_insn.get(&insn)
    }
}

struct TypeAnalyzer<'a> {
    inference: &'a TypeInference<'a>,
}

impl FixpointAnalyzer for TypeAnalyzer<'_> {
    type Domain = TypeEnvironment;

    fn analyze_block(&self, cfg: &ControlFlowGraph, block: Block, state: &mut TypeEnvironment) {
        for insn in cfg.block_insns(block) {
            self.inference.analyze_insn(cfg, Some(block), insn, state);
        }
    }
}

impl<'a> TypeInference<'a> {
    pub fn new(ctx: &'a DexContext, scope: &'a Scope) -> Self {
        Self {
            ctx,
            scope,
            typedef_annos: FxHashSet::default(),
        }
    }

    pub fn with_typedef_annotations(mut self, annos: FxHashSet<TypeId>) -> Self {
        self.typedef_annos = annos;
        self
    }

    /// Run the analysis over `cfg` for a method with the given signature.
    /// `declaring` is the receiver type of non-static methods;
    /// `param_annos` maps parameter index to its typedef annotation.
    pub fn run(
        &self,
        cfg: &ControlFlowGraph,
        is_static: bool,
        declaring: TypeId,
        args: &[TypeId],
        param_annos: &FxHashMap<u32, TypeId>,
    ) -> TypeInferenceResult {
        let init = self.initial_state(cfg, is_static, declaring, args, param_annos);
        let analyzer = TypeAnalyzer { inference: self };
        let fixpoint = FixpointIterator::run(cfg, &analyzer, init);
        let mut before_insn = FxHashMap::default();
        for block in cfg.blocks() {
            let mut env = fixpoint.entry_state_at(block);
            if env.is_bottom() {
                continue;
            }
            for insn in cfg.block_insns(block) {
                before_insn.insert(insn.uid(), env.clone());
                self.analyze_insn(cfg, Some(block), insn, &mut env);
            }
        }
        let (entry_states, exit_states) = fixpoint.into_states();
        TypeInferenceResult {
            entry_states,
            exit_states,
            before_insn,
        }
    }

    fn initial_state(
        &self,
        cfg: &ControlFlowGraph,
        is_static: bool,
        declaring: TypeId,
        args: &[TypeId],
        param_annos: &FxHashMap<u32, TypeId>,
    ) -> TypeEnvironment {
        let ctx = self.ctx;
        let mut state = TypeEnvironment::top();
        let params = cfg.param_insns();
        let mut sig = args.iter();
        let mut first = true;
        let mut arg_index: u32 = 0;
        for insn in params {
            let anno = if !first || is_static {
                let a = param_annos.get(&arg_index).copied();
                arg_index += 1;
                a.filter(|t| self.typedef_annos.contains(t))
            } else {
                None
            };
            let dest = insn.dest();
            match insn.opcode() {
                Opcode::LoadParamObject => {
                    if first && !is_static {
                        first = false;
                        self.set_reference(&mut state, dest, Some(declaring));
                    } else {
                        let ty = *sig.next().expect("more object params than arg types");
                        self.set_reference(&mut state, dest, Some(ty));
                    }
                }
                Opcode::LoadParam => {
                    let ty = *sig.next().expect("more params than arg types");
                    if ctx.is_float(ty) {
                        self.set_float(&mut state, dest);
                    } else if ctx.is_char(ty) {
                        self.set_char(&mut state, dest);
                    } else if ctx.is_short(ty) {
                        self.set_short(&mut state, dest);
                    } else if ctx.is_boolean(ty) {
                        self.set_boolean(&mut state, dest);
                    } else if ctx.is_byte(ty) {
                        self.set_byte(&mut state, dest);
                    } else {
                        self.set_int(&mut state, dest);
                    }
                }
                Opcode::LoadParamWide => {
                    let ty = *sig.next().expect("more wide params than arg types");
                    if ctx.is_double(ty) {
                        self.set_double(&mut state, dest);
                    } else {
                        self.set_long(&mut state, dest);
                    }
                }
                op => panic!("{op:?} in the parameter prelude"),
            }
            if let Some(anno) = anno {
                state.set_annotation(dest, DexTypeDomain::Ty(anno));
            }
            first = false;
        }
        state
    }

    // ---------------- set helpers ----------------

    fn set_reference(&self, state: &mut TypeEnvironment, reg: Reg, ty: Option<TypeId>) {
        state.set_type(reg, IrType::Reference);
        state.set_dex_type(
            reg,
            match ty {
                Some(t) => DexTypeDomain::Ty(t),
                None => DexTypeDomain::Top,
            },
        );
    }

    fn set_integral(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_type(reg, IrType::Int);
        state.reset_dex_type(reg);
    }

    fn set_int(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_int_type(reg, IntType::Int);
        self.set_integral(state, reg);
    }

    fn set_char(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_int_type(reg, IntType::Char);
        self.set_integral(state, reg);
    }

    fn set_short(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_int_type(reg, IntType::Short);
        self.set_integral(state, reg);
    }

    fn set_boolean(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_int_type(reg, IntType::Boolean);
        self.set_integral(state, reg);
    }

    fn set_byte(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_int_type(reg, IntType::Byte);
        self.set_integral(state, reg);
    }

    fn set_float(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_type(reg, IrType::Float);
        state.reset_dex_type(reg);
    }

    fn set_scalar(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_type(reg, IrType::Scalar);
        state.reset_dex_type(reg);
    }

    fn set_long(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_type(reg, IrType::Long1);
        state.set_type(reg + 1, IrType::Long2);
        state.reset_dex_type(reg);
        state.reset_dex_type(reg + 1);
    }

    fn set_double(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_type(reg, IrType::Double1);
        state.set_type(reg + 1, IrType::Double2);
        state.reset_dex_type(reg);
        state.reset_dex_type(reg + 1);
    }

    fn set_wide_scalar(&self, state: &mut TypeEnvironment, reg: Reg) {
        state.set_type(reg, IrType::Scalar1);
        state.set_type(reg + 1, IrType::Scalar2);
        state.reset_dex_type(reg);
        state.reset_dex_type(reg + 1);
    }

    // ---------------- refine helpers ----------------

    /// Narrow a register by what a read requires. Constants are lifted to
    /// the expected type when the context fully determines it; a narrowed
    /// register that bottoms out marks the state unreachable.
    fn refine_ir(
        &self,
        state: &mut TypeEnvironment,
        reg: Reg,
        expected: IrType,
        const_type: IrType,
        scalar_type: IrType,
    ) {
        if state.is_bottom() {
            return;
        }
        let current = state.get_type(reg);
        let refined = current.meet(expected);
        let lifted = if current.leq(const_type) && expected != scalar_type {
            if refined == IrType::Bottom {
                refined
            } else {
                expected
            }
        } else {
            refined
        };
        state.set_type(reg, lifted);
    }

    fn refine_reference(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_ir(state, reg, IrType::Reference, IrType::Const, IrType::Scalar);
    }

    fn refine_scalar(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_ir(state, reg, IrType::Scalar, IrType::Const, IrType::Scalar);
    }

    fn refine_integral(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_ir(state, reg, IrType::Int, IrType::Const, IrType::Scalar);
        if !state.is_bottom() {
            state.reset_dex_type(reg);
        }
    }

    fn refine_int_kind(&self, state: &mut TypeEnvironment, reg: Reg, kind: IntType) {
        if state.is_bottom() {
            return;
        }
        let refined = state.get_int_type(reg).meet(kind);
        state.set_int_type(reg, refined);
        if state.is_bottom() {
            return;
        }
        self.refine_integral(state, reg);
    }

    fn refine_int(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_int_kind(state, reg, IntType::Int);
    }

    fn refine_boolean(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_int_kind(state, reg, IntType::Boolean);
    }

    fn refine_char(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_int_kind(state, reg, IntType::Char);
    }

    fn refine_short(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_int_kind(state, reg, IntType::Short);
    }

    fn refine_byte(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_int_kind(state, reg, IntType::Byte);
    }

    fn refine_float(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_ir(state, reg, IrType::Float, IrType::Const, IrType::Scalar);
        if !state.is_bottom() {
            state.reset_dex_type(reg);
        }
    }

    fn refine_wide(&self, state: &mut TypeEnvironment, reg: Reg, first: IrType, second: IrType) {
        self.refine_ir(state, reg, first, IrType::Const1, IrType::Scalar1);
        self.refine_ir(state, reg + 1, second, IrType::Const2, IrType::Scalar2);
        if !state.is_bottom() {
            state.reset_dex_type(reg);
            state.reset_dex_type(reg + 1);
        }
    }

    fn refine_wide_scalar(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_wide(state, reg, IrType::Scalar1, IrType::Scalar2);
    }

    fn refine_long(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_wide(state, reg, IrType::Long1, IrType::Long2);
    }

    fn refine_double(&self, state: &mut TypeEnvironment, reg: Reg) {
        self.refine_wide(state, reg, IrType::Double1, IrType::Double2);
    }

    /// An operand compared against zero may be either a reference or an
    /// integer.
    fn refine_comparable_with_zero(&self, state: &mut TypeEnvironment, reg: Reg) {
        if state.is_bottom() {
            return;
        }
        let t = state.get_type(reg);
        if t == IrType::Scalar {
            // Nothing conclusive to learn from a SCALAR operand.
            return;
        }
        if !(t.leq(IrType::Reference) || t.leq(IrType::Int)) {
            // The type is incompatible with the comparison; the code that
            // follows is unreachable.
            state.set_to_bottom();
        }
    }

    /// Two compared operands must both be references or both non-float
    /// scalars.
    fn refine_comparable(&self, state: &mut TypeEnvironment, reg1: Reg, reg2: Reg) {
        if state.is_bottom() {
            return;
        }
        let t1 = state.get_type(reg1);
        let t2 = state.get_type(reg2);
        let both_refs = t1.leq(IrType::Reference) && t2.leq(IrType::Reference);
        let both_scalars = t1.leq(IrType::Scalar)
            && t2.leq(IrType::Scalar)
            && t1 != IrType::Float
            && t2 != IrType::Float;
        if !(both_refs || both_scalars) {
            state.set_to_bottom();
        }
    }

    // ---------------- transfer function ----------------

    /// Analyze one instruction, updating the environment in place.
    /// `block` provides the catch-edge context for `MoveException`.
    pub fn analyze_insn(
        &self,
        cfg: &ControlFlowGraph,
        block: Option<Block>,
        insn: &Insn,
        state: &mut TypeEnvironment,
    ) {
        use Opcode::*;
        let ctx = self.ctx;
        match insn.opcode() {
            LoadParam | LoadParamObject | LoadParamWide => {
                // Interpreted ahead of the fixpoint, from the signature.
            }
            Nop | FillArrayData | Goto | ReturnVoid | Unreachable => {}
            Move => {
                self.refine_scalar(state, insn.src(0));
                state.set_type(insn.dest(), state.get_type(insn.src(0)));
                state.set_int_type(insn.dest(), state.get_int_type(insn.src(0)));
            }
            MoveObject => {
                self.refine_reference(state, insn.src(0));
                if state.get_type(insn.src(0)) == IrType::Reference {
                    let dex = state.get_dex_type_domain(insn.src(0));
                    state.set_type(insn.dest(), IrType::Reference);
                    state.set_dex_type(insn.dest(), dex);
                } else {
                    state.set_type(insn.dest(), state.get_type(insn.src(0)));
                }
                let anno = self.anno_domain(state, insn.src(0));
                state.set_annotation(insn.dest(), anno);
            }
            MoveWide => {
                self.refine_wide_scalar(state, insn.src(0));
                state.set_type(insn.dest(), state.get_type(insn.src(0)));
                state.set_type(insn.dest() + 1, state.get_type(insn.src(0) + 1));
            }
            MoveResult | MoveResultPseudo => {
                self.refine_scalar(state, RESULT_REGISTER);
                state.set_type(insn.dest(), state.get_type(RESULT_REGISTER));
                state.set_int_type(insn.dest(), state.get_int_type(RESULT_REGISTER));
                let anno = self.anno_domain(state, RESULT_REGISTER);
                state.set_annotation(insn.dest(), anno);
            }
            MoveResultObject | MoveResultPseudoObject => {
                self.refine_reference(state, RESULT_REGISTER);
                let dex = state.get_dex_type_domain(RESULT_REGISTER);
                state.set_type(insn.dest(), IrType::Reference);
                state.set_dex_type(insn.dest(), dex);
                let anno = self.anno_domain(state, RESULT_REGISTER);
                state.set_annotation(insn.dest(), anno);
            }
            MoveResultWide | MoveResultPseudoWide => {
                self.refine_wide_scalar(state, RESULT_REGISTER);
                state.set_type(insn.dest(), state.get_type(RESULT_REGISTER));
                state.set_type(insn.dest() + 1, state.get_type(RESULT_REGISTER + 1));
            }
            MoveException => {
                let merged = self.merged_catch_type(cfg, block);
                self.set_reference(state, insn.dest(), Some(merged));
            }
            Return => self.refine_scalar(state, insn.src(0)),
            ReturnWide => self.refine_wide_scalar(state, insn.src(0)),
            ReturnObject => self.refine_reference(state, insn.src(0)),
            Const => {
                if insn.literal() == 0 {
                    state.set_dex_type(insn.dest(), DexTypeDomain::Null);
                    state.set_type(insn.dest(), IrType::Zero);
                } else {
                    state.set_type(insn.dest(), IrType::Const);
                }
                // A constant is compatible with every integral context;
                // start it at the most precise point of the sub-lattice.
                state.set_int_type(insn.dest(), IntType::Boolean);
            }
            ConstWide => {
                state.set_type(insn.dest(), IrType::Const1);
                state.set_type(insn.dest() + 1, IrType::Const2);
            }
            ConstString => {
                self.set_reference(state, RESULT_REGISTER, Some(ctx.known().string));
            }
            ConstClass => {
                self.set_reference(state, RESULT_REGISTER, Some(ctx.known().class));
            }
            MonitorEnter | MonitorExit => self.refine_reference(state, insn.src(0)),
            CheckCast => {
                self.refine_reference(state, insn.src(0));
                self.set_reference(state, RESULT_REGISTER, Some(insn.type_ref()));
            }
            InstanceOf => {
                self.refine_reference(state, insn.src(0));
                self.set_boolean(state, RESULT_REGISTER);
            }
            ArrayLength => {
                self.refine_reference(state, insn.src(0));
                self.set_int(state, RESULT_REGISTER);
            }
            NewInstance => {
                self.set_reference(state, RESULT_REGISTER, Some(insn.type_ref()));
            }
            NewArray => {
                self.refine_int(state, insn.src(0));
                self.set_reference(state, RESULT_REGISTER, Some(insn.type_ref()));
            }
            FilledNewArray => {
                let element = ctx
                    .array_component(insn.type_ref())
                    .expect("filled-new-array of a non-array type");
                let of_refs = ctx.is_object(element);
                for i in 0..insn.srcs_size() {
                    if of_refs {
                        self.refine_reference(state, insn.src(i));
                    } else {
                        self.refine_scalar(state, insn.src(i));
                    }
                }
                self.set_reference(state, RESULT_REGISTER, Some(insn.type_ref()));
            }
            Throw => self.refine_reference(state, insn.src(0)),
            Switch => self.refine_int(state, insn.src(0)),
            CmplFloat | CmpgFloat => {
                self.refine_float(state, insn.src(0));
                self.refine_float(state, insn.src(1));
                self.set_boolean(state, insn.dest());
            }
            CmplDouble | CmpgDouble => {
                self.refine_double(state, insn.src(0));
                self.refine_double(state, insn.src(1));
                self.set_boolean(state, insn.dest());
            }
            CmpLong => {
                self.refine_long(state, insn.src(0));
                self.refine_long(state, insn.src(1));
                self.set_boolean(state, insn.dest());
            }
            IfEq | IfNe => self.refine_comparable(state, insn.src(0), insn.src(1)),
            IfLt | IfGe | IfGt | IfLe => {
                self.refine_int(state, insn.src(0));
                self.refine_int(state, insn.src(1));
            }
            IfEqz | IfNez => self.refine_comparable_with_zero(state, insn.src(0)),
            IfLtz | IfGez | IfGtz | IfLez => self.refine_int(state, insn.src(0)),
            Aget => {
                self.refine_reference(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                self.set_scalar(state, RESULT_REGISTER);
            }
            AgetBoolean => {
                self.refine_reference(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                self.set_boolean(state, RESULT_REGISTER);
            }
            AgetByte => {
                self.refine_reference(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                self.set_byte(state, RESULT_REGISTER);
            }
            AgetChar => {
                self.refine_reference(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                self.set_char(state, RESULT_REGISTER);
            }
            AgetShort => {
                self.refine_reference(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                self.set_short(state, RESULT_REGISTER);
            }
            AgetWide => {
                self.refine_reference(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                self.set_wide_scalar(state, RESULT_REGISTER);
            }
            AgetObject => {
                self.refine_reference(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                let array_ty = state.get_dex_type(insn.src(0));
                match array_ty.and_then(|t| ctx.array_component(t)) {
                    Some(element) => self.set_reference(state, RESULT_REGISTER, Some(element)),
                    None => self.set_reference(state, RESULT_REGISTER, None),
                }
            }
            Aput => {
                self.refine_scalar(state, insn.src(0));
                self.refine_reference(state, insn.src(1));
                self.refine_int(state, insn.src(2));
            }
            AputBoolean => {
                self.refine_boolean(state, insn.src(0));
                self.refine_reference(state, insn.src(1));
                self.refine_int(state, insn.src(2));
            }
            AputByte => {
                self.refine_byte(state, insn.src(0));
                self.refine_reference(state, insn.src(1));
                self.refine_int(state, insn.src(2));
            }
            AputChar => {
                self.refine_char(state, insn.src(0));
                self.refine_reference(state, insn.src(1));
                self.refine_int(state, insn.src(2));
            }
            AputShort => {
                self.refine_short(state, insn.src(0));
                self.refine_reference(state, insn.src(1));
                self.refine_int(state, insn.src(2));
            }
            AputWide => {
                self.refine_wide_scalar(state, insn.src(0));
                self.refine_reference(state, insn.src(1));
                self.refine_int(state, insn.src(2));
            }
            AputObject => {
                self.refine_reference(state, insn.src(0));
                self.refine_reference(state, insn.src(1));
                self.refine_int(state, insn.src(2));
            }
            op if op.is_iget() => {
                self.refine_reference(state, insn.src(0));
                let field_ty = ctx.field(insn.field_ref()).ty;
                self.set_result_by_type(state, field_ty);
            }
            op if op.is_sget() => {
                let field_ty = ctx.field(insn.field_ref()).ty;
                self.set_result_by_type(state, field_ty);
            }
            op if op.is_iput() => {
                let field_ty = ctx.field(insn.field_ref()).ty;
                self.refine_by_type(state, insn.src(0), field_ty);
                self.refine_reference(state, insn.src(1));
            }
            op if op.is_sput() => {
                let field_ty = ctx.field(insn.field_ref()).ty;
                self.refine_by_type(state, insn.src(0), field_ty);
            }
            op if op.is_invoke() => {
                self.analyze_invoke(state, insn);
            }
            NegInt | NotInt => {
                self.refine_int(state, insn.src(0));
                self.set_int(state, insn.dest());
            }
            NegFloat => {
                self.refine_float(state, insn.src(0));
                self.set_float(state, insn.dest());
            }
            NegLong | NotLong => {
                self.refine_long(state, insn.src(0));
                self.set_long(state, insn.dest());
            }
            NegDouble => {
                self.refine_double(state, insn.src(0));
                self.set_double(state, insn.dest());
            }
            AndInt | OrInt | XorInt => {
                let both_boolean = state.get_int_type(insn.src(0)).leq(IntType::Boolean)
                    && state.get_int_type(insn.src(1)).leq(IntType::Boolean);
                self.refine_int(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                if both_boolean {
                    self.set_boolean(state, insn.dest());
                } else {
                    self.set_int(state, insn.dest());
                }
            }
            AddInt | SubInt | MulInt | DivInt | RemInt | ShlInt | ShrInt | UshrInt => {
                self.refine_int(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                self.set_int(state, insn.dest());
            }
            AddLong | SubLong | MulLong | DivLong | RemLong | AndLong | OrLong | XorLong => {
                self.refine_long(state, insn.src(0));
                self.refine_long(state, insn.src(1));
                self.set_long(state, insn.dest());
            }
            ShlLong | ShrLong | UshrLong => {
                self.refine_long(state, insn.src(0));
                self.refine_int(state, insn.src(1));
                self.set_long(state, insn.dest());
            }
            AddFloat | SubFloat | MulFloat | DivFloat | RemFloat => {
                self.refine_float(state, insn.src(0));
                self.refine_float(state, insn.src(1));
                self.set_float(state, insn.dest());
            }
            AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => {
                self.refine_double(state, insn.src(0));
                self.refine_double(state, insn.src(1));
                self.set_double(state, insn.dest());
            }
            AndIntLit | OrIntLit | XorIntLit => {
                let boolean_src = state.get_int_type(insn.src(0)).leq(IntType::Boolean);
                self.refine_int(state, insn.src(0));
                if boolean_src && (insn.literal() == 0 || insn.literal() == 1) {
                    self.set_boolean(state, insn.dest());
                } else {
                    self.set_int(state, insn.dest());
                }
            }
            AddIntLit | RsubIntLit | MulIntLit | DivIntLit | RemIntLit | ShlIntLit
            | ShrIntLit | UshrIntLit => {
                self.refine_int(state, insn.src(0));
                self.set_int(state, insn.dest());
            }
            op => panic!("type inference: unhandled opcode {op:?}"),
        }
    }

    fn anno_domain(&self, state: &TypeEnvironment, reg: Reg) -> DexTypeDomain {
        if self.typedef_annos.is_empty() {
            DexTypeDomain::Top
        } else {
            match state.get_annotation(reg) {
                Some(t) => DexTypeDomain::Ty(t),
                None => DexTypeDomain::Top,
            }
        }
    }

    fn set_result_by_type(&self, state: &mut TypeEnvironment, ty: TypeId) {
        let ctx = self.ctx;
        if ctx.is_object(ty) {
            self.set_reference(state, RESULT_REGISTER, Some(ty));
        } else if ctx.is_float(ty) {
            self.set_float(state, RESULT_REGISTER);
        } else if ctx.is_double(ty) {
            self.set_double(state, RESULT_REGISTER);
        } else if ctx.is_long(ty) {
            self.set_long(state, RESULT_REGISTER);
        } else if ctx.is_char(ty) {
            self.set_char(state, RESULT_REGISTER);
        } else if ctx.is_short(ty) {
            self.set_short(state, RESULT_REGISTER);
        } else if ctx.is_boolean(ty) {
            self.set_boolean(state, RESULT_REGISTER);
        } else if ctx.is_byte(ty) {
            self.set_byte(state, RESULT_REGISTER);
        } else {
            self.set_int(state, RESULT_REGISTER);
        }
    }

    fn refine_by_type(&self, state: &mut TypeEnvironment, reg: Reg, ty: TypeId) {
        let ctx = self.ctx;
        if ctx.is_object(ty) {
            self.refine_reference(state, reg);
        } else if ctx.is_float(ty) {
            self.refine_float(state, reg);
        } else if ctx.is_double(ty) {
            self.refine_double(state, reg);
        } else if ctx.is_long(ty) {
            self.refine_long(state, reg);
        } else if ctx.is_char(ty) {
            self.refine_char(state, reg);
        } else if ctx.is_short(ty) {
            self.refine_short(state, reg);
        } else if ctx.is_boolean(ty) {
            self.refine_boolean(state, reg);
        } else if ctx.is_byte(ty) {
            self.refine_byte(state, reg);
        } else {
            self.refine_int(state, reg);
        }
    }

    fn analyze_invoke(&self, state: &mut TypeEnvironment, insn: &Insn) {
        let ctx = self.ctx;
        let mref = insn.method_ref();
        let data = ctx.method(mref);
        let proto = ctx.proto(data.proto);
        let is_static_call = insn.opcode() == Opcode::InvokeStatic;
        let mut arg = 0usize;
        for i in 0..insn.srcs_size() {
            if i == 0 && !is_static_call {
                self.refine_reference(state, insn.src(0));
                continue;
            }
            let Some(&ty) = proto.args.get(arg) else {
                // Malformed call site; fall back to top for the rest.
                break;
            };
            arg += 1;
            self.refine_by_type(state, insn.src(i), ty);
        }
        if !ctx.is_void(proto.rtype) {
            self.set_result_by_type(state, proto.rtype);
            if !self.typedef_annos.is_empty() {
                if let Some(anno) = self.callee_typedef_anno(mref) {
                    state.set_annotation(RESULT_REGISTER, DexTypeDomain::Ty(anno));
                }
            }
        }
    }

    /// The typedef annotation on the resolved callee, if any.
    fn callee_typedef_anno(&self, mref: crate::ir::MethodId) -> Option<TypeId> {
        let def = crate::resolver::resolve_method(
            self.ctx,
            self.scope,
            mref,
            crate::resolver::MethodSearch::Any,
        )?;
        let data = self.ctx.method(def);
        let cls = self.scope.class(data.class)?;
        let mdef = cls
            .all_methods()
            .find(|m| m.method() == def)?;
        let annos = mdef.annotations()?;
        annos
            .annotations
            .iter()
            .map(|a| a.ty)
            .find(|t| self.typedef_annos.contains(t))
    }

    /// The most precise throwable for a catch block: the join of the catch
    /// types of all incoming throw edges; a catch-all edge forces
    /// `java.lang.Throwable`.
    fn merged_catch_type(&self, cfg: &ControlFlowGraph, block: Option<Block>) -> TypeId {
        let throwable = self.ctx.known().throwable;
        let Some(block) = block else {
            return throwable;
        };
        let mut merged: Option<TypeId> = None;
        for &e in cfg.pred_edges(block) {
            if let EdgeKind::Throw { catch_type } = cfg.edge(e).kind {
                let ty = catch_type.unwrap_or(throwable);
                merged = Some(match merged {
                    None => ty,
                    Some(prev) => self.join_types(prev, ty).unwrap_or(throwable),
                });
            }
        }
        merged.unwrap_or(throwable)
    }

    /// The least common superclass of two types, through the super chains.
    fn join_types(&self, a: TypeId, b: TypeId) -> Option<TypeId> {
        if a == b {
            return Some(a);
        }
        let mut a_chain = Vec::new();
        let mut cur = Some(a);
        while let Some(ty) = cur {
            a_chain.push(ty);
            cur = self.scope.class(ty).and_then(|c| c.super_class());
        }
        let mut cur = Some(b);
        while let Some(ty) = cur {
            if a_chain.contains(&ty) {
                return Some(ty);
            }
            cur = self.scope.class(ty).and_then(|c| c.super_class());
        }
        None
    }
}
