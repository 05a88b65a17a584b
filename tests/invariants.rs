//! Universal invariants and round-trip / idempotence laws.

use proptest::prelude::*;

use dexlift::analysis::constprop::ConstantPropagation;
use dexlift::analysis::fixpoint::AbstractDomain;
use dexlift::analysis::{IntType, IrType, Nullness, SignInterval, SignedConstantDomain};
use dexlift::ir::testutil::*;
use dexlift::ir::{AccessFlags, DexClass, DexContext, Opcode, Scope};
use dexlift::opt::check_casts::{EvaluateTypeChecks, MethodContext};
use dexlift::opt::dce::{default_pure_methods, LocalDce};

fn object_hierarchy(ctx: &DexContext) -> Scope {
    let mut scope = Scope::new();
    let mut object = DexClass::new(ctx.known().object, None, AccessFlags::PUBLIC);
    object.set_external();
    scope.add_class(object);
    scope
}

/// A method with branches, a loop and a try region, to exercise most of
/// the serializer.
fn busy_method(ctx: &DexContext) -> dexlift::IrCode {
    let callee = ctx.make_method("Lcom/example/H;", "h", &[], "V");
    let npe = ctx.get_or_make_type("Ljava/lang/NullPointerException;");
    let mut b = CodeBuilder::new(3);
    let loop_head = b.fresh_label();
    let done = b.fresh_label();
    let handler = b.fresh_label();
    let tid = b.add_catch(vec![(Some(npe), handler)]);
    b.push(load_param(0));
    b.push(const_insn(1, 0));
    b.label(loop_head);
    b.branch(if_insn(Opcode::IfLez, &[0]), done);
    b.try_start(tid);
    b.push(invoke_static(callee, &[]));
    b.try_end(tid);
    b.push(binop_lit(Opcode::AddIntLit, 0, 0, -1));
    b.goto(loop_head);
    b.label(handler);
    b.push(const_insn(1, 1));
    b.label(done);
    b.push(return_value(1));
    b.build()
}

/// Every used register index, including the second half of wide pairs,
/// falls inside `[0, registers_size)`. Transforms may leave holes (they
/// do not renumber; register allocation is not this crate's concern), but
/// never exceed the recomputed frame.
fn assert_registers_bounded(code: &dexlift::IrCode) {
    for insn in code.insns() {
        if let Some(dest) = insn.dest_opt() {
            assert!(dest + insn.dest_width() <= code.registers_size());
        }
        for i in 0..insn.srcs_size() {
            assert!(insn.src(i) + insn.src_width(i) <= code.registers_size());
        }
    }
}

/// Every MoveResult* is preceded in linear order by its producer.
fn assert_move_result_adjacency(code: &dexlift::IrCode) {
    let ops = opcodes_of(code);
    for (i, op) in ops.iter().enumerate() {
        if op.is_move_result_any() {
            assert!(i > 0 && ops[i - 1].has_move_result_any(), "{ops:?}");
        }
        if op.has_move_result_pseudo() {
            assert!(
                ops.get(i + 1).map_or(false, |n| n.is_move_result_pseudo()),
                "{ops:?}"
            );
        }
    }
}

#[test]
fn cfg_round_trip_preserves_structure() {
    let ctx = DexContext::new();
    let mut code = busy_method(&ctx);

    let shape = |code: &mut dexlift::IrCode| {
        code.build_cfg();
        let cfg = code.cfg();
        let mut blocks: Vec<(usize, usize, usize)> = cfg
            .blocks()
            .into_iter()
            .map(|b| {
                (
                    cfg.block_insns(b).count(),
                    cfg.succ_edges(b).len(),
                    cfg.pred_edges(b).len(),
                )
            })
            .collect();
        blocks.sort_unstable();
        let insns = cfg.count_opcodes();
        code.clear_cfg(None);
        (blocks, insns)
    };

    let first = shape(&mut code);
    let second = shape(&mut code);
    let third = shape(&mut code);
    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_registers_bounded(&code);
    assert_move_result_adjacency(&code);
}

#[test]
fn dce_is_idempotent_on_a_busy_method() {
    let ctx = DexContext::new();
    let scope = object_hierarchy(&ctx);
    let pure = default_pure_methods(&ctx);
    let mut code = busy_method(&ctx);

    let dce = LocalDce::new(&ctx, &scope, &pure);
    dce.run(&mut code);
    let once = opcodes_of(&code);
    let stats = dce.run(&mut code);
    assert_eq!(opcodes_of(&code), once);
    assert_eq!(stats.dead_instructions, 0);
    assert_eq!(stats.unreachable_instructions, 0);
    assert_registers_bounded(&code);
    assert_move_result_adjacency(&code);
}

#[test]
fn fixpoint_is_stable_across_reruns() {
    let ctx = DexContext::new();
    let scope = object_hierarchy(&ctx);
    let mut code = busy_method(&ctx);

    code.build_cfg();
    let analysis = ConstantPropagation::new(&ctx, &scope);
    let first = analysis.run(code.cfg());
    let second = analysis.run(code.cfg());
    for block in code.cfg().blocks() {
        let a = first.entry_state_at(block);
        let b = second.entry_state_at(block);
        assert!(a.leq(&b) && b.leq(&a), "entry state drifted at {block}");
        let a = first.exit_state_at(block);
        let b = second.exit_state_at(block);
        assert!(a.leq(&b) && b.leq(&a), "exit state drifted at {block}");
    }
    code.clear_cfg(None);
}

#[test]
fn type_check_evaluation_is_idempotent() {
    let ctx = DexContext::new();
    let mut scope = object_hierarchy(&ctx);
    let foo = ctx.get_or_make_type("Lcom/example/Foo;");
    let bar = ctx.get_or_make_type("Lcom/example/Bar;");
    scope.add_class(DexClass::new(foo, Some(ctx.known().object), AccessFlags::PUBLIC));
    scope.add_class(DexClass::new(bar, Some(foo), AccessFlags::PUBLIC));

    let mut b = CodeBuilder::new(3);
    let lfalse = b.fresh_label();
    b.push(load_param_object(0));
    b.push(instance_of(0, foo));
    b.push(move_result_pseudo(1));
    b.branch(if_insn(Opcode::IfEqz, &[1]), lfalse);
    b.push(check_cast(0, foo));
    b.push(move_result_pseudo_object(2));
    b.push(return_object(2));
    b.label(lfalse);
    b.push(return_object(0));
    let mut code = b.build();

    let pure = default_pure_methods(&ctx);
    let pass = EvaluateTypeChecks::new(&ctx, &scope, &pure);
    let method = MethodContext {
        is_static: true,
        declaring: bar,
        args: &[bar],
        method: None,
    };
    pass.optimize(method, &mut code);
    let after_first = opcodes_of(&code);
    let second = pass.optimize(method, &mut code);
    assert_eq!(opcodes_of(&code), after_first);
    assert_eq!(second.always_true_instance_ofs, 0);
    assert_eq!(second.check_casts_removed, 0);
    assert_registers_bounded(&code);
    assert_move_result_adjacency(&code);
}

// ---------------------------------------------------------------- lattices

fn signed_constant() -> impl Strategy<Value = SignedConstantDomain> {
    prop_oneof![
        Just(SignedConstantDomain::Bottom),
        any::<i8>().prop_map(|v| SignedConstantDomain::Constant(v as i64)),
        prop_oneof![
            Just(SignInterval::Ltz),
            Just(SignInterval::Lez),
            Just(SignInterval::Gez),
            Just(SignInterval::Gtz),
            Just(SignInterval::Nez),
        ]
        .prop_map(SignedConstantDomain::Interval),
        Just(SignedConstantDomain::Top),
    ]
}

fn nullness() -> impl Strategy<Value = Nullness> {
    prop_oneof![
        Just(Nullness::Bottom),
        Just(Nullness::Uninitialized),
        Just(Nullness::IsNull),
        Just(Nullness::NotNull),
        Just(Nullness::Top),
    ]
}

const ALL_IR_TYPES: [IrType; 16] = [
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

const ALL_INT_TYPES: [IntType; 7] = [
    IntType::Bottom,
    IntType::Boolean,
    IntType::Byte,
    IntType::Char,
    IntType::Short,
    IntType::Int,
    IntType::Top,
];

fn join<D: AbstractDomain>(a: &D, b: &D) -> D {
    let mut j = a.clone();
    j.join_with(b);
    j
}

fn meet<D: AbstractDomain>(a: &D, b: &D) -> D {
    let mut m = a.clone();
    m.meet_with(b);
    m
}

fn eq<D: AbstractDomain>(a: &D, b: &D) -> bool {
    a.leq(b) && b.leq(a)
}

fn check_lattice_laws<D: AbstractDomain>(a: D, b: D, c: D) {
    // Commutativity.
    assert!(eq(&join(&a, &b), &join(&b, &a)));
    assert!(eq(&meet(&a, &b), &meet(&b, &a)));
    // Associativity.
    assert!(eq(&join(&join(&a, &b), &c), &join(&a, &join(&b, &c))));
    assert!(eq(&meet(&meet(&a, &b), &c), &meet(&a, &meet(&b, &c))));
    // Idempotence.
    assert!(eq(&join(&a, &a), &a));
    assert!(eq(&meet(&a, &a), &a));
    // a <= a v b; a ^ b <= a.
    assert!(a.leq(&join(&a, &b)));
    assert!(meet(&a, &b).leq(&a));
    // Extremal elements.
    assert!(D::bottom().leq(&a));
    assert!(a.leq(&D::top()));
}

proptest! {
    #[test]
    fn signed_constant_lattice_laws(
        a in signed_constant(),
        b in signed_constant(),
        c in signed_constant(),
    ) {
        check_lattice_laws(a, b, c);
    }

    #[test]
    fn nullness_lattice_laws(a in nullness(), b in nullness(), c in nullness()) {
        check_lattice_laws(a, b, c);
    }
}

#[test]
fn ir_type_lattice_laws() {
    for &a in &ALL_IR_TYPES {
        for &b in &ALL_IR_TYPES {
            assert_eq!(a.join(b), b.join(a));
            assert_eq!(a.meet(b), b.meet(a));
            assert_eq!(a.join(a), a);
            assert_eq!(a.meet(a), a);
            assert!(a.leq(a.join(b)));
            assert!(a.meet(b).leq(a));
            for &c in &ALL_IR_TYPES {
                assert_eq!(a.join(b).join(c), a.join(b.join(c)));
                assert_eq!(a.meet(b).meet(c), a.meet(b.meet(c)));
            }
        }
    }
}

#[test]
fn int_type_lattice_laws() {
    for &a in &ALL_INT_TYPES {
        for &b in &ALL_INT_TYPES {
            assert_eq!(a.join(b), b.join(a));
            assert_eq!(a.meet(b), b.meet(a));
            assert!(a.leq(a.join(b)));
            assert!(a.meet(b).leq(a));
            for &c in &ALL_INT_TYPES {
                assert_eq!(a.join(b).join(c), a.join(b.join(c)));
                assert_eq!(a.meet(b).meet(c), a.meet(b.meet(c)));
            }
        }
    }
}
