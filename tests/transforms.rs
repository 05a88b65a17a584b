//! End-to-end transformation scenarios: one input method, one pass, one
//! expected output shape.

use rustc_hash::FxHashSet;

use dexlift::analysis::constprop::ConstantPropagation;
use dexlift::ir::testutil::*;
use dexlift::ir::{AccessFlags, DexClass, DexContext, MethodDef, Opcode, Scope};
use dexlift::opt::check_casts::{EvaluateTypeChecks, MethodContext};
use dexlift::opt::dce::{default_pure_methods, LocalDce};
use dexlift::opt::gotos::fold_gotos;
use dexlift::opt::{shrink, PeepholeOptimizer};
use dexlift::PassManager;

fn object_hierarchy(ctx: &DexContext) -> Scope {
    let mut scope = Scope::new();
    let mut object = DexClass::new(ctx.known().object, None, AccessFlags::PUBLIC);
    object.set_external();
    scope.add_class(object);
    scope
}

/// Scenario: `a = new StringBuilder(); s = ""; a.append(s); return a`.
/// After the empty-append rule the call is gone and `a` is returned
/// directly (after cleanup shrinking).
#[test]
fn peephole_removes_empty_append() {
    let ctx = DexContext::new();
    let scope = object_hierarchy(&ctx);
    let known = ctx.known();
    let empty = ctx.get_or_make_string("");

    let mut b = CodeBuilder::new(3);
    b.push(new_instance(known.string_builder));
    b.push(move_result_pseudo_object(0));
    b.push(invoke_direct(known.sb_init, &[0]));
    b.push(const_string(empty));
    b.push(move_result_pseudo_object(1));
    b.push(invoke_virtual(known.sb_append_string, &[0, 1]));
    b.push(move_result_object(2));
    b.push(return_object(2));
    let mut code = b.build();

    let stats = PeepholeOptimizer::new(&ctx, &scope).run(&mut code);
    assert_eq!(stats.per_rule.get("Remove_AppendEmptyString"), Some(&1));

    // The residual const-string/move are left for DCE by design; after a
    // shrink only the builder construction and the return remain.
    let pure = default_pure_methods(&ctx);
    shrink(&ctx, &scope, &pure, None, &mut code);
    let ops = opcodes_of(&code);
    assert!(!ops.contains(&Opcode::InvokeVirtual));
    assert_eq!(
        ops,
        vec![
            Opcode::NewInstance,
            Opcode::MoveResultPseudoObject,
            Opcode::InvokeDirect,
            Opcode::MoveObject,
            Opcode::ReturnObject,
        ]
    );
}

/// Scenario: `len = "hello".length()` folds to `len = const 5`.
#[test]
fn peephole_folds_constant_string_length() {
    let ctx = DexContext::new();
    let scope = object_hierarchy(&ctx);
    let hello = ctx.get_or_make_string("hello");

    let mut b = CodeBuilder::new(2);
    b.push(const_string(hello));
    b.push(move_result_pseudo_object(0));
    b.push(invoke_virtual(ctx.known().string_length, &[0]));
    b.push(move_result(1));
    b.push(return_value(1));
    let mut code = b.build();

    PeepholeOptimizer::new(&ctx, &scope).run(&mut code);
    let konst = code
        .insns()
        .find(|i| i.opcode() == Opcode::Const)
        .expect("length folded");
    assert_eq!(konst.literal(), 5);
    assert_eq!(konst.dest(), 1);
}

/// Scenario: a dead constant and a pure call with an unused result both
/// disappear; only `return-void` remains.
#[test]
fn dce_removes_dead_constant_and_pure_call() {
    let ctx = DexContext::new();
    let mut scope = object_hierarchy(&ctx);

    let x_ty = ctx.get_or_make_type("Lcom/example/X;");
    let pure_ref = ctx.make_method("Lcom/example/X;", "pure", &[], "I");
    let mut x_cls = DexClass::new(x_ty, Some(ctx.known().object), AccessFlags::PUBLIC);
    x_cls.add_method(
        &ctx,
        MethodDef::new(pure_ref, AccessFlags::PUBLIC | AccessFlags::STATIC),
    );
    scope.add_class(x_cls);

    let mut pure = default_pure_methods(&ctx);
    pure.insert(pure_ref);

    let mut b = CodeBuilder::new(2);
    b.push(const_insn(0, 42));
    b.push(invoke_static(pure_ref, &[]));
    b.push(move_result(1));
    b.push(return_void());
    let mut code = b.build();

    let mgr = PassManager::new();
    let stats = LocalDce::new(&ctx, &scope, &pure).run(&mut code);
    mgr.incr_metric("num_dead_instructions", stats.dead_instructions as i64);

    assert_eq!(opcodes_of(&code), vec![Opcode::ReturnVoid]);
    assert_eq!(mgr.get_metric("num_dead_instructions"), 3);
}

/// Scenario: `v1 = instance-of v0, Foo; if-eqz v1` where `v0: Bar <: Foo`
/// becomes a direct null test of (a copy of) `v0`; the instance-of is
/// cleaned away.
#[test]
fn type_check_evaluation_rewrites_trivially_true_instance_of() {
    let ctx = DexContext::new();
    let mut scope = object_hierarchy(&ctx);
    let foo = ctx.get_or_make_type("Lcom/example/Foo;");
    let bar = ctx.get_or_make_type("Lcom/example/Bar;");
    scope.add_class(DexClass::new(foo, Some(ctx.known().object), AccessFlags::PUBLIC));
    scope.add_class(DexClass::new(bar, Some(foo), AccessFlags::PUBLIC));

    let mut b = CodeBuilder::new(2);
    let lfalse = b.fresh_label();
    b.push(load_param_object(0));
    b.push(instance_of(0, foo));
    b.push(move_result_pseudo(1));
    b.branch(if_insn(Opcode::IfEqz, &[1]), lfalse);
    b.push(return_void());
    b.label(lfalse);
    b.push(return_void());
    let mut code = b.build();

    let pure = default_pure_methods(&ctx);
    let pass = EvaluateTypeChecks::new(&ctx, &scope, &pure);
    let stats = pass.optimize(
        MethodContext {
            is_static: true,
            declaring: bar,
            args: &[bar],
            method: None,
        },
        &mut code,
    );

    assert_eq!(stats.always_true_instance_ofs, 1);
    assert_eq!(stats.branch_tests_rewritten, 1);
    let ops = opcodes_of(&code);
    assert!(!ops.contains(&Opcode::InstanceOf));
    // The branch now consumes the copied object register directly.
    code.build_cfg();
    let branch = code
        .cfg()
        .insns()
        .find(|i| i.opcode() == Opcode::IfEqz)
        .expect("branch kept");
    let tested = branch.src(0);
    let feeds_from_object = code
        .cfg()
        .insns()
        .any(|i| i.opcode() == Opcode::MoveObject && i.dest() == tested && i.src(0) == 0);
    assert!(feeds_from_object);
    code.clear_cfg(None);
}

/// Scenario: `v0 = const 0; if-nez v0, L; code_A; return; L: code_B;
/// return` loses the branch and `code_B` entirely.
#[test]
fn constant_propagation_removes_untaken_branch() {
    let ctx = DexContext::new();
    let scope = object_hierarchy(&ctx);

    let mut b = CodeBuilder::new(2);
    let taken = b.fresh_label();
    b.push(const_insn(0, 0));
    b.branch(if_insn(Opcode::IfNez, &[0]), taken);
    // code_A
    b.push(const_insn(1, 10));
    b.push(return_value(1));
    b.label(taken);
    // code_B
    b.push(const_insn(1, 20));
    b.push(return_value(1));
    let mut code = b.build();

    let pure = default_pure_methods(&ctx);
    shrink(&ctx, &scope, &pure, None, &mut code);

    let ops = opcodes_of(&code);
    assert!(!ops.iter().any(|op| op.is_conditional_branch()));
    let consts: Vec<i64> = code
        .insns()
        .filter(|i| i.opcode() == Opcode::Const)
        .map(|i| i.literal())
        .collect();
    assert!(consts.contains(&10));
    assert!(!consts.contains(&20));
}

/// Scenario: `A: goto B; B: goto C; C: ...` folds into one block.
#[test]
fn goto_folding_merges_chains() {
    let mut b = CodeBuilder::new(1);
    let lb = b.fresh_label();
    let lc = b.fresh_label();
    b.push(const_insn(0, 1));
    b.goto(lb);
    b.label(lc);
    b.push(return_value(0));
    b.label(lb);
    b.goto(lc);
    let mut code = b.build();

    let removed = fold_gotos(&mut code);
    assert_eq!(removed, 2);
    assert_eq!(opcodes_of(&code), vec![Opcode::Const, Opcode::Return]);
}

/// The enum/boxed-boolean analyzer chain folds `Boolean.valueOf(1)`
/// followed by `booleanValue()` to the constant it started from.
#[test]
fn constant_propagation_tracks_boxed_booleans() {
    let ctx = DexContext::new();
    let scope = object_hierarchy(&ctx);

    let mut b = CodeBuilder::new(3);
    b.push(const_insn(0, 1));
    b.push(invoke_static(ctx.known().boolean_valueof, &[0]));
    b.push(move_result_object(1));
    b.push(invoke_virtual(ctx.known().boolean_booleanvalue, &[1]));
    b.push(move_result(2));
    b.push(return_value(2));
    let mut code = b.build();

    code.build_cfg();
    let analysis = ConstantPropagation::new(&ctx, &scope);
    let fixpoint = analysis.run(code.cfg());
    let exit = fixpoint.exit_state_at(code.cfg().blocks().pop().unwrap());
    assert_eq!(exit.get(2).constant(), Some(1));
    code.clear_cfg(None);
}

/// The boxed-boolean folding is live in the rewrite pipeline: a branch on
/// `Boolean.valueOf(1).booleanValue()` is decided and its dead arm removed
/// by the standard shrink.
#[test]
fn shrink_folds_boxed_boolean_branches() {
    let ctx = DexContext::new();
    let scope = object_hierarchy(&ctx);

    let mut b = CodeBuilder::new(4);
    let dead = b.fresh_label();
    b.push(const_insn(0, 1));
    b.push(invoke_static(ctx.known().boolean_valueof, &[0]));
    b.push(move_result_object(1));
    b.push(invoke_virtual(ctx.known().boolean_booleanvalue, &[1]));
    b.push(move_result(2));
    b.branch(if_insn(Opcode::IfEqz, &[2]), dead);
    b.push(return_void());
    b.label(dead);
    b.push(const_insn(3, 99));
    b.push(return_void());
    let mut code = b.build();

    let pure = default_pure_methods(&ctx);
    shrink(&ctx, &scope, &pure, None, &mut code);

    let ops = opcodes_of(&code);
    assert!(!ops.iter().any(|op| op.is_conditional_branch()));
    // The calls stay (they are not known pure); the dead arm is gone.
    assert!(ops.contains(&Opcode::InvokeStatic));
    assert!(ops.contains(&Opcode::InvokeVirtual));
    let consts: Vec<i64> = code
        .insns()
        .filter(|i| i.opcode() == Opcode::Const)
        .map(|i| i.literal())
        .collect();
    assert!(!consts.contains(&99));
}

/// In a class initializer, a branch on a just-written static field of the
/// same class is decided; the method-aware chain makes the difference.
#[test]
fn shrink_tracks_clinit_fields_of_the_class_under_init() {
    use dexlift::ir::FieldDef;

    let ctx = DexContext::new();
    let mut scope = object_hierarchy(&ctx);
    let c_ty = ctx.get_or_make_type("Lcom/example/C;");
    let field = ctx.make_field("Lcom/example/C;", "F", "I");
    let mut cls = DexClass::new(c_ty, Some(ctx.known().object), AccessFlags::PUBLIC);
    cls.add_field(FieldDef::new(
        field,
        AccessFlags::PRIVATE | AccessFlags::STATIC,
    ));
    scope.add_class(cls);
    let clinit = ctx.make_method("Lcom/example/C;", "<clinit>", &[], "V");

    let build = || {
        let mut b = CodeBuilder::new(3);
        let live = b.fresh_label();
        b.push(const_insn(0, 7));
        b.push(sput(field, 0));
        b.push(sget(field));
        b.push(move_result_pseudo(1));
        b.branch(if_insn(Opcode::IfNez, &[1]), live);
        b.push(const_insn(2, 13));
        b.push(return_void());
        b.label(live);
        b.push(return_void());
        b.build()
    };

    let pure = default_pure_methods(&ctx);
    let mut code = build();
    shrink(&ctx, &scope, &pure, Some(clinit), &mut code);
    let ops = opcodes_of(&code);
    assert!(!ops.iter().any(|op| op.is_conditional_branch()));
    assert!(ops.contains(&Opcode::Sput));
    let consts: Vec<i64> = code
        .insns()
        .filter(|i| i.opcode() == Opcode::Const)
        .map(|i| i.literal())
        .collect();
    assert_eq!(consts, vec![7]);

    // Outside the initializer context the field read stays unknown and the
    // branch survives.
    let mut plain = build();
    shrink(&ctx, &scope, &pure, None, &mut plain);
    assert!(opcodes_of(&plain)
        .iter()
        .any(|op| op.is_conditional_branch()));
}

/// Parallel and sequential walks agree, and metrics accumulate across the
/// pool.
#[test]
fn parallel_walkers_and_metrics() {
    let ctx = DexContext::new();
    let mut scope = object_hierarchy(&ctx);
    let ty = ctx.get_or_make_type("Lcom/example/Host;");
    let mut cls = DexClass::new(ty, Some(ctx.known().object), AccessFlags::PUBLIC);
    for i in 0..23 {
        let m = ctx.make_method("Lcom/example/Host;", &format!("m{i}"), &[], "V");
        let mut b = CodeBuilder::new(1);
        b.push(const_insn(0, i as i64));
        b.push(return_void());
        cls.add_method(
            &ctx,
            MethodDef::new(m, AccessFlags::PUBLIC | AccessFlags::STATIC).with_code_body(b.build()),
        );
    }
    scope.add_class(cls);

    let pure: FxHashSet<_> = default_pure_methods(&ctx);
    let mgr = PassManager::new();
    let total = dexlift::walkers::parallel::methods_reduce(
        &scope,
        |_, method| {
            method
                .with_code(|code| {
                    let stats = LocalDce::new(&ctx, &scope, &pure).run(code);
                    stats.dead_instructions
                })
                .unwrap_or(0)
        },
        |a, b| a + b,
        0usize,
    );
    mgr.incr_metric("num_dead_instructions", total as i64);
    // Each method loses its dead constant.
    assert_eq!(mgr.get_metric("num_dead_instructions"), 23);

    let mut remaining = 0usize;
    dexlift::walkers::opcodes(&scope, |_, _| remaining += 1);
    assert_eq!(remaining, 23);
}
