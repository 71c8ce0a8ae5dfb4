//! End-to-end lowering tests: statements through flattening, unbranching,
//! and body assembly, checked against the exact primitive form expected.

mod common;

use common::*;
use wybec::ast::{Exp, Placed, Stmt};
use wybec::body_builder::BodyBuilder;
use wybec::diag::DiagKind;
use wybec::prim::{PrimFlow, PrimFork, ProcBody};
use wybec::types::TypeSpec;
use wybec::ProcImpl;

/// `x = y; ?z = x + 1` with `x` an internal temporary: the move is elided
/// and the single remaining prim reads `y` directly.
#[test]
fn move_elision_leaves_single_add() {
    let result = compile_items(vec![proc_decl(
        "p",
        vec![in_param("y", TypeSpec::int()), out_param("z", TypeSpec::int())],
        vec![
            Stmt::assign("x", var("y")),
            Stmt::assign("z", llvm_exp("add", vec![var("x"), int(1)])),
        ],
    )]);
    assert!(result.outcome.success);
    let (proto, body) = lowered(&result, "p");
    assert_proc_invariants(proto, body);
    assert_eq!(prim_lines(body), vec!["foreign llvm add(y#0, 1, ?z#-1)"]);
}

/// `x = 2 + 3; ?y = x`: constant folding plus move elision leave one move
/// of the literal result.
#[test]
fn constant_fold_and_move_elision() {
    let result = compile_items(vec![proc_decl(
        "p",
        vec![out_param("y", TypeSpec::int())],
        vec![
            Stmt::assign("x", llvm_exp("add", vec![int(2), int(3)])),
            Stmt::assign("y", var("x")),
        ],
    )]);
    assert!(result.outcome.success);
    let (proto, body) = lowered(&result, "p");
    assert_proc_invariants(proto, body);
    assert_eq!(prim_lines(body), vec!["foreign llvm move(5, ?y#-1)"]);
}

/// `if 1 then A else B` compiles only A; no fork is emitted.
#[test]
fn constant_condition_folds_branch() {
    let result = compile_items(vec![proc_decl(
        "p",
        vec![out_param("r", TypeSpec::int())],
        vec![Stmt::Cond {
            cond: int(1),
            then_stmts: vec![Placed::unplaced(Stmt::assign("r", int(1)))],
            else_stmts: vec![Placed::unplaced(Stmt::assign("r", int(2)))],
        }],
    )]);
    assert!(result.outcome.success);
    let (proto, body) = lowered(&result, "p");
    assert_proc_invariants(proto, body);
    assert!(matches!(body.fork, PrimFork::NoFork));
    assert_eq!(prim_lines(body), vec!["foreign llvm move(1, ?r#-1)"]);
}

/// `a = f(x); b = f(x); ?c = a + b`: one call survives and both operands of
/// the add resolve to the same variable.
#[test]
fn common_subexpression_elimination() {
    let square = wybec::ast::Item::FuncDecl {
        visibility: wybec::types::Visibility::Public,
        det: Default::default(),
        proto: wybec::ast::ProcProto::new("f", vec![in_param("x", TypeSpec::int())]),
        result: TypeSpec::int(),
        body: llvm_exp("mul", vec![var("x"), var("x")]),
    };
    let result = compile_items(vec![
        square,
        proc_decl(
            "p",
            vec![in_param("x", TypeSpec::int()), out_param("c", TypeSpec::int())],
            vec![
                Stmt::assign("a", Placed::unplaced(Exp::fncall("f", vec![var("x")]))),
                Stmt::assign("b", Placed::unplaced(Exp::fncall("f", vec![var("x")]))),
                Stmt::assign("c", llvm_exp("add", vec![var("a"), var("b")])),
            ],
        ),
    ]);
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let (proto, body) = lowered(&result, "p");
    assert_proc_invariants(proto, body);
    let lines = prim_lines(body);
    assert_eq!(lines.len(), 2, "one call and one add: {lines:?}");
    assert!(is_call_to(&body.prims[0].node, "f"));
    assert_eq!(lines[1], "foreign llvm add(a#0, a#0, ?c#-1)");
}

/// A real two-way conditional forks on the condition variable with the
/// false branch at index 0.
#[test]
fn conditional_forks_false_branch_first() {
    let result = compile_items(vec![proc_decl(
        "p",
        vec![
            in_param("c", TypeSpec::bool()),
            out_param("r", TypeSpec::int()),
        ],
        vec![Stmt::Cond {
            cond: var("c"),
            then_stmts: vec![Placed::unplaced(Stmt::assign("r", int(1)))],
            else_stmts: vec![Placed::unplaced(Stmt::assign("r", int(2)))],
        }],
    )]);
    assert!(result.outcome.success);
    let (proto, body) = lowered(&result, "p");
    assert_proc_invariants(proto, body);
    assert!(body.prims.is_empty());
    let PrimFork::Fork {
        var,
        is_final,
        branches,
    } = &body.fork
    else {
        panic!("expected fork");
    };
    assert_eq!(var.to_string(), "c#0");
    assert!(*is_final, "tail conditional forks final");
    assert_eq!(branches.len(), 2);
    assert_eq!(
        prim_lines(&branches[0]),
        vec!["foreign llvm move(2, ?r#-1)"],
        "index 0 is the false branch"
    );
    assert_eq!(prim_lines(&branches[1]), vec!["foreign llvm move(1, ?r#-1)"]);
}

/// A conditional followed by more statements routes both branches through a
/// continuation proc carrying the live values.
#[test]
fn non_tail_conditional_uses_continuation() {
    let result = compile_items(vec![proc_decl(
        "p",
        vec![
            in_param("c", TypeSpec::bool()),
            out_param("r", TypeSpec::int()),
        ],
        vec![
            Stmt::Cond {
                cond: var("c"),
                then_stmts: vec![Placed::unplaced(Stmt::assign("x", int(1)))],
                else_stmts: vec![Placed::unplaced(Stmt::assign("x", int(2)))],
            },
            Stmt::assign("r", llvm_exp("add", vec![var("x"), int(5)])),
        ],
    )]);
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let (proto, body) = lowered(&result, "p");
    assert_proc_invariants(proto, body);
    let PrimFork::Fork {
        is_final, branches, ..
    } = &body.fork
    else {
        panic!("expected fork");
    };
    assert!(!is_final, "branches rejoin through the continuation");
    for branch in branches {
        assert_eq!(branch.prims.len(), 1);
        assert!(
            is_call_to(&branch.prims[0].node, "$cont0"),
            "branch ends in a continuation call: {}",
            branch.prims[0].node
        );
    }
    // The continuation holds the statements after the conditional.
    let (cont_proto, cont_body) = lowered(&result, "$cont0");
    assert_proc_invariants(cont_proto, cont_body);
    assert_eq!(prim_lines(cont_body), vec!["foreign llvm add(x#0, 5, ?r#-1)"]);
}

/// A `do` loop becomes a private tail-recursive proc: `break` returns,
/// falling off the end re-calls, and the caller sees one plain call.
#[test]
fn loop_lifts_to_tail_recursive_proc() {
    let result = compile_items(vec![proc_decl(
        "count",
        vec![in_param("n", TypeSpec::int()), out_param("r", TypeSpec::int())],
        vec![
            Stmt::assign("i", int(0)),
            Stmt::Loop {
                body: vec![
                    Placed::unplaced(Stmt::assign(
                        "c",
                        Placed::unplaced(Exp::llvm_op(
                            "icmp",
                            vec!["slt".into()],
                            vec![var("i"), var("n")],
                        )),
                    )),
                    Placed::unplaced(Stmt::Cond {
                        cond: var("c"),
                        then_stmts: vec![Placed::unplaced(Stmt::assign(
                            "i",
                            llvm_exp("add", vec![var("i"), int(1)]),
                        ))],
                        else_stmts: vec![Placed::unplaced(Stmt::Break)],
                    }),
                ],
            },
            Stmt::assign("r", var("i")),
        ],
    )]);
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let (proto, body) = lowered(&result, "count");
    assert_proc_invariants(proto, body);
    // The caller is a single call to the lifted loop.
    assert_eq!(body.prims.len(), 1);
    assert!(is_call_to(&body.prims[0].node, "$loop0"));
    assert!(matches!(body.fork, PrimFork::NoFork));

    let (loop_proto, loop_body) = lowered(&result, "$loop0");
    assert_proc_invariants(loop_proto, loop_body);
    let PrimFork::Fork { branches, .. } = &loop_body.fork else {
        panic!("loop proc forks on its condition");
    };
    // False branch: break, a plain return binding the loop's outputs.
    assert_eq!(
        prim_lines(&branches[0]),
        vec!["foreign llvm move(i#0, ?i#-1)"]
    );
    // True branch: advance and re-call self.
    let continue_lines = prim_lines(&branches[1]);
    assert_eq!(continue_lines.len(), 2);
    assert!(continue_lines[0].contains("add(i#0, 1"));
    assert!(is_call_to(&branches[1].prims[1].node, "$loop0"));
}

/// Explicit `next` restarts the loop exactly like falling off its end.
#[test]
fn next_recalls_loop_proc() {
    let result = compile_items(vec![proc_decl(
        "spin",
        vec![in_param("n", TypeSpec::int()), out_param("r", TypeSpec::int())],
        vec![
            Stmt::assign("i", int(0)),
            Stmt::Loop {
                body: vec![
                    Placed::unplaced(Stmt::assign(
                        "c",
                        Placed::unplaced(Exp::llvm_op(
                            "icmp",
                            vec!["sge".into()],
                            vec![var("i"), var("n")],
                        )),
                    )),
                    Placed::unplaced(Stmt::Cond {
                        cond: var("c"),
                        then_stmts: vec![Placed::unplaced(Stmt::Break)],
                        else_stmts: vec![
                            Placed::unplaced(Stmt::assign(
                                "i",
                                llvm_exp("add", vec![var("i"), int(1)]),
                            )),
                            Placed::unplaced(Stmt::Next),
                        ],
                    }),
                ],
            },
            Stmt::assign("r", var("i")),
        ],
    )]);
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let (loop_proto, loop_body) = lowered(&result, "$loop0");
    assert_proc_invariants(loop_proto, loop_body);
    let PrimFork::Fork { branches, .. } = &loop_body.fork else {
        panic!("loop proc forks on its condition");
    };
    let next_branch = &branches[0];
    assert!(
        is_call_to(&next_branch.prims.last().unwrap().node, "$loop0"),
        "explicit next tail-calls the loop proc"
    );
}

#[test]
fn break_outside_loop_is_reported() {
    let result = compile_items(vec![proc_decl("p", vec![], vec![Stmt::Break])]);
    assert!(!result.outcome.success);
    assert!(result
        .outcome
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagKind::FlowMode && d.message.contains("break")));
}

#[test]
fn unbound_output_is_reported() {
    let result = compile_items(vec![proc_decl(
        "p",
        vec![out_param("r", TypeSpec::int())],
        vec![],
    )]);
    assert!(!result.outcome.success);
    assert!(result
        .outcome
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagKind::FlowMode && d.message.contains("never bound")));
}

#[test]
fn read_before_bound_is_reported() {
    let result = compile_items(vec![proc_decl(
        "p",
        vec![out_param("r", TypeSpec::int())],
        vec![Stmt::assign("r", llvm_exp("add", vec![var("ghost"), int(1)]))],
    )]);
    assert!(!result.outcome.success);
    assert!(result
        .outcome
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagKind::FlowMode && d.message.contains("ghost")));
}

#[test]
fn unknown_proc_is_reported() {
    let result = compile_items(vec![proc_decl(
        "p",
        vec![],
        vec![Stmt::call("vanish", vec![])],
    )]);
    assert!(!result.outcome.success);
    assert!(result
        .outcome
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagKind::NameResolution));
}

/// Re-lowering a lowered body is a no-op: the optimisations are idempotent.
#[test]
fn relowering_reaches_fixpoint() {
    let result = compile_items(vec![proc_decl(
        "p",
        vec![
            in_param("c", TypeSpec::bool()),
            in_param("x", TypeSpec::int()),
            out_param("r", TypeSpec::int()),
        ],
        vec![
            Stmt::assign("a", llvm_exp("add", vec![var("x"), int(1)])),
            Stmt::Cond {
                cond: var("c"),
                then_stmts: vec![Placed::unplaced(Stmt::assign("r", var("a")))],
                else_stmts: vec![Placed::unplaced(Stmt::assign(
                    "r",
                    llvm_exp("mul", vec![var("a"), int(2)]),
                ))],
            },
        ],
    )]);
    assert!(result.outcome.success);
    let (proto, body) = lowered(&result, "p");
    let once = relower(proto, body);
    let twice = relower(proto, &once);
    assert_eq!(once, twice);
}

fn relower(proto: &wybec::PrimProto, body: &ProcBody) -> ProcBody {
    fn feed(builder: &mut BodyBuilder, body: &ProcBody) -> Result<(), wybec::CompileError> {
        for placed in &body.prims {
            builder.instr(placed.node.clone(), placed.pos.clone())?;
        }
        if let PrimFork::Fork {
            var,
            is_final,
            branches,
        } = &body.fork
        {
            builder.build_fork(var, *is_final, branches.iter().collect(), |b, branch| {
                feed(b, branch)
            })?;
        }
        Ok(())
    }
    let mut builder = BodyBuilder::new(
        proto
            .params
            .iter()
            .filter(|p| p.flow == PrimFlow::Out)
            .map(|p| p.name.name.clone()),
        proto
            .params
            .iter()
            .filter(|p| p.flow == PrimFlow::In)
            .map(|p| p.name.clone()),
    );
    feed(&mut builder, body).expect("relowering a valid body");
    builder.finish().expect("sealing a valid body")
}

/// Every proc of a larger program satisfies the structural invariants.
#[test]
fn structural_invariants_hold_across_program() {
    let result = compile_items(vec![
        proc_decl(
            "abs",
            vec![in_param("x", TypeSpec::int()), out_param("y", TypeSpec::int())],
            vec![
                Stmt::assign(
                    "neg",
                    Placed::unplaced(Exp::llvm_op(
                        "icmp",
                        vec!["slt".into()],
                        vec![var("x"), int(0)],
                    )),
                ),
                Stmt::Cond {
                    cond: var("neg"),
                    then_stmts: vec![Placed::unplaced(Stmt::assign(
                        "y",
                        llvm_exp("sub", vec![int(0), var("x")]),
                    ))],
                    else_stmts: vec![Placed::unplaced(Stmt::assign("y", var("x")))],
                },
            ],
        ),
        proc_decl(
            "clamp_sum",
            vec![
                in_param("a", TypeSpec::int()),
                in_param("b", TypeSpec::int()),
                out_param("s", TypeSpec::int()),
            ],
            vec![
                Stmt::assign("t", llvm_exp("add", vec![var("a"), var("b")])),
                Stmt::assign(
                    "big",
                    Placed::unplaced(Exp::llvm_op(
                        "icmp",
                        vec!["sgt".into()],
                        vec![var("t"), int(100)],
                    )),
                ),
                Stmt::Cond {
                    cond: var("big"),
                    then_stmts: vec![Placed::unplaced(Stmt::assign("s", int(100)))],
                    else_stmts: vec![Placed::unplaced(Stmt::assign("s", var("t")))],
                },
            ],
        ),
    ]);
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let module = &result.modules[&module_spec()];
    for pspec in module.all_proc_specs() {
        let def = module.proc_def(&pspec).unwrap();
        if let ProcImpl::Prim { proto, body, .. } = &def.impl_ {
            assert_proc_invariants(proto, body);
        }
    }
}
