//! Shared helpers for integration tests: AST construction shortcuts,
//! single-module compilation, and structural invariant checks over lowered
//! bodies.
#![allow(dead_code)]

use std::collections::HashSet;
use wybec::ast::{Exp, Item, Param, ParamFlow, Placed, ProcProto, Stmt};
use wybec::prim::{Prim, PrimArg, PrimFlow, PrimFork, PrimVarName, ProcBody};
use wybec::types::{ModSpec, TypeSpec, Visibility};
use wybec::{compile, CompileResult, CompilerOptions, PrimProto, ProcImpl};

/// The module every single-module test compiles into.
pub fn module_spec() -> ModSpec {
    ModSpec::new(["test"])
}

/// Compiles one module from the given items.
pub fn compile_items(items: Vec<Item>) -> CompileResult {
    let spec = module_spec();
    let placed = items.into_iter().map(Placed::unplaced).collect();
    compile(CompilerOptions::default(), vec![(spec.clone(), placed)], &spec)
        .expect("no internal compiler errors expected")
}

/// A deterministic public proc declaration.
pub fn proc_decl(name: &str, params: Vec<Param>, body: Vec<Stmt>) -> Item {
    Item::ProcDecl {
        visibility: Visibility::Public,
        det: Default::default(),
        proto: ProcProto::new(name, params),
        body: body.into_iter().map(Placed::unplaced).collect(),
    }
}

pub fn in_param(name: &str, ty: TypeSpec) -> Param {
    Param::new(name, ty, ParamFlow::In)
}

pub fn out_param(name: &str, ty: TypeSpec) -> Param {
    Param::new(name, ty, ParamFlow::Out)
}

pub fn var(name: &str) -> Placed<Exp> {
    Placed::unplaced(Exp::var_get(name))
}

pub fn set(name: &str) -> Placed<Exp> {
    Placed::unplaced(Exp::var_set(name))
}

pub fn int(value: i64) -> Placed<Exp> {
    Placed::unplaced(Exp::IntValue(value))
}

/// `op(args)` as a builtin operator expression.
pub fn llvm_exp(op: &str, args: Vec<Placed<Exp>>) -> Placed<Exp> {
    Placed::unplaced(Exp::llvm_op(op, vec![], args))
}

/// The lowered proto and body of the named proc's first overload.
pub fn lowered<'a>(result: &'a CompileResult, name: &str) -> (&'a PrimProto, &'a ProcBody) {
    lowered_id(result, name, 0)
}

/// The lowered proto and body of one overload of the named proc.
pub fn lowered_id<'a>(
    result: &'a CompileResult,
    name: &str,
    id: usize,
) -> (&'a PrimProto, &'a ProcBody) {
    let module = &result.modules[&module_spec()];
    let defs = module.lookup_procs(&name.into());
    assert!(defs.len() > id, "proc `{name}` overload {id} not found");
    match &defs[id].impl_ {
        ProcImpl::Prim { proto, body, .. } => (proto, body),
        other => panic!("proc `{name}` not in primitive form: {other:?}"),
    }
}

/// Renders a body to one prim per line for shape assertions.
pub fn prim_lines(body: &ProcBody) -> Vec<String> {
    body.all_prims()
        .iter()
        .map(|p| p.node.to_string())
        .collect()
}

/// Checks every structural invariant a lowered proc must satisfy.
pub fn assert_proc_invariants(proto: &PrimProto, body: &ProcBody) {
    assert_ssa(proto, body);
    assert_scope(proto, body);
    assert_fork_arity(body);
}

fn input_params(proto: &PrimProto) -> HashSet<PrimVarName> {
    proto
        .params
        .iter()
        .filter(|p| p.flow == PrimFlow::In)
        .map(|p| p.name.clone())
        .collect()
}

/// SSA: no variable is assigned twice along any root-to-leaf path.
pub fn assert_ssa(proto: &PrimProto, body: &ProcBody) {
    ssa_walk(body, input_params(proto), &proto.name);
}

fn ssa_walk(body: &ProcBody, mut defined: HashSet<PrimVarName>, proc: &str) {
    for placed in &body.prims {
        for name in placed.node.output_var_names() {
            assert!(
                defined.insert(name.clone()),
                "{proc}: `{name}` assigned twice on one path"
            );
        }
    }
    if let PrimFork::Fork { branches, .. } = &body.fork {
        for branch in branches {
            ssa_walk(branch, defined.clone(), proc);
        }
    }
}

/// Scope: every variable read is a parameter or defined by an earlier prim
/// on the same path.
pub fn assert_scope(proto: &PrimProto, body: &ProcBody) {
    scope_walk(body, input_params(proto), &proto.name);
}

fn scope_walk(body: &ProcBody, mut defined: HashSet<PrimVarName>, proc: &str) {
    for placed in &body.prims {
        for name in placed.node.input_var_names() {
            assert!(
                defined.contains(name),
                "{proc}: `{name}` read before definition"
            );
        }
        for name in placed.node.output_var_names() {
            defined.insert(name.clone());
        }
    }
    if let PrimFork::Fork { var, branches, .. } = &body.fork {
        assert!(defined.contains(var), "{proc}: fork on undefined `{var}`");
        for branch in branches {
            scope_walk(branch, defined.clone(), proc);
        }
    }
}

/// Every fork has at least two branches, recursively.
pub fn assert_fork_arity(body: &ProcBody) {
    if let PrimFork::Fork { branches, .. } = &body.fork {
        assert!(branches.len() >= 2, "fork with {} branches", branches.len());
        for branch in branches {
            assert_fork_arity(branch);
        }
    }
}

/// True if the prim is a call to the named proc.
pub fn is_call_to(prim: &Prim, name: &str) -> bool {
    matches!(prim, Prim::Call(spec, _) if spec.name == name)
}

/// The destructive flag of a `mutate` prim.
pub fn mutate_flag(prim: &Prim) -> Option<i64> {
    match prim {
        Prim::Foreign {
            lang, name, args, ..
        } if lang == "llvm" && name == "mutate" => match args.get(4) {
            Some(PrimArg::Int(flag, _)) => Some(*flag),
            _ => None,
        },
        _ => None,
    }
}
