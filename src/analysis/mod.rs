//! Bottom-up alias analysis over proc call graphs.
//!
//! For every proc the analysis computes an [`AliasMap`] over its formal
//! parameters: which parameters may refer to the same runtime value after a
//! call. Procs are processed by call-graph strongly-connected component,
//! callees first; a cyclic component is iterated to a fixed point. While
//! walking each body the analysis also rewrites `mutate` instructions whose
//! input reference provably has no other name and is in its final use,
//! setting their destructive flag so codegen reuses the storage in place.

pub mod alias_map;
pub mod last_use;

pub use alias_map::AliasMap;

use crate::diag::CompileError;
use crate::driver::Compiler;
use crate::modules::ProcImpl;
use crate::prim::{Prim, PrimArg, PrimFork, PrimProto, PrimVarName, ProcBody, ProcSpec};
use crate::types::ModSpec;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Per-proc analysis results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcAnalysis {
    /// Aliasing among the proc's formal parameters, as callers observe it.
    pub arg_alias_map: AliasMap,
}

/// Builtin operations that can make one argument an alias of another.
fn is_escapable(prim: &Prim) -> bool {
    matches!(
        prim,
        Prim::Foreign { lang, name, .. }
            if lang == "llvm"
                && (name == "move" || name == "mutate" || name == "access" || name == "cast")
    )
}

/// Runs final-use marking and alias analysis over every proc of a completed
/// module SCC.
pub fn analyse_modules(
    compiler: &mut Compiler,
    module_specs: &[ModSpec],
) -> Result<(), CompileError> {
    let mut procs: Vec<ProcSpec> = Vec::new();
    for spec in module_specs {
        if let Some(module) = compiler.module(spec) {
            procs.extend(module.all_proc_specs());
        }
    }
    // Mark final uses before any aliasing question is asked.
    for pspec in &procs {
        let Some(def) = compiler
            .module_mut(&pspec.module)
            .and_then(|m| m.proc_def_mut(pspec))
        else {
            continue;
        };
        if let ProcImpl::Prim { body, .. } = &mut def.impl_ {
            last_use::mark_final_uses(body);
        }
    }
    let local: HashSet<ProcSpec> = procs.iter().cloned().collect();
    let mut edges: HashMap<ProcSpec, Vec<ProcSpec>> = HashMap::new();
    for pspec in &procs {
        let mut callees = Vec::new();
        if let Some(ProcImpl::Prim { body, .. }) = proc_impl(compiler, pspec) {
            body.visit_prims(&mut |placed| {
                if let Prim::Call(callee, _) = &placed.node {
                    if local.contains(callee) {
                        callees.push(callee.clone());
                    }
                }
            });
        }
        edges.insert(pspec.clone(), callees);
    }
    let sccs = call_graph_sccs(&procs, &edges);
    for scc in &sccs {
        analyse_scc(compiler, scc, &edges)?;
    }
    Ok(())
}

fn proc_impl<'a>(compiler: &'a Compiler, spec: &ProcSpec) -> Option<&'a ProcImpl> {
    compiler
        .module(&spec.module)
        .and_then(|m| m.proc_def(spec))
        .map(|def| &def.impl_)
}

/// Analyses one proc SCC to a fixed point.
fn analyse_scc(
    compiler: &mut Compiler,
    scc: &[ProcSpec],
    edges: &HashMap<ProcSpec, Vec<ProcSpec>>,
) -> Result<(), CompileError> {
    let cyclic = scc.len() > 1
        || edges
            .get(&scc[0])
            .is_some_and(|callees| callees.contains(&scc[0]));
    loop {
        let mut changed = false;
        for pspec in scc {
            let Some(ProcImpl::Prim {
                proto,
                body,
                analysis,
            }) = proc_impl(compiler, pspec).cloned()
            else {
                continue;
            };
            let start_pairs = analysis.arg_alias_map.pairs();
            let (alias_map, new_body) = analyse_proc(compiler, &proto, body)?;
            let end_pairs = alias_map.pairs();
            // First-time population is not a change; only a later shift in
            // the canonical relation keeps the iteration going.
            if end_pairs != start_pairs && !start_pairs.is_empty() {
                changed = true;
            }
            debug!(
                target: "analysis",
                "analysed {pspec}: {} alias pairs", end_pairs.len()
            );
            if let Some(def) = compiler
                .module_mut(&pspec.module)
                .and_then(|m| m.proc_def_mut(pspec))
            {
                def.impl_ = ProcImpl::Prim {
                    proto,
                    body: new_body,
                    analysis: ProcAnalysis {
                        arg_alias_map: alias_map,
                    },
                };
            }
        }
        if !changed || !cyclic {
            return Ok(());
        }
    }
}

/// Analyses one proc body, returning the parameter alias map callers will
/// consume and the body with destructive flags settled.
fn analyse_proc(
    compiler: &Compiler,
    proto: &PrimProto,
    body: ProcBody,
) -> Result<(AliasMap, ProcBody), CompileError> {
    let params: HashSet<PrimVarName> = proto
        .params
        .iter()
        .filter(|p| !p.is_phantom())
        .map(|p| p.name.clone())
        .collect();
    let mut alias_map = AliasMap::new();
    let body = analyse_body(compiler, &params, &mut alias_map, body)?;
    // Callers only see the proc's own non-phantom parameters.
    alias_map.retain(|var| params.contains(var));
    Ok((alias_map, body))
}

fn analyse_body(
    compiler: &Compiler,
    params: &HashSet<PrimVarName>,
    alias_map: &mut AliasMap,
    mut body: ProcBody,
) -> Result<ProcBody, CompileError> {
    for placed in &mut body.prims {
        analyse_prim(compiler, params, alias_map, &mut placed.node)?;
    }
    body.fork = match body.fork {
        PrimFork::NoFork => PrimFork::NoFork,
        PrimFork::Fork {
            var,
            is_final,
            branches,
        } => {
            // Each branch is analysed from a fresh relation; afterwards the
            // branches join into this map by union, so two variables alias
            // if they alias in any branch.
            let mut analysed = Vec::with_capacity(branches.len());
            for branch in branches {
                let mut branch_map = AliasMap::new();
                analysed.push(analyse_body(compiler, params, &mut branch_map, branch)?);
                for (a, b) in branch_map.pairs() {
                    alias_map.unite(&a, &b);
                }
            }
            PrimFork::Fork {
                var,
                is_final,
                branches: analysed,
            }
        }
    };
    Ok(body)
}

fn analyse_prim(
    compiler: &Compiler,
    params: &HashSet<PrimVarName>,
    alias_map: &mut AliasMap,
    prim: &mut Prim,
) -> Result<(), CompileError> {
    if is_mutate(prim) {
        rewrite_mutate(alias_map, prim);
    }
    if is_escapable(prim) {
        // Every address-valued input may escape into every address-valued
        // output.
        let args: Vec<PrimArg> = prim.args().to_vec();
        for input in args.iter().filter(|a| a.is_input()) {
            let Some(in_name) = escapable_var(input) else {
                continue;
            };
            for output in args.iter().filter(|a| a.is_output()) {
                if let Some(out_name) = escapable_var(output) {
                    trace!(target: "analysis", "escape: {in_name} ~ {out_name}");
                    alias_map.unite(in_name, out_name);
                }
            }
        }
    } else if let Prim::Call(callee, args) = prim {
        apply_callee_aliasing(compiler, alias_map, callee, args);
    }
    // A variable at its final use that is not a parameter can no longer
    // alias anything the caller sees; drop it from the relation.
    let finals: Vec<PrimVarName> = prim
        .args()
        .iter()
        .filter(|a| a.is_final_use())
        .filter_map(|a| a.var_name().cloned())
        .filter(|name| !params.contains(name))
        .collect();
    for name in finals {
        alias_map.remove_key(&name);
    }
    Ok(())
}

/// An argument that can participate in aliasing: a variable of address
/// (non-value) type, or one whose type is still unknown.
fn escapable_var(arg: &PrimArg) -> Option<&PrimVarName> {
    match arg {
        PrimArg::Var { name, ty, .. } if !ty.is_value_type() => Some(name),
        _ => None,
    }
}

/// Interprets a callee's parameter aliasing at a call site: every unified
/// pair of callee parameters unites the corresponding actual argument
/// variables in the caller.
fn apply_callee_aliasing(
    compiler: &Compiler,
    alias_map: &mut AliasMap,
    callee: &ProcSpec,
    args: &[PrimArg],
) {
    let Some(ProcImpl::Prim {
        proto, analysis, ..
    }) = proc_impl(compiler, callee)
    else {
        return;
    };
    for (p, q) in analysis.arg_alias_map.pairs() {
        let actual = |param: &PrimVarName| -> Option<&PrimVarName> {
            let index = proto.params.iter().position(|pp| pp.name == *param)?;
            args.get(index).and_then(|arg| arg.var_name())
        };
        if let (Some(a), Some(b)) = (actual(&p), actual(&q)) {
            trace!(target: "analysis", "call {callee}: {a} ~ {b} via {p} ~ {q}");
            let (a, b) = (a.clone(), b.clone());
            alias_map.unite(&a, &b);
        }
    }
}

fn is_mutate(prim: &Prim) -> bool {
    matches!(
        prim,
        Prim::Foreign { lang, name, .. } if lang == "llvm" && name == "mutate"
    )
}

/// Argument layout of `mutate`: input reference, output reference, size,
/// offset, destructive flag, new value.
const MUTATE_IN_REF: usize = 0;
const MUTATE_FLAG: usize = 4;
const MUTATE_NEW_VAL: usize = 5;

/// Sets the destructive flag when the mutated reference has no other name
/// and this is its last use, so the write can happen in place.
fn rewrite_mutate(alias_map: &AliasMap, prim: &mut Prim) {
    let Prim::Foreign { args, .. } = prim else {
        return;
    };
    let Some(PrimArg::Int(flag, flag_ty)) = args.get(MUTATE_FLAG) else {
        return;
    };
    if *flag == 1 {
        return;
    }
    let flag_ty = flag_ty.clone();
    let Some(PrimArg::Var {
        name, final_use, ..
    }) = args.get(MUTATE_IN_REF)
    else {
        return;
    };
    if !final_use || !alias_map.is_singleton(name) {
        return;
    }
    // A pointer-valued new value smuggles another reference into the
    // structure; it must satisfy the same conditions.
    if let Some(PrimArg::Var {
        name: val_name,
        ty,
        final_use: val_final,
        ..
    }) = args.get(MUTATE_NEW_VAL)
    {
        if !ty.is_value_type() && (!val_final || !alias_map.is_singleton(val_name)) {
            return;
        }
    }
    debug!(target: "analysis", "mutate proven destructive");
    args[MUTATE_FLAG] = PrimArg::Int(1, flag_ty);
}

/// Tarjan's algorithm over the proc call graph; components come out
/// callees-first, the order the bottom-up traversal wants.
fn call_graph_sccs(
    procs: &[ProcSpec],
    edges: &HashMap<ProcSpec, Vec<ProcSpec>>,
) -> Vec<Vec<ProcSpec>> {
    struct Walk<'a> {
        edges: &'a HashMap<ProcSpec, Vec<ProcSpec>>,
        index: HashMap<ProcSpec, usize>,
        lowlink: HashMap<ProcSpec, usize>,
        on_stack: HashSet<ProcSpec>,
        stack: Vec<ProcSpec>,
        next_index: usize,
        sccs: Vec<Vec<ProcSpec>>,
    }

    impl Walk<'_> {
        fn visit(&mut self, v: &ProcSpec) {
            let v_index = self.next_index;
            self.next_index += 1;
            self.index.insert(v.clone(), v_index);
            self.lowlink.insert(v.clone(), v_index);
            self.stack.push(v.clone());
            self.on_stack.insert(v.clone());
            for w in self.edges.get(v).cloned().unwrap_or_default() {
                if !self.index.contains_key(&w) {
                    self.visit(&w);
                    let w_low = self.lowlink[&w];
                    let entry = self.lowlink.get_mut(v).expect("visited");
                    *entry = (*entry).min(w_low);
                } else if self.on_stack.contains(&w) {
                    let w_index = self.index[&w];
                    let entry = self.lowlink.get_mut(v).expect("visited");
                    *entry = (*entry).min(w_index);
                }
            }
            if self.lowlink[v] == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(&w);
                    let done = w == *v;
                    component.push(w);
                    if done {
                        break;
                    }
                }
                component.reverse();
                self.sccs.push(component);
            }
        }
    }

    let mut walk = Walk {
        edges,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        next_index: 0,
        sccs: Vec::new(),
    };
    for proc in procs {
        if !walk.index.contains_key(proc) {
            walk.visit(proc);
        }
    }
    walk.sccs
}
