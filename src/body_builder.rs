//! Assembly of lowered proc bodies.
//!
//! A [`BodyBuilder`] is a stateful writer over a partially-built
//! [`ProcBody`]. As instructions arrive it rewrites their inputs through the
//! current substitution, elides moves, folds constants, merges common
//! subexpressions, and constructs forks, so the body that comes out is
//! already optimised. A builder is single-owner: branch construction works
//! on isolated copies that never see each other's state.
//!
//! Three tables drive the rewriting:
//!
//! - `curr_subst` maps a variable to the argument future reads of it should
//!   see, recorded when a move into a temporary is elided or a common
//!   subexpression is merged;
//! - `out_subst` renames the outputs of already- or not-yet-emitted prims to
//!   their ultimate destination, recorded when a move out of a generated
//!   variable is elided; it is applied to emitted prims when the body is
//!   sealed;
//! - `sub_exprs` keys each emitted prim's input-only skeleton to its output
//!   arguments for common-subexpression elimination.

use crate::ast::pos::{OptPos, Placed};
use crate::diag::CompileError;
use crate::prim::{
    Prim, PrimArg, PrimArgs, PrimFlow, PrimFork, PrimVarName, ProcBody, FINAL_SUFFIX,
};
use crate::types::{is_generated_name, Ident, TypeSpec};
use log::{debug, trace};
use std::collections::{HashMap, HashSet};

/// Stateful writer assembling one proc body.
#[derive(Debug, Clone)]
pub struct BodyBuilder {
    /// Source names of the proc's output parameters; moves into these are
    /// real and never elided by the temporary rule.
    out_params: HashSet<Ident>,
    /// Instructions emitted so far in this body segment.
    prims: Vec<Placed<Prim>>,
    /// Input substitution: what a read of the keyed variable should become.
    curr_subst: HashMap<PrimVarName, PrimArg>,
    /// Output renaming, applied to emitted prims when the body is sealed.
    out_subst: HashMap<PrimVarName, PrimVarName>,
    /// Common-subexpression table: input-only skeleton to output arguments.
    sub_exprs: HashMap<Prim, Vec<PrimArg>>,
    /// Every variable defined so far, including inherited ancestor segments.
    defined: HashSet<PrimVarName>,
    /// Variables defined by prims of this segment only; renaming an
    /// ancestor's output from inside a branch would corrupt its siblings.
    segment_defined: HashSet<PrimVarName>,
    /// The fork sealing this body, once built.
    fork: Option<BuiltFork>,
}

#[derive(Debug, Clone)]
struct BuiltFork {
    var: PrimVarName,
    is_final: bool,
    branches: Vec<ProcBody>,
}

impl BodyBuilder {
    /// Creates a builder for a proc whose input parameters are already
    /// defined and whose output parameter names must not be elided.
    pub fn new(
        out_params: impl IntoIterator<Item = Ident>,
        defined_inputs: impl IntoIterator<Item = PrimVarName>,
    ) -> Self {
        Self {
            out_params: out_params.into_iter().collect(),
            prims: Vec::new(),
            curr_subst: HashMap::new(),
            out_subst: HashMap::new(),
            sub_exprs: HashMap::new(),
            defined: defined_inputs.into_iter().collect(),
            segment_defined: HashSet::new(),
            fork: None,
        }
    }

    /// A fresh builder for one branch of a fork: it inherits the parent's
    /// substitutions and CSE results but emits into its own segment.
    fn fork_child(&self) -> Self {
        Self {
            out_params: self.out_params.clone(),
            prims: Vec::new(),
            curr_subst: self.curr_subst.clone(),
            out_subst: self.out_subst.clone(),
            sub_exprs: self.sub_exprs.clone(),
            defined: self.defined.clone(),
            segment_defined: HashSet::new(),
            fork: None,
        }
    }

    /// Resolves an input argument through the current substitution.
    fn resolve_input(&self, arg: &PrimArg) -> PrimArg {
        let mut arg = arg.clone();
        loop {
            let PrimArg::Var {
                name,
                flow: PrimFlow::In,
                ..
            } = &arg
            else {
                return arg;
            };
            match self.curr_subst.get(name) {
                // The substitution is acyclic by construction, so this
                // terminates.
                Some(next) => arg = next.clone(),
                None => return arg,
            }
        }
    }

    /// Resolves an output variable name through the output renaming.
    fn resolve_output_name(&self, name: &PrimVarName) -> PrimVarName {
        let mut name = name.clone();
        while let Some(next) = self.out_subst.get(&name) {
            name = next.clone();
        }
        name
    }

    fn mark_defined(&mut self, name: PrimVarName) {
        self.defined.insert(name.clone());
        self.segment_defined.insert(name);
    }

    /// Adds one instruction to the body under construction.
    ///
    /// The prim may be dropped (nop, elided move, repeated subexpression),
    /// rewritten (substitution, constant folding), or emitted as is.
    pub fn instr(&mut self, prim: Prim, pos: OptPos) -> Result<(), CompileError> {
        if self.fork.is_some() {
            return Err(CompileError::Internal(format!(
                "instruction {prim} arrived after the body was sealed by a fork"
            )));
        }
        match prim {
            Prim::Nop => Ok(()),
            Prim::Fail => {
                self.prims.push(Placed::new(Prim::Fail, pos));
                Ok(())
            }
            Prim::Guard { var, value } => self.guard(var, value, pos),
            prim => self.instr_rewritten(prim, pos),
        }
    }

    /// A guard on a variable with a known value decides now: it becomes
    /// nothing or an unconditional failure.
    fn guard(&mut self, var: PrimVarName, value: i64, pos: OptPos) -> Result<(), CompileError> {
        let resolved = self.resolve_input(&PrimArg::input(var, TypeSpec::Unspecified));
        match resolved {
            PrimArg::Int(actual, _) => {
                if actual != value {
                    trace!(target: "body_builder", "guard on constant {actual} != {value}: fail");
                    self.prims.push(Placed::new(Prim::Fail, pos));
                }
                Ok(())
            }
            PrimArg::Var { name, .. } => {
                self.prims.push(Placed::new(Prim::Guard { var: name, value }, pos));
                Ok(())
            }
            other => Err(CompileError::Internal(format!(
                "guard on non-integer argument {other}"
            ))),
        }
    }

    fn instr_rewritten(&mut self, mut prim: Prim, pos: OptPos) -> Result<(), CompileError> {
        for arg in prim.args_mut() {
            if arg.is_input() {
                *arg = self.resolve_input(arg);
            } else if let PrimArg::Var { name, .. } = arg {
                *name = self.resolve_output_name(name);
            }
        }
        if let Some(folded) = fold_constant(&prim) {
            debug!(target: "body_builder", "folded {prim} to {folded}");
            prim = folded;
        }
        if prim.is_move() {
            if let Some(()) = self.try_elide_move(&prim) {
                return Ok(());
            }
            return self.emit(prim, pos, false);
        }
        let try_cse = cse_applies(&prim);
        self.emit(prim, pos, try_cse)
    }

    /// Move elision. Returns `Some(())` when the move was absorbed into a
    /// substitution and nothing is emitted.
    fn try_elide_move(&mut self, prim: &Prim) -> Option<()> {
        let [source, target] = prim.args() else {
            return None;
        };
        let PrimArg::Var {
            name: target_name,
            flow: PrimFlow::Out,
            ..
        } = target
        else {
            return None;
        };
        // A move into anything but an output parameter vanishes; future
        // reads of the target see the source. Output parameters must
        // materialise their value, so their moves stay.
        if !self.out_params.contains(&target_name.name) {
            trace!(target: "body_builder", "eliding move: {target_name} reads as {source}");
            self.curr_subst
                .insert(target_name.clone(), source.value_key());
            return Some(());
        }
        let PrimArg::Var {
            name: source_name,
            flow: PrimFlow::In,
            ty: source_ty,
            ..
        } = source
        else {
            return None;
        };
        if self.out_params.contains(&source_name.name) && source_name.suffix == FINAL_SUFFIX {
            return None;
        }
        if self.segment_defined.contains(source_name) {
            // The defining prim is in this segment: rename its output to the
            // move's target when the body is sealed.
            trace!(
                target: "body_builder",
                "eliding move: renaming definition of {source_name} to {target_name}"
            );
            self.out_subst
                .insert(source_name.clone(), target_name.clone());
            self.curr_subst.insert(
                source_name.clone(),
                PrimArg::input(target_name.clone(), source_ty.clone()),
            );
            self.mark_defined(target_name.clone());
            return Some(());
        }
        if is_generated_name(&source_name.name) && !self.defined.contains(source_name) {
            // The defining prim has not arrived yet: when it does, its
            // output is renamed straight to the move's target.
            trace!(
                target: "body_builder",
                "eliding move: forward-renaming {source_name} to {target_name}"
            );
            self.out_subst
                .insert(source_name.clone(), target_name.clone());
            return Some(());
        }
        None
    }

    /// Emits a prim, first consulting the common-subexpression table when
    /// the operation is eligible.
    fn emit(&mut self, prim: Prim, pos: OptPos, try_cse: bool) -> Result<(), CompileError> {
        if try_cse {
            let skeleton = input_skeleton(&prim);
            let outputs: Vec<PrimArg> = prim
                .args()
                .iter()
                .filter(|a| a.is_output())
                .cloned()
                .collect();
            if let Some(previous) = self.sub_exprs.get(&skeleton) {
                // Same operation on the same inputs: reuse the earlier
                // results instead of emitting again.
                debug!(target: "body_builder", "merged repeated {prim}");
                for (new_out, old_out) in outputs.iter().zip(previous.clone()) {
                    if let (Some(new_name), Some(old_name)) =
                        (new_out.var_name(), old_out.var_name())
                    {
                        let old_name = self.resolve_output_name(old_name);
                        self.curr_subst.insert(
                            new_name.clone(),
                            PrimArg::input(old_name, old_out.ty().clone()),
                        );
                    }
                }
                return Ok(());
            }
            self.sub_exprs.insert(skeleton, outputs);
        }
        for name in prim.output_var_names() {
            self.mark_defined(name.clone());
        }
        trace!(target: "body_builder", "emit {prim}");
        self.prims.push(Placed::new(prim, pos));
        Ok(())
    }

    /// Seals this body with a fork on `var` and builds each branch with
    /// `build`, which receives a branch-isolated builder.
    ///
    /// When the forked-on variable is already known to be a constant `n`,
    /// only branch `n` is built, inline, and no fork is emitted.
    pub fn build_fork<T>(
        &mut self,
        var: &PrimVarName,
        is_final: bool,
        branches: Vec<T>,
        mut build: impl FnMut(&mut BodyBuilder, T) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        if self.fork.is_some() {
            return Err(CompileError::Internal(
                "fork built after the body was already sealed".into(),
            ));
        }
        let resolved = self.resolve_input(&PrimArg::input(var.clone(), TypeSpec::Unspecified));
        match resolved {
            PrimArg::Int(value, _) => {
                let count = branches.len();
                let Ok(index) = usize::try_from(value) else {
                    return Err(CompileError::Internal(format!(
                        "fork on negative constant {value}"
                    )));
                };
                let Some(branch) = branches.into_iter().nth(index) else {
                    return Err(CompileError::Internal(format!(
                        "fork on constant {value} with only {count} branches"
                    )));
                };
                debug!(target: "body_builder", "fork on constant {value}: taking branch inline");
                build(self, branch)
            }
            PrimArg::Var { name, .. } => {
                if branches.len() < 2 {
                    return Err(CompileError::Internal(format!(
                        "fork on {name} with fewer than two branches"
                    )));
                }
                let mut built = Vec::with_capacity(branches.len());
                for branch in branches {
                    let mut child = self.fork_child();
                    build(&mut child, branch)?;
                    built.push(child.finish()?);
                }
                self.fork = Some(BuiltFork {
                    var: name,
                    is_final,
                    branches: built,
                });
                Ok(())
            }
            other => Err(CompileError::Internal(format!(
                "fork on non-integer argument {other}"
            ))),
        }
    }

    /// Binds the out parameter `name`, whose last assigned version is
    /// `version`, to its ultimate output value at the end of a branch.
    pub fn bind_output(
        &mut self,
        name: &Ident,
        version: i32,
        ty: &TypeSpec,
    ) -> Result<(), CompileError> {
        let current = PrimVarName::new(name.clone(), version);
        let ultimate = PrimVarName::ultimate(name.clone());
        self.instr(
            Prim::moves(
                PrimArg::input(current, ty.clone()),
                PrimArg::output(ultimate, ty.clone()),
            ),
            None,
        )
    }

    /// Seals the body: applies the output renaming to everything emitted
    /// and returns the finished tree.
    pub fn finish(mut self) -> Result<ProcBody, CompileError> {
        if !self.out_subst.is_empty() {
            for placed in &mut self.prims {
                for arg in placed.node.args_mut() {
                    if let PrimArg::Var {
                        name,
                        flow: PrimFlow::Out,
                        ..
                    } = arg
                    {
                        let renamed = resolve_chain(&self.out_subst, name);
                        *name = renamed;
                    }
                }
            }
        }
        let fork = match self.fork {
            None => PrimFork::NoFork,
            Some(BuiltFork {
                var,
                is_final,
                branches,
            }) => PrimFork::Fork {
                var,
                is_final,
                branches,
            },
        };
        Ok(ProcBody {
            prims: self.prims,
            fork,
        })
    }

    /// What a read of `name` currently resolves to, if anything was
    /// recorded.
    pub fn lookup_subst(&self, name: &PrimVarName) -> Option<&PrimArg> {
        self.curr_subst.get(name)
    }
}

fn resolve_chain(
    subst: &HashMap<PrimVarName, PrimVarName>,
    name: &PrimVarName,
) -> PrimVarName {
    let mut name = name.clone();
    while let Some(next) = subst.get(&name) {
        name = next.clone();
    }
    name
}

/// Whether the common-subexpression table may merge this prim.
///
/// Builtin `"llvm"` operations are pure. Proc calls are value-functions of
/// their arguments in this IR. Foreign calls in any other language, or
/// flagged impure, may have effects and are never merged.
fn cse_applies(prim: &Prim) -> bool {
    match prim {
        Prim::Call(..) => true,
        Prim::Foreign { lang, flags, .. } => {
            lang == "llvm" && !flags.iter().any(|f| f == "impure")
        }
        _ => false,
    }
}

/// The canonical input-only skeleton of a prim: outputs removed, value
/// identity normalised on the inputs.
fn input_skeleton(prim: &Prim) -> Prim {
    let keep_inputs = |args: &PrimArgs| -> PrimArgs {
        args.iter()
            .filter(|a| a.is_input())
            .map(PrimArg::value_key)
            .collect()
    };
    match prim {
        Prim::Call(spec, args) => Prim::Call(spec.clone(), keep_inputs(args)),
        Prim::Foreign {
            lang,
            name,
            flags,
            args,
        } => Prim::Foreign {
            lang: lang.clone(),
            name: name.clone(),
            flags: flags.clone(),
            args: keep_inputs(args),
        },
        other => other.clone(),
    }
}

/// Constant folding for builtin `"llvm"` arithmetic and comparisons.
///
/// When every input is a literal of the right kind the operation happens at
/// compile time and the prim becomes a move of the result. Integer division
/// by zero is left alone so the runtime traps as written.
fn fold_constant(prim: &Prim) -> Option<Prim> {
    let Prim::Foreign {
        lang,
        name,
        flags,
        args,
    } = prim
    else {
        return None;
    };
    if lang != "llvm" {
        return None;
    }
    let result = match (name.as_str(), args.as_slice()) {
        ("add", [PrimArg::Int(a, _), PrimArg::Int(b, _), out]) => {
            int_result(a.wrapping_add(*b), out)
        }
        ("sub", [PrimArg::Int(a, _), PrimArg::Int(b, _), out]) => {
            int_result(a.wrapping_sub(*b), out)
        }
        ("mul", [PrimArg::Int(a, _), PrimArg::Int(b, _), out]) => {
            int_result(a.wrapping_mul(*b), out)
        }
        ("div", [PrimArg::Int(a, _), PrimArg::Int(b, _), out]) => {
            if *b == 0 {
                return None;
            }
            int_result(a.wrapping_div(*b), out)
        }
        ("icmp", [PrimArg::Int(a, _), PrimArg::Int(b, _), out]) => {
            let holds = compare(flags.first()?, a.partial_cmp(b)?)?;
            int_result(holds as i64, out)
        }
        ("fadd", [PrimArg::Float(a, _), PrimArg::Float(b, _), out]) => float_result(a + b, out),
        ("fsub", [PrimArg::Float(a, _), PrimArg::Float(b, _), out]) => float_result(a - b, out),
        ("fmul", [PrimArg::Float(a, _), PrimArg::Float(b, _), out]) => float_result(a * b, out),
        ("fdiv", [PrimArg::Float(a, _), PrimArg::Float(b, _), out]) => {
            if *b == 0.0 {
                return None;
            }
            float_result(a / b, out)
        }
        ("fcmp", [PrimArg::Float(a, _), PrimArg::Float(b, _), out]) => {
            let holds = compare(flags.first()?, a.partial_cmp(b)?)?;
            int_result(holds as i64, out)
        }
        _ => return None,
    }?;
    let output = args.last()?.clone();
    Some(Prim::moves(result, output))
}

fn int_result(value: i64, out: &PrimArg) -> Option<PrimArg> {
    out.is_output().then(|| PrimArg::Int(value, out.ty().clone()))
}

fn float_result(value: f64, out: &PrimArg) -> Option<PrimArg> {
    out.is_output()
        .then(|| PrimArg::Float(value, out.ty().clone()))
}

fn compare(predicate: &Ident, ordering: std::cmp::Ordering) -> Option<bool> {
    use std::cmp::Ordering::*;
    Some(match predicate.as_str() {
        "eq" => ordering == Equal,
        "ne" => ordering != Equal,
        "slt" => ordering == Less,
        "sle" => ordering != Greater,
        "sgt" => ordering == Greater,
        "sge" => ordering != Less,
        _ => return None,
    })
}
