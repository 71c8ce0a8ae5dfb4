//! Control-flow lowering: structured statements to fork trees.
//!
//! Linear statements accumulate into the current body. A conditional seals
//! the body with a fork on its (Boolean) condition variable, false branch at
//! index 0. A `do` loop is lifted into a fresh private proc that calls
//! itself at its tail, so `break` lowers to a plain return and `next` to a
//! self call. A conditional followed by more statements sends both branches
//! through a fresh continuation proc carrying the live values, so branches
//! never structurally rejoin; a conditional at the proc tail forks final.
//!
//! Variables are renamed into SSA form here: each assignment of a source
//! name gets the next numeric suffix, and out parameters are bound to their
//! suffix `-1` ultimate value at every path end.

use crate::ast::pos::{OptPos, Placed};
use crate::ast::{Determinism, Exp, Param, ParamFlow, ProcProto, Stmt};
use crate::body_builder::BodyBuilder;
use crate::diag::{CompileError, Diag, DiagKind};
use crate::driver::{Compiler, ResolveFailure};
use crate::flatten::atomic_type;
use crate::modules::{ProcDef, ProcImpl};
use crate::prim::{
    FlowTag, Prim, PrimArg, PrimArgs, PrimFlow, PrimParam, PrimProto, PrimVarName, ProcBody,
    ProcSpec,
};
use crate::types::{Ident, ModSpec, TypeSpec, Visibility};
use log::debug;
use std::collections::{BTreeSet, HashMap};

/// The implicit Boolean output of a semi-deterministic proc.
pub const SUCCESS_VAR: &str = "$success";

/// Outcome of lowering one proc.
pub struct UnbranchResult {
    /// The lowered prototype.
    pub proto: PrimProto,
    /// The lowered body tree.
    pub body: ProcBody,
    /// Private procs generated along the way: lifted loops and
    /// continuations, already in primitive form.
    pub generated: Vec<ProcDef>,
}

/// Lowers one proc's flattened statements to a fork tree.
pub fn unbranch_proc(
    compiler: &Compiler,
    module: &ModSpec,
    proto: &ProcProto,
    det: Determinism,
    stmts: Vec<Placed<Stmt>>,
    tmp_count: usize,
    gen_count: &mut usize,
    diags: &mut Vec<Diag>,
) -> Result<UnbranchResult, CompileError> {
    let mut unbrancher = Unbrancher {
        compiler,
        module: module.clone(),
        gen_count,
        diags,
        generated: Vec::new(),
    };
    let semidet = det == Determinism::SemiDet;
    let prim_proto = source_prim_proto(proto, semidet);
    let mut state = LowerState::for_source_proto(proto, semidet, tmp_count);
    let mut builder = builder_for(&prim_proto);
    unbrancher.lower_seq(&mut state, &mut builder, &stmts)?;
    let body = builder.finish()?;
    debug!(target: "unbranch", "lowered {}:\n{body}", prim_proto.name);
    Ok(UnbranchResult {
        proto: prim_proto,
        body,
        generated: unbrancher.generated,
    })
}

/// What a linear path does when it falls off the end of its statements.
#[derive(Debug, Clone)]
enum Tail {
    /// Bind the proc's outputs and return.
    Return,
    /// Start the next iteration of the enclosing loop proc.
    Repeat,
    /// Call a continuation proc carrying the live values.
    CallCont(CallTarget),
}

/// Everything needed to emit a call to a generated proc.
#[derive(Debug, Clone)]
struct CallTarget {
    spec: ProcSpec,
    ins: Vec<(Ident, TypeSpec)>,
    outs: Vec<(Ident, TypeSpec)>,
    semidet: bool,
}

/// Per-proc lowering state; cloned at forks so branches rename
/// independently.
#[derive(Debug, Clone)]
struct LowerState {
    /// Current SSA suffix for every bound variable.
    versions: HashMap<Ident, i32>,
    /// Best-known type for every variable.
    var_types: HashMap<Ident, TypeSpec>,
    /// The proc's declared outputs, to bind at a return.
    outs: Vec<(Ident, TypeSpec)>,
    /// Whether this proc carries the implicit success output.
    semidet: bool,
    /// Counter for fresh temporaries.
    tmp_count: usize,
    /// The enclosing loop proc, for `break` and `next`.
    loop_ctx: Option<CallTarget>,
    /// End-of-path behaviour.
    tail: Tail,
}

impl LowerState {
    fn for_source_proto(proto: &ProcProto, semidet: bool, tmp_count: usize) -> Self {
        let mut versions = HashMap::new();
        let mut var_types = HashMap::new();
        let mut outs = Vec::new();
        for param in &proto.params {
            var_types.insert(param.name.clone(), param.ty.clone());
            match param.flow {
                ParamFlow::In => {
                    versions.insert(param.name.clone(), 0);
                }
                ParamFlow::Out => {
                    outs.push((param.name.clone(), param.ty.clone()));
                }
                ParamFlow::InOut => {
                    versions.insert(param.name.clone(), 0);
                    outs.push((param.name.clone(), param.ty.clone()));
                }
            }
        }
        Self {
            versions,
            var_types,
            outs,
            semidet,
            tmp_count,
            loop_ctx: None,
            tail: Tail::Return,
        }
    }

    fn fresh_tmp(&mut self) -> Ident {
        let name = format!("$tmp{}", self.tmp_count);
        self.tmp_count += 1;
        name.into()
    }

    fn var_type(&self, name: &Ident) -> TypeSpec {
        self.var_types.get(name).cloned().unwrap_or_default()
    }

    /// The next SSA version of `name`, recording the assignment.
    fn bump(&mut self, name: &Ident) -> i32 {
        let next = self.versions.get(name).map_or(0, |v| v + 1);
        self.versions.insert(name.clone(), next);
        next
    }
}

/// Lowers a source prototype: in parameters keep suffix 0, out parameters
/// become the ultimate value, and an in/out parameter splits into both
/// halves. Semi-det procs gain the implicit success output.
fn source_prim_proto(proto: &ProcProto, semidet: bool) -> PrimProto {
    let mut params = Vec::new();
    for param in &proto.params {
        match param.flow {
            ParamFlow::In => params.push(PrimParam::new(
                PrimVarName::first(param.name.clone()),
                param.ty.clone(),
                PrimFlow::In,
            )),
            ParamFlow::Out => params.push(PrimParam::new(
                PrimVarName::ultimate(param.name.clone()),
                param.ty.clone(),
                PrimFlow::Out,
            )),
            ParamFlow::InOut => {
                params.push(PrimParam {
                    name: PrimVarName::first(param.name.clone()),
                    ty: param.ty.clone(),
                    flow: PrimFlow::In,
                    flow_tag: FlowTag::FirstHalf,
                });
                params.push(PrimParam {
                    name: PrimVarName::ultimate(param.name.clone()),
                    ty: param.ty.clone(),
                    flow: PrimFlow::Out,
                    flow_tag: FlowTag::SecondHalf,
                });
            }
        }
    }
    if semidet {
        params.push(PrimParam {
            name: PrimVarName::ultimate(SUCCESS_VAR),
            ty: TypeSpec::bool(),
            flow: PrimFlow::Out,
            flow_tag: FlowTag::Implicit,
        });
    }
    PrimProto::new(proto.name.clone(), params)
}

/// A prototype for a generated proc from sorted in/out variable lists.
fn gen_prim_proto(
    name: &Ident,
    ins: &[(Ident, TypeSpec)],
    outs: &[(Ident, TypeSpec)],
    semidet: bool,
) -> PrimProto {
    let mut params = Vec::new();
    for (var, ty) in ins {
        params.push(PrimParam::new(
            PrimVarName::first(var.clone()),
            ty.clone(),
            PrimFlow::In,
        ));
    }
    for (var, ty) in outs {
        params.push(PrimParam::new(
            PrimVarName::ultimate(var.clone()),
            ty.clone(),
            PrimFlow::Out,
        ));
    }
    if semidet {
        params.push(PrimParam {
            name: PrimVarName::ultimate(SUCCESS_VAR),
            ty: TypeSpec::bool(),
            flow: PrimFlow::Out,
            flow_tag: FlowTag::Implicit,
        });
    }
    PrimProto::new(name.clone(), params)
}

fn builder_for(proto: &PrimProto) -> BodyBuilder {
    BodyBuilder::new(
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
    )
}

struct Unbrancher<'a> {
    compiler: &'a Compiler,
    module: ModSpec,
    gen_count: &'a mut usize,
    diags: &'a mut Vec<Diag>,
    generated: Vec<ProcDef>,
}

impl Unbrancher<'_> {
    fn fresh_proc_name(&mut self, kind: &str) -> Ident {
        let name = format!("${kind}{}", self.gen_count);
        *self.gen_count += 1;
        name.into()
    }

    /// Lowers a statement sequence and whatever its tail requires.
    fn lower_seq(
        &mut self,
        st: &mut LowerState,
        b: &mut BodyBuilder,
        stmts: &[Placed<Stmt>],
    ) -> Result<(), CompileError> {
        for (i, stmt) in stmts.iter().enumerate() {
            let rest = &stmts[i + 1..];
            match &stmt.node {
                Stmt::Cond {
                    cond,
                    then_stmts,
                    else_stmts,
                } => {
                    return self.lower_cond(st, b, cond, then_stmts, else_stmts, rest, &stmt.pos);
                }
                Stmt::Loop { body } => {
                    return self.lower_loop(st, b, body, rest, &stmt.pos);
                }
                Stmt::Break => {
                    self.warn_unreachable(rest, "break");
                    return self.lower_break(st, b, &stmt.pos);
                }
                Stmt::Next => {
                    self.warn_unreachable(rest, "next");
                    return self.lower_next(st, b, &stmt.pos);
                }
                _ => self.lower_linear(st, b, stmt)?,
            }
        }
        self.lower_tail(st, b)
    }

    fn warn_unreachable(&mut self, rest: &[Placed<Stmt>], after: &str) {
        if let Some(first) = rest.first() {
            self.diags.push(
                Diag::warning(
                    DiagKind::General,
                    format!("statements after `{after}` are unreachable"),
                )
                .at(first.pos.clone()),
            );
        }
    }

    /// End of a linear path: return, repeat, or continue.
    fn lower_tail(&mut self, st: &mut LowerState, b: &mut BodyBuilder) -> Result<(), CompileError> {
        match st.tail.clone() {
            Tail::Return => {
                for (name, ty) in st.outs.clone() {
                    match st.versions.get(&name).copied() {
                        Some(version) => b.bind_output(&name, version, &ty)?,
                        None => self.diags.push(Diag::error(
                            DiagKind::FlowMode,
                            format!("output parameter `{name}` is never bound"),
                        )),
                    }
                }
                if st.semidet {
                    b.instr(
                        Prim::moves(
                            PrimArg::Int(1, TypeSpec::bool()),
                            PrimArg::output(PrimVarName::ultimate(SUCCESS_VAR), TypeSpec::bool()),
                        ),
                        None,
                    )?;
                }
                Ok(())
            }
            Tail::Repeat => {
                let Some(target) = st.loop_ctx.clone() else {
                    return Err(CompileError::Internal(
                        "loop tail outside a loop proc".into(),
                    ));
                };
                self.emit_tail_call(st, b, &target, &None)
            }
            Tail::CallCont(target) => self.emit_tail_call(st, b, &target, &None),
        }
    }

    /// Emits a call whose outputs are this proc's own outputs: the tail call
    /// of a loop iteration or the jump into a continuation.
    fn emit_tail_call(
        &mut self,
        st: &mut LowerState,
        b: &mut BodyBuilder,
        target: &CallTarget,
        pos: &OptPos,
    ) -> Result<(), CompileError> {
        let mut args = PrimArgs::new();
        for (name, ty) in &target.ins {
            match st.versions.get(name).copied() {
                Some(version) => args.push(PrimArg::input(
                    PrimVarName::new(name.clone(), version),
                    ty.clone(),
                )),
                None => {
                    self.diags.push(
                        Diag::error(
                            DiagKind::FlowMode,
                            format!("`{name}` may be unbound here"),
                        )
                        .at(pos.clone()),
                    );
                    return Ok(());
                }
            }
        }
        for (name, ty) in &target.outs {
            args.push(PrimArg::output(
                PrimVarName::ultimate(name.clone()),
                ty.clone(),
            ));
        }
        if target.semidet {
            args.push(PrimArg::output(
                PrimVarName::ultimate(SUCCESS_VAR),
                TypeSpec::bool(),
            ));
        }
        b.instr(Prim::Call(target.spec.clone(), args), pos.clone())
    }

    fn lower_break(
        &mut self,
        st: &mut LowerState,
        b: &mut BodyBuilder,
        pos: &OptPos,
    ) -> Result<(), CompileError> {
        if st.loop_ctx.is_none() {
            self.diags.push(
                Diag::error(DiagKind::FlowMode, "`break` outside a loop").at(pos.clone()),
            );
            return Ok(());
        }
        // Leaving the loop is a plain return from the loop proc.
        let mut returning = st.clone();
        returning.tail = Tail::Return;
        self.lower_tail(&mut returning, b)
    }

    fn lower_next(
        &mut self,
        st: &mut LowerState,
        b: &mut BodyBuilder,
        pos: &OptPos,
    ) -> Result<(), CompileError> {
        let Some(target) = st.loop_ctx.clone() else {
            self.diags
                .push(Diag::error(DiagKind::FlowMode, "`next` outside a loop").at(pos.clone()));
            return Ok(());
        };
        self.emit_tail_call(st, b, &target, pos)
    }

    /// A conditional: seal the body with a fork, false branch first. A
    /// conditional with following statements routes both branches through a
    /// fresh continuation proc so they never rejoin.
    #[allow(clippy::too_many_arguments)]
    fn lower_cond(
        &mut self,
        st: &mut LowerState,
        b: &mut BodyBuilder,
        cond: &Placed<Exp>,
        then_stmts: &[Placed<Stmt>],
        else_stmts: &[Placed<Stmt>],
        rest: &[Placed<Stmt>],
        pos: &OptPos,
    ) -> Result<(), CompileError> {
        let Some(cond_args) = self.convert_arg(st, cond) else {
            return Ok(());
        };
        let [cond_arg] = cond_args.as_slice() else {
            self.diags.push(
                Diag::error(DiagKind::FlowMode, "condition must be a value").at(pos.clone()),
            );
            return Ok(());
        };
        // A constant condition selects its branch at compile time.
        if let PrimArg::Int(value, _) = cond_arg {
            let chosen = if *value != 0 { then_stmts } else { else_stmts };
            let merged: Vec<Placed<Stmt>> = chosen.iter().chain(rest).cloned().collect();
            debug!(target: "unbranch", "constant condition {value}: folding branch");
            return self.lower_seq(st, b, &merged);
        }
        let PrimArg::Var { name, .. } = cond_arg else {
            self.diags.push(
                Diag::error(DiagKind::Type, "condition must be a Boolean variable")
                    .at(pos.clone()),
            );
            return Ok(());
        };
        let cond_var = name.clone();
        let mut branch_states = [st.clone(), st.clone()];
        if rest.is_empty() {
            // Tail fork: both branches are terminal.
            let branches: Vec<(usize, &[Placed<Stmt>])> =
                vec![(0, else_stmts), (1, then_stmts)];
            b.build_fork(&cond_var, true, branches, |builder, (index, stmts)| {
                let branch_state = &mut branch_states[index];
                self.lower_seq(branch_state, builder, stmts)
            })
        } else {
            // Values the continuation can rely on: whatever is already
            // bound, plus whatever both branches bind.
            let mut available: BTreeSet<Ident> = st.versions.keys().cloned().collect();
            let both: BTreeSet<Ident> = assigned_vars(then_stmts)
                .intersection(&assigned_vars(else_stmts))
                .cloned()
                .collect();
            available.extend(both);
            let cont = self.make_continuation(st, rest, &available, pos)?;
            let branches: Vec<(usize, &[Placed<Stmt>])> =
                vec![(0, else_stmts), (1, then_stmts)];
            b.build_fork(&cond_var, false, branches, |builder, (index, stmts)| {
                let branch_state = &mut branch_states[index];
                branch_state.tail = Tail::CallCont(cont.clone());
                self.lower_seq(branch_state, builder, stmts)
            })
        }
    }

    /// Lifts the statements following a conditional into a private proc
    /// taking the values live at its entry.
    fn make_continuation(
        &mut self,
        st: &LowerState,
        rest: &[Placed<Stmt>],
        available: &BTreeSet<Ident>,
        pos: &OptPos,
    ) -> Result<CallTarget, CompileError> {
        let needed = free_reads(rest, &tail_reads(st), &loop_reads(st));
        let ins: Vec<(Ident, TypeSpec)> = needed
            .into_iter()
            .filter(|name| available.contains(name))
            .map(|name| (name.clone(), st.var_type(&name)))
            .collect();
        let name = self.fresh_proc_name("cont");
        let spec = ProcSpec::new(self.module.clone(), name.clone(), 0);
        let target = CallTarget {
            spec,
            ins: ins.clone(),
            outs: st.outs.clone(),
            semidet: st.semidet,
        };
        debug!(target: "unbranch", "continuation {name} carries {} values", ins.len());
        let proto = gen_prim_proto(&name, &ins, &st.outs, st.semidet);
        let mut cont_state = LowerState {
            versions: ins.iter().map(|(n, _)| (n.clone(), 0)).collect(),
            var_types: st.var_types.clone(),
            outs: st.outs.clone(),
            semidet: st.semidet,
            tmp_count: st.tmp_count,
            loop_ctx: st.loop_ctx.clone(),
            tail: st.tail.clone(),
        };
        let mut builder = builder_for(&proto);
        self.lower_seq(&mut cont_state, &mut builder, rest)?;
        let body = builder.finish()?;
        self.register_generated(proto, body, pos);
        Ok(target)
    }

    /// Lifts a loop body into a private tail-recursive proc and calls it.
    fn lower_loop(
        &mut self,
        st: &mut LowerState,
        b: &mut BodyBuilder,
        body: &[Placed<Stmt>],
        rest: &[Placed<Stmt>],
        pos: &OptPos,
    ) -> Result<(), CompileError> {
        let rest_needs = free_reads(rest, &tail_reads(st), &loop_reads(st));
        let assigned = assigned_vars(body);
        // What the loop must deliver: values it may change that are wanted
        // afterwards.
        let outs: Vec<(Ident, TypeSpec)> = rest_needs
            .iter()
            .filter(|name| assigned.contains(*name))
            .map(|name| (name.clone(), st.var_type(name)))
            .collect();
        let out_names: BTreeSet<Ident> = outs.iter().map(|(n, _)| n.clone()).collect();
        let body_needs = free_reads(body, &out_names, &BTreeSet::new());
        let ins: Vec<(Ident, TypeSpec)> = body_needs
            .union(&rest_needs)
            .filter(|name| st.versions.contains_key(*name))
            .map(|name| (name.clone(), st.var_type(name)))
            .collect();
        let name = self.fresh_proc_name("loop");
        let spec = ProcSpec::new(self.module.clone(), name.clone(), 0);
        let target = CallTarget {
            spec: spec.clone(),
            ins: ins.clone(),
            outs: outs.clone(),
            semidet: false,
        };
        debug!(
            target: "unbranch",
            "loop proc {name}: {} in, {} out", ins.len(), outs.len()
        );
        let proto = gen_prim_proto(&name, &ins, &outs, false);
        let mut loop_state = LowerState {
            versions: ins.iter().map(|(n, _)| (n.clone(), 0)).collect(),
            var_types: st.var_types.clone(),
            outs: outs.clone(),
            semidet: false,
            tmp_count: 0,
            loop_ctx: Some(target.clone()),
            tail: Tail::Repeat,
        };
        let mut builder = builder_for(&proto);
        self.lower_seq(&mut loop_state, &mut builder, body)?;
        let lowered = builder.finish()?;
        self.register_generated(proto, lowered, pos);
        // Call the loop where the `do` stood, then carry on.
        let mut args = PrimArgs::new();
        for (in_name, ty) in &ins {
            let version = st.versions.get(in_name).copied().unwrap_or(0);
            args.push(PrimArg::input(
                PrimVarName::new(in_name.clone(), version),
                ty.clone(),
            ));
        }
        for (out_name, ty) in &outs {
            let version = st.bump(out_name);
            args.push(PrimArg::output(
                PrimVarName::new(out_name.clone(), version),
                ty.clone(),
            ));
        }
        b.instr(Prim::Call(spec, args), pos.clone())?;
        self.lower_seq(st, b, rest)
    }

    fn register_generated(&mut self, proto: PrimProto, body: ProcBody, pos: &OptPos) {
        let source_proto = ProcProto::new(
            proto.name.clone(),
            proto
                .params
                .iter()
                .map(|p| {
                    Param::new(
                        p.name.name.clone(),
                        p.ty.clone(),
                        match p.flow {
                            PrimFlow::In => ParamFlow::In,
                            PrimFlow::Out => ParamFlow::Out,
                        },
                    )
                })
                .collect(),
        );
        let mut def = ProcDef::new(
            source_proto,
            Determinism::Det,
            Visibility::Private,
            Vec::new(),
            pos.clone(),
        );
        def.impl_ = ProcImpl::Prim {
            proto,
            body,
            analysis: Default::default(),
        };
        self.generated.push(def);
    }

    /// Lowers a linear statement: a proc call, a foreign call, or a
    /// unification test.
    fn lower_linear(
        &mut self,
        st: &mut LowerState,
        b: &mut BodyBuilder,
        stmt: &Placed<Stmt>,
    ) -> Result<(), CompileError> {
        match &stmt.node {
            Stmt::ProcCall { name, args, .. } if name == "=" => {
                self.lower_unify_test(st, b, args, &stmt.pos)
            }
            Stmt::ProcCall { name, args, .. } => self.lower_call(st, b, name, args, &stmt.pos),
            Stmt::ForeignCall {
                lang,
                name,
                flags,
                args,
            } => {
                let Some(prim_args) = self.convert_args(st, args) else {
                    return Ok(());
                };
                b.instr(
                    Prim::Foreign {
                        lang: lang.clone(),
                        name: name.clone(),
                        flags: flags.clone(),
                        args: prim_args,
                    },
                    stmt.pos.clone(),
                )
            }
            Stmt::Nop => Ok(()),
            other => Err(CompileError::Internal(format!(
                "unexpected statement shape after flattening: {other:?}"
            ))),
        }
    }

    /// `a = b` with both sides bound is a test: equality compare plus a
    /// guard on the result.
    fn lower_unify_test(
        &mut self,
        st: &mut LowerState,
        b: &mut BodyBuilder,
        args: &[Placed<Exp>],
        pos: &OptPos,
    ) -> Result<(), CompileError> {
        if !st.semidet {
            self.diags.push(
                Diag::error(
                    DiagKind::FlowMode,
                    "equality test in a deterministic context",
                )
                .at(pos.clone()),
            );
            return Ok(());
        }
        let Some(prim_args) = self.convert_args(st, args) else {
            return Ok(());
        };
        let tmp = st.fresh_tmp();
        let version = st.bump(&tmp);
        let test_var = PrimVarName::new(tmp, version);
        let mut cmp_args = prim_args;
        cmp_args.push(PrimArg::output(test_var.clone(), TypeSpec::bool()));
        b.instr(Prim::llvm("icmp", vec!["eq".into()], cmp_args), pos.clone())?;
        b.instr(
            Prim::Guard {
                var: test_var,
                value: 1,
            },
            pos.clone(),
        )
    }

    fn lower_call(
        &mut self,
        st: &mut LowerState,
        b: &mut BodyBuilder,
        name: &Ident,
        args: &[Placed<Exp>],
        pos: &OptPos,
    ) -> Result<(), CompileError> {
        let flows = arg_flows(args);
        let (spec, reified_test) = match self.compiler.resolve_proc(&self.module, name, &flows) {
            Ok(spec) => (spec, false),
            Err(ResolveFailure::Ambiguous(candidates)) => {
                self.diags.push(
                    Diag::error(
                        DiagKind::NameResolution,
                        format!("ambiguous call to `{name}`"),
                    )
                    .at(pos.clone())
                    .with_note(format!("{} procs match", candidates.len())),
                );
                return Ok(());
            }
            Err(ResolveFailure::Unknown) => {
                // A test proc called with one extra out argument reifies its
                // success as that argument.
                let reified = match flows.split_last() {
                    Some((ParamFlow::Out, leading)) => self
                        .compiler
                        .resolve_proc(&self.module, name, leading)
                        .ok()
                        .filter(|spec| self.callee_det(spec) == Some(Determinism::SemiDet)),
                    _ => None,
                };
                match reified {
                    Some(spec) => (spec, true),
                    None => {
                        self.diags.push(
                            Diag::error(
                                DiagKind::NameResolution,
                                format!("no visible proc `{name}` with {} arguments", args.len()),
                            )
                            .at(pos.clone()),
                        );
                        return Ok(());
                    }
                }
            }
        };
        self.adopt_callee_types(st, &spec, args);
        let Some(mut prim_args) = self.convert_args(st, args) else {
            return Ok(());
        };
        let callee_det = self.callee_det(&spec).unwrap_or(Determinism::Det);
        if callee_det == Determinism::SemiDet && !reified_test {
            // Statement position: the implicit success output feeds a guard.
            if !st.semidet {
                self.diags.push(
                    Diag::error(
                        DiagKind::FlowMode,
                        format!("call to test proc `{name}` in a deterministic context"),
                    )
                    .at(pos.clone()),
                );
                return Ok(());
            }
            let tmp = st.fresh_tmp();
            let version = st.bump(&tmp);
            let success = PrimVarName::new(tmp, version);
            prim_args.push(PrimArg::Var {
                name: success.clone(),
                ty: TypeSpec::bool(),
                flow: PrimFlow::Out,
                flow_tag: FlowTag::Implicit,
                final_use: false,
            });
            b.instr(Prim::Call(spec, prim_args), pos.clone())?;
            return b.instr(
                Prim::Guard {
                    var: success,
                    value: 1,
                },
                pos.clone(),
            );
        }
        b.instr(Prim::Call(spec, prim_args), pos.clone())
    }

    fn callee_det(&self, spec: &ProcSpec) -> Option<Determinism> {
        self.compiler
            .module(&spec.module)
            .and_then(|m| m.proc_def(spec))
            .map(|def| def.det)
    }

    /// Adopts the callee's declared parameter types for arguments whose
    /// types are still unknown.
    fn adopt_callee_types(&self, st: &mut LowerState, spec: &ProcSpec, args: &[Placed<Exp>]) {
        let Some(def) = self
            .compiler
            .module(&spec.module)
            .and_then(|m| m.proc_def(spec))
        else {
            return;
        };
        for (param, arg) in def.proto.params.iter().zip(args) {
            if let Exp::Var { name, .. } = strip_type(&arg.node) {
                if param.ty.is_specified() && !st.var_types.contains_key(name) {
                    st.var_types.insert(name.clone(), param.ty.clone());
                }
            }
        }
    }

    fn convert_args(&mut self, st: &mut LowerState, args: &[Placed<Exp>]) -> Option<PrimArgs> {
        let mut out = PrimArgs::new();
        for arg in args {
            out.extend(self.convert_arg(st, arg)?);
        }
        Some(out)
    }

    /// Converts one atomic expression to primitive arguments; an in/out
    /// variable becomes its two halves. `None` means a diagnostic was
    /// recorded and the statement should be dropped.
    fn convert_arg(&mut self, st: &mut LowerState, arg: &Placed<Exp>) -> Option<Vec<PrimArg>> {
        let declared = atomic_type(&arg.node);
        match strip_type(&arg.node) {
            Exp::IntValue(n) => Some(vec![PrimArg::Int(*n, declared)]),
            Exp::FloatValue(x) => Some(vec![PrimArg::Float(*x, declared)]),
            Exp::StringValue(s) => Some(vec![PrimArg::Str(s.clone(), declared)]),
            Exp::CharValue(c) => Some(vec![PrimArg::Char(*c, declared)]),
            Exp::Var { name, flow } => {
                if declared.is_specified() {
                    st.var_types.insert(name.clone(), declared);
                }
                let ty = st.var_type(name);
                match flow {
                    ParamFlow::In => {
                        let Some(version) = st.versions.get(name).copied() else {
                            self.diags.push(
                                Diag::error(
                                    DiagKind::FlowMode,
                                    format!("`{name}` is read before it is bound"),
                                )
                                .at(arg.pos.clone()),
                            );
                            return None;
                        };
                        Some(vec![PrimArg::input(
                            PrimVarName::new(name.clone(), version),
                            ty,
                        )])
                    }
                    ParamFlow::Out => {
                        let version = st.bump(name);
                        Some(vec![PrimArg::output(
                            PrimVarName::new(name.clone(), version),
                            ty,
                        )])
                    }
                    ParamFlow::InOut => {
                        let Some(read) = st.versions.get(name).copied() else {
                            self.diags.push(
                                Diag::error(
                                    DiagKind::FlowMode,
                                    format!("`!{name}` is updated before it is bound"),
                                )
                                .at(arg.pos.clone()),
                            );
                            return None;
                        };
                        let write = st.bump(name);
                        Some(vec![
                            PrimArg::Var {
                                name: PrimVarName::new(name.clone(), read),
                                ty: ty.clone(),
                                flow: PrimFlow::In,
                                flow_tag: FlowTag::FirstHalf,
                                final_use: false,
                            },
                            PrimArg::Var {
                                name: PrimVarName::new(name.clone(), write),
                                ty,
                                flow: PrimFlow::Out,
                                flow_tag: FlowTag::SecondHalf,
                                final_use: false,
                            },
                        ])
                    }
                }
            }
            other => {
                self.diags.push(
                    Diag::error(
                        DiagKind::Syntax,
                        format!("argument `{other}` survived flattening"),
                    )
                    .at(arg.pos.clone()),
                );
                None
            }
        }
    }
}

fn strip_type(exp: &Exp) -> &Exp {
    match exp {
        Exp::Typed { exp, .. } => strip_type(&exp.node),
        other => other,
    }
}

/// The flow signature of a call's arguments; literals flow in.
fn arg_flows(args: &[Placed<Exp>]) -> Vec<ParamFlow> {
    args.iter()
        .map(|arg| match strip_type(&arg.node) {
            Exp::Var { flow, .. } => *flow,
            _ => ParamFlow::In,
        })
        .collect()
}

/// What the end of the current path reads implicitly.
fn tail_reads(st: &LowerState) -> BTreeSet<Ident> {
    match &st.tail {
        Tail::Return => st.outs.iter().map(|(n, _)| n.clone()).collect(),
        Tail::Repeat => loop_reads(st),
        Tail::CallCont(target) => target.ins.iter().map(|(n, _)| n.clone()).collect(),
    }
}

/// What restarting the enclosing loop reads.
fn loop_reads(st: &LowerState) -> BTreeSet<Ident> {
    st.loop_ctx
        .as_ref()
        .map(|target| target.ins.iter().map(|(n, _)| n.clone()).collect())
        .unwrap_or_default()
}

/// Variables a statement sequence reads before assigning, including what
/// its implicit tail and any `break`/`next` consume.
fn free_reads(
    stmts: &[Placed<Stmt>],
    tail: &BTreeSet<Ident>,
    next: &BTreeSet<Ident>,
) -> BTreeSet<Ident> {
    let mut reads = BTreeSet::new();
    let mut defined = BTreeSet::new();
    let terminated = scan_free_reads(stmts, tail, next, &mut defined, &mut reads);
    if !terminated {
        for name in tail {
            if !defined.contains(name) {
                reads.insert(name.clone());
            }
        }
    }
    reads
}

/// Returns true when the sequence cannot fall off its end.
fn scan_free_reads(
    stmts: &[Placed<Stmt>],
    tail: &BTreeSet<Ident>,
    next: &BTreeSet<Ident>,
    defined: &mut BTreeSet<Ident>,
    reads: &mut BTreeSet<Ident>,
) -> bool {
    let mut read = |name: &Ident, defined: &BTreeSet<Ident>, reads: &mut BTreeSet<Ident>| {
        if !defined.contains(name) {
            reads.insert(name.clone());
        }
    };
    for stmt in stmts {
        match &stmt.node {
            Stmt::ProcCall { args, .. } | Stmt::ForeignCall { args, .. } => {
                for arg in args {
                    if let Exp::Var { name, flow } = strip_type(&arg.node) {
                        match flow {
                            ParamFlow::In => read(name, defined, reads),
                            ParamFlow::Out => {
                                defined.insert(name.clone());
                            }
                            ParamFlow::InOut => {
                                read(name, defined, reads);
                                defined.insert(name.clone());
                            }
                        }
                    }
                }
            }
            Stmt::Cond {
                cond,
                then_stmts,
                else_stmts,
            } => {
                if let Exp::Var { name, .. } = strip_type(&cond.node) {
                    read(name, defined, reads);
                }
                let mut then_defined = defined.clone();
                let mut else_defined = defined.clone();
                let then_done =
                    scan_free_reads(then_stmts, tail, next, &mut then_defined, reads);
                let else_done =
                    scan_free_reads(else_stmts, tail, next, &mut else_defined, reads);
                if then_done && else_done {
                    return true;
                }
                // Only variables bound on every continuing path are surely
                // defined afterwards.
                *defined = match (then_done, else_done) {
                    (false, false) => then_defined
                        .intersection(&else_defined)
                        .cloned()
                        .collect(),
                    (false, true) => then_defined,
                    (true, false) => else_defined,
                    (true, true) => unreachable!(),
                };
            }
            Stmt::Loop { body } => {
                // First-iteration reads; loop-carried values are assigned
                // within the body. Assignments inside are conditional from
                // here, so they do not count as definitions.
                let mut loop_defined = defined.clone();
                scan_free_reads(body, &BTreeSet::new(), &BTreeSet::new(), &mut loop_defined, reads);
            }
            Stmt::Break => {
                for name in tail {
                    read(name, defined, reads);
                }
                return true;
            }
            Stmt::Next => {
                for name in next {
                    read(name, defined, reads);
                }
                return true;
            }
            Stmt::Nop => {}
        }
    }
    false
}

/// All variables a sequence may assign, anywhere in its tree.
fn assigned_vars(stmts: &[Placed<Stmt>]) -> BTreeSet<Ident> {
    let mut assigned = BTreeSet::new();
    collect_assigned(stmts, &mut assigned);
    assigned
}

fn collect_assigned(stmts: &[Placed<Stmt>], assigned: &mut BTreeSet<Ident>) {
    for stmt in stmts {
        match &stmt.node {
            Stmt::ProcCall { args, .. } | Stmt::ForeignCall { args, .. } => {
                for arg in args {
                    if let Exp::Var { name, flow } = strip_type(&arg.node) {
                        if *flow != ParamFlow::In {
                            assigned.insert(name.clone());
                        }
                    }
                }
            }
            Stmt::Cond {
                then_stmts,
                else_stmts,
                ..
            } => {
                collect_assigned(then_stmts, assigned);
                collect_assigned(else_stmts, assigned);
            }
            Stmt::Loop { body } => collect_assigned(body, assigned),
            Stmt::Break | Stmt::Next | Stmt::Nop => {}
        }
    }
}
