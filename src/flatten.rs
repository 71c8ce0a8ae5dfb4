//! Expression flattening: resolves compound expressions into statement
//! sequences whose arguments are all atomic.
//!
//! Each non-atomic argument is replaced by a fresh `$tmpN` temporary bound
//! by an extra statement emitted ahead of the original one; function calls
//! appearing as expressions become proc calls with an extra output argument.
//! User identifiers cannot start with `$`, so temporaries never collide.

use crate::ast::pos::{OptPos, Placed};
use crate::ast::{Exp, ParamFlow, Stmt};
use crate::diag::{Diag, DiagKind};
use crate::types::{Ident, TypeSpec};
use log::trace;

/// Flattens a proc body.
///
/// `tmp_count` is the proc's temporary counter; the updated value is
/// returned so later passes continue the same sequence.
pub fn flatten_body(
    stmts: Vec<Placed<Stmt>>,
    tmp_count: usize,
    diags: &mut Vec<Diag>,
) -> (Vec<Placed<Stmt>>, usize) {
    let mut flattener = Flattener {
        tmp_count,
        out: Vec::new(),
        diags,
    };
    flattener.flatten_stmts(stmts);
    (flattener.out, flattener.tmp_count)
}

struct Flattener<'a> {
    tmp_count: usize,
    out: Vec<Placed<Stmt>>,
    diags: &'a mut Vec<Diag>,
}

impl Flattener<'_> {
    fn fresh_tmp(&mut self) -> Ident {
        let name = format!("$tmp{}", self.tmp_count);
        self.tmp_count += 1;
        name.into()
    }

    fn flatten_stmts(&mut self, stmts: Vec<Placed<Stmt>>) {
        for stmt in stmts {
            self.flatten_stmt(stmt);
        }
    }

    fn subsequence(&mut self, stmts: Vec<Placed<Stmt>>) -> Vec<Placed<Stmt>> {
        let saved = std::mem::take(&mut self.out);
        self.flatten_stmts(stmts);
        std::mem::replace(&mut self.out, saved)
    }

    fn flatten_stmt(&mut self, stmt: Placed<Stmt>) {
        let pos = stmt.pos.clone();
        match stmt.node {
            Stmt::ProcCall {
                module: _,
                name,
                mut args,
            } if name == "=" && is_assignment(&args) => {
                let rhs = args.pop().expect("assignment has two arguments");
                let lhs = args.pop().expect("assignment has two arguments");
                self.flatten_assignment(lhs, rhs, pos);
            }
            Stmt::ProcCall { module, name, args } => {
                let args = self.flatten_args(args);
                self.out
                    .push(Placed::new(Stmt::ProcCall { module, name, args }, pos));
            }
            Stmt::ForeignCall {
                lang,
                name,
                flags,
                args,
            } => {
                let args = self.flatten_args(args);
                self.out.push(Placed::new(
                    Stmt::ForeignCall {
                        lang,
                        name,
                        flags,
                        args,
                    },
                    pos,
                ));
            }
            Stmt::Cond {
                cond,
                then_stmts,
                else_stmts,
            } => {
                let cond = self.flatten_arg(cond);
                let then_stmts = self.subsequence(then_stmts);
                let else_stmts = self.subsequence(else_stmts);
                self.out.push(Placed::new(
                    Stmt::Cond {
                        cond,
                        then_stmts,
                        else_stmts,
                    },
                    pos,
                ));
            }
            Stmt::Loop { body } => {
                let body = self.subsequence(body);
                self.out.push(Placed::new(Stmt::Loop { body }, pos));
            }
            Stmt::Break | Stmt::Next => self.out.push(stmt),
            Stmt::Nop => {}
        }
    }

    /// `?x = rhs`: binds straight into the call when the right side is a
    /// call, otherwise emits a move.
    fn flatten_assignment(&mut self, lhs: Placed<Exp>, rhs: Placed<Exp>, pos: OptPos) {
        let target = lhs;
        match rhs.node {
            Exp::FnCall { module, name, args } => {
                let mut args = self.flatten_args(args);
                args.push(target);
                self.out
                    .push(Placed::new(Stmt::ProcCall { module, name, args }, pos));
            }
            Exp::ForeignFn {
                lang,
                name,
                flags,
                args,
            } => {
                let mut args = self.flatten_args(args);
                args.push(target);
                self.out.push(Placed::new(
                    Stmt::ForeignCall {
                        lang,
                        name,
                        flags,
                        args,
                    },
                    pos,
                ));
            }
            _ => {
                let source = self.flatten_arg(rhs);
                trace!(target: "flatten", "assignment becomes move into {}", target.node);
                self.out.push(Placed::new(
                    Stmt::ForeignCall {
                        lang: "llvm".into(),
                        name: "move".into(),
                        flags: vec![],
                        args: vec![source, target],
                    },
                    pos,
                ));
            }
        }
    }

    fn flatten_args(&mut self, args: Vec<Placed<Exp>>) -> Vec<Placed<Exp>> {
        args.into_iter().map(|a| self.flatten_arg(a)).collect()
    }

    /// Reduces one argument to an atomic expression, emitting defining
    /// statements for any calls it contains.
    fn flatten_arg(&mut self, arg: Placed<Exp>) -> Placed<Exp> {
        let pos = arg.pos.clone();
        match arg.node {
            Exp::IntValue(_)
            | Exp::FloatValue(_)
            | Exp::StringValue(_)
            | Exp::CharValue(_)
            | Exp::Var { .. } => arg,
            Exp::Typed { exp, ty } => {
                let inner = self.flatten_arg(*exp);
                Placed::new(
                    Exp::Typed {
                        exp: Box::new(inner),
                        ty,
                    },
                    pos,
                )
            }
            Exp::FnCall { module, name, args } => {
                self.check_nested_flows(&args);
                let mut args = self.flatten_args(args);
                let tmp = self.fresh_tmp();
                args.push(Placed::unplaced(Exp::var_set(tmp.clone())));
                trace!(target: "flatten", "lifting call to {name} into {tmp}");
                self.out
                    .push(Placed::new(Stmt::ProcCall { module, name, args }, pos.clone()));
                Placed::new(Exp::var_get(tmp), pos)
            }
            Exp::ForeignFn {
                lang,
                name,
                flags,
                args,
            } => {
                self.check_nested_flows(&args);
                let mut args = self.flatten_args(args);
                let tmp = self.fresh_tmp();
                args.push(Placed::unplaced(Exp::var_set(tmp.clone())));
                self.out.push(Placed::new(
                    Stmt::ForeignCall {
                        lang,
                        name,
                        flags,
                        args,
                    },
                    pos.clone(),
                ));
                Placed::new(Exp::var_get(tmp), pos)
            }
        }
    }

    /// Out-flow variables are only meaningful as direct call arguments;
    /// nested inside a value expression they are a mode error.
    fn check_nested_flows(&mut self, args: &[Placed<Exp>]) {
        for arg in args {
            if let Exp::Var { name, flow } = &arg.node {
                if *flow != ParamFlow::In {
                    self.diags.push(
                        Diag::error(
                            DiagKind::FlowMode,
                            format!("output variable `?{name}` inside a value expression"),
                        )
                        .at(arg.pos.clone()),
                    );
                }
            }
        }
    }
}

/// True when a `=` call is an assignment: first argument is an out-flow
/// variable, possibly type-ascribed.
fn is_assignment(args: &[Placed<Exp>]) -> bool {
    fn out_var(exp: &Exp) -> bool {
        match exp {
            Exp::Var {
                flow: ParamFlow::Out,
                ..
            } => true,
            Exp::Typed { exp, .. } => out_var(&exp.node),
            _ => false,
        }
    }
    matches!(args, [first, _] if out_var(&first.node))
}

/// The declared type of an atomic expression, if ascribed.
pub fn atomic_type(exp: &Exp) -> TypeSpec {
    match exp {
        Exp::IntValue(_) => TypeSpec::int(),
        Exp::FloatValue(_) => TypeSpec::float(),
        Exp::StringValue(_) => TypeSpec::string(),
        Exp::CharValue(_) => TypeSpec::char(),
        Exp::Typed { ty, .. } => ty.clone(),
        _ => TypeSpec::Unspecified,
    }
}
