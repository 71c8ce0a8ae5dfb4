//! The code generation boundary.
//!
//! The emitter downstream is deterministic given what this module hands
//! over: every proc in primitive form, every argument carrying a concrete
//! type, and every called proc resolvable to a known definition. Foreign
//! calls in any language other than `"llvm"` become extern declarations.
//! `fail` and an unsatisfied `guard` abort the enclosing proc, binding its
//! implicit success output false; the structure operations are
//! `alloc(size, ?ref)`, `access(ref, offset, size, ?value)`, and
//! `mutate(ref, ?ref, size, offset, destructive, value)`.
//!
//! This module validates that contract and produces an ordered view of a
//! compiled module; emission itself is an external collaborator.

use crate::diag::{Diag, DiagKind};
use crate::driver::Compiler;
use crate::modules::ProcImpl;
use crate::prim::{Prim, PrimProto, ProcBody, ProcSpec};
use crate::types::ModSpec;
use log::info;

/// One proc ready for emission.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredProc {
    /// Which proc this is.
    pub spec: ProcSpec,
    /// Its lowered prototype.
    pub proto: PrimProto,
    /// Its lowered, analysed body.
    pub body: ProcBody,
}

/// A module's procs in a stable order, ready for the emitter.
#[derive(Debug, Clone, PartialEq)]
pub struct CodegenInput {
    /// The module these procs belong to.
    pub module: ModSpec,
    /// Every proc, ordered by name then overload index.
    pub procs: Vec<LoweredProc>,
}

/// Validates a compiled module against the emitter's contract.
///
/// Returns the ordered procs, or the contract violations as diagnostics.
pub fn prepare_module(compiler: &Compiler, spec: &ModSpec) -> Result<CodegenInput, Vec<Diag>> {
    let mut diags = Vec::new();
    let mut procs = Vec::new();
    let Some(module) = compiler.module(spec) else {
        return Err(vec![Diag::error(
            DiagKind::General,
            format!("module `{spec}` was never compiled"),
        )]);
    };
    for pspec in module.all_proc_specs() {
        let Some(def) = module.proc_def(&pspec) else {
            continue;
        };
        let ProcImpl::Prim { proto, body, .. } = &def.impl_ else {
            diags.push(
                Diag::error(
                    DiagKind::General,
                    format!("proc `{pspec}` never reached primitive form"),
                )
                .at(def.pos.clone()),
            );
            continue;
        };
        check_proc(compiler, &pspec, proto, body, &mut diags);
        procs.push(LoweredProc {
            spec: pspec,
            proto: proto.clone(),
            body: body.clone(),
        });
    }
    if diags.is_empty() {
        info!(target: "codegen", "module {spec}: {} procs ready", procs.len());
        Ok(CodegenInput {
            module: spec.clone(),
            procs,
        })
    } else {
        Err(diags)
    }
}

fn check_proc(
    compiler: &Compiler,
    pspec: &ProcSpec,
    proto: &PrimProto,
    body: &ProcBody,
    diags: &mut Vec<Diag>,
) {
    for param in &proto.params {
        if !param.ty.is_specified() {
            diags.push(Diag::error(
                DiagKind::Type,
                format!("parameter `{}` of `{pspec}` has no type", param.name),
            ));
        }
    }
    body.visit_prims(&mut |placed| match &placed.node {
        Prim::Call(callee, args) => {
            let resolved = compiler
                .module(&callee.module)
                .and_then(|m| m.proc_def(callee))
                .is_some();
            if !resolved {
                diags.push(
                    Diag::error(
                        DiagKind::NameResolution,
                        format!("`{pspec}` calls unknown proc `{callee}`"),
                    )
                    .at(placed.pos.clone()),
                );
            }
            for arg in args.iter() {
                if !arg.ty().is_specified() {
                    diags.push(
                        Diag::error(
                            DiagKind::Type,
                            format!("untyped argument `{arg}` in call to `{callee}`"),
                        )
                        .at(placed.pos.clone()),
                    );
                }
            }
        }
        Prim::Foreign { args, .. } => {
            for arg in args.iter() {
                if !arg.ty().is_specified() {
                    diags.push(
                        Diag::error(
                            DiagKind::Type,
                            format!("untyped foreign argument `{arg}` in `{pspec}`"),
                        )
                        .at(placed.pos.clone()),
                    );
                }
            }
        }
        Prim::Guard { .. } | Prim::Fail | Prim::Nop => {}
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Compiler;
    use crate::options::CompilerOptions;

    #[test]
    fn missing_module_is_an_error() {
        let compiler = Compiler::new(CompilerOptions::default());
        let result = prepare_module(&compiler, &ModSpec::new(["ghost"]));
        let diags = result.expect_err("expected failure");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("never compiled"));
    }
}
