//! Middle end of the Wybe compiler: AST lowering to SSA primitives, body
//! optimisation, and destructive-update alias analysis.
//!
//! The pipeline takes parsed top-level items (parsing itself is an external
//! collaborator), flattens compound expressions, lowers structured control
//! flow into trees of forked procedure bodies, optimises each body as it is
//! assembled, and finally runs a bottom-up alias analysis over call-graph
//! SCCs that proves `mutate` operations safe to perform in place.
//!
//! # Compile a module
//!
//! ```
//! use wybec::ast::{Exp, Item, Param, ParamFlow, Placed, ProcProto, Stmt};
//! use wybec::types::{ModSpec, TypeSpec, Visibility};
//! use wybec::{compile, CompilerOptions};
//!
//! // proc double(x, ?y) { ?y = x + x }
//! let double = Item::ProcDecl {
//!     visibility: Visibility::Public,
//!     det: Default::default(),
//!     proto: ProcProto::new(
//!         "double",
//!         vec![
//!             Param::new("x", TypeSpec::int(), ParamFlow::In),
//!             Param::new("y", TypeSpec::int(), ParamFlow::Out),
//!         ],
//!     ),
//!     body: vec![Placed::unplaced(Stmt::assign(
//!         "y",
//!         Placed::unplaced(Exp::llvm_op(
//!             "add",
//!             vec![],
//!             vec![
//!                 Placed::unplaced(Exp::var_get("x")),
//!                 Placed::unplaced(Exp::var_get("x")),
//!             ],
//!         )),
//!     ))],
//! };
//!
//! let spec = ModSpec::new(["demo"]);
//! let result = compile(
//!     CompilerOptions::default(),
//!     vec![(spec.clone(), vec![Placed::unplaced(double)])],
//!     &spec,
//! )
//! .unwrap();
//! assert!(result.outcome.success);
//! assert!(result.modules.contains_key(&spec));
//! ```

pub mod analysis;
pub mod artifact;
pub mod ast;
pub mod body_builder;
pub mod codegen;
pub mod diag;
pub mod driver;
pub mod flatten;
pub mod modules;
pub mod normalise;
pub mod options;
pub mod prim;
pub mod types;
pub mod unbranch;

// Re-export position primitives.
pub use ast::{OptPos, Placed, SourcePos};

// Re-export the diagnostic model.
pub use diag::{diags_to_reports, CompileError, Diag, DiagKind, DiagSeverity};

// Re-export driver types for convenience.
pub use driver::{CompileOutcome, Compiler};
pub use options::{CompilerOptions, LogCategory};

// Re-export the core IR.
pub use analysis::{AliasMap, ProcAnalysis};
pub use modules::{Module, ProcDef, ProcImpl};
pub use prim::{Prim, PrimArg, PrimFork, PrimProto, PrimVarName, ProcBody, ProcSpec};

use crate::ast::Item;
use crate::types::ModSpec;
use std::collections::HashMap;

/// Result of compiling a set of modules.
#[derive(Debug)]
pub struct CompileResult {
    /// Every module that finished compilation, keyed by spec.
    pub modules: HashMap<ModSpec, Module>,
    /// Diagnostics and overall success.
    pub outcome: CompileOutcome,
}

/// Compiles `root` and everything it imports from the given sources.
///
/// This is the recommended entry point: it wires the driver, normaliser,
/// lowering passes, and alias analysis together and flushes diagnostics in
/// source order. Internal invariant violations surface as
/// [`CompileError`]; ordinary user-level problems land in the outcome's
/// diagnostics with `success` false.
pub fn compile(
    options: CompilerOptions,
    sources: Vec<(ModSpec, Vec<Placed<Item>>)>,
    root: &ModSpec,
) -> Result<CompileResult, CompileError> {
    let mut compiler = Compiler::new(options);
    for (spec, items) in sources {
        compiler.add_source(spec, items);
    }
    compiler.compile_module(root)?;
    let modules = compiler.take_loaded_modules();
    Ok(CompileResult {
        modules,
        outcome: compiler.finish(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Exp, Param, ParamFlow, ProcProto, Stmt};
    use crate::types::{TypeSpec, Visibility};

    fn simple_proc() -> Item {
        Item::ProcDecl {
            visibility: Visibility::Public,
            det: Default::default(),
            proto: ProcProto::new(
                "id",
                vec![
                    Param::new("x", TypeSpec::int(), ParamFlow::In),
                    Param::new("y", TypeSpec::int(), ParamFlow::Out),
                ],
            ),
            body: vec![Placed::unplaced(Stmt::assign(
                "y",
                Placed::unplaced(Exp::var_get("x")),
            ))],
        }
    }

    #[test]
    fn compile_produces_lowered_module() {
        let spec = ModSpec::new(["m"]);
        let result = compile(
            CompilerOptions::default(),
            vec![(spec.clone(), vec![Placed::unplaced(simple_proc())])],
            &spec,
        )
        .unwrap();
        assert!(result.outcome.success);
        let module = &result.modules[&spec];
        let def = &module.lookup_procs(&"id".into())[0];
        assert!(matches!(def.impl_, ProcImpl::Prim { .. }));
    }

    #[test]
    fn compile_missing_root_reports_error() {
        let spec = ModSpec::new(["nowhere"]);
        let result = compile(CompilerOptions::default(), vec![], &spec).unwrap();
        assert!(!result.outcome.success);
        assert!(!result.outcome.diagnostics.is_empty());
    }
}
