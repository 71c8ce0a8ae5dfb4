//! The compiler driver: global state, the under-compilation module stack,
//! and the module SCC loader.
//!
//! Modules are loaded depth-first as imports are encountered. Each module
//! entering compilation gets a load number; importing a module that is still
//! open (on the stack or deferred) lowers the importer's
//! `min_dependency_num`, the Tarjan lowlink discipline driven by dependency
//! declarations rather than explicit graph edges. When a module closes with
//! `min_dependency_num` equal to its own load number it is the root of a
//! completed SCC, which is then finalised as a unit.

use crate::ast::pos::{OptPos, Placed};
use crate::ast::Item;
use crate::diag::{CompileError, Diag, DiagKind, DiagSeverity};
use crate::modules::{ImportSpec, Module};
use crate::options::{init_logging, CompilerOptions};
use crate::prim::ProcSpec;
use crate::types::{Ident, ModSpec};
use log::{debug, info};
use std::collections::HashMap;
use std::path::PathBuf;

/// Outcome of a whole compiler run.
#[derive(Debug)]
pub struct CompileOutcome {
    /// All diagnostics, in source order.
    pub diagnostics: Vec<Diag>,
    /// True when no error-severity diagnostic was recorded.
    pub success: bool,
}

/// The compiler's global state.
pub struct Compiler {
    /// Options for this run.
    pub options: CompilerOptions,
    /// Diagnostic buffer, flushed at the end of the run.
    diags: Vec<Diag>,
    /// Set as soon as any error-severity diagnostic is recorded.
    error_flag: bool,
    /// Fully loaded modules.
    modules: HashMap<ModSpec, Module>,
    /// Monotonically increasing module load counter.
    load_count: usize,
    /// Modules currently being compiled, innermost last.
    under_compilation: Vec<Module>,
    /// Finished modules whose SCC has not yet closed.
    deferred: Vec<Module>,
    /// Parsed items for modules not yet loaded, keyed by spec.
    sources: HashMap<ModSpec, Vec<Placed<Item>>>,
}

impl Compiler {
    /// Creates a compiler with the given options.
    pub fn new(options: CompilerOptions) -> Self {
        let _ = init_logging(&options);
        Self {
            options,
            diags: Vec::new(),
            error_flag: false,
            modules: HashMap::new(),
            load_count: 0,
            under_compilation: Vec::new(),
            deferred: Vec::new(),
            sources: HashMap::new(),
        }
    }

    /// Supplies the parsed items of a module, making it loadable on import.
    pub fn add_source(&mut self, spec: ModSpec, items: Vec<Placed<Item>>) {
        self.sources.insert(spec, items);
    }

    /// Records a diagnostic, setting the error flag for error severity.
    pub fn message(&mut self, diag: Diag) {
        if diag.severity == DiagSeverity::Error {
            self.error_flag = true;
        }
        self.diags.push(diag);
    }

    /// True once any error-severity diagnostic has been recorded.
    pub fn errors_seen(&self) -> bool {
        self.error_flag
    }

    /// Pushes a new module onto the under-compilation stack.
    pub fn enter_module(&mut self, directory: PathBuf, spec: ModSpec, params: Option<Vec<Ident>>) {
        self.load_count += 1;
        let mut module = Module::new(directory, spec.clone(), params);
        module.this_load_num = self.load_count;
        module.min_dependency_num = self.load_count;
        debug!(target: "driver", "entering module {spec} (load {})", self.load_count);
        self.under_compilation.push(module);
    }

    /// Pops the finished module off the stack.
    ///
    /// If it belongs to a still-open SCC it is deferred and an empty list is
    /// returned. Otherwise it is the SCC root: the whole component is moved
    /// to the loaded-module table and returned for finalisation.
    pub fn exit_module(&mut self) -> Result<Vec<ModSpec>, CompileError> {
        let Some(module) = self.under_compilation.pop() else {
            return Err(CompileError::Internal(
                "exit_module with no module under compilation".into(),
            ));
        };
        // Propagate the lowlink to the enclosing module, if any.
        if let Some(top) = self.under_compilation.last_mut() {
            top.min_dependency_num = top.min_dependency_num.min(module.min_dependency_num);
        }
        if module.min_dependency_num < module.this_load_num {
            debug!(
                target: "driver",
                "deferring module {} (min {} < load {})",
                module.spec, module.min_dependency_num, module.this_load_num
            );
            self.deferred.push(module);
            return Ok(Vec::new());
        }
        // Everything deferred since this module entered belongs to its SCC.
        let root_num = module.this_load_num;
        let mut scc = vec![module];
        while let Some(last) = self.deferred.last() {
            if last.this_load_num > root_num {
                scc.push(self.deferred.pop().expect("checked non-empty"));
            } else {
                break;
            }
        }
        scc.sort_by_key(|m| m.this_load_num);
        let specs: Vec<ModSpec> = scc.iter().map(|m| m.spec.clone()).collect();
        info!(target: "driver", "completed module SCC: {}",
            specs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "));
        for m in scc {
            self.modules.insert(m.spec.clone(), m);
        }
        Ok(specs)
    }

    /// The module currently being compiled.
    pub fn current_module(&mut self) -> Result<&mut Module, CompileError> {
        self.under_compilation
            .last_mut()
            .ok_or_else(|| CompileError::Internal("no module under compilation".into()))
    }

    /// The spec of the module currently being compiled.
    pub fn current_spec(&self) -> Result<ModSpec, CompileError> {
        self.under_compilation
            .last()
            .map(|m| m.spec.clone())
            .ok_or_else(|| CompileError::Internal("no module under compilation".into()))
    }

    /// Looks up a module anywhere: loaded, deferred, or under compilation.
    pub fn module(&self, spec: &ModSpec) -> Option<&Module> {
        self.modules
            .get(spec)
            .or_else(|| self.deferred.iter().find(|m| m.spec == *spec))
            .or_else(|| self.under_compilation.iter().rev().find(|m| m.spec == *spec))
    }

    /// Mutable module lookup anywhere.
    pub fn module_mut(&mut self, spec: &ModSpec) -> Option<&mut Module> {
        if self.modules.contains_key(spec) {
            return self.modules.get_mut(spec);
        }
        if let Some(i) = self.deferred.iter().position(|m| m.spec == *spec) {
            return self.deferred.get_mut(i);
        }
        self.under_compilation
            .iter_mut()
            .rev()
            .find(|m| m.spec == *spec)
    }

    /// Records an import in the current module and loads the imported
    /// module if necessary, maintaining the SCC lowlink.
    pub fn import_module(
        &mut self,
        spec: ModSpec,
        import: ImportSpec,
        pos: OptPos,
    ) -> Result<(), CompileError> {
        self.current_module()?.add_import(spec.clone(), import);
        // An import of a module still open (on the stack or deferred) is a
        // cycle; pull the importer's lowlink down to the target's index.
        let open_load_num = self
            .under_compilation
            .iter()
            .find(|m| m.spec == spec)
            .or_else(|| self.deferred.iter().find(|m| m.spec == spec))
            .map(|m| m.this_load_num);
        if let Some(num) = open_load_num {
            let current = self.current_module()?;
            current.min_dependency_num = current.min_dependency_num.min(num);
            debug!(
                target: "driver",
                "cyclic import of {spec}; lowlink of {} now {}",
                current.spec, current.min_dependency_num
            );
            return Ok(());
        }
        if self.modules.contains_key(&spec) {
            return Ok(());
        }
        match self.sources.remove(&spec) {
            Some(items) => crate::normalise::load_module(self, spec, items),
            None => {
                self.message(
                    Diag::error(
                        DiagKind::NameResolution,
                        format!("cannot find module `{spec}`"),
                    )
                    .at(pos),
                );
                Ok(())
            }
        }
    }

    /// Resolves an unqualified call to a proc visible from `from`, matching
    /// on name and on the argument flow signature, so same-named procs
    /// differing only in flows (a field's getter and setter, say) stay
    /// distinct.
    pub fn resolve_proc(
        &self,
        from: &ModSpec,
        name: &Ident,
        flows: &[crate::ast::ParamFlow],
    ) -> Result<ProcSpec, ResolveFailure> {
        let matches = |proto: &crate::ast::ProcProto| {
            proto.params.len() == flows.len()
                && proto.params.iter().zip(flows).all(|(p, f)| p.flow == *f)
        };
        let mut candidates = Vec::new();
        if let Some(module) = self.module(from) {
            for (id, def) in module.lookup_procs(name).iter().enumerate() {
                if matches(&def.proto) {
                    candidates.push(ProcSpec::new(from.clone(), name.clone(), id));
                }
            }
            if let Some(imp) = &module.implementation {
                for (source, import) in &imp.imports {
                    if !import.imports_item(name) {
                        continue;
                    }
                    let Some(dep) = self.module(source) else {
                        continue;
                    };
                    for info in dep.interface.procs.get(name).into_iter().flatten() {
                        if matches(&info.proto) {
                            candidates.push(ProcSpec::new(
                                source.clone(),
                                name.clone(),
                                info.id,
                            ));
                        }
                    }
                }
            }
        }
        match candidates.len() {
            0 => Err(ResolveFailure::Unknown),
            1 => Ok(candidates.remove(0)),
            _ => Err(ResolveFailure::Ambiguous(candidates)),
        }
    }

    /// All fully loaded modules.
    pub fn loaded_modules(&self) -> &HashMap<ModSpec, Module> {
        &self.modules
    }

    /// Takes ownership of the loaded modules, leaving the compiler empty.
    pub fn take_loaded_modules(&mut self) -> HashMap<ModSpec, Module> {
        std::mem::take(&mut self.modules)
    }

    /// Consumes the compiler, flushing diagnostics in source order.
    pub fn finish(mut self) -> CompileOutcome {
        // Stable sort: unplaced diagnostics keep their emission order, ahead
        // of placed ones for the same reason the parser reports first.
        self.diags
            .sort_by(|a, b| match (&a.pos, &b.pos) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            });
        CompileOutcome {
            success: !self.error_flag,
            diagnostics: self.diags,
        }
    }

    /// Compiles one module from previously added sources, recursively
    /// loading its imports, then finalising every SCC that closes.
    pub fn compile_module(&mut self, spec: &ModSpec) -> Result<(), CompileError> {
        match self.sources.remove(spec) {
            Some(items) => crate::normalise::load_module(self, spec.clone(), items),
            None => {
                self.message(Diag::error(
                    DiagKind::NameResolution,
                    format!("cannot find module `{spec}`"),
                ));
                Ok(())
            }
        }
    }
}

/// Why a proc reference failed to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    /// No visible proc has the name and arity.
    Unknown,
    /// More than one visible proc matches.
    Ambiguous(Vec<ProcSpec>),
}
