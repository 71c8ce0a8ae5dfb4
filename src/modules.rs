//! The module tree: public interfaces, private implementations, and import
//! tables.
//!
//! Every module has a [`ModuleInterface`] describing what it exports and a
//! [`ModuleImplementation`] holding everything defined in it. Every public
//! entry also appears in the implementation tables; adding a public item
//! updates both, adding a private one only the implementation.

use crate::analysis::ProcAnalysis;
use crate::ast::pos::{OptPos, Placed};
use crate::ast::{CtorDecl, Determinism, ProcProto, Stmt};
use crate::prim::{PrimProto, ProcBody, ProcSpec};
use crate::types::{Ident, ModSpec, TypeSpec, Visibility};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Interface-level information about an exported type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeInfo {
    /// Number of type parameters.
    pub arity: usize,
    /// Declaration position.
    pub pos: OptPos,
}

/// A type definition held in a module implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Export visibility.
    pub visibility: Visibility,
    /// Type parameter names.
    pub params: Vec<Ident>,
    /// The type's constructors.
    pub ctors: Vec<Placed<CtorDecl>>,
    /// Declaration position.
    pub pos: OptPos,
}

/// A resource definition held in a module implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDef {
    /// Export visibility.
    pub visibility: Visibility,
    /// Resource type.
    pub ty: TypeSpec,
    /// Declaration position.
    pub pos: OptPos,
}

/// Interface-level information about one overload of an exported proc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcCallInfo {
    /// Overload index within the module.
    pub id: usize,
    /// The source prototype callers see.
    pub proto: ProcProto,
    /// Declaration position.
    pub pos: OptPos,
}

/// The stages a proc definition moves through.
///
/// A proc's implementation only ever advances: source form, then primitive
/// form, then blocks after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcImpl {
    /// As written: a list of statements.
    Source {
        /// Body statements.
        body: Vec<Placed<Stmt>>,
    },
    /// Lowered, optimised, and analysed.
    Prim {
        /// The lowered prototype.
        proto: PrimProto,
        /// The lowered body tree.
        body: ProcBody,
        /// Result of alias analysis.
        analysis: ProcAnalysis,
    },
    /// Emitted to codegen blocks; the middle end is done with it.
    Blocks,
}

impl ProcImpl {
    /// Stage number for the monotone-progression invariant.
    pub fn stage(&self) -> u8 {
        match self {
            ProcImpl::Source { .. } => 0,
            ProcImpl::Prim { .. } => 1,
            ProcImpl::Blocks => 2,
        }
    }
}

/// A proc definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcDef {
    /// Proc name.
    pub name: Ident,
    /// Source prototype.
    pub proto: ProcProto,
    /// Whether the proc may fail.
    pub det: Determinism,
    /// Export visibility.
    pub visibility: Visibility,
    /// Current implementation stage.
    pub impl_: ProcImpl,
    /// Declaration position.
    pub pos: OptPos,
    /// Counter for `$tmpN` temporaries generated in this proc.
    pub tmp_count: usize,
}

impl ProcDef {
    /// Creates a source-form proc definition.
    pub fn new(
        proto: ProcProto,
        det: Determinism,
        visibility: Visibility,
        body: Vec<Placed<Stmt>>,
        pos: OptPos,
    ) -> Self {
        Self {
            name: proto.name.clone(),
            proto,
            det,
            visibility,
            impl_: ProcImpl::Source { body },
            pos,
            tmp_count: 0,
        }
    }

    /// Replaces the implementation, enforcing the forward-only stage
    /// progression.
    pub fn advance(&mut self, impl_: ProcImpl) -> bool {
        if impl_.stage() < self.impl_.stage() {
            return false;
        }
        self.impl_ = impl_;
        true
    }
}

/// What an import re-exports: per-item visibilities, plus an optional
/// whole-module visibility.
///
/// `use X` sets the whole-module visibility; `from X use a, b` fills the
/// per-item map. Repeated imports of the same module combine by elementwise
/// visibility max.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImportSpec {
    /// Item names imported, each with its re-export visibility.
    pub items: HashMap<Ident, Visibility>,
    /// Visibility of a whole-module import, if one was declared.
    pub whole: Option<Visibility>,
}

impl ImportSpec {
    /// A whole-module import.
    pub fn whole_module(visibility: Visibility) -> Self {
        Self {
            items: HashMap::new(),
            whole: Some(visibility),
        }
    }

    /// A selective import of the given names.
    pub fn selective(names: &[Ident], visibility: Visibility) -> Self {
        Self {
            items: names.iter().map(|n| (n.clone(), visibility)).collect(),
            whole: None,
        }
    }

    /// Merges another import of the same module into this one, elementwise
    /// max on visibility.
    pub fn combine(&mut self, other: &ImportSpec) {
        for (name, vis) in &other.items {
            let entry = self.items.entry(name.clone()).or_insert(*vis);
            *entry = (*entry).max(*vis);
        }
        self.whole = match (self.whole, other.whole) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// True if this import makes `name` visible.
    pub fn imports_item(&self, name: &Ident) -> bool {
        self.whole.is_some() || self.items.contains_key(name)
    }
}

/// A module's public interface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleInterface {
    /// Exported types.
    pub types: HashMap<Ident, TypeInfo>,
    /// Exported resources.
    pub resources: HashMap<Ident, OptPos>,
    /// Exported procs, one entry per overload.
    pub procs: HashMap<Ident, Vec<ProcCallInfo>>,
    /// Dependencies re-exported publicly.
    pub pub_dependencies: BTreeSet<ModSpec>,
    /// All module dependencies, for linking.
    pub dependencies: BTreeSet<ModSpec>,
}

/// A module's private implementation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleImplementation {
    /// Imports, keyed by source module.
    pub imports: HashMap<ModSpec, ImportSpec>,
    /// Submodules defined in this module.
    pub submodules: HashMap<Ident, ModSpec>,
    /// All locally defined types.
    pub types: HashMap<Ident, TypeDef>,
    /// All locally defined resources.
    pub resources: HashMap<Ident, ResourceDef>,
    /// All locally defined procs, by name, supporting overloading.
    pub procs: HashMap<Ident, Vec<ProcDef>>,
}

/// A module under or after compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Directory the module was loaded from.
    pub directory: PathBuf,
    /// The module's own spec.
    pub spec: ModSpec,
    /// Type parameters, for modules that define a parameterised type.
    pub params: Option<Vec<Ident>>,
    /// The public interface.
    pub interface: ModuleInterface,
    /// The implementation; absent for interface-only loads.
    pub implementation: Option<ModuleImplementation>,
    /// Load sequence number assigned when compilation of this module began.
    pub this_load_num: usize,
    /// Smallest load number reachable through this module's dependencies.
    pub min_dependency_num: usize,
}

impl Module {
    /// Creates a fresh module with an empty implementation.
    pub fn new(directory: PathBuf, spec: ModSpec, params: Option<Vec<Ident>>) -> Self {
        Self {
            directory,
            spec,
            params,
            interface: ModuleInterface::default(),
            implementation: Some(ModuleImplementation::default()),
            this_load_num: 0,
            min_dependency_num: 0,
        }
    }

    fn impl_mut(&mut self) -> &mut ModuleImplementation {
        self.implementation
            .get_or_insert_with(ModuleImplementation::default)
    }

    /// Registers a type; public types also enter the interface.
    pub fn add_type(&mut self, name: Ident, def: TypeDef) {
        if def.visibility == Visibility::Public {
            self.interface.types.insert(
                name.clone(),
                TypeInfo {
                    arity: def.params.len(),
                    pos: def.pos.clone(),
                },
            );
        }
        self.impl_mut().types.insert(name, def);
    }

    /// Registers a resource; public resources also enter the interface.
    pub fn add_resource(&mut self, name: Ident, def: ResourceDef) {
        if def.visibility == Visibility::Public {
            self.interface
                .resources
                .insert(name.clone(), def.pos.clone());
        }
        self.impl_mut().resources.insert(name, def);
    }

    /// Registers a proc definition, returning its [`ProcSpec`].
    pub fn add_proc(&mut self, def: ProcDef) -> ProcSpec {
        let name = def.name.clone();
        let spec = self.spec.clone();
        let id = self.impl_mut().procs.entry(name.clone()).or_default().len();
        if def.visibility == Visibility::Public {
            self.interface
                .procs
                .entry(name.clone())
                .or_default()
                .push(ProcCallInfo {
                    id,
                    proto: def.proto.clone(),
                    pos: def.pos.clone(),
                });
        }
        self.impl_mut()
            .procs
            .get_mut(&name)
            .expect("proc table entry exists after or_default")
            .push(def);
        ProcSpec::new(spec, name, id)
    }

    /// Records an import, combining with any earlier import of the same
    /// module, and tracks the dependency for linking.
    pub fn add_import(&mut self, from: ModSpec, import: ImportSpec) {
        let public = import
            .whole
            .map(|v| v == Visibility::Public)
            .unwrap_or(false)
            || import.items.values().any(|v| *v == Visibility::Public);
        if public {
            self.interface.pub_dependencies.insert(from.clone());
        }
        self.interface.dependencies.insert(from.clone());
        self.impl_mut()
            .imports
            .entry(from)
            .and_modify(|existing| existing.combine(&import))
            .or_insert(import);
    }

    /// Registers a submodule.
    pub fn add_submodule(&mut self, name: Ident, spec: ModSpec) {
        self.impl_mut().submodules.insert(name, spec);
    }

    /// All overloads of `name` defined in this module.
    pub fn lookup_procs(&self, name: &Ident) -> &[ProcDef] {
        self.implementation
            .as_ref()
            .and_then(|imp| imp.procs.get(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The definition a [`ProcSpec`] refers to.
    pub fn proc_def(&self, spec: &ProcSpec) -> Option<&ProcDef> {
        self.lookup_procs(&spec.name).get(spec.id)
    }

    /// Mutable access to the definition a [`ProcSpec`] refers to.
    pub fn proc_def_mut(&mut self, spec: &ProcSpec) -> Option<&mut ProcDef> {
        self.implementation
            .as_mut()?
            .procs
            .get_mut(&spec.name)?
            .get_mut(spec.id)
    }

    /// The locally defined type `name`, if any.
    pub fn lookup_type(&self, name: &Ident) -> Option<&TypeDef> {
        self.implementation.as_ref()?.types.get(name)
    }

    /// Every proc spec defined in this module, in a stable order.
    pub fn all_proc_specs(&self) -> Vec<ProcSpec> {
        let Some(imp) = &self.implementation else {
            return Vec::new();
        };
        let mut names: Vec<_> = imp.procs.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| {
                let count = imp.procs[&name].len();
                let spec = self.spec.clone();
                (0..count).map(move |id| ProcSpec::new(spec.clone(), name.clone(), id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Param;

    fn module() -> Module {
        Module::new(PathBuf::from("."), ModSpec::new(["m"]), None)
    }

    fn proc_def(name: &str, visibility: Visibility) -> ProcDef {
        ProcDef::new(
            ProcProto::new(name, vec![Param::new("x", TypeSpec::int(), crate::ast::ParamFlow::In)]),
            Determinism::Det,
            visibility,
            vec![],
            None,
        )
    }

    #[test]
    fn public_type_enters_both_tables() {
        let mut m = module();
        m.add_type(
            "pair".into(),
            TypeDef {
                visibility: Visibility::Public,
                params: vec!["a".into(), "b".into()],
                ctors: vec![],
                pos: None,
            },
        );
        assert_eq!(m.interface.types["pair"].arity, 2);
        assert!(m.lookup_type(&"pair".into()).is_some());
    }

    #[test]
    fn private_type_skips_interface() {
        let mut m = module();
        m.add_type(
            "secret".into(),
            TypeDef {
                visibility: Visibility::Private,
                params: vec![],
                ctors: vec![],
                pos: None,
            },
        );
        assert!(m.interface.types.is_empty());
        assert!(m.lookup_type(&"secret".into()).is_some());
    }

    #[test]
    fn proc_overloads_get_sequential_ids() {
        let mut m = module();
        let first = m.add_proc(proc_def("p", Visibility::Public));
        let second = m.add_proc(proc_def("p", Visibility::Private));
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert_eq!(m.lookup_procs(&"p".into()).len(), 2);
        // Only the public overload is in the interface.
        assert_eq!(m.interface.procs["p"].len(), 1);
    }

    #[test]
    fn import_combination_takes_max_visibility() {
        let mut spec = ImportSpec::selective(&["f".into()], Visibility::Private);
        let other = ImportSpec {
            items: [("f".into(), Visibility::Public)].into_iter().collect(),
            whole: Some(Visibility::Private),
        };
        spec.combine(&other);
        assert_eq!(spec.items[&Ident::from("f")], Visibility::Public);
        assert_eq!(spec.whole, Some(Visibility::Private));
    }

    #[test]
    fn repeated_imports_merge() {
        let mut m = module();
        let dep = ModSpec::new(["dep"]);
        m.add_import(dep.clone(), ImportSpec::selective(&["f".into()], Visibility::Private));
        m.add_import(dep.clone(), ImportSpec::whole_module(Visibility::Public));
        let imp = m.implementation.as_ref().unwrap();
        let merged = &imp.imports[&dep];
        assert_eq!(merged.whole, Some(Visibility::Public));
        assert!(merged.imports_item(&"f".into()));
        assert!(m.interface.pub_dependencies.contains(&dep));
        assert!(m.interface.dependencies.contains(&dep));
    }

    #[test]
    fn proc_impl_never_regresses() {
        let mut def = proc_def("p", Visibility::Private);
        assert!(def.advance(ProcImpl::Blocks));
        assert!(!def.advance(ProcImpl::Source { body: vec![] }));
        assert_eq!(def.impl_.stage(), 2);
    }

    #[test]
    fn all_proc_specs_stable_order() {
        let mut m = module();
        m.add_proc(proc_def("b", Visibility::Private));
        m.add_proc(proc_def("a", Visibility::Private));
        m.add_proc(proc_def("a", Visibility::Private));
        let specs = m.all_proc_specs();
        let names: Vec<_> = specs.iter().map(|s| (s.name.as_str(), s.id)).collect();
        assert_eq!(names, vec![("a", 0), ("a", 1), ("b", 0)]);
    }
}
