//! Normalisation: registers top-level items into the module tables,
//! desugars constructor declarations into primitive structure operations,
//! and drives each proc through flattening, unbranching, and body assembly.
//!
//! Constructor sugar: a sum type's constructors become ordinary procs built
//! from `alloc`/`access`/`mutate` foreign calls. Multi-constructor types
//! keep an integer tag in their first word; deconstructors read it with
//! `access` and test it, which makes them semi-deterministic. Fields are one
//! word each, in declaration order after the tag.

use crate::ast::pos::{OptPos, Placed};
use crate::ast::{CtorDecl, Determinism, Exp, Item, Param, ParamFlow, ProcProto, Stmt};
use crate::diag::CompileError;
use crate::driver::Compiler;
use crate::flatten::flatten_body;
use crate::modules::{ImportSpec, ProcDef, ProcImpl, ResourceDef, TypeDef};
use crate::types::{Ident, ModSpec, TypeSpec, Visibility};
use crate::unbranch::unbranch_proc;
use log::info;
use std::path::PathBuf;

/// Bytes per structure word.
const WORD_SIZE: i64 = 8;

/// Loads one module from parsed items: registers its declarations (loading
/// imports recursively), lowers its procs, and finalises every module SCC
/// that closes, running alias analysis over it.
pub fn load_module(
    compiler: &mut Compiler,
    spec: ModSpec,
    items: Vec<Placed<Item>>,
) -> Result<(), CompileError> {
    info!(target: "driver", "compiling module {spec}");
    compiler.enter_module(PathBuf::from("."), spec.clone(), None);
    normalise_items(compiler, items)?;
    lower_module(compiler, &spec)?;
    let scc = compiler.exit_module()?;
    if !scc.is_empty() {
        crate::analysis::analyse_modules(compiler, &scc)?;
    }
    Ok(())
}

/// Registers a sequence of items into the current module.
pub fn normalise_items(
    compiler: &mut Compiler,
    items: Vec<Placed<Item>>,
) -> Result<(), CompileError> {
    for item in items {
        normalise_item(compiler, item)?;
    }
    Ok(())
}

fn normalise_item(compiler: &mut Compiler, item: Placed<Item>) -> Result<(), CompileError> {
    let pos = item.pos.clone();
    match item.node {
        Item::TypeDecl {
            visibility,
            name,
            params,
            ctors,
        } => {
            let spec = compiler.current_spec()?;
            let type_spec = TypeSpec::simple(spec, name.clone());
            let procs = ctor_procs(visibility, &type_spec, &ctors, &pos);
            let module = compiler.current_module()?;
            module.add_type(
                name,
                TypeDef {
                    visibility,
                    params,
                    ctors,
                    pos,
                },
            );
            for def in procs {
                module.add_proc(def);
            }
            Ok(())
        }
        Item::ModuleDecl {
            visibility,
            name,
            items,
        } => {
            let parent = compiler.current_spec()?;
            let sub = parent.child(name.clone());
            compiler.current_module()?.add_submodule(name, sub.clone());
            compiler.enter_module(PathBuf::from("."), sub.clone(), None);
            normalise_items(compiler, items)?;
            lower_module(compiler, &sub)?;
            let scc = compiler.exit_module()?;
            if !scc.is_empty() {
                crate::analysis::analyse_modules(compiler, &scc)?;
            }
            compiler.import_module(sub, ImportSpec::whole_module(visibility), pos)
        }
        Item::UseModules {
            visibility,
            modules,
        } => {
            for module in modules {
                compiler.import_module(
                    module,
                    ImportSpec::whole_module(visibility),
                    pos.clone(),
                )?;
            }
            Ok(())
        }
        Item::FromUse {
            visibility,
            module,
            names,
        } => compiler.import_module(module, ImportSpec::selective(&names, visibility), pos),
        Item::ResourceDecl {
            visibility,
            name,
            ty,
        } => {
            compiler.current_module()?.add_resource(
                name,
                ResourceDef {
                    visibility,
                    ty,
                    pos,
                },
            );
            Ok(())
        }
        Item::ProcDecl {
            visibility,
            det,
            proto,
            body,
        } => {
            compiler
                .current_module()?
                .add_proc(ProcDef::new(proto, det, visibility, body, pos));
            Ok(())
        }
        Item::FuncDecl {
            visibility,
            det,
            proto,
            result,
            body,
        } => {
            // A function is a proc with one extra output bound to its body
            // expression.
            let mut proto = proto;
            proto
                .params
                .push(Param::new("$result", result, ParamFlow::Out));
            let stmts = vec![Placed::new(Stmt::assign("$result", body), pos.clone())];
            compiler
                .current_module()?
                .add_proc(ProcDef::new(proto, det, visibility, stmts, pos));
            Ok(())
        }
    }
}

/// Lowers every source-form proc of a module to primitive form.
pub fn lower_module(compiler: &mut Compiler, spec: &ModSpec) -> Result<(), CompileError> {
    let Some(module) = compiler.module(spec) else {
        return Ok(());
    };
    let proc_specs = module.all_proc_specs();
    let mut gen_count = 0usize;
    for pspec in proc_specs {
        let Some(def) = compiler.module(spec).and_then(|m| m.proc_def(&pspec)) else {
            continue;
        };
        let ProcImpl::Source { body } = &def.impl_ else {
            continue;
        };
        let stmts = body.clone();
        let proto = def.proto.clone();
        let det = def.det;
        let tmp_count = def.tmp_count;
        let mut diags = Vec::new();
        let (flattened, tmp_count) = flatten_body(stmts, tmp_count, &mut diags);
        let result = unbranch_proc(
            compiler,
            spec,
            &proto,
            det,
            flattened,
            tmp_count,
            &mut gen_count,
            &mut diags,
        )?;
        for diag in diags {
            compiler.message(diag);
        }
        let Some(module) = compiler.module_mut(spec) else {
            continue;
        };
        if let Some(def) = module.proc_def_mut(&pspec) {
            def.tmp_count = tmp_count;
            def.advance(ProcImpl::Prim {
                proto: result.proto,
                body: result.body,
                analysis: Default::default(),
            });
        }
        for generated in result.generated {
            module.add_proc(generated);
        }
    }
    Ok(())
}

/// The record variable used in generated constructor procs.
const REC_VAR: &str = "$rec";

/// Generates the procs a constructor declaration stands for: the
/// constructor itself, the deconstructor, and field getters and setters for
/// single-constructor types.
fn ctor_procs(
    visibility: Visibility,
    type_spec: &TypeSpec,
    ctors: &[Placed<CtorDecl>],
    pos: &OptPos,
) -> Vec<ProcDef> {
    let multi = ctors.len() > 1;
    let mut procs = Vec::new();
    for (tag, ctor) in ctors.iter().enumerate() {
        let fields = &ctor.node.fields;
        let slots = fields.len() as i64 + multi as i64;
        let size = slots * WORD_SIZE;
        let offset = |index: usize| (index as i64 + multi as i64) * WORD_SIZE;

        procs.push(constructor_proc(
            visibility, type_spec, &ctor.node, multi, tag as i64, size, &offset, pos,
        ));
        procs.push(deconstructor_proc(
            visibility, type_spec, &ctor.node, multi, tag as i64, size, &offset, pos,
        ));
        if !multi {
            for (index, (field, field_ty)) in fields.iter().enumerate() {
                procs.push(getter_proc(
                    visibility,
                    type_spec,
                    field,
                    field_ty,
                    offset(index),
                    size,
                    pos,
                ));
                procs.push(setter_proc(
                    visibility,
                    type_spec,
                    field,
                    field_ty,
                    offset(index),
                    size,
                    pos,
                ));
            }
        }
    }
    procs
}

fn rec_out(type_spec: &TypeSpec) -> Placed<Exp> {
    Placed::unplaced(Exp::Typed {
        exp: Box::new(Placed::unplaced(Exp::var_set(REC_VAR))),
        ty: type_spec.clone(),
    })
}

fn int_exp(value: i64) -> Placed<Exp> {
    Placed::unplaced(Exp::IntValue(value))
}

fn llvm_stmt(name: &str, args: Vec<Placed<Exp>>, pos: &OptPos) -> Placed<Stmt> {
    Placed::new(
        Stmt::ForeignCall {
            lang: "llvm".into(),
            name: name.into(),
            flags: vec![],
            args,
        },
        pos.clone(),
    )
}

/// A write into the record under construction: the allocation is fresh, so
/// the mutate is destructive from the start.
fn init_field(size: i64, offset: i64, value: Placed<Exp>, pos: &OptPos) -> Placed<Stmt> {
    llvm_stmt(
        "mutate",
        vec![
            Placed::unplaced(Exp::var_get(REC_VAR)),
            Placed::unplaced(Exp::var_set(REC_VAR)),
            int_exp(size),
            int_exp(offset),
            int_exp(1),
            value,
        ],
        pos,
    )
}

#[allow(clippy::too_many_arguments)]
fn constructor_proc(
    visibility: Visibility,
    type_spec: &TypeSpec,
    ctor: &CtorDecl,
    multi: bool,
    tag: i64,
    size: i64,
    offset: &dyn Fn(usize) -> i64,
    pos: &OptPos,
) -> ProcDef {
    let mut params: Vec<Param> = ctor
        .fields
        .iter()
        .map(|(name, ty)| Param::new(name.clone(), ty.clone(), ParamFlow::In))
        .collect();
    params.push(Param::new(REC_VAR, type_spec.clone(), ParamFlow::Out));
    let mut body = vec![llvm_stmt(
        "alloc",
        vec![int_exp(size), rec_out(type_spec)],
        pos,
    )];
    if multi {
        body.push(init_field(size, 0, int_exp(tag), pos));
    }
    for (index, (field, _)) in ctor.fields.iter().enumerate() {
        body.push(init_field(
            size,
            offset(index),
            Placed::unplaced(Exp::var_get(field.clone())),
            pos,
        ));
    }
    ProcDef::new(
        ProcProto::new(ctor.name.clone(), params),
        Determinism::Det,
        visibility,
        body,
        pos.clone(),
    )
}

#[allow(clippy::too_many_arguments)]
fn deconstructor_proc(
    visibility: Visibility,
    type_spec: &TypeSpec,
    ctor: &CtorDecl,
    multi: bool,
    tag: i64,
    size: i64,
    offset: &dyn Fn(usize) -> i64,
    pos: &OptPos,
) -> ProcDef {
    let mut params: Vec<Param> = ctor
        .fields
        .iter()
        .map(|(name, ty)| Param::new(name.clone(), ty.clone(), ParamFlow::Out))
        .collect();
    params.push(Param::new(REC_VAR, type_spec.clone(), ParamFlow::In));
    let mut body = Vec::new();
    if multi {
        // Read the tag word and test it; a mismatch fails the proc.
        body.push(llvm_stmt(
            "access",
            vec![
                Placed::unplaced(Exp::var_get(REC_VAR)),
                int_exp(0),
                int_exp(size),
                Placed::unplaced(Exp::Typed {
                    exp: Box::new(Placed::unplaced(Exp::var_set("$tag"))),
                    ty: TypeSpec::int(),
                }),
            ],
            pos,
        ));
        body.push(Placed::new(
            Stmt::call(
                "=",
                vec![
                    Placed::unplaced(Exp::var_get("$tag")),
                    int_exp(tag),
                ],
            ),
            pos.clone(),
        ));
    }
    for (index, (field, field_ty)) in ctor.fields.iter().enumerate() {
        body.push(llvm_stmt(
            "access",
            vec![
                Placed::unplaced(Exp::var_get(REC_VAR)),
                int_exp(offset(index)),
                int_exp(size),
                Placed::unplaced(Exp::Typed {
                    exp: Box::new(Placed::unplaced(Exp::var_set(field.clone()))),
                    ty: field_ty.clone(),
                }),
            ],
            pos,
        ));
    }
    ProcDef::new(
        ProcProto::new(ctor.name.clone(), params),
        if multi {
            Determinism::SemiDet
        } else {
            Determinism::Det
        },
        visibility,
        body,
        pos.clone(),
    )
}

fn getter_proc(
    visibility: Visibility,
    type_spec: &TypeSpec,
    field: &Ident,
    field_ty: &TypeSpec,
    offset: i64,
    size: i64,
    pos: &OptPos,
) -> ProcDef {
    let params = vec![
        Param::new(REC_VAR, type_spec.clone(), ParamFlow::In),
        Param::new("$val", field_ty.clone(), ParamFlow::Out),
    ];
    let body = vec![llvm_stmt(
        "access",
        vec![
            Placed::unplaced(Exp::var_get(REC_VAR)),
            int_exp(offset),
            int_exp(size),
            Placed::unplaced(Exp::var_set("$val")),
        ],
        pos,
    )];
    ProcDef::new(
        ProcProto::new(field.clone(), params),
        Determinism::Det,
        visibility,
        body,
        pos.clone(),
    )
}

/// The setter's mutate starts non-destructive; alias analysis upgrades it
/// when the record is provably unshared at the call site.
fn setter_proc(
    visibility: Visibility,
    type_spec: &TypeSpec,
    field: &Ident,
    field_ty: &TypeSpec,
    offset: i64,
    size: i64,
    pos: &OptPos,
) -> ProcDef {
    let params = vec![
        Param::new(REC_VAR, type_spec.clone(), ParamFlow::InOut),
        Param::new("$val", field_ty.clone(), ParamFlow::In),
    ];
    let body = vec![llvm_stmt(
        "mutate",
        vec![
            Placed::unplaced(Exp::var_get(REC_VAR)),
            rec_out(type_spec),
            int_exp(size),
            int_exp(offset),
            int_exp(0),
            Placed::unplaced(Exp::var_get("$val")),
        ],
        pos,
    )];
    ProcDef::new(
        ProcProto::new(field.clone(), params),
        Determinism::Det,
        visibility,
        body,
        pos.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_ctor() -> Vec<Placed<CtorDecl>> {
        vec![Placed::unplaced(CtorDecl::new(
            "point",
            vec![
                ("x".into(), TypeSpec::int()),
                ("y".into(), TypeSpec::int()),
            ],
        ))]
    }

    fn shape_ctors() -> Vec<Placed<CtorDecl>> {
        vec![
            Placed::unplaced(CtorDecl::new("circle", vec![("r".into(), TypeSpec::int())])),
            Placed::unplaced(CtorDecl::new("square", vec![("side".into(), TypeSpec::int())])),
        ]
    }

    fn ty() -> TypeSpec {
        TypeSpec::simple(crate::types::ModSpec::new(["m"]), "t")
    }

    #[test]
    fn single_ctor_generates_accessors() {
        let procs = ctor_procs(Visibility::Public, &ty(), &point_ctor(), &None);
        let names: Vec<_> = procs.iter().map(|p| p.name.as_str()).collect();
        // Constructor, deconstructor, then getter/setter per field.
        assert_eq!(names, vec!["point", "point", "x", "x", "y", "y"]);
        assert!(procs.iter().all(|p| p.det == Determinism::Det));
    }

    #[test]
    fn multi_ctor_deconstructors_are_tests() {
        let procs = ctor_procs(Visibility::Public, &ty(), &shape_ctors(), &None);
        let names: Vec<_> = procs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["circle", "circle", "square", "square"]);
        let decon = &procs[1];
        assert_eq!(decon.det, Determinism::SemiDet);
        let ProcImpl::Source { body } = &decon.impl_ else {
            panic!("expected source form");
        };
        // Tag read and test precede the field accesses.
        assert!(matches!(
            &body[0].node,
            Stmt::ForeignCall { name, .. } if name == "access"
        ));
        assert!(matches!(
            &body[1].node,
            Stmt::ProcCall { name, .. } if name == "="
        ));
    }

    #[test]
    fn multi_ctor_fields_skip_tag_word() {
        let procs = ctor_procs(Visibility::Public, &ty(), &shape_ctors(), &None);
        let ProcImpl::Source { body } = &procs[0].impl_ else {
            panic!("expected source form");
        };
        // alloc, tag write, then the field write at offset 8.
        let Stmt::ForeignCall { name, args, .. } = &body[2].node else {
            panic!("expected mutate");
        };
        assert_eq!(name, "mutate");
        assert_eq!(args[3].node, Exp::IntValue(WORD_SIZE));
    }

    #[test]
    fn constructor_initialises_all_fields_destructively() {
        let procs = ctor_procs(Visibility::Public, &ty(), &point_ctor(), &None);
        let ProcImpl::Source { body } = &procs[0].impl_ else {
            panic!("expected source form");
        };
        assert_eq!(body.len(), 3, "alloc plus one mutate per field");
        for stmt in &body[1..] {
            let Stmt::ForeignCall { name, args, .. } = &stmt.node else {
                panic!("expected mutate");
            };
            assert_eq!(name, "mutate");
            assert_eq!(args[4].node, Exp::IntValue(1));
        }
    }
}
