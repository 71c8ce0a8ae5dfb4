//! Module loading, SCC discovery, imports, constructor desugaring, and
//! artifact round-trips.

mod common;

use common::*;
use wybec::artifact::{decode_module, encode_module};
use wybec::ast::{CtorDecl, Exp, Item, ParamFlow, Placed, Stmt};
use wybec::codegen::prepare_module;
use wybec::diag::DiagKind;
use wybec::prim::Prim;
use wybec::types::{ModSpec, TypeSpec, Visibility};
use wybec::{compile, CompilerOptions, ProcImpl};

fn use_item(module: &ModSpec) -> Item {
    Item::UseModules {
        visibility: Visibility::Private,
        modules: vec![module.clone()],
    }
}

/// Mutually importing modules form one SCC; the import target that closed
/// first defers until the root closes.
#[test]
fn cyclic_imports_form_one_scc() {
    let a = ModSpec::new(["a"]);
    let b = ModSpec::new(["b"]);
    let result = compile(
        CompilerOptions::default(),
        vec![
            (a.clone(), vec![Placed::unplaced(use_item(&b))]),
            (b.clone(), vec![Placed::unplaced(use_item(&a))]),
        ],
        &a,
    )
    .unwrap();
    assert!(result.outcome.success);
    let ma = &result.modules[&a];
    let mb = &result.modules[&b];
    assert!(ma.min_dependency_num <= ma.this_load_num);
    assert!(mb.min_dependency_num <= mb.this_load_num);
    // The root of the SCC is exactly the module whose numbers coincide.
    assert_eq!(ma.min_dependency_num, ma.this_load_num);
    assert!(mb.min_dependency_num < mb.this_load_num);
}

/// Acyclic imports close as singleton SCCs: every module is its own root.
#[test]
fn acyclic_imports_are_singleton_sccs() {
    let a = ModSpec::new(["a"]);
    let b = ModSpec::new(["b"]);
    let result = compile(
        CompilerOptions::default(),
        vec![
            (a.clone(), vec![Placed::unplaced(use_item(&b))]),
            (b.clone(), vec![]),
        ],
        &a,
    )
    .unwrap();
    assert!(result.outcome.success);
    for spec in [&a, &b] {
        let module = &result.modules[spec];
        assert_eq!(module.min_dependency_num, module.this_load_num);
    }
}

#[test]
fn missing_import_is_reported() {
    let a = ModSpec::new(["a"]);
    let result = compile(
        CompilerOptions::default(),
        vec![(
            a.clone(),
            vec![Placed::unplaced(use_item(&ModSpec::new(["ghost"])))],
        )],
        &a,
    )
    .unwrap();
    assert!(!result.outcome.success);
    assert!(result
        .outcome
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagKind::NameResolution && d.message.contains("ghost")));
}

/// A proc exported by one module resolves from an importing module, and the
/// lowered call names the defining module.
#[test]
fn imported_proc_resolves_across_modules() {
    let app = ModSpec::new(["app"]);
    let lib = ModSpec::new(["lib"]);
    let inc = Item::ProcDecl {
        visibility: Visibility::Public,
        det: Default::default(),
        proto: wybec::ast::ProcProto::new(
            "inc",
            vec![in_param("x", TypeSpec::int()), out_param("y", TypeSpec::int())],
        ),
        body: vec![Placed::unplaced(Stmt::assign(
            "y",
            llvm_exp("add", vec![var("x"), int(1)]),
        ))],
    };
    let main = Item::ProcDecl {
        visibility: Visibility::Public,
        det: Default::default(),
        proto: wybec::ast::ProcProto::new(
            "main",
            vec![in_param("n", TypeSpec::int()), out_param("r", TypeSpec::int())],
        ),
        body: vec![Placed::unplaced(Stmt::call(
            "inc",
            vec![var("n"), set("r")],
        ))],
    };
    let result = compile(
        CompilerOptions::default(),
        vec![
            (
                app.clone(),
                vec![
                    Placed::unplaced(use_item(&lib)),
                    Placed::unplaced(main),
                ],
            ),
            (lib.clone(), vec![Placed::unplaced(inc)]),
        ],
        &app,
    )
    .unwrap();
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let module = &result.modules[&app];
    let ProcImpl::Prim { body, .. } = &module.lookup_procs(&"main".into())[0].impl_ else {
        panic!("main not lowered");
    };
    let Prim::Call(spec, _) = &body.prims[0].node else {
        panic!("expected a call, got {}", body.prims[0].node);
    };
    assert_eq!(spec.module, lib);
    assert_eq!(spec.name, "inc");
}

/// Selective imports only expose the named items.
#[test]
fn selective_import_limits_visibility() {
    let app = ModSpec::new(["app"]);
    let lib = ModSpec::new(["lib"]);
    let export = |name: &str| Item::ProcDecl {
        visibility: Visibility::Public,
        det: Default::default(),
        proto: wybec::ast::ProcProto::new(name, vec![out_param("r", TypeSpec::int())]),
        body: vec![Placed::unplaced(Stmt::assign("r", int(1)))],
    };
    let caller = |callee: &str| Item::ProcDecl {
        visibility: Visibility::Public,
        det: Default::default(),
        proto: wybec::ast::ProcProto::new("main", vec![out_param("r", TypeSpec::int())]),
        body: vec![Placed::unplaced(Stmt::call(callee, vec![set("r")]))],
    };
    let selective = Item::FromUse {
        visibility: Visibility::Private,
        module: lib.clone(),
        names: vec!["wanted".into()],
    };
    // Calling the imported proc works.
    let ok = compile(
        CompilerOptions::default(),
        vec![
            (
                app.clone(),
                vec![
                    Placed::unplaced(selective.clone()),
                    Placed::unplaced(caller("wanted")),
                ],
            ),
            (
                lib.clone(),
                vec![
                    Placed::unplaced(export("wanted")),
                    Placed::unplaced(export("hidden")),
                ],
            ),
        ],
        &app,
    )
    .unwrap();
    assert!(ok.outcome.success, "{:?}", ok.outcome.diagnostics);
    // Calling the one that was not named fails to resolve.
    let bad = compile(
        CompilerOptions::default(),
        vec![
            (
                app.clone(),
                vec![
                    Placed::unplaced(selective),
                    Placed::unplaced(caller("hidden")),
                ],
            ),
            (
                lib.clone(),
                vec![
                    Placed::unplaced(export("wanted")),
                    Placed::unplaced(export("hidden")),
                ],
            ),
        ],
        &app,
    )
    .unwrap();
    assert!(!bad.outcome.success);
}

fn point_type() -> Item {
    Item::TypeDecl {
        visibility: Visibility::Public,
        name: "point".into(),
        params: vec![],
        ctors: vec![Placed::unplaced(CtorDecl::new(
            "point",
            vec![("x".into(), TypeSpec::int()), ("y".into(), TypeSpec::int())],
        ))],
    }
}

fn point_ty() -> TypeSpec {
    TypeSpec::simple(module_spec(), "point")
}

/// A single-constructor type generates a constructor, a deconstructor, and
/// a getter/setter per field; the constructor initialises destructively.
#[test]
fn single_ctor_type_desugars_to_structure_ops() {
    let result = compile_items(vec![point_type()]);
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let module = &result.modules[&module_spec()];
    assert_eq!(module.lookup_procs(&"point".into()).len(), 2);
    assert_eq!(module.lookup_procs(&"x".into()).len(), 2);
    assert_eq!(module.lookup_procs(&"y".into()).len(), 2);
    // The constructor allocates then writes both fields destructively.
    let (proto, body) = lowered(&result, "point");
    assert_proc_invariants(proto, body);
    let lines = prim_lines(body);
    assert_eq!(lines.len(), 3, "{lines:?}");
    assert!(lines[0].contains("alloc"));
    assert_eq!(mutate_flag(&body.prims[1].node), Some(1));
    assert_eq!(mutate_flag(&body.prims[2].node), Some(1));
    // The type itself landed in both interface and implementation.
    assert!(module.interface.types.contains_key("point"));
    assert!(module.lookup_type(&"point".into()).is_some());
}

/// Field access through generated getters and setters lowers to access and
/// mutate, and the setter's own mutate is destructive for an unshared
/// final-use record.
#[test]
fn getters_and_setters_lower_to_structure_ops() {
    let shift = Item::ProcDecl {
        visibility: Visibility::Public,
        det: Default::default(),
        proto: wybec::ast::ProcProto::new(
            "shift",
            vec![
                wybec::ast::Param::new("p", point_ty(), ParamFlow::InOut),
                in_param("dx", TypeSpec::int()),
            ],
        ),
        body: vec![
            Placed::unplaced(Stmt::call("x", vec![var("p"), set("old")])),
            Placed::unplaced(Stmt::assign(
                "new",
                llvm_exp("add", vec![var("old"), var("dx")]),
            )),
            Placed::unplaced(Stmt::call(
                "x",
                vec![Placed::unplaced(Exp::var_both("p")), var("new")],
            )),
        ],
    };
    let result = compile_items(vec![point_type(), shift]);
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let (proto, body) = lowered(&result, "shift");
    assert_proc_invariants(proto, body);
    let lines = prim_lines(body);
    assert!(lines.iter().any(|l| l.contains("call") && l.contains(".x<0>")));
    assert!(lines.iter().any(|l| l.contains(".x<1>")), "{lines:?}");
    // The setter overload holds the mutate; analysis proves it in-place.
    let (_, setter_body) = lowered_id(&result, "x", 1);
    let mutate = setter_body
        .all_prims()
        .into_iter()
        .find(|p| mutate_flag(&p.node).is_some())
        .expect("setter contains a mutate");
    assert_eq!(mutate_flag(&mutate.node), Some(1));
}

/// Multi-constructor types tag their first word; deconstructors read the
/// tag and guard on it, failing on mismatch.
#[test]
fn multi_ctor_deconstructor_guards_on_tag() {
    let shape = Item::TypeDecl {
        visibility: Visibility::Public,
        name: "shape".into(),
        params: vec![],
        ctors: vec![
            Placed::unplaced(CtorDecl::new("circle", vec![("r".into(), TypeSpec::int())])),
            Placed::unplaced(CtorDecl::new("square", vec![("s".into(), TypeSpec::int())])),
        ],
    };
    let result = compile_items(vec![shape]);
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let (proto, body) = lowered_id(&result, "circle", 1);
    assert_proc_invariants(proto, body);
    let lines = prim_lines(body);
    assert_eq!(lines.len(), 5, "{lines:?}");
    assert!(lines[0].contains("access"), "tag read: {}", lines[0]);
    assert!(lines[1].contains("icmp"), "tag test: {}", lines[1]);
    assert!(lines[2].starts_with("guard"), "tag guard: {}", lines[2]);
    assert!(lines[3].contains("access"), "field read: {}", lines[3]);
    assert!(
        lines[4].contains("?$success#-1"),
        "success bound: {}",
        lines[4]
    );
    // The square constructor writes its tag word before the field.
    let (_, square_body) = lowered(&result, "square");
    let square_lines = prim_lines(square_body);
    assert!(square_lines[1].contains("mutate"));
    assert!(
        square_lines[1].contains(", 0, 1, 1)"),
        "tag 1 at offset 0: {}",
        square_lines[1]
    );
}

/// A compiled module round-trips through its binary artifact unchanged.
#[test]
fn artifact_round_trip_preserves_compiled_module() {
    let result = compile_items(vec![
        point_type(),
        proc_decl(
            "origin",
            vec![out_param("p", point_ty())],
            vec![Stmt::assign(
                "p",
                Placed::unplaced(Exp::fncall("point", vec![int(0), int(0)])),
            )],
        ),
    ]);
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let module = &result.modules[&module_spec()];
    let bytes = encode_module(module).unwrap();
    let decoded = decode_module(&bytes).unwrap();
    assert_eq!(*module, decoded);
}

/// A fully compiled module satisfies the code generator's contract.
#[test]
fn compiled_module_passes_codegen_checks() {
    let spec = module_spec();
    let placed = vec![
        Placed::unplaced(point_type()),
        Placed::unplaced(proc_decl(
            "origin",
            vec![out_param("p", point_ty())],
            vec![Stmt::assign(
                "p",
                Placed::unplaced(Exp::fncall("point", vec![int(0), int(0)])),
            )],
        )),
    ];
    let mut compiler = wybec::Compiler::new(CompilerOptions::default());
    compiler.add_source(spec.clone(), placed);
    compiler.compile_module(&spec).unwrap();
    let input = prepare_module(&compiler, &spec).expect("contract satisfied");
    assert_eq!(input.module, spec);
    assert!(!input.procs.is_empty());
    assert!(compiler.finish().success);
}

/// Nested module declarations compile as their own modules, importable by
/// the parent.
#[test]
fn nested_module_compiles_and_exports() {
    let inner_proc = Item::ProcDecl {
        visibility: Visibility::Public,
        det: Default::default(),
        proto: wybec::ast::ProcProto::new("five", vec![out_param("r", TypeSpec::int())]),
        body: vec![Placed::unplaced(Stmt::assign("r", int(5)))],
    };
    let outer = vec![
        Placed::unplaced(Item::ModuleDecl {
            visibility: Visibility::Public,
            name: "util".into(),
            items: vec![Placed::unplaced(inner_proc)],
        }),
        Placed::unplaced(proc_decl(
            "main",
            vec![out_param("r", TypeSpec::int())],
            vec![Stmt::call("five", vec![set("r")])],
        )),
    ];
    let spec = module_spec();
    let result = compile(CompilerOptions::default(), vec![(spec.clone(), outer)], &spec).unwrap();
    assert!(result.outcome.success, "{:?}", result.outcome.diagnostics);
    let sub = spec.child("util");
    assert!(result.modules.contains_key(&sub));
    let parent = &result.modules[&spec];
    let imp = parent.implementation.as_ref().unwrap();
    assert!(imp.submodules.contains_key("util"));
    assert!(imp.imports.contains_key(&sub));
}
