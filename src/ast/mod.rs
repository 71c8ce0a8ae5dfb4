//! AST node structures for the Wybe surface language.
//!
//! The parser is an external collaborator: this crate consumes a sequence of
//! top-level [`Item`]s whose statements and expressions are already
//! structured. Flow prefixes follow the surface syntax: no prefix reads a
//! value, `?` binds one, `!` does both.

pub mod pos;

pub use pos::{OptPos, Placed, SourcePos};

use crate::types::{Ident, ModSpec, TypeSpec, Visibility};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a parameter or argument variable flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamFlow {
    /// Value flows into the callee (no prefix).
    In,
    /// Value flows out of the callee (`?` prefix).
    Out,
    /// Value flows in and back out (`!` prefix).
    InOut,
}

impl fmt::Display for ParamFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamFlow::In => Ok(()),
            ParamFlow::Out => write!(f, "?"),
            ParamFlow::InOut => write!(f, "!"),
        }
    }
}

/// Whether a proc always succeeds or may fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Determinism {
    /// Always succeeds (ordinary proc).
    #[default]
    Det,
    /// May fail (`test` proc); lowered with an implicit Boolean output.
    SemiDet,
}

/// A formal parameter of a proc or function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name.
    pub name: Ident,
    /// Declared or inferred type.
    pub ty: TypeSpec,
    /// Flow direction.
    pub flow: ParamFlow,
}

impl Param {
    /// Creates a parameter.
    pub fn new(name: impl Into<Ident>, ty: TypeSpec, flow: ParamFlow) -> Self {
        Self {
            name: name.into(),
            ty,
            flow,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", self.flow, self.name, self.ty)
    }
}

/// A proc or function prototype: name and formal parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcProto {
    /// Proc name.
    pub name: Ident,
    /// Formal parameters in declaration order.
    pub params: Vec<Param>,
}

impl ProcProto {
    /// Creates a prototype.
    pub fn new(name: impl Into<Ident>, params: Vec<Param>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

impl fmt::Display for ProcProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ")")
    }
}

/// One constructor of a sum type, with named, typed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtorDecl {
    /// Constructor name.
    pub name: Ident,
    /// Field names and types in declaration order.
    pub fields: Vec<(Ident, TypeSpec)>,
}

impl CtorDecl {
    /// Creates a constructor declaration.
    pub fn new(name: impl Into<Ident>, fields: Vec<(Ident, TypeSpec)>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

/// A top-level declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    /// `type Name(params) ctors end`
    TypeDecl {
        /// Export visibility.
        visibility: Visibility,
        /// Type name.
        name: Ident,
        /// Type parameter names.
        params: Vec<Ident>,
        /// The type's constructors.
        ctors: Vec<Placed<CtorDecl>>,
    },
    /// A nested `module Name ... end` declaration.
    ModuleDecl {
        /// Export visibility.
        visibility: Visibility,
        /// Submodule name.
        name: Ident,
        /// The submodule's own items.
        items: Vec<Placed<Item>>,
    },
    /// `use Module` — import a whole module.
    UseModules {
        /// Visibility under which imports are re-exported.
        visibility: Visibility,
        /// The modules imported.
        modules: Vec<ModSpec>,
    },
    /// `from Module use name, ...` — import selected items.
    FromUse {
        /// Visibility under which imports are re-exported.
        visibility: Visibility,
        /// The source module.
        module: ModSpec,
        /// The item names imported.
        names: Vec<Ident>,
    },
    /// A resource declaration.
    ResourceDecl {
        /// Export visibility.
        visibility: Visibility,
        /// Resource name.
        name: Ident,
        /// Resource type.
        ty: TypeSpec,
    },
    /// A procedure declaration.
    ProcDecl {
        /// Export visibility.
        visibility: Visibility,
        /// Whether the proc may fail.
        det: Determinism,
        /// Name and parameters.
        proto: ProcProto,
        /// Body statements.
        body: Vec<Placed<Stmt>>,
    },
    /// A function declaration; sugar for a proc with one extra output.
    FuncDecl {
        /// Export visibility.
        visibility: Visibility,
        /// Whether the function may fail.
        det: Determinism,
        /// Name and input parameters.
        proto: ProcProto,
        /// Result type.
        result: TypeSpec,
        /// Body expression.
        body: Placed<Exp>,
    },
}

/// A statement in a proc body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// A call to a proc, possibly module-qualified. The `=` proc doubles as
    /// assignment when its first argument has out flow.
    ProcCall {
        /// Qualifying module path; empty means unqualified.
        module: ModSpec,
        /// Proc name.
        name: Ident,
        /// Actual arguments.
        args: Vec<Placed<Exp>>,
    },
    /// `foreign lang name(args)`.
    ForeignCall {
        /// Foreign language; `"llvm"` names the builtin operators.
        lang: Ident,
        /// Operation name.
        name: Ident,
        /// Operation flags, e.g. comparison predicates.
        flags: Vec<Ident>,
        /// Actual arguments.
        args: Vec<Placed<Exp>>,
    },
    /// `if cond :: then | else :: otherwise end`, already reduced to
    /// two-way form.
    Cond {
        /// Boolean condition.
        cond: Placed<Exp>,
        /// Statements when the condition holds.
        then_stmts: Vec<Placed<Stmt>>,
        /// Statements when it does not.
        else_stmts: Vec<Placed<Stmt>>,
    },
    /// `do ... end`: repeat until `break`.
    Loop {
        /// Loop body statements.
        body: Vec<Placed<Stmt>>,
    },
    /// Leave the enclosing loop.
    Break,
    /// Restart the enclosing loop.
    Next,
    /// No operation.
    Nop,
}

impl Stmt {
    /// An unqualified proc call.
    pub fn call(name: impl Into<Ident>, args: Vec<Placed<Exp>>) -> Self {
        Stmt::ProcCall {
            module: ModSpec::default(),
            name: name.into(),
            args,
        }
    }

    /// The assignment statement `?name = exp`.
    pub fn assign(name: impl Into<Ident>, exp: Placed<Exp>) -> Self {
        Stmt::call(
            "=",
            vec![Placed::unplaced(Exp::var_set(name)), exp],
        )
    }
}

/// An expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Exp {
    /// Integer literal.
    IntValue(i64),
    /// Floating point literal.
    FloatValue(f64),
    /// String literal.
    StringValue(String),
    /// Character literal.
    CharValue(char),
    /// A variable reference with its flow prefix.
    Var {
        /// Source variable name.
        name: Ident,
        /// Flow direction of this occurrence.
        flow: ParamFlow,
    },
    /// `exp : Type` ascription.
    Typed {
        /// The ascribed expression.
        exp: Box<Placed<Exp>>,
        /// The ascribed type.
        ty: TypeSpec,
    },
    /// A function call used as a value.
    FnCall {
        /// Qualifying module path; empty means unqualified.
        module: ModSpec,
        /// Function name.
        name: Ident,
        /// Actual arguments.
        args: Vec<Placed<Exp>>,
    },
    /// A foreign function call used as a value.
    ForeignFn {
        /// Foreign language.
        lang: Ident,
        /// Operation name.
        name: Ident,
        /// Operation flags.
        flags: Vec<Ident>,
        /// Actual arguments.
        args: Vec<Placed<Exp>>,
    },
}

impl Exp {
    /// A variable read.
    pub fn var_get(name: impl Into<Ident>) -> Self {
        Exp::Var {
            name: name.into(),
            flow: ParamFlow::In,
        }
    }

    /// A variable binding (`?name`).
    pub fn var_set(name: impl Into<Ident>) -> Self {
        Exp::Var {
            name: name.into(),
            flow: ParamFlow::Out,
        }
    }

    /// A variable update (`!name`).
    pub fn var_both(name: impl Into<Ident>) -> Self {
        Exp::Var {
            name: name.into(),
            flow: ParamFlow::InOut,
        }
    }

    /// An unqualified function call.
    pub fn fncall(name: impl Into<Ident>, args: Vec<Placed<Exp>>) -> Self {
        Exp::FnCall {
            module: ModSpec::default(),
            name: name.into(),
            args,
        }
    }

    /// A builtin `"llvm"` operator applied to arguments.
    pub fn llvm_op(name: impl Into<Ident>, flags: Vec<Ident>, args: Vec<Placed<Exp>>) -> Self {
        Exp::ForeignFn {
            lang: "llvm".into(),
            name: name.into(),
            flags,
            args,
        }
    }

    /// True for expressions the flattener passes through unchanged:
    /// literals and variable references, possibly type-ascribed.
    pub fn is_atomic(&self) -> bool {
        match self {
            Exp::IntValue(_)
            | Exp::FloatValue(_)
            | Exp::StringValue(_)
            | Exp::CharValue(_)
            | Exp::Var { .. } => true,
            Exp::Typed { exp, .. } => exp.node.is_atomic(),
            Exp::FnCall { .. } | Exp::ForeignFn { .. } => false,
        }
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exp::IntValue(n) => write!(f, "{n}"),
            Exp::FloatValue(x) => write!(f, "{x}"),
            Exp::StringValue(s) => write!(f, "{s:?}"),
            Exp::CharValue(c) => write!(f, "{c:?}"),
            Exp::Var { name, flow } => write!(f, "{flow}{name}"),
            Exp::Typed { exp, ty } => write!(f, "{}:{ty}", exp.node),
            Exp::FnCall { module, name, args } => {
                if !module.is_empty() {
                    write!(f, "{module}.")?;
                }
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a.node)?;
                }
                write!(f, ")")
            }
            Exp::ForeignFn {
                lang, name, args, ..
            } => {
                write!(f, "foreign {lang} {name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a.node)?;
                }
                write!(f, ")")
            }
        }
    }
}
