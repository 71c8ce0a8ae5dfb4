//! The primitive intermediate representation.
//!
//! After unbranching, every proc body is a tree of three-address
//! instructions ([`Prim`]) terminated by either nothing or a multi-way
//! branch ([`PrimFork`]) on an integer-valued variable. Variables are in
//! SSA form: a [`PrimVarName`] pairs the source name with a numeric suffix,
//! and each (name, suffix) pair is assigned at most once along any
//! root-to-leaf path.

use crate::ast::pos::Placed;
use crate::types::{Ident, ModSpec, TypeSpec};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The suffix reserved for the ultimate output value of a name: the version
/// a proc's out parameters carry in its prototype.
pub const FINAL_SUFFIX: i32 = -1;

/// An SSA variable: source name plus version suffix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimVarName {
    /// The source-level name.
    pub name: Ident,
    /// Version suffix; 0 is the first binding, [`FINAL_SUFFIX`] the
    /// ultimate output value.
    pub suffix: i32,
}

impl PrimVarName {
    /// Creates a variable with an explicit suffix.
    pub fn new(name: impl Into<Ident>, suffix: i32) -> Self {
        Self {
            name: name.into(),
            suffix,
        }
    }

    /// The first binding of `name`.
    pub fn first(name: impl Into<Ident>) -> Self {
        Self::new(name, 0)
    }

    /// The ultimate output value of `name`.
    pub fn ultimate(name: impl Into<Ident>) -> Self {
        Self::new(name, FINAL_SUFFIX)
    }
}

impl fmt::Display for PrimVarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.suffix)
    }
}

/// Direction a primitive argument flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimFlow {
    /// Read by the instruction.
    In,
    /// Written by the instruction.
    Out,
}

impl fmt::Display for PrimFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimFlow::In => Ok(()),
            PrimFlow::Out => write!(f, "?"),
        }
    }
}

/// How an argument position relates to the source parameter it came from.
///
/// An in/out source parameter is split into an in half and an out half
/// during lowering; the tag records which half an argument is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FlowTag {
    /// An ordinary in or out parameter.
    #[default]
    Ordinary,
    /// The in half of a split in/out parameter.
    FirstHalf,
    /// The out half of a split in/out parameter.
    SecondHalf,
    /// A compiler-introduced argument with no source counterpart.
    Implicit,
}

/// An argument to a primitive instruction: a variable reference or a typed
/// literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PrimArg {
    /// A variable occurrence.
    Var {
        /// The SSA variable.
        name: PrimVarName,
        /// The variable's type.
        ty: TypeSpec,
        /// Whether this occurrence reads or writes the variable.
        flow: PrimFlow,
        /// How this argument relates to its source parameter.
        flow_tag: FlowTag,
        /// True when upstream analysis guarantees this read is the last use
        /// of the variable on its branch.
        final_use: bool,
    },
    /// Integer literal.
    Int(i64, TypeSpec),
    /// Floating point literal.
    Float(f64, TypeSpec),
    /// String literal.
    Str(String, TypeSpec),
    /// Character literal.
    Char(char, TypeSpec),
}

impl PrimArg {
    /// An input variable occurrence with ordinary flow tag.
    pub fn input(name: PrimVarName, ty: TypeSpec) -> Self {
        PrimArg::Var {
            name,
            ty,
            flow: PrimFlow::In,
            flow_tag: FlowTag::Ordinary,
            final_use: false,
        }
    }

    /// An output variable occurrence with ordinary flow tag.
    pub fn output(name: PrimVarName, ty: TypeSpec) -> Self {
        PrimArg::Var {
            name,
            ty,
            flow: PrimFlow::Out,
            flow_tag: FlowTag::Ordinary,
            final_use: false,
        }
    }

    /// An untyped-int literal argument.
    pub fn int(value: i64) -> Self {
        PrimArg::Int(value, TypeSpec::int())
    }

    /// The argument's type.
    pub fn ty(&self) -> &TypeSpec {
        match self {
            PrimArg::Var { ty, .. }
            | PrimArg::Int(_, ty)
            | PrimArg::Float(_, ty)
            | PrimArg::Str(_, ty)
            | PrimArg::Char(_, ty) => ty,
        }
    }

    /// The argument's flow; literals always flow in.
    pub fn flow(&self) -> PrimFlow {
        match self {
            PrimArg::Var { flow, .. } => *flow,
            _ => PrimFlow::In,
        }
    }

    /// True if this argument is read by its instruction.
    pub fn is_input(&self) -> bool {
        self.flow() == PrimFlow::In
    }

    /// True if this argument is written by its instruction.
    pub fn is_output(&self) -> bool {
        self.flow() == PrimFlow::Out
    }

    /// The variable name, if this argument is a variable.
    pub fn var_name(&self) -> Option<&PrimVarName> {
        match self {
            PrimArg::Var { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The final-use flag; literals are never final uses.
    pub fn is_final_use(&self) -> bool {
        matches!(
            self,
            PrimArg::Var {
                final_use: true,
                ..
            }
        )
    }

    /// A copy of this argument normalised for value identity: final-use and
    /// flow tags cleared. Used to key the common-subexpression table.
    pub fn value_key(&self) -> PrimArg {
        match self {
            PrimArg::Var { name, ty, flow, .. } => PrimArg::Var {
                name: name.clone(),
                ty: ty.clone(),
                flow: *flow,
                flow_tag: FlowTag::Ordinary,
                final_use: false,
            },
            other => other.clone(),
        }
    }
}

// Float literals are compared and hashed bitwise so arguments can key hash
// tables; NaN payloads distinguish, which is the conservative direction for
// CSE.
impl PartialEq for PrimArg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                PrimArg::Var {
                    name: a,
                    ty: ta,
                    flow: fa,
                    flow_tag: ga,
                    final_use: ua,
                },
                PrimArg::Var {
                    name: b,
                    ty: tb,
                    flow: fb,
                    flow_tag: gb,
                    final_use: ub,
                },
            ) => a == b && ta == tb && fa == fb && ga == gb && ua == ub,
            (PrimArg::Int(a, ta), PrimArg::Int(b, tb)) => a == b && ta == tb,
            (PrimArg::Float(a, ta), PrimArg::Float(b, tb)) => {
                a.to_bits() == b.to_bits() && ta == tb
            }
            (PrimArg::Str(a, ta), PrimArg::Str(b, tb)) => a == b && ta == tb,
            (PrimArg::Char(a, ta), PrimArg::Char(b, tb)) => a == b && ta == tb,
            _ => false,
        }
    }
}

impl Eq for PrimArg {}

impl Hash for PrimArg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            PrimArg::Var {
                name,
                ty,
                flow,
                flow_tag,
                final_use,
            } => {
                name.hash(state);
                ty.hash(state);
                flow.hash(state);
                flow_tag.hash(state);
                final_use.hash(state);
            }
            PrimArg::Int(v, ty) => {
                v.hash(state);
                ty.hash(state);
            }
            PrimArg::Float(v, ty) => {
                v.to_bits().hash(state);
                ty.hash(state);
            }
            PrimArg::Str(v, ty) => {
                v.hash(state);
                ty.hash(state);
            }
            PrimArg::Char(v, ty) => {
                v.hash(state);
                ty.hash(state);
            }
        }
    }
}

impl fmt::Display for PrimArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimArg::Var {
                name,
                flow,
                final_use,
                ..
            } => {
                write!(f, "{flow}{name}")?;
                if *final_use {
                    write!(f, "^")?;
                }
                Ok(())
            }
            PrimArg::Int(v, _) => write!(f, "{v}"),
            PrimArg::Float(v, _) => write!(f, "{v}"),
            PrimArg::Str(v, _) => write!(f, "{v:?}"),
            PrimArg::Char(v, _) => write!(f, "{v:?}"),
        }
    }
}

/// Argument vector for a primitive instruction.
pub type PrimArgs = SmallVec<[PrimArg; 4]>;

/// A reference to a particular proc: module, name, and overload index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcSpec {
    /// Module defining the proc.
    pub module: ModSpec,
    /// Proc name.
    pub name: Ident,
    /// Index among same-named procs in the module.
    pub id: usize,
}

impl ProcSpec {
    /// Creates a proc spec.
    pub fn new(module: ModSpec, name: impl Into<Ident>, id: usize) -> Self {
        Self {
            module,
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for ProcSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}<{}>", self.module, self.name, self.id)
    }
}

/// A three-address primitive instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Prim {
    /// Call another proc.
    Call(ProcSpec, PrimArgs),
    /// Call a foreign operation; `"llvm"` names the builtin operators.
    Foreign {
        /// Foreign language.
        lang: Ident,
        /// Operation name.
        name: Ident,
        /// Operation flags (comparison predicates, purity markers).
        flags: Vec<Ident>,
        /// Arguments.
        args: PrimArgs,
    },
    /// Fail unless `var` holds `value`; only meaningful in semi-det procs.
    Guard {
        /// The tested variable.
        var: PrimVarName,
        /// The value it must hold.
        value: i64,
    },
    /// Unconditional failure.
    Fail,
    /// No operation; dropped during body assembly.
    Nop,
}

impl Prim {
    /// A builtin `"llvm"` operation.
    pub fn llvm(name: impl Into<Ident>, flags: Vec<Ident>, args: PrimArgs) -> Self {
        Prim::Foreign {
            lang: "llvm".into(),
            name: name.into(),
            flags,
            args,
        }
    }

    /// The builtin register-to-register move.
    pub fn moves(source: PrimArg, target: PrimArg) -> Self {
        Prim::llvm("move", vec![], PrimArgs::from_iter([source, target]))
    }

    /// The instruction's arguments, empty for guards, fail, and nop.
    pub fn args(&self) -> &[PrimArg] {
        match self {
            Prim::Call(_, args) | Prim::Foreign { args, .. } => args,
            Prim::Guard { .. } | Prim::Fail | Prim::Nop => &[],
        }
    }

    /// Mutable view of the instruction's arguments.
    pub fn args_mut(&mut self) -> &mut [PrimArg] {
        match self {
            Prim::Call(_, args) | Prim::Foreign { args, .. } => args,
            Prim::Guard { .. } | Prim::Fail | Prim::Nop => &mut [],
        }
    }

    /// Variable names this instruction reads, including a guard's tested
    /// variable.
    pub fn input_var_names(&self) -> Vec<&PrimVarName> {
        match self {
            Prim::Guard { var, .. } => vec![var],
            _ => self
                .args()
                .iter()
                .filter(|a| a.is_input())
                .filter_map(PrimArg::var_name)
                .collect(),
        }
    }

    /// Variable names this instruction writes.
    pub fn output_var_names(&self) -> Vec<&PrimVarName> {
        self.args()
            .iter()
            .filter(|a| a.is_output())
            .filter_map(PrimArg::var_name)
            .collect()
    }

    /// True for the builtin move operation.
    pub fn is_move(&self) -> bool {
        matches!(
            self,
            Prim::Foreign { lang, name, .. } if lang == "llvm" && name == "move"
        )
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_args = |f: &mut fmt::Formatter<'_>, args: &[PrimArg]| {
            write!(f, "(")?;
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{a}")?;
            }
            write!(f, ")")
        };
        match self {
            Prim::Call(spec, args) => {
                write!(f, "call {spec}")?;
                write_args(f, args)
            }
            Prim::Foreign {
                lang,
                name,
                flags,
                args,
            } => {
                write!(f, "foreign {lang} {name}")?;
                for flag in flags {
                    write!(f, " {flag}")?;
                }
                write_args(f, args)
            }
            Prim::Guard { var, value } => write!(f, "guard {var} = {value}"),
            Prim::Fail => write!(f, "fail"),
            Prim::Nop => write!(f, "nop"),
        }
    }
}

/// A formal parameter of a lowered proc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimParam {
    /// The parameter's SSA name: suffix 0 for inputs, [`FINAL_SUFFIX`] for
    /// outputs.
    pub name: PrimVarName,
    /// Parameter type.
    pub ty: TypeSpec,
    /// Flow direction.
    pub flow: PrimFlow,
    /// Relation to the source parameter.
    pub flow_tag: FlowTag,
}

impl PrimParam {
    /// Creates a parameter with ordinary flow tag.
    pub fn new(name: PrimVarName, ty: TypeSpec, flow: PrimFlow) -> Self {
        Self {
            name,
            ty,
            flow,
            flow_tag: FlowTag::Ordinary,
        }
    }

    /// True for parameters of the phantom type, which occupy no runtime
    /// storage and take no part in aliasing.
    pub fn is_phantom(&self) -> bool {
        self.ty.is_phantom()
    }
}

impl fmt::Display for PrimParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", self.flow, self.name, self.ty)
    }
}

/// A lowered proc prototype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimProto {
    /// Proc name.
    pub name: Ident,
    /// Formal parameters.
    pub params: Vec<PrimParam>,
}

impl PrimProto {
    /// Creates a prototype.
    pub fn new(name: impl Into<Ident>, params: Vec<PrimParam>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// The position of the parameter with the given source name, if any.
    pub fn param_index(&self, name: &Ident) -> Option<usize> {
        self.params.iter().position(|p| p.name.name == *name)
    }
}

impl fmt::Display for PrimProto {
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

/// The terminator of a [`ProcBody`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrimFork {
    /// The body falls off its end (an implicit return).
    #[default]
    NoFork,
    /// Branch on an integer-valued variable: branch index equals variable
    /// value.
    Fork {
        /// The branched-on variable.
        var: PrimVarName,
        /// True when the branches are terminal and never rejoin.
        is_final: bool,
        /// One body per variable value, at least two.
        branches: Vec<ProcBody>,
    },
}

/// A lowered proc body: a sequence of placed prims ending in a fork or
/// nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcBody {
    /// The instructions, in execution order.
    pub prims: Vec<Placed<Prim>>,
    /// How the body ends.
    pub fork: PrimFork,
}

impl ProcBody {
    /// An empty body with no fork.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Total prim count over the whole tree.
    pub fn size(&self) -> usize {
        let mut n = self.prims.len();
        if let PrimFork::Fork { branches, .. } = &self.fork {
            n += branches.iter().map(ProcBody::size).sum::<usize>();
        }
        n
    }

    /// Applies `f` to every prim in the tree, in execution order.
    pub fn visit_prims<'a>(&'a self, f: &mut impl FnMut(&'a Placed<Prim>)) {
        for prim in &self.prims {
            f(prim);
        }
        if let PrimFork::Fork { branches, .. } = &self.fork {
            for branch in branches {
                branch.visit_prims(f);
            }
        }
    }

    /// All prims of the tree in execution order.
    pub fn all_prims(&self) -> Vec<&Placed<Prim>> {
        let mut out = Vec::new();
        self.visit_prims(&mut |p| out.push(p));
        out
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "    ".repeat(indent);
        for prim in &self.prims {
            writeln!(f, "{pad}{}", prim.node)?;
        }
        match &self.fork {
            PrimFork::NoFork => Ok(()),
            PrimFork::Fork {
                var,
                is_final,
                branches,
            } => {
                let marker = if *is_final { " (final)" } else { "" };
                writeln!(f, "{pad}case {var}{marker}:")?;
                for (value, branch) in branches.iter().enumerate() {
                    writeln!(f, "{pad}  {value}:")?;
                    branch.fmt_indented(f, indent + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for ProcBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::pos::Placed;

    fn add_prim() -> Prim {
        Prim::llvm(
            "add",
            vec![],
            PrimArgs::from_iter([
                PrimArg::input(PrimVarName::first("x"), TypeSpec::int()),
                PrimArg::int(1),
                PrimArg::output(PrimVarName::ultimate("y"), TypeSpec::int()),
            ]),
        )
    }

    #[test]
    fn var_name_display() {
        assert_eq!(PrimVarName::first("x").to_string(), "x#0");
        assert_eq!(PrimVarName::ultimate("y").to_string(), "y#-1");
    }

    #[test]
    fn prim_display() {
        assert_eq!(
            add_prim().to_string(),
            "foreign llvm add(x#0, 1, ?y#-1)"
        );
        assert_eq!(
            Prim::Guard {
                var: PrimVarName::first("tag"),
                value: 1
            }
            .to_string(),
            "guard tag#0 = 1"
        );
    }

    #[test]
    fn input_output_partition() {
        let prim = add_prim();
        let ins: Vec<_> = prim.input_var_names();
        let outs: Vec<_> = prim.output_var_names();
        assert_eq!(ins, vec![&PrimVarName::first("x")]);
        assert_eq!(outs, vec![&PrimVarName::ultimate("y")]);
    }

    #[test]
    fn guard_reads_its_variable() {
        let guard = Prim::Guard {
            var: PrimVarName::first("tag"),
            value: 0,
        };
        assert_eq!(guard.input_var_names(), vec![&PrimVarName::first("tag")]);
        assert!(guard.output_var_names().is_empty());
    }

    #[test]
    fn float_args_compare_bitwise() {
        let a = PrimArg::Float(1.5, TypeSpec::float());
        let b = PrimArg::Float(1.5, TypeSpec::float());
        let c = PrimArg::Float(2.5, TypeSpec::float());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn value_key_clears_final_use() {
        let arg = PrimArg::Var {
            name: PrimVarName::first("x"),
            ty: TypeSpec::int(),
            flow: PrimFlow::In,
            flow_tag: FlowTag::FirstHalf,
            final_use: true,
        };
        let key = arg.value_key();
        assert!(!key.is_final_use());
        assert_eq!(
            key,
            PrimArg::input(PrimVarName::first("x"), TypeSpec::int())
        );
    }

    #[test]
    fn body_size_counts_branches() {
        let leaf = ProcBody {
            prims: vec![Placed::unplaced(add_prim())],
            fork: PrimFork::NoFork,
        };
        let body = ProcBody {
            prims: vec![Placed::unplaced(add_prim())],
            fork: PrimFork::Fork {
                var: PrimVarName::first("b"),
                is_final: true,
                branches: vec![leaf.clone(), leaf],
            },
        };
        assert_eq!(body.size(), 3);
        assert_eq!(body.all_prims().len(), 3);
    }

    #[test]
    fn moves_builder_is_move() {
        let mv = Prim::moves(
            PrimArg::int(5),
            PrimArg::output(PrimVarName::first("x"), TypeSpec::int()),
        );
        assert!(mv.is_move());
        assert!(!add_prim().is_move());
    }
}
