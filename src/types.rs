//! Foundation types shared across the compiler: identifiers, module paths,
//! visibility, and type specifications.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// An identifier: a module segment, variable source name, procedure name,
/// type name, or foreign-call name.
pub type Ident = SmolStr;

/// Returns true if `name` is a compiler-generated name.
///
/// The grammar forbids user identifiers starting with `$`, so generated
/// temporaries and lifted procs can never collide with source names.
pub fn is_generated_name(name: &str) -> bool {
    name.starts_with('$')
}

/// An ordered path of identifiers naming a module.
///
/// Rendered dotted (`foo.bar.baz`) for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModSpec(pub Vec<Ident>);

impl ModSpec {
    /// Creates a module spec from path segments.
    pub fn new(segments: impl IntoIterator<Item = impl Into<Ident>>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The spec of a submodule named `name` under this module.
    pub fn child(&self, name: impl Into<Ident>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    /// The enclosing module's spec, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// The final path segment, the module's own name.
    pub fn name(&self) -> Option<&Ident> {
        self.0.last()
    }

    /// Number of path segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty (root) spec.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ModSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// Whether a declared item is visible outside its defining module.
///
/// Totally ordered with `Public > Private`, so combining visibilities is
/// `Ord::max`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Visibility {
    /// Visible only within the defining module.
    #[default]
    Private,
    /// Exported through the module interface.
    Public,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "pub"),
            Visibility::Private => write!(f, "priv"),
        }
    }
}

/// A type expression: either not yet determined, or a named type constructor
/// applied to type arguments.
///
/// Equality is structural; `Unspecified` compares equal only to itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TypeSpec {
    /// A type still to be inferred.
    #[default]
    Unspecified,
    /// A concrete type constructor.
    Type {
        /// Module defining the type.
        module: ModSpec,
        /// Type constructor name.
        name: Ident,
        /// Type arguments, empty for non-generic types.
        params: Vec<TypeSpec>,
    },
}

impl TypeSpec {
    /// A non-generic type `module.name`.
    pub fn simple(module: ModSpec, name: impl Into<Ident>) -> Self {
        TypeSpec::Type {
            module,
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// The builtin machine integer type.
    pub fn int() -> Self {
        Self::simple(ModSpec::new(["wybe"]), "int")
    }

    /// The builtin floating point type.
    pub fn float() -> Self {
        Self::simple(ModSpec::new(["wybe"]), "float")
    }

    /// The builtin Boolean type.
    pub fn bool() -> Self {
        Self::simple(ModSpec::new(["wybe"]), "bool")
    }

    /// The builtin character type.
    pub fn char() -> Self {
        Self::simple(ModSpec::new(["wybe"]), "char")
    }

    /// The builtin string type.
    pub fn string() -> Self {
        Self::simple(ModSpec::new(["wybe"]), "string")
    }

    /// The phantom type, occupying no runtime storage.
    pub fn phantom() -> Self {
        Self::simple(ModSpec::new(["wybe"]), "phantom")
    }

    /// True if this type has been determined.
    pub fn is_specified(&self) -> bool {
        !matches!(self, TypeSpec::Unspecified)
    }

    /// True for the phantom type.
    pub fn is_phantom(&self) -> bool {
        matches!(self, TypeSpec::Type { name, .. } if name == "phantom")
    }

    /// True for types represented unboxed in a machine word or register.
    ///
    /// Everything else is address-valued at runtime and can alias.
    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            TypeSpec::Type { name, .. }
                if name == "int" || name == "float" || name == "bool"
                    || name == "char" || name == "phantom"
        )
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpec::Unspecified => write!(f, "?"),
            TypeSpec::Type {
                module,
                name,
                params,
            } => {
                if !module.is_empty() {
                    write!(f, "{module}.")?;
                }
                write!(f, "{name}")?;
                if !params.is_empty() {
                    write!(f, "(")?;
                    for (i, p) in params.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{p}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}
