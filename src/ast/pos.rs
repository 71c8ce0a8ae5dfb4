//! Source position tracking: optional file/line/column positions and placed
//! nodes.

use crate::types::Ident;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in a source file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourcePos {
    /// Source file name.
    pub file: Ident,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

impl SourcePos {
    /// Creates a source position.
    pub fn new(file: impl Into<Ident>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An optional source position.
///
/// Attached to almost every syntactic and IR node. Positions never affect
/// semantics, only diagnostics; compiled artifacts compare equal regardless
/// of positions.
pub type OptPos = Option<SourcePos>;

/// A value with an associated optional source position.
///
/// `Placed<T>` pairs a syntax or IR node with where it appeared in source.
/// This is the primary building block for nodes that need positional
/// information for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placed<T> {
    /// The wrapped value.
    pub node: T,
    /// Where the node appeared, if known.
    pub pos: OptPos,
}

impl<T> Placed<T> {
    /// Creates a placed value.
    pub fn new(node: T, pos: OptPos) -> Self {
        Self { node, pos }
    }

    /// Creates a placed value with no position.
    pub fn unplaced(node: T) -> Self {
        Self { node, pos: None }
    }

    /// Maps the inner value while preserving the position.
    pub fn map<U, F>(self, f: F) -> Placed<U>
    where
        F: FnOnce(T) -> U,
    {
        Placed {
            node: f(self.node),
            pos: self.pos,
        }
    }

    /// Extracts the inner value, discarding the position.
    pub fn into_inner(self) -> T {
        self.node
    }

    /// Rebuilds with the same position around a different node.
    pub fn replace<U>(&self, node: U) -> Placed<U> {
        Placed {
            node,
            pos: self.pos.clone(),
        }
    }
}

impl<T> AsRef<T> for Placed<T> {
    fn as_ref(&self) -> &T {
        &self.node
    }
}

impl<T> AsMut<T> for Placed<T> {
    fn as_mut(&mut self) -> &mut T {
        &mut self.node
    }
}

impl<T: fmt::Display> fmt::Display for Placed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node)
    }
}
