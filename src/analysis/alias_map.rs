//! Union-find over primitive variable names.
//!
//! An [`AliasMap`] represents an equivalence relation over variables: two
//! variables are in the same class when they may refer to the same runtime
//! value. Maps are small (bounded by proc size), so a path-compressed
//! union-by-rank structure over hash tables is plenty.

use crate::prim::PrimVarName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// An equivalence relation over variable names.
///
/// Variables not present in the map are implicitly singleton classes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AliasMap {
    /// Parent pointers; roots map to themselves.
    parent: HashMap<PrimVarName, PrimVarName>,
    /// Union-by-rank bookkeeping, kept only for roots.
    rank: HashMap<PrimVarName, u32>,
}

impl AliasMap {
    /// An empty relation.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no variable has been united with any other.
    pub fn is_empty(&self) -> bool {
        self.parent
            .iter()
            .all(|(var, parent)| var == parent && self.class_size(var) == 1)
    }

    fn class_size(&self, var: &PrimVarName) -> usize {
        let root = self.root_of(var);
        self.parent
            .keys()
            .filter(|v| self.root_of(v) == root)
            .count()
    }

    /// The representative of `var`'s class without modifying the structure.
    pub fn root_of(&self, var: &PrimVarName) -> PrimVarName {
        let mut current = var;
        while let Some(parent) = self.parent.get(current) {
            if parent == current {
                break;
            }
            current = parent;
        }
        current.clone()
    }

    /// The representative of `var`'s class, compressing the path to it.
    pub fn find(&mut self, var: &PrimVarName) -> PrimVarName {
        let root = self.root_of(var);
        // Point every variable on the walked path directly at the root.
        let mut current = var.clone();
        while let Some(parent) = self.parent.get(&current).cloned() {
            if parent == current {
                break;
            }
            self.parent.insert(current, root.clone());
            current = parent;
        }
        root
    }

    /// Merges the classes of `a` and `b`.
    pub fn unite(&mut self, a: &PrimVarName, b: &PrimVarName) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        self.parent.entry(ra.clone()).or_insert_with(|| ra.clone());
        self.parent.entry(rb.clone()).or_insert_with(|| rb.clone());
        let rank_a = self.rank.get(&ra).copied().unwrap_or(0);
        let rank_b = self.rank.get(&rb).copied().unwrap_or(0);
        let (child, root) = if rank_a < rank_b { (ra, rb) } else { (rb, ra) };
        if rank_a == rank_b {
            self.rank.insert(root.clone(), rank_a + 1);
        }
        self.parent.insert(child, root);
    }

    /// True when `a` and `b` are in the same class.
    pub fn aliased(&self, a: &PrimVarName, b: &PrimVarName) -> bool {
        a == b || self.root_of(a) == self.root_of(b)
    }

    /// True when nothing else shares `var`'s class.
    pub fn is_singleton(&self, var: &PrimVarName) -> bool {
        let root = self.root_of(var);
        !self
            .parent
            .keys()
            .any(|other| other != var && self.root_of(other) == root)
    }

    /// All members of `var`'s class, including `var` itself if present.
    pub fn class_members(&self, var: &PrimVarName) -> Vec<PrimVarName> {
        let root = self.root_of(var);
        let mut members: Vec<_> = self
            .parent
            .keys()
            .filter(|v| self.root_of(v) == root)
            .cloned()
            .collect();
        members.sort();
        members
    }

    /// Removes `var` from the relation.
    ///
    /// If `var` roots a class, the remaining members are re-rooted on one of
    /// them; an emptied class disappears.
    pub fn remove_key(&mut self, var: &PrimVarName) {
        if !self.parent.contains_key(var) {
            return;
        }
        let root = self.root_of(var);
        let mut remaining: Vec<_> = self
            .parent
            .keys()
            .filter(|v| *v != var && self.root_of(v) == root)
            .cloned()
            .collect();
        remaining.sort();
        for v in &remaining {
            self.parent.remove(v);
        }
        self.parent.remove(var);
        self.rank.remove(var);
        self.rank.remove(&root);
        if let Some((new_root, rest)) = remaining.split_first() {
            self.parent.insert(new_root.clone(), new_root.clone());
            for v in rest {
                self.parent.insert(v.clone(), new_root.clone());
            }
        }
    }

    /// Keeps only variables `keep` accepts, re-rooting surviving class
    /// fragments.
    pub fn retain(&mut self, keep: impl Fn(&PrimVarName) -> bool) {
        let doomed: Vec<_> = self.parent.keys().filter(|v| !keep(v)).cloned().collect();
        for var in doomed {
            self.remove_key(&var);
        }
    }

    /// The relation as a canonical pair list: within each class the members
    /// are sorted and each is paired with the smallest member; the list of
    /// pairs is itself sorted and duplicate-free.
    ///
    /// Two maps describe the same relation exactly when their pair lists are
    /// equal.
    pub fn pairs(&self) -> Vec<(PrimVarName, PrimVarName)> {
        let mut classes: HashMap<PrimVarName, Vec<PrimVarName>> = HashMap::new();
        for var in self.parent.keys() {
            classes.entry(self.root_of(var)).or_default().push(var.clone());
        }
        let mut pairs = Vec::new();
        for members in classes.into_values() {
            if members.len() < 2 {
                continue;
            }
            let mut members = members;
            members.sort();
            let (least, rest) = members.split_first().expect("class has two members");
            for var in rest {
                pairs.push((least.clone(), var.clone()));
            }
        }
        pairs.sort();
        pairs.dedup();
        pairs
    }

    /// All variables mentioned in the relation.
    pub fn vars(&self) -> impl Iterator<Item = &PrimVarName> {
        self.parent.keys()
    }
}

impl fmt::Display for AliasMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (a, b)) in self.pairs().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{a} ~ {b}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> PrimVarName {
        PrimVarName::first(name)
    }

    #[test]
    fn fresh_vars_are_singletons() {
        let map = AliasMap::new();
        assert!(map.is_singleton(&var("x")));
        assert!(!map.aliased(&var("x"), &var("y")));
        assert!(map.aliased(&var("x"), &var("x")));
    }

    #[test]
    fn unite_then_aliased() {
        let mut map = AliasMap::new();
        map.unite(&var("a"), &var("b"));
        assert!(map.aliased(&var("a"), &var("b")));
        assert!(!map.is_singleton(&var("a")));
        assert!(map.is_singleton(&var("c")));
    }

    #[test]
    fn transitive_unification() {
        let mut map = AliasMap::new();
        map.unite(&var("a"), &var("b"));
        map.unite(&var("b"), &var("c"));
        assert!(map.aliased(&var("a"), &var("c")));
        assert_eq!(map.class_members(&var("a")).len(), 3);
    }

    #[test]
    fn pairs_are_canonical() {
        let mut left = AliasMap::new();
        left.unite(&var("a"), &var("b"));
        left.unite(&var("b"), &var("c"));

        let mut right = AliasMap::new();
        right.unite(&var("c"), &var("a"));
        right.unite(&var("a"), &var("b"));

        assert_eq!(left.pairs(), right.pairs());
        assert_eq!(
            left.pairs(),
            vec![(var("a"), var("b")), (var("a"), var("c"))]
        );
    }

    #[test]
    fn remove_member_keeps_class() {
        let mut map = AliasMap::new();
        map.unite(&var("a"), &var("b"));
        map.unite(&var("b"), &var("c"));
        map.remove_key(&var("b"));
        assert!(map.aliased(&var("a"), &var("c")));
        assert!(map.is_singleton(&var("b")));
    }

    #[test]
    fn remove_root_rewrites_class() {
        let mut map = AliasMap::new();
        map.unite(&var("a"), &var("b"));
        map.unite(&var("a"), &var("c"));
        let root = map.root_of(&var("a"));
        map.remove_key(&root);
        let mut survivors = vec![var("a"), var("b"), var("c")];
        survivors.retain(|v| *v != root);
        assert!(map.aliased(&survivors[0], &survivors[1]));
        assert!(map.is_singleton(&root));
    }

    #[test]
    fn remove_from_two_member_class_empties_it() {
        let mut map = AliasMap::new();
        map.unite(&var("a"), &var("b"));
        map.remove_key(&var("a"));
        assert!(map.is_singleton(&var("b")));
        assert!(map.pairs().is_empty());
    }

    #[test]
    fn retain_filters_to_params() {
        let mut map = AliasMap::new();
        map.unite(&var("p"), &var("t"));
        map.unite(&var("t"), &var("q"));
        map.retain(|v| v.name == "p" || v.name == "q");
        assert!(map.aliased(&var("p"), &var("q")));
        assert!(map.is_singleton(&var("t")));
    }

    #[test]
    fn empty_relation_reports_empty() {
        let mut map = AliasMap::new();
        assert!(map.is_empty());
        map.unite(&var("a"), &var("b"));
        assert!(!map.is_empty());
        map.remove_key(&var("a"));
        // A one-member class left behind still encodes no aliasing.
        assert!(map.is_empty());
    }
}
