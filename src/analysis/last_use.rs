//! Final-use marking: a backward sweep setting the `final_use` flag on the
//! last read of each variable along every branch.
//!
//! Alias analysis trusts these flags; they are computed here right after
//! lowering, before a proc is analysed. A read is final when no later prim
//! on the same root-to-leaf path reads the same variable.

use crate::prim::{Prim, PrimArg, PrimFork, ProcBody};
use crate::prim::PrimVarName;
use std::collections::HashSet;

/// Marks final uses throughout a body tree.
///
/// Returns the set of variables the body reads before defining them, which
/// is also what remains live at its entry.
pub fn mark_final_uses(body: &mut ProcBody) -> HashSet<PrimVarName> {
    // Live-after at the end of this segment comes from the fork, if any: a
    // variable is live if any branch reads it, and the forked-on variable is
    // read by the fork itself.
    let mut live: HashSet<PrimVarName> = match &mut body.fork {
        PrimFork::NoFork => HashSet::new(),
        PrimFork::Fork { var, branches, .. } => {
            let mut live = HashSet::new();
            for branch in branches.iter_mut() {
                live.extend(mark_final_uses(branch));
            }
            live.insert(var.clone());
            live
        }
    };
    for placed in body.prims.iter_mut().rev() {
        match &mut placed.node {
            Prim::Guard { var, .. } => {
                live.insert(var.clone());
            }
            prim => {
                for arg in prim.args_mut() {
                    if let PrimArg::Var {
                        name,
                        flow: crate::prim::PrimFlow::Out,
                        ..
                    } = arg
                    {
                        live.remove(name);
                    }
                }
                for arg in prim.args_mut() {
                    if let PrimArg::Var {
                        name,
                        flow: crate::prim::PrimFlow::In,
                        final_use,
                        ..
                    } = arg
                    {
                        *final_use = !live.contains(name);
                        live.insert(name.clone());
                    }
                }
            }
        }
    }
    live
}
