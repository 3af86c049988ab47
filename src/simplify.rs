//! Layout simplification: shrinks the iteration space shared by a set of
//! co-occurring variables by dropping unit dimensions and merging dimensions
//! that vary in lockstep.

use crate::axis::{Axis, Order};
use crate::common::DimSize;
use crate::graph::{Graph, VarId};
use indexmap::{IndexMap, IndexSet};
use log::debug;
use smallvec::SmallVec;

/// A variable's simplified iteration layout: an order over surviving (and
/// possibly synthetic) axes with one extent per axis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarLayout {
    pub order: Order,
    pub extents: IndexMap<Axis, DimSize>,
}

pub type SimplifiedLayouts = IndexMap<VarId, VarLayout>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("variable {0} simplified to zero axes but has {1} elements")]
    MalformedScalar(VarId, usize),
    #[error("axis {0} is not present in the variable set")]
    UnknownAxis(Axis),
    #[error("merged extent of axes {0} and {1} overflows")]
    ExtentOverflow(Axis, Axis),
}

/// Simplifies the orders of a set of variables that one kernel will iterate
/// together.
///
/// Two rules, applied to a fixpoint:
/// - an axis with extent 1 is removed from that variable's order (a variable
///   left with no axes keeps a single [Axis::SCALAR] with extent 1);
/// - axes `A` and `B` are merged into a fresh synthetic axis when exactly the
///   same variables contain both and `B` immediately follows `A` in every
///   one of them. The synthetic extent is `extent(A) * extent(B)`.
///
/// Synthetic axis ids are assigned from a counter reset per call, so
/// identical inputs simplify to identical outputs. Simplified layouts are
/// local to kernel generation and never re-enter the graph.
pub fn simplify_orders(graph: &Graph, vars: &[VarId]) -> Result<SimplifiedLayouts, LayoutError> {
    let mut layouts: SimplifiedLayouts = IndexMap::new();
    for &v in vars {
        if layouts.contains_key(&v) {
            continue;
        }
        let variable = graph.variable(v);
        let mut axes: SmallVec<[Axis; 4]> = SmallVec::new();
        let mut extents: IndexMap<Axis, DimSize> = IndexMap::new();
        for (&axis, &extent) in variable.order().axes().iter().zip(variable.shape()) {
            if extent.get() != 1 {
                axes.push(axis);
                extents.insert(axis, extent);
            }
        }
        if axes.is_empty() {
            if variable.size() != 1 {
                return Err(LayoutError::MalformedScalar(v, variable.size()));
            }
            axes.push(Axis::SCALAR);
            extents.insert(Axis::SCALAR, DimSize::new(1).unwrap());
        }
        layouts.insert(
            v,
            VarLayout {
                order: Order::new(axes),
                extents,
            },
        );
    }

    // Axis -> variables containing it, in first-seen order on both levels.
    let mut members: IndexMap<Axis, IndexSet<VarId>> = IndexMap::new();
    for (&v, layout) in &layouts {
        for &axis in layout.order.axes() {
            members.entry(axis).or_default().insert(v);
        }
    }

    let mut counter = 0u32;
    while let Some((a, b)) = find_mergeable(&layouts, &members) {
        let merged = Axis::synthetic(counter);
        counter += 1;
        let vars_ab = members
            .get(&a)
            .cloned()
            .ok_or(LayoutError::UnknownAxis(a))?;
        for &v in &vars_ab {
            merge_in_layout(layouts.get_mut(&v).unwrap(), a, b, merged)?;
        }
        members.shift_remove(&a);
        members.shift_remove(&b);
        members.insert(merged, vars_ab);
        debug!("merged axes {a} and {b} into {merged}");
    }

    Ok(layouts)
}

/// First pair `(A, B)` in scan order whose variable-membership sets are
/// identical and where `B` immediately follows `A` everywhere.
fn find_mergeable(
    layouts: &SimplifiedLayouts,
    members: &IndexMap<Axis, IndexSet<VarId>>,
) -> Option<(Axis, Axis)> {
    for (&a, vars_a) in members {
        for (&b, vars_b) in members {
            if a == b || vars_a != vars_b {
                continue;
            }
            let adjacent_everywhere = vars_a.iter().all(|v| {
                let order = &layouts[v].order;
                match order.position(a) {
                    Some(pos) => order.axes().get(pos + 1) == Some(&b),
                    None => false,
                }
            });
            if adjacent_everywhere {
                return Some((a, b));
            }
        }
    }
    None
}

fn merge_in_layout(
    layout: &mut VarLayout,
    a: Axis,
    b: Axis,
    merged: Axis,
) -> Result<(), LayoutError> {
    let ext_a = layout
        .extents
        .shift_remove(&a)
        .ok_or(LayoutError::UnknownAxis(a))?;
    let ext_b = layout
        .extents
        .shift_remove(&b)
        .ok_or(LayoutError::UnknownAxis(b))?;
    let ext = ext_a
        .checked_mul(ext_b)
        .ok_or(LayoutError::ExtentOverflow(a, b))?;
    layout.extents.insert(merged, ext);

    let pos = layout.order.position(a).ok_or(LayoutError::UnknownAxis(a))?;
    debug_assert_eq!(layout.order.axes().get(pos + 1), Some(&b));
    let mut axes: SmallVec<[Axis; 4]> = layout.order.axes()[..pos].into();
    axes.push(merged);
    axes.extend_from_slice(&layout.order.axes()[pos + 2..]);
    layout.order = Order::new(axes);
    Ok(())
}
