//! Loop canonicalization: turns simplified layouts into concrete shapes,
//! row-major strides, and a globally consistent axis ordering so one
//! flattened loop index can drive every variable in the set.

use crate::axis::{Axis, Order};
use crate::common::Shape;
use crate::graph::VarId;
use crate::simplify::SimplifiedLayouts;
use indexmap::IndexMap;
use itertools::Itertools;

/// Per-axis step between consecutive elements, in storage units.
pub type StrideMap = IndexMap<Axis, usize>;

/// A variable's concrete loop description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarLoop {
    /// The variable's axes restricted from the global axis sequence.
    pub order: Order,
    /// Extents parallel to `order`.
    pub shape: Shape,
    /// Row-major strides keyed by axis, computed from the variable's own
    /// simplified order (its memory layout), independent of the loop order.
    pub strides: StrideMap,
}

pub type LoopStructure = IndexMap<VarId, VarLoop>;

/// Canonicalizes the loop structure for a set of simplified variables.
///
/// Strides are row-major over each variable's simplified order: the stride
/// of an axis is the product of the extents of all axes after it; the last
/// axis has stride 1.
///
/// The shared ordering accumulates a single global axis sequence by visiting
/// variables in ascending axis count (stable on ties) and appending axes not
/// yet present. Low-rank variables are the likely broadcast operands, so
/// they anchor a shared prefix and every variable that shares axes agrees on
/// their relative order.
pub fn canonicalize_loops(simplified: &SimplifiedLayouts) -> LoopStructure {
    let mut strides_by_var: IndexMap<VarId, StrideMap> = IndexMap::new();
    for (&v, layout) in simplified {
        let axes = layout.order.axes();
        let mut strides = StrideMap::new();
        for (i, &axis) in axes.iter().enumerate() {
            let stride: usize = axes[i + 1..]
                .iter()
                .map(|a| layout.extents[a].get() as usize)
                .product();
            strides.insert(axis, stride);
        }
        strides_by_var.insert(v, strides);
    }

    let mut global: Vec<Axis> = Vec::new();
    for (_, layout) in simplified
        .iter()
        .sorted_by_key(|(_, layout)| layout.order.ndim())
    {
        for &axis in layout.order.axes() {
            if !global.contains(&axis) {
                global.push(axis);
            }
        }
    }

    simplified
        .iter()
        .map(|(&v, layout)| {
            let order = Order::new(
                global
                    .iter()
                    .copied()
                    .filter(|&axis| layout.order.contains(axis)),
            );
            let shape: Shape = order.axes().iter().map(|a| layout.extents[a]).collect();
            let strides = strides_by_var.shift_remove(&v).unwrap();
            (v, VarLoop { order, shape, strides })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::AxisGen;
    use crate::common::{ChannelMode, DimSize};
    use crate::graph::{Graph, Variable};
    use crate::simplify::simplify_orders;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    fn add_var(graph: &mut Graph, axes: &[Axis], extents: &[u32]) -> VarId {
        let shape = extents.iter().map(|&e| DimSize::new(e).unwrap()).collect();
        graph.add_variable(Variable::new(
            Order::new(axes.iter().copied()),
            shape,
            ChannelMode::R,
        ))
    }

    // A companion with order (N,C) blocks every merge: N,C memberships
    // match but N,C are not adjacent in v, while H belongs to v alone, so
    // all three of v's axes survive with their row-major strides.
    #[test]
    fn test_row_major_strides() {
        let mut graph = Graph::new();
        let mut gen = AxisGen::new();
        let (n, h, c) = (gen.fresh(), gen.fresh(), gen.fresh());
        let v = add_var(&mut graph, &[n, h, c], &[2, 3, 5]);
        let v2 = add_var(&mut graph, &[n, c], &[2, 5]);
        let loops = canonicalize_loops(&simplify_orders(&graph, &[v, v2]).unwrap());

        let l = &loops[&v];
        assert_eq!(l.order.ndim(), 3);
        assert_eq!(l.strides[&n], 15);
        assert_eq!(l.strides[&h], 5);
        assert_eq!(l.strides[&c], 1);
        assert_eq!(loops[&v2].strides[&n], 5);
        assert_eq!(loops[&v2].strides[&c], 1);
    }

    // Broadcast variable (C) anchors the shared ordering: v2 keeps C while
    // v1 becomes its axes filtered from the global sequence, C included at
    // a consistent relative position.
    #[test]
    fn test_global_ordering_shared_across_variables() {
        let mut graph = Graph::new();
        let mut gen = AxisGen::new();
        let (h, w, c) = (gen.fresh(), gen.fresh(), gen.fresh());
        let v1 = add_var(&mut graph, &[h, w, c], &[3, 4, 5]);
        let v2 = add_var(&mut graph, &[c], &[5]);
        let loops = canonicalize_loops(&simplify_orders(&graph, &[v1, v2]).unwrap());

        // H,W merged into X; global sequence is (C, X) since v2 is visited
        // first; v1's final order filters the global sequence to (C, X).
        let x = loops[&v1]
            .order
            .axes()
            .iter()
            .copied()
            .find(|a| a.is_synthetic())
            .unwrap();
        assert_eq!(loops[&v2].order, Order::new([c]));
        assert_eq!(loops[&v1].order, Order::new([c, x]));
        assert_eq!(loops[&v1].shape, vec![nz!(5u32), nz!(12u32)]);
        // Strides still reflect v1's own memory layout (X outermost).
        assert_eq!(loops[&v1].strides[&x], 5);
        assert_eq!(loops[&v1].strides[&c], 1);
    }

    #[test]
    fn test_canonicalization_is_deterministic() {
        let mut graph = Graph::new();
        let mut gen = AxisGen::new();
        let (n, h, w, c) = (gen.fresh(), gen.fresh(), gen.fresh(), gen.fresh());
        let v1 = add_var(&mut graph, &[n, h, w, c], &[2, 3, 4, 5]);
        let v2 = add_var(&mut graph, &[h, w], &[3, 4]);
        let run = || {
            let simplified = simplify_orders(&graph, &[v1, v2]).unwrap();
            canonicalize_loops(&simplified)
        };
        assert_eq!(format!("{:?}", run()), format!("{:?}", run()));
    }

    proptest! {
        // Row-major stride law over the variable's own axis sequence:
        // stride(axis) is the product of the extents after it, and the last
        // axis has stride 1. A companion holding every other axis keeps
        // memberships unequal for all adjacent pairs of `v`, so no merge
        // fires and every axis keeps its own stride.
        #[test]
        fn test_stride_law(extents in prop::collection::vec(2u32..=6, 1..6)) {
            let mut graph = Graph::new();
            let mut gen = AxisGen::new();
            let axes: Vec<Axis> = extents.iter().map(|_| gen.fresh()).collect();
            let v = add_var(&mut graph, &axes, &extents);
            let even_axes: Vec<Axis> = axes.iter().copied().step_by(2).collect();
            let even_extents: Vec<u32> = extents.iter().copied().step_by(2).collect();
            let v2 = add_var(&mut graph, &even_axes, &even_extents);
            let loops = canonicalize_loops(&simplify_orders(&graph, &[v, v2]).unwrap());

            let l = &loops[&v];
            prop_assert_eq!(l.order.ndim(), axes.len());
            prop_assert_eq!(l.strides[axes.last().unwrap()], 1);
            for (i, axis) in axes.iter().enumerate() {
                let expected: usize =
                    extents[i + 1..].iter().map(|&e| e as usize).product();
                prop_assert_eq!(l.strides[axis], expected);
            }
        }
    }
}
