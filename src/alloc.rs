//! View of the texture allocator collaborator: per-variable allocation
//! records plus the texture-shape derivation kernels use for their `W`/`H`
//! uniforms.

use crate::graph::{Graph, VarId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Widest texture a kernel will address; element counts beyond this spill
/// into additional rows.
pub const MAX_TEXTURE_WIDTH: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Allocation {
    pub variable: VarId,
    /// Total element count of the variable.
    pub size: usize,
}

/// Lookup from variable to its allocation record.
#[derive(Default, Clone, Debug, Deserialize, Serialize)]
pub struct MemoryLayout {
    allocations: IndexMap<VarId, Allocation>,
}

impl MemoryLayout {
    pub fn new() -> Self {
        MemoryLayout::default()
    }

    /// Allocates every variable in the graph, in id order.
    pub fn from_graph(graph: &Graph) -> Self {
        let mut layout = MemoryLayout::new();
        for v in graph.var_ids() {
            layout.allocate(graph, v);
        }
        layout
    }

    pub fn allocate(&mut self, graph: &Graph, variable: VarId) -> Allocation {
        let allocation = Allocation {
            variable,
            size: graph.variable(variable).size(),
        };
        self.allocations.insert(variable, allocation);
        allocation
    }

    pub fn get(&self, variable: VarId) -> Option<&Allocation> {
        self.allocations.get(&variable)
    }
}

/// Width and height of the 2-D texture backing `size` elements: width is
/// capped at [MAX_TEXTURE_WIDTH] with the remainder spilling into rows.
pub fn texture_shape(size: usize) -> (usize, usize) {
    let width = size.min(MAX_TEXTURE_WIDTH);
    let height = (size + MAX_TEXTURE_WIDTH - 1) / MAX_TEXTURE_WIDTH;
    (width, height)
}
