use crate::axis::Order;
use crate::common::{ChannelMode, DimSize, Shape};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Stable handle to a [Variable] in a [Graph]'s arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Deserialize, Serialize)]
pub struct VarId(u32);

/// Stable handle to an [Operator] in a [Graph]'s arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Deserialize, Serialize)]
pub struct OpId(u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// An immutable tensor value: a dimension order, one extent per axis, and a
/// pixel-packing mode. Changing a variable's layout or mode always means
/// constructing a new `Variable` and rewiring references.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct Variable {
    order: Order,
    shape: Shape,
    mode: ChannelMode,
}

impl Variable {
    /// Panics if `shape` is not parallel to `order`.
    pub fn new(order: Order, shape: Shape, mode: ChannelMode) -> Variable {
        assert_eq!(order.ndim(), shape.len(), "shape must be parallel to order");
        Variable { order, shape, mode }
    }

    pub fn order(&self) -> &Order {
        &self.order
    }

    pub fn shape(&self) -> &[DimSize] {
        &self.shape
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Total element count.
    pub fn size(&self) -> usize {
        crate::common::volume(&self.shape)
    }

    /// The same logical value repacked into `mode`.
    pub fn with_mode(&self, mode: ChannelMode) -> Variable {
        Variable {
            order: self.order.clone(),
            shape: self.shape.clone(),
            mode,
        }
    }
}

/// Closed set of operator kinds the backend knows how to classify.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize, Serialize)]
pub enum OpKind {
    ElementwiseAdd,
    ElementwiseMul,
    Relu,
    Sgemm,
    ConvertRToRgba,
    ConvertRgbaToR,
}

impl OpKind {
    pub fn tag(&self) -> &'static str {
        match self {
            OpKind::ElementwiseAdd => "elementwise_add",
            OpKind::ElementwiseMul => "elementwise_mul",
            OpKind::Relu => "relu",
            OpKind::Sgemm => "sgemm",
            OpKind::ConvertRToRgba => "convert_r_to_rgba",
            OpKind::ConvertRgbaToR => "convert_rgba_to_r",
        }
    }

    /// Kinds whose kernels handle any packing mode themselves; the
    /// channel-mode pass leaves their parameters alone.
    pub fn is_mode_exempt(&self) -> bool {
        matches!(self, OpKind::Sgemm)
    }

    /// For conversion kinds, the `(input, output)` modes they are declared
    /// to consume and produce.
    pub fn conversion_modes(&self) -> Option<(ChannelMode, ChannelMode)> {
        match self {
            OpKind::ConvertRToRgba => Some((ChannelMode::R, ChannelMode::Rgba)),
            OpKind::ConvertRgbaToR => Some((ChannelMode::Rgba, ChannelMode::R)),
            _ => None,
        }
    }
}

/// A named computation over named input and output variables.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Operator {
    kind: OpKind,
    inputs: IndexMap<String, VarId>,
    outputs: IndexMap<String, VarId>,
}

impl Operator {
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn inputs(&self) -> &IndexMap<String, VarId> {
        &self.inputs
    }

    pub fn outputs(&self) -> &IndexMap<String, VarId> {
        &self.outputs
    }

    pub fn input(&self, name: &str) -> Option<VarId> {
        self.inputs.get(name).copied()
    }

    pub fn output(&self, name: &str) -> Option<VarId> {
        self.outputs.get(name).copied()
    }

    /// Input and output variables, inputs first, in declaration order.
    pub fn parameters(&self) -> impl Iterator<Item = VarId> + '_ {
        self.inputs.values().chain(self.outputs.values()).copied()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("variable {variable} is produced by both {first} and {second}")]
    DuplicateProducer {
        variable: VarId,
        first: OpId,
        second: OpId,
    },
    #[error("cycle detected through operator {0}")]
    CycleDetected(OpId),
    #[error("operator {op} has no parameter named {name:?}")]
    UnknownParameter { op: OpId, name: String },
    #[error("operator {op} references {variable} but is missing from its consumer list")]
    StaleConsumerList { op: OpId, variable: VarId },
}

/// A DAG of operators connected by shared variable identity, stored as an
/// arena addressed by [VarId]/[OpId]. Producer and consumer links are
/// maintained alongside the arena and updated by the rewiring primitives.
#[derive(Default, Clone, Debug, Deserialize, Serialize)]
pub struct Graph {
    variables: Vec<Variable>,
    operators: Vec<Operator>,
    producers: Vec<Option<OpId>>,
    consumers: Vec<Vec<OpId>>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add_variable(&mut self, variable: Variable) -> VarId {
        let id = VarId(u32::try_from(self.variables.len()).unwrap());
        self.variables.push(variable);
        self.producers.push(None);
        self.consumers.push(Vec::new());
        id
    }

    /// Adds an operator, registering it as a consumer of each input and the
    /// unique producer of each output.
    pub fn add_operator(
        &mut self,
        kind: OpKind,
        inputs: &[(&str, VarId)],
        outputs: &[(&str, VarId)],
    ) -> Result<OpId, GraphError> {
        let id = OpId(u32::try_from(self.operators.len()).unwrap());
        for &(_, v) in outputs {
            if let Some(first) = self.producers[v.index()] {
                return Err(GraphError::DuplicateProducer {
                    variable: v,
                    first,
                    second: id,
                });
            }
        }
        for &(_, v) in inputs {
            self.consumers[v.index()].push(id);
        }
        for &(_, v) in outputs {
            self.producers[v.index()] = Some(id);
        }
        self.operators.push(Operator {
            kind,
            inputs: inputs.iter().map(|&(n, v)| (n.to_owned(), v)).collect(),
            outputs: outputs.iter().map(|&(n, v)| (n.to_owned(), v)).collect(),
        });
        Ok(id)
    }

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.index()]
    }

    pub fn operator(&self, id: OpId) -> &Operator {
        &self.operators[id.index()]
    }

    /// Operators in insertion order.
    pub fn operators(&self) -> impl Iterator<Item = (OpId, &Operator)> + '_ {
        self.operators
            .iter()
            .enumerate()
            .map(|(i, op)| (OpId(i as u32), op))
    }

    /// Snapshot of operator ids, for passes that append while scanning.
    pub fn op_ids(&self) -> Vec<OpId> {
        (0..self.operators.len() as u32).map(OpId).collect()
    }

    pub fn var_ids(&self) -> Vec<VarId> {
        (0..self.variables.len() as u32).map(VarId).collect()
    }

    pub fn producer(&self, v: VarId) -> Option<OpId> {
        self.producers[v.index()]
    }

    pub fn consumers(&self, v: VarId) -> &[OpId] {
        &self.consumers[v.index()]
    }

    /// Repoints `op`'s input `name` at `new`, maintaining consumer lists.
    /// Other consumers of the old variable are untouched.
    pub(crate) fn rewire_input(
        &mut self,
        op: OpId,
        name: &str,
        new: VarId,
    ) -> Result<(), GraphError> {
        let slot = self.operators[op.index()]
            .inputs
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownParameter {
                op,
                name: name.to_owned(),
            })?;
        let old = std::mem::replace(slot, new);
        let old_consumers = &mut self.consumers[old.index()];
        match old_consumers.iter().position(|&o| o == op) {
            Some(pos) => {
                old_consumers.remove(pos);
            }
            None => return Err(GraphError::StaleConsumerList { op, variable: old }),
        }
        self.consumers[new.index()].push(op);
        Ok(())
    }

    /// Repoints `op`'s output `name` at `new`. The old variable is left
    /// producerless; the caller is expected to give it a new producer.
    pub(crate) fn rewire_output(
        &mut self,
        op: OpId,
        name: &str,
        new: VarId,
    ) -> Result<(), GraphError> {
        if let Some(first) = self.producers[new.index()] {
            return Err(GraphError::DuplicateProducer {
                variable: new,
                first,
                second: op,
            });
        }
        let slot = self.operators[op.index()]
            .outputs
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownParameter {
                op,
                name: name.to_owned(),
            })?;
        let old = std::mem::replace(slot, new);
        self.producers[old.index()] = None;
        self.producers[new.index()] = Some(op);
        Ok(())
    }

    /// Checks producer uniqueness, consumer-list consistency, and acyclicity.
    pub fn verify(&self) -> Result<(), GraphError> {
        let mut produced: Vec<Option<OpId>> = vec![None; self.variables.len()];
        for (op_id, op) in self.operators() {
            for &v in op.outputs.values() {
                if let Some(first) = produced[v.index()] {
                    return Err(GraphError::DuplicateProducer {
                        variable: v,
                        first,
                        second: op_id,
                    });
                }
                produced[v.index()] = Some(op_id);
            }
            for &v in op.inputs.values() {
                if !self.consumers[v.index()].contains(&op_id) {
                    return Err(GraphError::StaleConsumerList {
                        op: op_id,
                        variable: v,
                    });
                }
            }
        }

        let mut colors = vec![Color::White; self.operators.len()];
        for op in self.op_ids() {
            if colors[op.index()] == Color::White {
                self.dfs(op, &mut colors)?;
            }
        }
        Ok(())
    }

    fn dfs(&self, op: OpId, colors: &mut [Color]) -> Result<(), GraphError> {
        colors[op.index()] = Color::Grey;
        for &v in self.operators[op.index()].outputs.values() {
            for &succ in &self.consumers[v.index()] {
                match colors[succ.index()] {
                    Color::Grey => return Err(GraphError::CycleDetected(succ)),
                    Color::White => self.dfs(succ, colors)?,
                    Color::Black => {}
                }
            }
        }
        colors[op.index()] = Color::Black;
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}
