//! Channel-mode rewriting: splices conversion operators into the graph so
//! every operator sees its parameters in the packing mode it expects.
//!
//! One invocation makes a single pass; an inserted conversion is itself
//! revisited the next time around, so the pass is driven to a fixpoint by
//! [run_to_fixpoint] under an iteration cap.

use crate::common::ChannelMode;
use crate::graph::{Graph, GraphError, OpId, OpKind};
use log::debug;

/// Passes a well-formed graph needs beyond this are treated as
/// non-termination.
pub const DEFAULT_FIXPOINT_CAP: usize = 32;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RewriteError {
    #[error(
        "channel-mode rewriting still changing after {iterations} passes \
         (last change at {last_changed:?})"
    )]
    Nontermination {
        iterations: usize,
        last_changed: Option<OpId>,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// The conversion kind that produces `target`.
fn conversion_into(target: ChannelMode) -> OpKind {
    match target {
        ChannelMode::Rgba => OpKind::ConvertRToRgba,
        ChannelMode::R => OpKind::ConvertRgbaToR,
    }
}

/// The conversion kind that consumes `source`.
fn conversion_from(source: ChannelMode) -> OpKind {
    match source {
        ChannelMode::Rgba => OpKind::ConvertRgbaToR,
        ChannelMode::R => OpKind::ConvertRToRgba,
    }
}

/// Forces `op`'s input `name` to `target` mode by splicing a conversion
/// before it:
///
/// ```text
/// before)  v --{op}--
/// after)   v --{conversion}-- v' --{op}--
/// ```
///
/// The old variable keeps its producer and its other consumers.
fn force_input(
    graph: &mut Graph,
    op: OpId,
    name: &str,
    target: ChannelMode,
) -> Result<bool, GraphError> {
    let v = graph
        .operator(op)
        .input(name)
        .ok_or_else(|| GraphError::UnknownParameter {
            op,
            name: name.to_owned(),
        })?;
    if graph.variable(v).mode() == target {
        return Ok(false);
    }
    let v_new = graph.add_variable(graph.variable(v).with_mode(target));
    let conv = graph.add_operator(conversion_into(target), &[("x0", v)], &[("y", v_new)])?;
    graph.rewire_input(op, name, v_new)?;
    debug!("spliced {} before {op} input {name:?}", graph.operator(conv).kind().tag());
    Ok(true)
}

/// Forces `op`'s output `name` to `target` mode by splicing a conversion
/// after it:
///
/// ```text
/// before)  --{op}-- v
/// after)   --{op}-- v' --{conversion}-- v
/// ```
///
/// The original variable keeps its identity: its consumers are untouched
/// and its producer becomes the conversion.
fn force_output(
    graph: &mut Graph,
    op: OpId,
    name: &str,
    target: ChannelMode,
) -> Result<bool, GraphError> {
    let v = graph
        .operator(op)
        .output(name)
        .ok_or_else(|| GraphError::UnknownParameter {
            op,
            name: name.to_owned(),
        })?;
    if graph.variable(v).mode() == target {
        return Ok(false);
    }
    let v_new = graph.add_variable(graph.variable(v).with_mode(target));
    graph.rewire_output(op, name, v_new)?;
    let conv = graph.add_operator(conversion_from(target), &[("x0", v_new)], &[("y", v)])?;
    debug!("spliced {} after {op} output {name:?}", graph.operator(conv).kind().tag());
    Ok(true)
}

/// One pass over every operator present at entry, in insertion order.
/// Returns the last operator whose parameters were changed, if any.
fn run_pass(graph: &mut Graph) -> Result<Option<OpId>, GraphError> {
    let mut last_changed = None;
    for op_id in graph.op_ids() {
        let kind = graph.operator(op_id).kind();
        let mut changed = false;
        if kind.is_mode_exempt() {
            continue;
        } else if let Some((in_mode, out_mode)) = kind.conversion_modes() {
            changed |= force_input(graph, op_id, "x0", in_mode)?;
            changed |= force_output(graph, op_id, "y", out_mode)?;
        } else {
            let input_names: Vec<String> =
                graph.operator(op_id).inputs().keys().cloned().collect();
            for name in &input_names {
                changed |= force_input(graph, op_id, name, ChannelMode::R)?;
            }
            let output_names: Vec<String> =
                graph.operator(op_id).outputs().keys().cloned().collect();
            for name in &output_names {
                changed |= force_output(graph, op_id, name, ChannelMode::R)?;
            }
        }
        if changed {
            last_changed = Some(op_id);
        }
    }
    Ok(last_changed)
}

/// Inserts the conversions one pass calls for. Returns whether the graph
/// changed; callers are expected to re-invoke until it reports `false`.
pub fn insert_channel_mode_conversion(graph: &mut Graph) -> Result<bool, GraphError> {
    Ok(run_pass(graph)?.is_some())
}

/// Drives [insert_channel_mode_conversion] to a fixpoint, verifying graph
/// integrity on convergence. Returns the number of passes that changed the
/// graph. Exceeding `max_iters` passes without converging reports
/// [RewriteError::Nontermination] instead of looping forever.
pub fn run_to_fixpoint(graph: &mut Graph, max_iters: usize) -> Result<usize, RewriteError> {
    let mut last_changed = None;
    for pass in 1..=max_iters {
        match run_pass(graph)? {
            None => {
                debug!("channel-mode rewriting converged after {} changing passes", pass - 1);
                graph.verify()?;
                return Ok(pass - 1);
            }
            Some(op) => last_changed = Some(op),
        }
    }
    Err(RewriteError::Nontermination {
        iterations: max_iters,
        last_changed,
    })
}
