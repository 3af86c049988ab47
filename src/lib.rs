//! Compiles tensor-computation graphs into GPU kernels for a texture-backed
//! accelerator model: every tensor is stored as a 2-D image whose pixels hold
//! either one scalar (`R`) or four packed scalars (`RGBA`).
//!
//! The pipeline is: build a [graph::Graph], run the channel-mode rewriting
//! pass ([rewrite::run_to_fixpoint]) so every operator sees tensors in the
//! packing format it expects, then invoke per-operator handlers
//! ([handlers::HandlerRegistry]) which simplify the iteration space
//! ([simplify]), canonicalize loop order ([loopnest]), and expand a shader
//! template ([template]) into a [kernel::Kernel].

pub mod alloc;
pub mod axis;
pub mod common;
pub mod graph;
pub mod handlers;
pub mod kernel;
pub mod loopnest;
pub mod rewrite;
pub mod simplify;
pub mod template;
