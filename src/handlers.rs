//! Per-operator kernel generation: a dispatch table from operator kind to a
//! handler that simplifies the operator's iteration space, canonicalizes its
//! loop structure, and expands that operator's shader template.

use crate::alloc::{texture_shape, MemoryLayout};
use crate::graph::{Graph, OpId, OpKind, VarId};
use crate::kernel::Kernel;
use crate::loopnest::canonicalize_loops;
use crate::simplify::{simplify_orders, LayoutError};
use crate::template::{KernelTemplateEngine, TemplateError, UniformValue};
use indexmap::IndexMap;
use log::debug;

#[derive(thiserror::Error, Debug)]
pub enum KernelBuildError {
    #[error("no kernel handler registered for operator kind {0:?}")]
    MissingHandler(&'static str),
    #[error("handler for {op} returned no kernels")]
    EmptyKernelList { op: OpId },
    #[error("operator {op} is missing parameter {name:?}")]
    MissingParameter { op: OpId, name: &'static str },
    #[error("no allocation for variable {0}")]
    MissingAllocation(VarId),
    #[error("operator {op}: {source}")]
    Layout {
        op: OpId,
        #[source]
        source: LayoutError,
    },
    #[error("operator {op}: {source}")]
    Template {
        op: OpId,
        #[source]
        source: TemplateError,
    },
}

pub type HandlerFn = fn(&Graph, OpId, &MemoryLayout) -> Result<Vec<Kernel>, KernelBuildError>;

/// Maps operator-kind tags to generation functions. Dispatch enforces the
/// handler contract: every handler returns a non-empty ordered kernel list.
pub struct HandlerRegistry {
    handlers: IndexMap<&'static str, HandlerFn>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        HandlerRegistry {
            handlers: IndexMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(OpKind::ElementwiseAdd.tag(), elementwise);
        registry.register(OpKind::ElementwiseMul.tag(), elementwise);
        registry.register(OpKind::ConvertRToRgba.tag(), convert_channel_mode);
        registry.register(OpKind::ConvertRgbaToR.tag(), convert_channel_mode);
        registry
    }

    /// Registers `handler` for `tag`, replacing any previous registration.
    pub fn register(&mut self, tag: &'static str, handler: HandlerFn) {
        self.handlers.insert(tag, handler);
    }

    pub fn generate(
        &self,
        graph: &Graph,
        op_id: OpId,
        layout: &MemoryLayout,
    ) -> Result<Vec<Kernel>, KernelBuildError> {
        let tag = graph.operator(op_id).kind().tag();
        let handler = self
            .handlers
            .get(tag)
            .ok_or(KernelBuildError::MissingHandler(tag))?;
        let kernels = handler(graph, op_id, layout)?;
        if kernels.is_empty() {
            return Err(KernelBuildError::EmptyKernelList { op: op_id });
        }
        Ok(kernels)
    }

    /// Generates kernels for every operator, in graph insertion order.
    pub fn generate_graph(
        &self,
        graph: &Graph,
        layout: &MemoryLayout,
    ) -> Result<Vec<Kernel>, KernelBuildError> {
        let mut kernels = Vec::new();
        for op_id in graph.op_ids() {
            kernels.extend(self.generate(graph, op_id, layout)?);
        }
        Ok(kernels)
    }
}

fn input(graph: &Graph, op: OpId, name: &'static str) -> Result<VarId, KernelBuildError> {
    graph
        .operator(op)
        .input(name)
        .ok_or(KernelBuildError::MissingParameter { op, name })
}

fn output(graph: &Graph, op: OpId, name: &'static str) -> Result<VarId, KernelBuildError> {
    graph
        .operator(op)
        .output(name)
        .ok_or(KernelBuildError::MissingParameter { op, name })
}

fn allocation_size(layout: &MemoryLayout, v: VarId) -> Result<usize, KernelBuildError> {
    Ok(layout
        .get(v)
        .ok_or(KernelBuildError::MissingAllocation(v))?
        .size)
}

const ELEMENTWISE_ADD_TEMPLATE: &str = r#"precision mediump float;

// %%KERNEL_NAME%%

%%UNIFORM(float, W)%%;
%%UNIFORM(float, H)%%;
%%UNIFORM(sampler2D, X0)%%;
%%UNIFORM(sampler2D, X1)%%;

void main() {
    int x = int(gl_FragCoord.x - 0.5);
    int y = int(gl_FragCoord.y - 0.5);
    int index = y * int(W) + x;

    vec2 pos0 = vec2(float(x) / W, float(y) / H);
    vec2 pos1 = vec2(float(x) / W, float(y) / H);

    float v0 = texture2D(X0, pos0).r;
    float v1 = texture2D(X1, pos1).r;

    gl_FragColor = vec4(v0 + v1, 0, 0, 0);
}
"#;

const ELEMENTWISE_MUL_TEMPLATE: &str = r#"precision mediump float;

// %%KERNEL_NAME%%

%%UNIFORM(float, W)%%;
%%UNIFORM(float, H)%%;
%%UNIFORM(sampler2D, X0)%%;
%%UNIFORM(sampler2D, X1)%%;

void main() {
    int x = int(gl_FragCoord.x - 0.5);
    int y = int(gl_FragCoord.y - 0.5);
    int index = y * int(W) + x;

    vec2 pos0 = vec2(float(x) / W, float(y) / H);
    vec2 pos1 = vec2(float(x) / W, float(y) / H);

    float v0 = texture2D(X0, pos0).r;
    float v1 = texture2D(X1, pos1).r;

    gl_FragColor = vec4(v0 * v1, 0, 0, 0);
}
"#;

/// Generates the kernel for a binary elementwise operator whose operands
/// have been rewritten into R mode. The template bodies differ only in the
/// combining expression.
pub fn elementwise(
    graph: &Graph,
    op_id: OpId,
    layout: &MemoryLayout,
) -> Result<Vec<Kernel>, KernelBuildError> {
    let x0 = input(graph, op_id, "x0")?;
    let x1 = input(graph, op_id, "x1")?;
    let y = output(graph, op_id, "y")?;
    let template = match graph.operator(op_id).kind() {
        OpKind::ElementwiseAdd => ELEMENTWISE_ADD_TEMPLATE,
        OpKind::ElementwiseMul => ELEMENTWISE_MUL_TEMPLATE,
        kind => return Err(KernelBuildError::MissingHandler(kind.tag())),
    };

    let parameters: Vec<VarId> = graph.operator(op_id).parameters().collect();
    let simplified = simplify_orders(graph, &parameters)
        .map_err(|source| KernelBuildError::Layout { op: op_id, source })?;
    let loops = canonicalize_loops(&simplified);
    debug!("loop structure for {op_id}: {loops:?}");

    let (w, h) = texture_shape(allocation_size(layout, y)?);
    let mut engine = KernelTemplateEngine::new(template);
    engine
        .bind("W", UniformValue::Float(w as f32))
        .bind("H", UniformValue::Float(h as f32))
        .bind("X0", UniformValue::Sampler(x0))
        .bind("X1", UniformValue::Sampler(x1));
    let kernel = engine
        .generate(graph, op_id, y)
        .map_err(|source| KernelBuildError::Template { op: op_id, source })?;
    Ok(vec![kernel])
}

const CONVERT_R_TO_RGBA_TEMPLATE: &str = r#"precision mediump float;

// %%KERNEL_NAME%%

%%UNIFORM(float, W)%%;
%%UNIFORM(float, H)%%;
%%UNIFORM(float, W_IN)%%;
%%UNIFORM(float, H_IN)%%;
%%UNIFORM(sampler2D, X0)%%;

float fetch_r(int index) {
    int x = int(mod(float(index), W_IN));
    int y = index / int(W_IN);
    vec2 pos = vec2((float(x) + 0.5) / W_IN, (float(y) + 0.5) / H_IN);
    return texture2D(X0, pos).r;
}

void main() {
    int x = int(gl_FragCoord.x - 0.5);
    int y = int(gl_FragCoord.y - 0.5);
    int base = (y * int(W) + x) * 4;

    gl_FragColor = vec4(
        fetch_r(base),
        fetch_r(base + 1),
        fetch_r(base + 2),
        fetch_r(base + 3)
    );
}
"#;

const CONVERT_RGBA_TO_R_TEMPLATE: &str = r#"precision mediump float;

// %%KERNEL_NAME%%

%%UNIFORM(float, W)%%;
%%UNIFORM(float, H)%%;
%%UNIFORM(float, W_IN)%%;
%%UNIFORM(float, H_IN)%%;
%%UNIFORM(sampler2D, X0)%%;

void main() {
    int x = int(gl_FragCoord.x - 0.5);
    int y = int(gl_FragCoord.y - 0.5);
    int index = y * int(W) + x;

    int px = int(mod(float(index / 4), W_IN));
    int py = (index / 4) / int(W_IN);
    vec2 pos = vec2((float(px) + 0.5) / W_IN, (float(py) + 0.5) / H_IN);
    vec4 texel = texture2D(X0, pos);

    int channel = int(mod(float(index), 4.0));
    float v = channel == 0 ? texel.r : channel == 1 ? texel.g : channel == 2 ? texel.b : texel.a;
    gl_FragColor = vec4(v, 0, 0, 0);
}
"#;

/// Generates the repacking kernel for either conversion direction. Texture
/// extents are in pixels, so RGBA-side sizes are divided by four.
pub fn convert_channel_mode(
    graph: &Graph,
    op_id: OpId,
    layout: &MemoryLayout,
) -> Result<Vec<Kernel>, KernelBuildError> {
    let x0 = input(graph, op_id, "x0")?;
    let y = output(graph, op_id, "y")?;
    let template = match graph.operator(op_id).kind() {
        OpKind::ConvertRToRgba => CONVERT_R_TO_RGBA_TEMPLATE,
        OpKind::ConvertRgbaToR => CONVERT_RGBA_TO_R_TEMPLATE,
        kind => return Err(KernelBuildError::MissingHandler(kind.tag())),
    };

    let pixels = |v: VarId, size: usize| {
        let per_pixel = graph.variable(v).mode().scalars_per_pixel() as usize;
        (size + per_pixel - 1) / per_pixel
    };
    let (w, h) = texture_shape(pixels(y, allocation_size(layout, y)?));
    let (w_in, h_in) = texture_shape(pixels(x0, allocation_size(layout, x0)?));

    let mut engine = KernelTemplateEngine::new(template);
    engine
        .bind("W", UniformValue::Float(w as f32))
        .bind("H", UniformValue::Float(h as f32))
        .bind("W_IN", UniformValue::Float(w_in as f32))
        .bind("H_IN", UniformValue::Float(h_in as f32))
        .bind("X0", UniformValue::Sampler(x0));
    let kernel = engine
        .generate(graph, op_id, y)
        .map_err(|source| KernelBuildError::Template { op: op_id, source })?;
    Ok(vec![kernel])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{AxisGen, Order};
    use crate::common::ChannelMode;
    use crate::graph::Variable;
    use crate::kernel::ScalarUniform;
    use crate::rewrite::{run_to_fixpoint, DEFAULT_FIXPOINT_CAP};
    use nonzero::nonzero as nz;

    #[test]
    fn test_elementwise_add_end_to_end() {
        let mut graph = Graph::new();
        let mut gen = AxisGen::new();
        let (n, c) = (gen.fresh(), gen.fresh());
        let mk = |graph: &mut Graph| {
            graph.add_variable(Variable::new(
                Order::new([n, c]),
                vec![nz!(100u32), nz!(20u32)],
                ChannelMode::R,
            ))
        };
        let x0 = mk(&mut graph);
        let x1 = mk(&mut graph);
        let y = mk(&mut graph);
        let op = graph
            .add_operator(OpKind::ElementwiseAdd, &[("x0", x0), ("x1", x1)], &[("y", y)])
            .unwrap();

        let layout = MemoryLayout::from_graph(&graph);
        let registry = HandlerRegistry::with_builtins();
        let kernels = registry.generate(&graph, op, &layout).unwrap();

        assert_eq!(kernels.len(), 1);
        let kernel = &kernels[0];
        assert_eq!(kernel.name, "elementwise_add_0");
        assert_eq!(kernel.output, y);
        assert_eq!(kernel.samplers.len(), 2);
        assert_eq!(kernel.samplers[0].variable, x0);
        assert_eq!(kernel.samplers[1].variable, x1);
        // 2000 elements: full-width rows spill over the 1024 cap.
        assert_eq!(
            kernel.uniforms[0].value,
            ScalarUniform::Float(1024.0)
        );
        assert_eq!(kernel.uniforms[1].value, ScalarUniform::Float(2.0));
        assert!(kernel.source.contains("uniform sampler2D X0;"));
        assert!(!kernel.source.contains("%%"));
    }

    // Add and mul share the elementwise handler; both kinds must compile
    // out of the builtin registry.
    #[test]
    fn test_elementwise_mul_uses_shared_handler() {
        let mut graph = Graph::new();
        let mut gen = AxisGen::new();
        let c = gen.fresh();
        let mk = |graph: &mut Graph| {
            graph.add_variable(Variable::new(
                Order::new([c]),
                vec![nz!(32u32)],
                ChannelMode::R,
            ))
        };
        let x0 = mk(&mut graph);
        let x1 = mk(&mut graph);
        let y = mk(&mut graph);
        let op = graph
            .add_operator(OpKind::ElementwiseMul, &[("x0", x0), ("x1", x1)], &[("y", y)])
            .unwrap();

        let layout = MemoryLayout::from_graph(&graph);
        let registry = HandlerRegistry::with_builtins();
        let kernels = registry.generate(&graph, op, &layout).unwrap();

        assert_eq!(kernels.len(), 1);
        assert_eq!(kernels[0].name, "elementwise_mul_0");
        assert!(kernels[0].source.contains("v0 * v1"));
        assert_eq!(kernels[0].samplers.len(), 2);
    }

    #[test]
    fn test_missing_handler_reported() {
        let mut graph = Graph::new();
        let mut gen = AxisGen::new();
        let a = gen.fresh();
        let mk = |graph: &mut Graph| {
            graph.add_variable(Variable::new(
                Order::new([a]),
                vec![nz!(4u32)],
                ChannelMode::R,
            ))
        };
        let x = mk(&mut graph);
        let y = mk(&mut graph);
        let op = graph
            .add_operator(OpKind::Relu, &[("x0", x)], &[("y", y)])
            .unwrap();

        let layout = MemoryLayout::from_graph(&graph);
        let registry = HandlerRegistry::with_builtins();
        let err = registry.generate(&graph, op, &layout).unwrap_err();
        assert!(matches!(err, KernelBuildError::MissingHandler("relu")));
    }

    // Rewrite a mixed-mode graph to its fixpoint, then compile every
    // operator, conversions included.
    #[test]
    fn test_generate_graph_after_rewrite() {
        let mut graph = Graph::new();
        let mut gen = AxisGen::new();
        let c = gen.fresh();
        let mk = |graph: &mut Graph, mode| {
            graph.add_variable(Variable::new(
                Order::new([c]),
                vec![nz!(64u32)],
                mode,
            ))
        };
        let x0 = mk(&mut graph, ChannelMode::R);
        let x1 = mk(&mut graph, ChannelMode::Rgba);
        let y = mk(&mut graph, ChannelMode::R);
        graph
            .add_operator(OpKind::ElementwiseAdd, &[("x0", x0), ("x1", x1)], &[("y", y)])
            .unwrap();

        run_to_fixpoint(&mut graph, DEFAULT_FIXPOINT_CAP).unwrap();
        let layout = MemoryLayout::from_graph(&graph);
        let registry = HandlerRegistry::with_builtins();
        let kernels = registry.generate_graph(&graph, &layout).unwrap();

        // The add plus the spliced RGBA->R conversion.
        assert_eq!(kernels.len(), 2);
        assert!(kernels.iter().any(|k| k.name.starts_with("elementwise_add")));
        assert!(kernels.iter().any(|k| k.name.starts_with("convert_rgba_to_r")));
        // Kernel names never collide.
        let mut names: Vec<&str> = kernels.iter().map(|k| k.name.as_str()).collect();
        names.dedup();
        assert_eq!(names.len(), kernels.len());
    }
}
