use crate::graph::VarId;
use serde::{Deserialize, Serialize};

/// A texture bound to a sampler uniform.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SamplerBinding {
    pub name: String,
    pub variable: VarId,
}

/// A numeric value bound to a scalar uniform.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct UniformBinding {
    pub name: String,
    pub value: ScalarUniform,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub enum ScalarUniform {
    Float(f32),
    Int(i32),
}

/// A generated, self-contained unit of shader code implementing one operator
/// over one concrete layout. Sampler and scalar bindings are kept separate
/// because the execution boundary binds textures and numeric uniforms
/// through different mechanisms.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Kernel {
    pub source: String,
    pub name: String,
    pub samplers: Vec<SamplerBinding>,
    pub uniforms: Vec<UniformBinding>,
    /// The variable this kernel writes.
    pub output: VarId,
}
