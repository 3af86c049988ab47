//! Shader-text template expansion.
//!
//! Templates carry two marker kinds: `%%KERNEL_NAME%%`, replaced by a name
//! derived from the operator's identity, and `%%UNIFORM(type, name)%%`,
//! replaced by a `uniform type name` declaration whose symbolic name must
//! have a registered binding. The symbolic name doubles as the GLSL
//! identifier, so code references to it need no rewriting.

use crate::graph::{Graph, OpId, OpKind, VarId};
use crate::kernel::{Kernel, SamplerBinding, ScalarUniform, UniformBinding};
use indexmap::{IndexMap, IndexSet};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template placeholder {name:?} has no registered binding")]
    UnresolvedPlaceholder { name: String },
    #[error("binding {name:?} does not appear in the template")]
    UnknownBinding { name: String },
    #[error("uniform {name:?} declared as {ty:?} but bound to an incompatible value")]
    TypeMismatch { name: String, ty: String },
    #[error("malformed placeholder {text:?} at byte {offset}")]
    MalformedPlaceholder { offset: usize, text: String },
}

/// A value bound to a template's symbolic uniform name.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Sampler(VarId),
}

/// Kernel name for an operator, derived from its identity alone so that
/// recompiling the same graph yields identical names and distinct operators
/// never collide.
pub fn kernel_name(kind: OpKind, op: OpId) -> String {
    format!("{}_{}", kind.tag(), op.index())
}

/// Expands one shader template into a [Kernel] for one operator.
pub struct KernelTemplateEngine<'a> {
    template: &'a str,
    bindings: IndexMap<String, UniformValue>,
}

impl<'a> KernelTemplateEngine<'a> {
    pub fn new(template: &'a str) -> Self {
        KernelTemplateEngine {
            template,
            bindings: IndexMap::new(),
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: UniformValue) -> &mut Self {
        self.bindings.insert(name.into(), value);
        self
    }

    /// Substitutes every marker and produces the kernel descriptor.
    ///
    /// Fails if a declared placeholder has no binding, a binding names no
    /// placeholder, or a binding's kind contradicts the declared type.
    /// Repeated declarations of one symbolic name all receive the same
    /// binding and are recorded once.
    pub fn generate(
        &self,
        graph: &Graph,
        op_id: OpId,
        output: VarId,
    ) -> Result<Kernel, TemplateError> {
        let name = kernel_name(graph.operator(op_id).kind(), op_id);
        let mut source = String::with_capacity(self.template.len());
        let mut samplers: Vec<SamplerBinding> = Vec::new();
        let mut uniforms: Vec<UniformBinding> = Vec::new();
        let mut seen: IndexSet<&str> = IndexSet::new();

        let mut rest = self.template;
        let mut offset = 0usize;
        while let Some(start) = rest.find("%%") {
            source.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("%%")
                .ok_or_else(|| TemplateError::MalformedPlaceholder {
                    offset: offset + start,
                    text: after.chars().take(24).collect(),
                })?;
            let marker = &after[..end];

            if marker == "KERNEL_NAME" {
                source.push_str(&name);
            } else if let Some(args) = marker
                .strip_prefix("UNIFORM(")
                .and_then(|s| s.strip_suffix(')'))
            {
                let (ty, uniform_name) =
                    args.split_once(',')
                        .ok_or_else(|| TemplateError::MalformedPlaceholder {
                            offset: offset + start,
                            text: marker.to_owned(),
                        })?;
                let (ty, uniform_name) = (ty.trim(), uniform_name.trim());
                let value = self.bindings.get(uniform_name).ok_or_else(|| {
                    TemplateError::UnresolvedPlaceholder {
                        name: uniform_name.to_owned(),
                    }
                })?;
                if !seen.contains(uniform_name) {
                    match (ty, value) {
                        ("sampler2D", UniformValue::Sampler(v)) => samplers.push(SamplerBinding {
                            name: uniform_name.to_owned(),
                            variable: *v,
                        }),
                        ("float", UniformValue::Float(x)) => uniforms.push(UniformBinding {
                            name: uniform_name.to_owned(),
                            value: ScalarUniform::Float(*x),
                        }),
                        ("int", UniformValue::Int(x)) => uniforms.push(UniformBinding {
                            name: uniform_name.to_owned(),
                            value: ScalarUniform::Int(*x),
                        }),
                        _ => {
                            return Err(TemplateError::TypeMismatch {
                                name: uniform_name.to_owned(),
                                ty: ty.to_owned(),
                            })
                        }
                    }
                    let (interned, _) = self.bindings.get_key_value(uniform_name).unwrap();
                    seen.insert(interned.as_str());
                }
                source.push_str("uniform ");
                source.push_str(ty);
                source.push(' ');
                source.push_str(uniform_name);
            } else {
                return Err(TemplateError::MalformedPlaceholder {
                    offset: offset + start,
                    text: marker.to_owned(),
                });
            }

            offset += start + 2 + end + 2;
            rest = &after[end + 2..];
        }
        source.push_str(rest);

        for bound in self.bindings.keys() {
            if !seen.contains(bound.as_str()) {
                return Err(TemplateError::UnknownBinding {
                    name: bound.clone(),
                });
            }
        }

        Ok(Kernel {
            source,
            name,
            samplers,
            uniforms,
            output,
        })
    }
}
