//! User-defined compute kernels.
//!
//! A [`KernelSpec`] is constructed once from caller-supplied source text,
//! declared outputs, and an execution-grid description, then invoked any
//! number of times with named input tensors. This primitive has no
//! decomposition — it is accelerated-path-only, and invoking it on a
//! non-accelerated target is an unsupported-operation error.

use std::any::Any;
use std::sync::Arc;

use opal_core::{to_stream, DType, OpalError, Result, Stream, Tensor};

use crate::primitive::{build_fused, Decomposition, FusedPrimitive, OutputSpec};

/// A template parameter value: a closed tagged union of the three kinds
/// a kernel may be specialized on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateArg {
    Bool(bool),
    Int(i64),
    Dtype(DType),
}

/// A dynamic value at the construction boundary, before classification.
///
/// Only the boolean, integer, and dtype kinds are valid template
/// parameters; everything else is rejected at the boundary rather than
/// deep inside dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArgValue {
    Bool(bool),
    Int(i64),
    Dtype(DType),
    Float(f64),
    Str(String),
}

impl TemplateArg {
    /// Classify a dynamic value into exactly one of the three template
    /// kinds.
    pub fn from_value(name: &str, value: &KernelArgValue) -> Result<TemplateArg> {
        match value {
            KernelArgValue::Bool(b) => Ok(TemplateArg::Bool(*b)),
            KernelArgValue::Int(i) => Ok(TemplateArg::Int(*i)),
            KernelArgValue::Dtype(d) => Ok(TemplateArg::Dtype(*d)),
            other => Err(OpalError::invalid(
                "custom_kernel",
                format!(
                    "invalid template argument '{name}': {other:?}; must be a dtype, int, or bool"
                ),
            )),
        }
    }
}

/// A user-defined kernel: name, source text, declared outputs, and the
/// execution grid it launches over. Reusable across invocations.
#[derive(Clone)]
pub struct KernelSpec {
    name: String,
    source: String,
    outputs: Vec<(String, Vec<usize>, DType)>,
    grid: (u32, u32, u32),
    threadgroup: (u32, u32, u32),
    ensure_row_contiguous: bool,
    template_args: Vec<(String, TemplateArg)>,
}

impl KernelSpec {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        outputs: &[(&str, &[usize], DType)],
        grid: (u32, u32, u32),
        threadgroup: (u32, u32, u32),
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            outputs: outputs
                .iter()
                .map(|(n, s, d)| (n.to_string(), s.to_vec(), *d))
                .collect(),
            grid,
            threadgroup,
            ensure_row_contiguous: true,
            template_args: Vec::new(),
        }
    }

    /// Require (or not) that every input is made row-contiguous before
    /// dispatch. Defaults to true.
    pub fn ensure_row_contiguous(mut self, ensure: bool) -> Self {
        self.ensure_row_contiguous = ensure;
        self
    }

    /// Replace the template parameters, classifying each dynamic value
    /// by runtime tag.
    pub fn set_template_args(&mut self, args: &[(&str, KernelArgValue)]) -> Result<()> {
        let mut classified = Vec::with_capacity(args.len());
        for (name, value) in args {
            classified.push((name.to_string(), TemplateArg::from_value(name, value)?));
        }
        self.template_args = classified;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn grid(&self) -> (u32, u32, u32) {
        self.grid
    }

    pub fn threadgroup(&self) -> (u32, u32, u32) {
        self.threadgroup
    }

    pub fn template_args(&self) -> &[(String, TemplateArg)] {
        &self.template_args
    }

    /// Invoke the kernel on named input tensors, producing one tensor
    /// per declared output (in declaration order).
    pub fn call(&self, inputs: &[(&str, &Tensor)], stream: Option<Stream>) -> Result<Vec<Tensor>> {
        let s = to_stream(stream);
        if !s.device.is_gpu() {
            return Err(OpalError::unsupported(
                "custom_kernel",
                format!(
                    "kernel '{}' has no decomposition and requires a GPU-class execution target, got {}",
                    self.name, s.device
                ),
            ));
        }

        let mut in_tensors = Vec::with_capacity(inputs.len());
        for (_, t) in inputs {
            if self.ensure_row_contiguous {
                in_tensors.push(t.contiguous()?);
            } else {
                in_tensors.push((*t).clone());
            }
        }

        // With the cuda backend compiled in, surface source errors at
        // dispatch time instead of first realization.
        #[cfg(feature = "cuda")]
        {
            let ctx = opal_kernels::cuda::CudaContext::new(
                s.device.gpu_index().unwrap_or(0),
            )
            .map_err(|e| OpalError::unsupported("custom_kernel", e.to_string()))?;
            opal_kernels::cuda::get_or_load_func(
                ctx.device(),
                ctx.index(),
                &self.name,
                &self.name,
                &self.source,
            )
            .map_err(|e| OpalError::invalid("custom_kernel", e.to_string()))?;
        }

        let specs: Vec<OutputSpec> = self
            .outputs
            .iter()
            .map(|(_, shape, dtype)| OutputSpec::new(shape, *dtype))
            .collect();
        let prim = Arc::new(CustomKernel {
            spec: self.clone(),
            stream: s,
        });
        Ok(build_fused(prim, in_tensors, specs))
    }
}

/// The user-kernel fused primitive. Unlike every other operator kind it
/// carries no decomposition; transform and fallback requests surface an
/// unsupported-operation error.
pub struct CustomKernel {
    spec: KernelSpec,
    stream: Stream,
}

impl FusedPrimitive for CustomKernel {
    fn name(&self) -> &'static str {
        "custom_kernel"
    }

    fn stream(&self) -> Stream {
        self.stream
    }

    fn decomposition(&self) -> Arc<dyn Decomposition> {
        let name = self.spec.name.clone();
        Arc::new(move |_inputs: &[Tensor]| -> Result<Vec<Tensor>> {
            Err(OpalError::unsupported(
                "custom_kernel",
                format!("kernel '{name}' has no decomposition fallback"),
            ))
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_equivalent(&self, _other: &dyn FusedPrimitive) -> bool {
        false
    }
}
