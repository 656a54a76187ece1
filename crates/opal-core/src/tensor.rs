use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::autograd::GradNode;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::OpalError;
use crate::shape::Shape;
use crate::storage::{DeferredCell, LazySource, Storage};
use crate::Result;

/// A multi-dimensional array — the fundamental data structure in Opal.
///
/// Tensors are immutable handles: shape and dtype are fixed at
/// construction and the underlying buffer is never mutated in place.
/// Views (reshape, swapaxes, strided slice) share storage. A tensor can
/// also be *deferred*: the output of an accelerated-path graph node whose
/// data materializes on first access, through the node's decomposition
/// when no accelerated backend is registered.
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 4]>,
    offset: usize,
    requires_grad: bool,
    grad_node: Option<Arc<GradNode>>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create an f32 tensor from data with the given shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        let strides = s.contiguous_strides();
        Self {
            storage: Storage::from_f32(data),
            shape: s,
            strides,
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Create a float tensor with an explicit dtype tag.
    ///
    /// Values are rounded to the representable set of `dtype` on the way
    /// in, so narrow kinds behave like narrow kinds.
    pub fn from_f32_with_dtype(mut data: Vec<f32>, shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        assert_eq!(s.numel(), data.len());
        if dtype != DType::F32 {
            for v in data.iter_mut() {
                *v = round_to_dtype(*v, dtype);
            }
        }
        let strides = s.contiguous_strides();
        Self {
            storage: Storage::from_f32_with_dtype(data, dtype),
            shape: s,
            strides,
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Create a u32 tensor from data with the given shape.
    pub fn from_u32(data: &[u32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(s.numel(), data.len());
        let strides = s.contiguous_strides();
        Self {
            storage: Storage::from_u32(data),
            shape: s,
            strides,
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        let strides = s.contiguous_strides();
        Self {
            storage: Storage::zeros(dtype, s.numel()),
            shape: s,
            strides,
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Zeros with the shape and dtype of another tensor.
    pub fn zeros_like(other: &Tensor) -> Self {
        Self::zeros(other.shape.dims(), other.dtype())
    }

    /// Create an f32 tensor of ones.
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// Create an f32 tensor filled with `value`.
    pub fn full(shape: &[usize], value: f32) -> Self {
        let s = Shape::new(shape);
        let data = vec![value; s.numel()];
        Self::from_f32(&data, shape)
    }

    /// Create a scalar (0-d) f32 tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            storage: Storage::from_f32(&[value]),
            shape: Shape::scalar(),
            strides: SmallVec::new(),
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Create a scalar tensor with an explicit float dtype tag.
    pub fn scalar_with_dtype(value: f32, dtype: DType) -> Self {
        Self {
            storage: Storage::from_f32_with_dtype(vec![round_to_dtype(value, dtype)], dtype),
            shape: Shape::scalar(),
            strides: SmallVec::new(),
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Create a 1-D f32 tensor with values from `start` to `end`
    /// (exclusive) in steps of `step`.
    ///
    /// # Panics
    /// Panics if `step` is zero or its direction doesn't match `start`→`end`.
    pub fn arange(start: f32, end: f32, step: f32) -> Self {
        assert!(step != 0.0, "arange: step must be non-zero");
        assert!(
            (end - start) * step > 0.0 || (end - start).abs() < f32::EPSILON,
            "arange: step direction ({step}) does not match start ({start}) -> end ({end})"
        );
        let mut data = Vec::new();
        let mut v = start;
        if step > 0.0 {
            while v < end {
                data.push(v);
                v += step;
            }
        } else {
            while v > end {
                data.push(v);
                v += step;
            }
        }
        let len = data.len();
        Self::from_f32(&data, &[len])
    }

    /// Create an f32 tensor with values drawn from N(0, 1).
    pub fn randn(shape: &[usize]) -> Self {
        use rand::Rng;
        let s = Shape::new(shape);
        let mut rng = rand::thread_rng();
        // Box-Muller transform
        let data: Vec<f32> = (0..s.numel())
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self::from_f32(&data, shape)
    }

    /// Create an f32 tensor with values uniform in [low, high).
    pub fn rand_uniform(shape: &[usize], low: f32, high: f32) -> Self {
        use rand::Rng;
        let s = Shape::new(shape);
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..s.numel()).map(|_| rng.gen_range(low..high)).collect();
        Self::from_f32(&data, shape)
    }

    /// Create a tensor from pre-built storage and shape.
    pub fn from_storage(storage: Storage, shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        let strides = s.contiguous_strides();
        Self {
            storage,
            shape: s,
            strides,
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Create a deferred tensor: output `index` of an accelerated-path
    /// graph node, with declared shape, dtype, and device.
    pub fn deferred(
        source: Arc<dyn LazySource>,
        index: usize,
        shape: &[usize],
        dtype: DType,
        device: Device,
    ) -> Self {
        let s = Shape::new(shape);
        let strides = s.contiguous_strides();
        Self {
            storage: Storage::deferred(Arc::new(DeferredCell::new(source, index)), dtype, device),
            shape: s,
            strides,
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Get a reference to the underlying storage.
    pub fn storage_ref(&self) -> &Storage {
        &self.storage
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Device the tensor lives on (or is bound to evaluate on).
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Strides (in elements, not bytes).
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Size of the given axis, with negative-axis resolution.
    pub fn dim(&self, axis: isize) -> Result<usize> {
        let ax = self.shape.normalize_axis(axis)?;
        Ok(self.shape.dims()[ax])
    }

    /// Offset of this view into its storage, in elements.
    pub(crate) fn view_offset(&self) -> usize {
        self.offset
    }

    /// Whether this tensor is contiguous in memory (row-major).
    pub fn is_contiguous(&self) -> bool {
        self.strides == self.shape.contiguous_strides() && self.offset == 0
    }

    /// Whether the data has not been materialized yet.
    pub fn is_deferred(&self) -> bool {
        self.storage.is_deferred()
    }

    // =========================================================================
    // Autograd
    // =========================================================================

    /// Whether this tensor requires gradient computation.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Set whether this tensor requires gradient computation.
    /// When enabled, creates a leaf GradNode for this tensor.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if requires_grad && self.grad_node.is_none() {
            self.grad_node = Some(GradNode::leaf());
        }
        if !requires_grad {
            self.grad_node = None;
        }
    }

    /// Get the GradNode for this tensor (if tracking gradients).
    pub fn grad_node(&self) -> Option<&Arc<GradNode>> {
        self.grad_node.as_ref()
    }

    /// Attach a GradNode to this tensor (used by op dispatch).
    pub fn with_grad_node(mut self, node: Arc<GradNode>) -> Self {
        self.grad_node = Some(node);
        self.requires_grad = true;
        self
    }

    /// Get the accumulated gradient for this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_node.as_ref().and_then(|n| n.get_grad())
    }

    /// Clear accumulated gradients.
    pub fn zero_grad(&self) {
        if let Some(ref node) = self.grad_node {
            node.zero_grad();
        }
    }

    /// Check if this tensor participates in gradient recording.
    pub fn tracks_grad(&self) -> bool {
        self.requires_grad && self.grad_node.is_some() && crate::autograd::is_grad_enabled()
    }

    /// A handle to the same data with no gradient tracking. The
    /// transform engine detaches primals before tracing so a trace never
    /// leaks gradients into nodes recorded outside it.
    pub fn detach(&self) -> Tensor {
        let mut t = self.clone();
        t.requires_grad = false;
        t.grad_node = None;
        t
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// The underlying f32 data (contiguous, concrete, f32-backed only).
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        if !self.is_contiguous() {
            return None;
        }
        self.storage.as_f32_slice()
    }

    /// The underlying u32 data (contiguous, concrete only).
    pub fn as_u32_slice(&self) -> Option<&[u32]> {
        if !self.is_contiguous() {
            return None;
        }
        self.storage.as_u32_slice()
    }

    /// Get a single f32 element by logical flat index.
    pub fn get_f32(&self, flat_index: usize) -> Option<f32> {
        let slice = self.storage.as_f32_slice()?;
        let physical = self.flat_to_physical(flat_index)?;
        slice.get(physical).copied()
    }

    /// Get a single u32 element by logical flat index.
    pub fn get_u32(&self, flat_index: usize) -> Option<u32> {
        let slice = self.storage.as_u32_slice()?;
        let physical = self.flat_to_physical(flat_index)?;
        slice.get(physical).copied()
    }

    /// Convert a logical flat index to a physical storage index.
    fn flat_to_physical(&self, flat_index: usize) -> Option<usize> {
        if self.shape.is_scalar() {
            return if flat_index == 0 {
                Some(self.offset)
            } else {
                None
            };
        }
        if flat_index >= self.numel() {
            return None;
        }

        let mut remaining = flat_index;
        let mut physical = self.offset;
        let contiguous_strides = self.shape.contiguous_strides();
        for (i, &cs) in contiguous_strides.iter().enumerate() {
            let idx = remaining / cs;
            remaining %= cs;
            physical += idx * self.strides[i];
        }
        Some(physical)
    }

    // =========================================================================
    // Realization
    // =========================================================================

    /// Materialize a deferred tensor, preserving this handle's view
    /// parameters. Concrete tensors are returned as-is.
    pub fn realize(&self) -> Result<Tensor> {
        if !self.is_deferred() {
            return Ok(self.clone());
        }
        let base = self.storage.realize()?;
        if base.numel() < self.shape.numel() {
            return Err(OpalError::StorageError(format!(
                "deferred node produced {} elements, view needs {}",
                base.numel(),
                self.shape.numel()
            )));
        }
        Ok(Tensor {
            storage: base.storage,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            offset: self.offset,
            requires_grad: self.requires_grad,
            grad_node: self.grad_node.clone(),
        })
    }

    /// Return a contiguous concrete tensor with this tensor's contents.
    pub fn contiguous(&self) -> Result<Tensor> {
        let t = self.realize()?;
        if t.is_contiguous() {
            return Ok(t);
        }
        let numel = t.numel();
        let result = match t.dtype() {
            DType::U32 => {
                let mut data = vec![0u32; numel];
                for (i, v) in data.iter_mut().enumerate() {
                    *v = t
                        .get_u32(i)
                        .ok_or_else(|| OpalError::StorageError("gather out of bounds".into()))?;
                }
                Tensor::from_u32(&data, t.shape.dims())
            }
            dtype => {
                let mut data = vec![0.0f32; numel];
                for (i, v) in data.iter_mut().enumerate() {
                    *v = t
                        .get_f32(i)
                        .ok_or_else(|| OpalError::StorageError("gather out of bounds".into()))?;
                }
                Tensor::from_storage(Storage::from_f32_with_dtype(data, dtype), t.shape.dims())
            }
        };
        let mut result = result;
        result.requires_grad = t.requires_grad;
        result.grad_node = t.grad_node.clone();
        Ok(result)
    }

    /// Build a view with explicit shape/strides/offset over this
    /// tensor's storage. Used by the shape ops in `ops::manipulation`,
    /// which attach their own gradient nodes; the view itself starts
    /// untracked.
    pub(crate) fn view(
        &self,
        shape: Shape,
        strides: SmallVec<[usize; 4]>,
        offset: usize,
    ) -> Tensor {
        Tensor {
            storage: self.storage.clone(),
            shape,
            strides,
            offset,
            requires_grad: false,
            grad_node: None,
        }
    }
}

/// Round an f32 value to the representable set of a float dtype.
pub fn round_to_dtype(value: f32, dtype: DType) -> f32 {
    match dtype {
        DType::F16 => half::f16::from_f32(value).to_f32(),
        DType::BF16 => half::bf16::from_f32(value).to_f32(),
        _ => value,
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={}, contiguous={}, deferred={})",
            self.shape,
            self.dtype(),
            self.device(),
            self.is_contiguous(),
            self.is_deferred(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(data) = self.as_f32_slice() {
            if self.numel() <= 20 {
                write!(f, "tensor({:?}, shape={})", data, self.shape)
            } else {
                write!(
                    f,
                    "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                    data[0],
                    data[1],
                    data[self.numel() - 1],
                    self.shape
                )
            }
        } else {
            write!(f, "tensor(shape={}, dtype={})", self.shape, self.dtype())
        }
    }
}
