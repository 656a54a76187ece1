//! Gradient recording for automatic differentiation.
//!
//! Defines the `GradFn` trait and `GradNode` computation graph node.
//! Every eager op records a node when any input tracks gradients; the
//! closure-level transform engine (opal-transforms) then walks the
//! recorded graph in reverse (vjp) or forward (jvp) order. These live in
//! opal-core so that `Tensor` can carry gradient tracking without
//! circular dependencies.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dtype::DType;
use crate::tensor::Tensor;

// ============================================================================
// GradFn trait
// ============================================================================

/// Differentiation rules for one recorded operation.
///
/// `apply` is the reverse rule: upstream cotangent in, one cotangent per
/// input out (`None` means no gradient flows to that input). `tangent` is
/// the forward rule: one tangent per input in (`None` means a zero
/// tangent), output tangent out.
pub trait GradFn: Send + Sync {
    /// Compute gradients for each input given the output gradient.
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>>;

    /// Compute the output tangent given the input tangents.
    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor>;

    /// Name of this gradient function (for debugging).
    fn name(&self) -> &str;
}

// ============================================================================
// GradNode
// ============================================================================

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A node in the recorded computation graph.
///
/// Node ids are allocated in creation order, so an op's node always has a
/// larger id than the nodes of its inputs. Both transform walkers rely on
/// this: descending-id order is a valid reverse topological order and
/// ascending-id order a valid forward one.
pub struct GradNode {
    pub id: usize,
    pub grad_fn: Option<Box<dyn GradFn>>,
    pub inputs: Vec<Arc<GradNode>>,
    pub grad: RwLock<Option<Tensor>>,
}

impl GradNode {
    /// Create a new leaf node (no grad_fn, e.g. a transform primal).
    pub fn leaf() -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: None,
            inputs: Vec::new(),
            grad: RwLock::new(None),
        })
    }

    /// Create a new interior node with a gradient function and inputs.
    ///
    /// `inputs` must align positionally with the operands of the op the
    /// grad_fn was built for. Input links are strong: the recorded graph
    /// must outlive the intermediate tensors a closure drops on the way
    /// to its outputs.
    pub fn with_grad_fn(grad_fn: Box<dyn GradFn>, inputs: Vec<Arc<GradNode>>) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: Some(grad_fn),
            inputs,
            grad: RwLock::new(None),
        })
    }

    /// Whether this is a leaf node (no grad_fn).
    pub fn is_leaf(&self) -> bool {
        self.grad_fn.is_none()
    }

    /// Accumulate gradient into this node (thread-safe).
    pub fn accumulate_grad(&self, grad: &Tensor) {
        let mut lock = self.grad.write();
        match lock.as_ref() {
            Some(existing) => {
                *lock = Some(existing.add(grad).expect("gradient accumulation failed"));
            }
            None => {
                *lock = Some(grad.clone());
            }
        }
    }

    /// Get the current accumulated gradient.
    pub fn get_grad(&self) -> Option<Tensor> {
        self.grad.read().clone()
    }

    /// Clear the accumulated gradient.
    pub fn zero_grad(&self) {
        *self.grad.write() = None;
    }
}

// ============================================================================
// Backward pass
// ============================================================================

/// Execute the backward pass from a single root.
pub fn backward(root: &Arc<GradNode>, grad_output: Tensor) {
    backward_multi(&[(Arc::clone(root), grad_output)]);
}

/// Execute the backward pass from several roots at once, each seeded with
/// its own cotangent. Used by the closure-level vjp transform, whose
/// closures may return multiple outputs.
pub fn backward_multi(roots: &[(Arc<GradNode>, Tensor)]) {
    // The walk itself must not record new graph nodes.
    let _guard = NoGradGuard::new();

    for (root, seed) in roots {
        root.accumulate_grad(seed);
    }

    for node in reachable(roots.iter().map(|(r, _)| r)) {
        if let Some(ref grad_fn) = node.grad_fn {
            let node_grad = match node.get_grad() {
                Some(g) => g,
                None => continue,
            };

            let input_grads = grad_fn.apply(&node_grad);

            for (input_node, maybe_grad) in node.inputs.iter().zip(input_grads.into_iter()) {
                if let Some(grad) = maybe_grad {
                    input_node.accumulate_grad(&grad);
                }
            }
        }
    }
}

/// All nodes reachable from the roots, in descending id order — a valid
/// reverse topological order since ids follow creation order.
pub fn reachable<'a>(roots: impl Iterator<Item = &'a Arc<GradNode>>) -> Vec<Arc<GradNode>> {
    let mut seen = HashSet::new();
    let mut stack: Vec<Arc<GradNode>> = Vec::new();
    for root in roots {
        if seen.insert(root.id) {
            stack.push(Arc::clone(root));
        }
    }
    let mut all = stack.clone();
    while let Some(node) = stack.pop() {
        for input in &node.inputs {
            if seen.insert(input.id) {
                all.push(Arc::clone(input));
                stack.push(Arc::clone(input));
            }
        }
    }
    all.sort_by(|a, b| b.id.cmp(&a.id));
    all
}

// ============================================================================
// No-grad scope
// ============================================================================

use std::cell::Cell;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Check if gradient recording is currently enabled.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|g| {
        let prev = g.get();
        g.set(enabled);
        prev
    })
}

/// RAII guard that disables gradient recording in its scope.
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        let prev = set_grad_enabled(false);
        Self { prev }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}

/// RAII guard that force-enables gradient recording in its scope.
///
/// The transform engine uses this while tracing a closure, so transforms
/// keep working when invoked from inside a no-grad region (e.g. nested
/// inside another transform's backward walk).
pub struct EnableGradGuard {
    prev: bool,
}

impl EnableGradGuard {
    pub fn new() -> Self {
        let prev = set_grad_enabled(true);
        Self { prev }
    }
}

impl Default for EnableGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EnableGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}

// ============================================================================
// Broadcasting helpers shared by the built-in gradient functions
// ============================================================================

/// Reduce a gradient produced at a broadcast output shape back to the
/// shape of the input that was broadcast: sum out the leading extra axes,
/// then sum (keepdims) every axis the input held at size 1.
pub fn reduce_broadcast(grad: &Tensor, target_dims: &[usize]) -> Tensor {
    let mut g = grad.clone();
    while g.ndim() > target_dims.len() {
        g = g.sum_axis(0, false).expect("broadcast gradient reduction failed");
    }
    for (axis, &dim) in target_dims.iter().enumerate() {
        if dim == 1 && g.shape().dims()[axis] > 1 {
            g = g
                .sum_axis(axis as isize, true)
                .expect("broadcast gradient reduction failed");
        }
    }
    g
}

/// Broadcast a tensor up to the given dims (used by forward-mode rules
/// when one operand's tangent is missing).
pub fn broadcast_to(t: &Tensor, dims: &[usize]) -> Tensor {
    if t.shape().dims() == dims {
        return t.clone();
    }
    t.add(&Tensor::zeros(dims, t.dtype()))
        .expect("tangent broadcast failed")
}

// ============================================================================
// Built-in gradient functions: elementwise arithmetic
// ============================================================================

/// Backward for broadcasting addition.
pub struct AddBackward {
    pub a_dims: Vec<usize>,
    pub b_dims: Vec<usize>,
    pub out_dims: Vec<usize>,
}

impl GradFn for AddBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![
            Some(reduce_broadcast(grad_output, &self.a_dims)),
            Some(reduce_broadcast(grad_output, &self.b_dims)),
        ]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        match (&tangents[0], &tangents[1]) {
            (Some(ta), Some(tb)) => Some(ta.add(tb).expect("AddBackward tangent failed")),
            (Some(ta), None) => Some(broadcast_to(ta, &self.out_dims)),
            (None, Some(tb)) => Some(broadcast_to(tb, &self.out_dims)),
            (None, None) => None,
        }
    }

    fn name(&self) -> &str {
        "AddBackward"
    }
}

/// Backward for broadcasting subtraction.
pub struct SubBackward {
    pub a_dims: Vec<usize>,
    pub b_dims: Vec<usize>,
    pub out_dims: Vec<usize>,
}

impl GradFn for SubBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let neg = grad_output.neg().expect("SubBackward neg failed");
        vec![
            Some(reduce_broadcast(grad_output, &self.a_dims)),
            Some(reduce_broadcast(&neg, &self.b_dims)),
        ]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        match (&tangents[0], &tangents[1]) {
            (Some(ta), Some(tb)) => Some(ta.sub(tb).expect("SubBackward tangent failed")),
            (Some(ta), None) => Some(broadcast_to(ta, &self.out_dims)),
            (None, Some(tb)) => Some(
                broadcast_to(tb, &self.out_dims)
                    .neg()
                    .expect("SubBackward tangent neg failed"),
            ),
            (None, None) => None,
        }
    }

    fn name(&self) -> &str {
        "SubBackward"
    }
}

/// Backward for broadcasting multiplication.
pub struct MulBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl GradFn for MulBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let ga = grad_output.mul(&self.rhs).expect("MulBackward grad_a failed");
        let gb = grad_output.mul(&self.lhs).expect("MulBackward grad_b failed");
        vec![
            Some(reduce_broadcast(&ga, self.lhs.shape().dims())),
            Some(reduce_broadcast(&gb, self.rhs.shape().dims())),
        ]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        let mut acc: Option<Tensor> = None;
        if let Some(ta) = &tangents[0] {
            acc = Some(ta.mul(&self.rhs).expect("MulBackward tangent failed"));
        }
        if let Some(tb) = &tangents[1] {
            let term = self.lhs.mul(tb).expect("MulBackward tangent failed");
            acc = Some(match acc {
                Some(a) => a.add(&term).expect("MulBackward tangent sum failed"),
                None => term,
            });
        }
        acc
    }

    fn name(&self) -> &str {
        "MulBackward"
    }
}

/// Backward for broadcasting division.
pub struct DivBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl GradFn for DivBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        // d/da (a/b) = 1/b, d/db (a/b) = -a/b^2
        let ga = grad_output.div(&self.rhs).expect("DivBackward grad_a failed");
        let b_sq = self.rhs.mul(&self.rhs).expect("DivBackward b^2 failed");
        let gb = grad_output
            .mul(&self.lhs.neg().expect("DivBackward neg failed"))
            .expect("DivBackward mul failed")
            .div(&b_sq)
            .expect("DivBackward grad_b failed");
        vec![
            Some(reduce_broadcast(&ga, self.lhs.shape().dims())),
            Some(reduce_broadcast(&gb, self.rhs.shape().dims())),
        ]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        let mut acc: Option<Tensor> = None;
        if let Some(ta) = &tangents[0] {
            acc = Some(ta.div(&self.rhs).expect("DivBackward tangent failed"));
        }
        if let Some(tb) = &tangents[1] {
            let b_sq = self.rhs.mul(&self.rhs).expect("DivBackward tangent b^2 failed");
            let term = self
                .lhs
                .mul(tb)
                .expect("DivBackward tangent failed")
                .div(&b_sq)
                .expect("DivBackward tangent failed")
                .neg()
                .expect("DivBackward tangent failed");
            acc = Some(match acc {
                Some(a) => a.add(&term).expect("DivBackward tangent sum failed"),
                None => term,
            });
        }
        acc
    }

    fn name(&self) -> &str {
        "DivBackward"
    }
}

/// Backward for negation.
pub struct NegBackward;

impl GradFn for NegBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(grad_output.neg().expect("NegBackward failed"))]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0]
            .as_ref()
            .map(|t| t.neg().expect("NegBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "NegBackward"
    }
}

/// Backward for exp.
pub struct ExpBackward {
    pub output: Tensor,
}

impl GradFn for ExpBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(
            grad_output.mul(&self.output).expect("ExpBackward mul failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0]
            .as_ref()
            .map(|t| t.mul(&self.output).expect("ExpBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "ExpBackward"
    }
}

/// Backward for natural log.
pub struct LogBackward {
    pub input: Tensor,
}

impl GradFn for LogBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(
            grad_output.div(&self.input).expect("LogBackward div failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0]
            .as_ref()
            .map(|t| t.div(&self.input).expect("LogBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "LogBackward"
    }
}

/// Backward for sqrt.
pub struct SqrtBackward {
    pub output: Tensor,
}

impl GradFn for SqrtBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        // d/dx sqrt(x) = 1 / (2 sqrt(x))
        let two_sqrt = self.output.mul_scalar(2.0).expect("SqrtBackward mul failed");
        vec![Some(
            grad_output.div(&two_sqrt).expect("SqrtBackward div failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            let two_sqrt = self.output.mul_scalar(2.0).expect("SqrtBackward tangent failed");
            t.div(&two_sqrt).expect("SqrtBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "SqrtBackward"
    }
}

/// Backward for rsqrt: d/dx x^(-1/2) = -1/2 x^(-3/2) = -out^3 / 2.
pub struct RsqrtBackward {
    pub output: Tensor,
}

impl RsqrtBackward {
    fn local(&self) -> Tensor {
        self.output
            .mul(&self.output)
            .and_then(|o2| o2.mul(&self.output))
            .and_then(|o3| o3.mul_scalar(-0.5))
            .expect("RsqrtBackward local derivative failed")
    }
}

impl GradFn for RsqrtBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(
            grad_output.mul(&self.local()).expect("RsqrtBackward mul failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0]
            .as_ref()
            .map(|t| t.mul(&self.local()).expect("RsqrtBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "RsqrtBackward"
    }
}

/// Backward for square.
pub struct SquareBackward {
    pub input: Tensor,
}

impl GradFn for SquareBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let two_x = self.input.mul_scalar(2.0).expect("SquareBackward mul failed");
        vec![Some(
            grad_output.mul(&two_x).expect("SquareBackward mul failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            let two_x = self.input.mul_scalar(2.0).expect("SquareBackward tangent failed");
            t.mul(&two_x).expect("SquareBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "SquareBackward"
    }
}

/// Backward for sin.
pub struct SinBackward {
    pub input: Tensor,
}

impl GradFn for SinBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let cos = self.input.cos().expect("SinBackward cos failed");
        vec![Some(grad_output.mul(&cos).expect("SinBackward mul failed"))]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            let cos = self.input.cos().expect("SinBackward tangent failed");
            t.mul(&cos).expect("SinBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "SinBackward"
    }
}

/// Backward for cos.
pub struct CosBackward {
    pub input: Tensor,
}

impl GradFn for CosBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let neg_sin = self
            .input
            .sin()
            .and_then(|s| s.neg())
            .expect("CosBackward sin failed");
        vec![Some(grad_output.mul(&neg_sin).expect("CosBackward mul failed"))]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            let neg_sin = self
                .input
                .sin()
                .and_then(|s| s.neg())
                .expect("CosBackward tangent failed");
            t.mul(&neg_sin).expect("CosBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "CosBackward"
    }
}

/// Backward for abs.
pub struct AbsBackward {
    pub input: Tensor,
}

impl GradFn for AbsBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let sign = self.input.sign().expect("AbsBackward sign failed");
        vec![Some(grad_output.mul(&sign).expect("AbsBackward mul failed"))]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            let sign = self.input.sign().expect("AbsBackward tangent failed");
            t.mul(&sign).expect("AbsBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "AbsBackward"
    }
}

/// Backward for scalar addition: grad flows through unchanged.
pub struct AddScalarBackward;

impl GradFn for AddScalarBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(grad_output.clone())]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].clone()
    }

    fn name(&self) -> &str {
        "AddScalarBackward"
    }
}

/// Backward for scalar multiplication.
pub struct MulScalarBackward {
    pub scalar: f32,
}

impl GradFn for MulScalarBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(
            grad_output
                .mul_scalar(self.scalar)
                .expect("MulScalarBackward failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0]
            .as_ref()
            .map(|t| t.mul_scalar(self.scalar).expect("MulScalarBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "MulScalarBackward"
    }
}

/// Backward for pow_scalar: d/dx x^n = n x^(n-1).
pub struct PowScalarBackward {
    pub input: Tensor,
    pub exponent: f32,
}

impl PowScalarBackward {
    fn local(&self) -> Tensor {
        self.input
            .pow_scalar(self.exponent - 1.0)
            .and_then(|p| p.mul_scalar(self.exponent))
            .expect("PowScalarBackward local derivative failed")
    }
}

impl GradFn for PowScalarBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(
            grad_output.mul(&self.local()).expect("PowScalarBackward mul failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0]
            .as_ref()
            .map(|t| t.mul(&self.local()).expect("PowScalarBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "PowScalarBackward"
    }
}

/// Backward for dtype casts: cotangents cast back to the source dtype,
/// tangents forward to the destination dtype.
pub struct AstypeBackward {
    pub src_dtype: DType,
    pub dst_dtype: DType,
}

impl GradFn for AstypeBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(
            grad_output
                .astype(self.src_dtype)
                .expect("AstypeBackward cast failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0]
            .as_ref()
            .map(|t| t.astype(self.dst_dtype).expect("AstypeBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "AstypeBackward"
    }
}

// ============================================================================
// Built-in gradient functions: reductions
// ============================================================================

fn spread_reduced(grad: &Tensor, input_dims: &[usize], axis: usize, keepdims: bool) -> Tensor {
    let g = if keepdims {
        grad.clone()
    } else {
        let mut kept: Vec<isize> = grad.shape().dims().iter().map(|&d| d as isize).collect();
        kept.insert(axis, 1);
        grad.reshape(&kept).expect("reduction gradient reshape failed")
    };
    broadcast_to(&g, input_dims)
}

/// Backward for sum along one axis.
pub struct SumAxisBackward {
    pub input_dims: Vec<usize>,
    pub axis: usize,
    pub keepdims: bool,
}

impl GradFn for SumAxisBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(spread_reduced(
            grad_output,
            &self.input_dims,
            self.axis,
            self.keepdims,
        ))]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            t.sum_axis(self.axis as isize, self.keepdims)
                .expect("SumAxisBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "SumAxisBackward"
    }
}

/// Backward for mean along one axis.
pub struct MeanAxisBackward {
    pub input_dims: Vec<usize>,
    pub axis: usize,
    pub keepdims: bool,
}

impl GradFn for MeanAxisBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let n = self.input_dims[self.axis] as f32;
        let g = spread_reduced(grad_output, &self.input_dims, self.axis, self.keepdims);
        vec![Some(
            g.mul_scalar(1.0 / n).expect("MeanAxisBackward scale failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            t.mean_axis(self.axis as isize, self.keepdims)
                .expect("MeanAxisBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "MeanAxisBackward"
    }
}

/// Backward for sum over a set of axes.
pub struct SumAxesBackward {
    pub input_dims: Vec<usize>,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

impl GradFn for SumAxesBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let g = if self.keepdims {
            grad_output.clone()
        } else {
            let mut kept: Vec<isize> = self.input_dims.iter().map(|&d| d as isize).collect();
            for &ax in &self.axes {
                kept[ax] = 1;
            }
            grad_output.reshape(&kept).expect("SumAxesBackward reshape failed")
        };
        vec![Some(broadcast_to(&g, &self.input_dims))]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            let axes: Vec<isize> = self.axes.iter().map(|&a| a as isize).collect();
            t.sum_axes(&axes, self.keepdims)
                .expect("SumAxesBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "SumAxesBackward"
    }
}

/// Backward for full-tensor sum.
pub struct SumAllBackward {
    pub input_dims: Vec<usize>,
}

impl GradFn for SumAllBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let grad_val = grad_output.get_f32(0).unwrap_or(1.0);
        vec![Some(Tensor::full(&self.input_dims, grad_val))]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0]
            .as_ref()
            .map(|t| t.sum().expect("SumAllBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "SumAllBackward"
    }
}

/// Backward for full-tensor mean.
pub struct MeanAllBackward {
    pub input_dims: Vec<usize>,
}

impl GradFn for MeanAllBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let numel: usize = self.input_dims.iter().product();
        let grad_val = grad_output.get_f32(0).unwrap_or(1.0) / numel as f32;
        vec![Some(Tensor::full(&self.input_dims, grad_val))]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0]
            .as_ref()
            .map(|t| t.mean().expect("MeanAllBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "MeanAllBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_node() {
        let node = GradNode::leaf();
        assert!(node.is_leaf());
        assert!(node.get_grad().is_none());
    }

    #[test]
    fn test_grad_accumulation() {
        let node = GradNode::leaf();
        let g1 = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let g2 = Tensor::from_f32(&[3.0, 4.0], &[2]);
        node.accumulate_grad(&g1);
        node.accumulate_grad(&g2);
        let grad = node.get_grad().unwrap();
        assert_eq!(grad.as_f32_slice().unwrap(), &[4.0, 6.0]);
    }

    #[test]
    fn test_no_grad_guard() {
        assert!(is_grad_enabled());
        {
            let _guard = NoGradGuard::new();
            assert!(!is_grad_enabled());
        }
        assert!(is_grad_enabled());
    }

    #[test]
    fn test_backward_add() {
        let a = GradNode::leaf();
        let b = GradNode::leaf();
        let c = GradNode::with_grad_fn(
            Box::new(AddBackward {
                a_dims: vec![],
                b_dims: vec![],
                out_dims: vec![],
            }),
            vec![Arc::clone(&a), Arc::clone(&b)],
        );
        backward(&c, Tensor::scalar(1.0));
        assert_eq!(a.get_grad().unwrap().get_f32(0).unwrap(), 1.0);
        assert_eq!(b.get_grad().unwrap().get_f32(0).unwrap(), 1.0);
    }

    #[test]
    fn test_backward_chain() {
        // d = (a + b) * b with a=2, b=3
        let a = GradNode::leaf();
        let b = GradNode::leaf();
        let c = GradNode::with_grad_fn(
            Box::new(AddBackward {
                a_dims: vec![],
                b_dims: vec![],
                out_dims: vec![],
            }),
            vec![Arc::clone(&a), Arc::clone(&b)],
        );
        let d = GradNode::with_grad_fn(
            Box::new(MulBackward {
                lhs: Tensor::scalar(5.0),
                rhs: Tensor::scalar(3.0),
            }),
            vec![Arc::clone(&c), Arc::clone(&b)],
        );
        backward(&d, Tensor::scalar(1.0));
        assert_eq!(a.get_grad().unwrap().get_f32(0).unwrap(), 3.0);
        assert_eq!(b.get_grad().unwrap().get_f32(0).unwrap(), 8.0);
    }

    #[test]
    fn test_reduce_broadcast() {
        // grad at [2, 3] reduced to a [3] input
        let g = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let r = reduce_broadcast(&g, &[3]);
        assert_eq!(r.shape().dims(), &[3]);
        assert_eq!(r.as_f32_slice().unwrap(), &[5.0, 7.0, 9.0]);

        // grad at [2, 3] reduced to a [2, 1] input
        let r = reduce_broadcast(&g, &[2, 1]);
        assert_eq!(r.shape().dims(), &[2, 1]);
        assert_eq!(r.as_f32_slice().unwrap(), &[6.0, 15.0]);
    }

    #[test]
    fn test_mul_tangent_missing_side() {
        let bw = MulBackward {
            lhs: Tensor::from_f32(&[2.0, 3.0], &[2]),
            rhs: Tensor::from_f32(&[4.0, 5.0], &[2]),
        };
        let t = bw.tangent(&[Some(Tensor::from_f32(&[1.0, 1.0], &[2])), None]);
        assert_eq!(t.unwrap().as_f32_slice().unwrap(), &[4.0, 5.0]);
        assert!(bw.tangent(&[None, None]).is_none());
    }
}
