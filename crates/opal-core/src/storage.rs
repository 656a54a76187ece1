//! Tensor storage: Arc-shared element buffers, plus the deferred cell an
//! accelerated-path graph node parks its outputs in until something needs
//! the data.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::Device;
use crate::dtype::DType;
use crate::error::OpalError;
use crate::tensor::Tensor;
use crate::Result;

/// A graph node that can produce concrete outputs on demand.
///
/// Implemented by fused-operator nodes: realization runs the accelerated
/// backend when one is registered for the node's stream, and otherwise
/// evaluates the node's stored decomposition. Sources are immutable once
/// constructed and may be realized at most once per output (memoized).
pub trait LazySource: Send + Sync {
    /// Produce the concrete tensor for output `index`.
    fn realize_output(&self, index: usize) -> Result<Tensor>;

    /// Operator name, used in diagnostics.
    fn name(&self) -> &'static str;
}

/// Deferred output of a [`LazySource`], with memoized realization.
pub struct DeferredCell {
    source: Arc<dyn LazySource>,
    index: usize,
    realized: RwLock<Option<Tensor>>,
}

impl DeferredCell {
    pub fn new(source: Arc<dyn LazySource>, index: usize) -> Self {
        Self {
            source,
            index,
            realized: RwLock::new(None),
        }
    }

    /// Realize (or fetch the memoized) concrete tensor.
    pub fn realize(&self) -> Result<Tensor> {
        if let Some(t) = self.realized.read().as_ref() {
            return Ok(t.clone());
        }
        let mut slot = self.realized.write();
        // Another thread may have realized while we waited for the lock.
        if let Some(t) = slot.as_ref() {
            return Ok(t.clone());
        }
        log::debug!(
            "realizing deferred output {} of {}",
            self.index,
            self.source.name()
        );
        let t = self.source.realize_output(self.index)?;
        *slot = Some(t.clone());
        Ok(t)
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }
}

/// Element buffer, shared between tensor views.
#[derive(Clone)]
pub enum Buffer {
    F32(Arc<Vec<f32>>),
    U32(Arc<Vec<u32>>),
}

impl Buffer {
    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tensor storage: either a concrete buffer or a deferred graph-node
/// output.
///
/// All float dtypes share an f32 buffer; narrow kinds (F16, BF16) hold
/// values already rounded to their representable set, so the dtype tag
/// plus the buffer fully determine the logical contents.
#[derive(Clone)]
pub enum Storage {
    Concrete {
        buffer: Buffer,
        dtype: DType,
        device: Device,
    },
    Deferred {
        cell: Arc<DeferredCell>,
        dtype: DType,
        device: Device,
    },
}

impl Storage {
    pub fn from_f32(data: &[f32]) -> Self {
        Storage::Concrete {
            buffer: Buffer::F32(Arc::new(data.to_vec())),
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    /// An f32-backed buffer carrying a (possibly narrower) float dtype tag.
    /// The caller is responsible for having rounded the values already.
    pub fn from_f32_with_dtype(data: Vec<f32>, dtype: DType) -> Self {
        debug_assert!(dtype.is_float());
        Storage::Concrete {
            buffer: Buffer::F32(Arc::new(data)),
            dtype,
            device: Device::Cpu,
        }
    }

    pub fn from_u32(data: &[u32]) -> Self {
        Storage::Concrete {
            buffer: Buffer::U32(Arc::new(data.to_vec())),
            dtype: DType::U32,
            device: Device::Cpu,
        }
    }

    pub fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::U32 => Storage::Concrete {
                buffer: Buffer::U32(Arc::new(vec![0u32; n])),
                dtype,
                device: Device::Cpu,
            },
            _ => Storage::Concrete {
                buffer: Buffer::F32(Arc::new(vec![0.0f32; n])),
                dtype,
                device: Device::Cpu,
            },
        }
    }

    pub fn deferred(cell: Arc<DeferredCell>, dtype: DType, device: Device) -> Self {
        Storage::Deferred {
            cell,
            dtype,
            device,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::Concrete { dtype, .. } | Storage::Deferred { dtype, .. } => *dtype,
        }
    }

    pub fn device(&self) -> Device {
        match self {
            Storage::Concrete { device, .. } | Storage::Deferred { device, .. } => *device,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Storage::Deferred { .. })
    }

    /// Raw f32 buffer, if concrete and f32-backed.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        match self {
            Storage::Concrete {
                buffer: Buffer::F32(v),
                ..
            } => Some(v),
            _ => None,
        }
    }

    /// Raw u32 buffer, if concrete and u32-backed.
    pub fn as_u32_slice(&self) -> Option<&[u32]> {
        match self {
            Storage::Concrete {
                buffer: Buffer::U32(v),
                ..
            } => Some(v),
            _ => None,
        }
    }

    /// The deferred cell, if any.
    pub fn deferred_cell(&self) -> Option<&Arc<DeferredCell>> {
        match self {
            Storage::Deferred { cell, .. } => Some(cell),
            _ => None,
        }
    }

    /// Realize a deferred storage into the concrete tensor it stands for.
    pub fn realize(&self) -> Result<Tensor> {
        match self {
            Storage::Deferred { cell, .. } => cell.realize(),
            Storage::Concrete { .. } => Err(OpalError::StorageError(
                "realize called on concrete storage".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32() {
        let s = Storage::from_f32(&[1.0, 2.0, 3.0]);
        assert_eq!(s.dtype(), DType::F32);
        assert!(s.device().is_cpu());
        assert_eq!(s.as_f32_slice().unwrap(), &[1.0, 2.0, 3.0]);
        assert!(s.as_u32_slice().is_none());
        assert!(!s.is_deferred());
    }

    #[test]
    fn test_from_u32() {
        let s = Storage::from_u32(&[7, 8]);
        assert_eq!(s.dtype(), DType::U32);
        assert_eq!(s.as_u32_slice().unwrap(), &[7, 8]);
        assert!(s.as_f32_slice().is_none());
    }

    #[test]
    fn test_zeros() {
        let s = Storage::zeros(DType::F32, 4);
        assert_eq!(s.as_f32_slice().unwrap(), &[0.0; 4]);
        let s = Storage::zeros(DType::U32, 2);
        assert_eq!(s.as_u32_slice().unwrap(), &[0, 0]);
    }

    struct CountingSource {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl LazySource for CountingSource {
        fn realize_output(&self, _index: usize) -> Result<Tensor> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Tensor::from_f32(&[1.0, 2.0], &[2]))
        }
        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[test]
    fn test_deferred_realization_is_memoized() {
        let src = Arc::new(CountingSource {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let cell = Arc::new(DeferredCell::new(src.clone(), 0));
        let a = cell.realize().unwrap();
        let b = cell.realize().unwrap();
        assert_eq!(a.as_f32_slice().unwrap(), b.as_f32_slice().unwrap());
        assert_eq!(src.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
