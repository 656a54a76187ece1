use std::fmt;

/// Data types supported by Opal tensors.
///
/// The floating kinds participate in type promotion; `U32` exists for the
/// packed output of the affine quantization codec and never promotes with
/// a floating kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 16-bit Brain Float (same exponent range as F32, reduced mantissa)
    BF16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 32-bit unsigned integer (packed quantization words)
    U32,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::U32 => 4,
        }
    }

    /// Whether this dtype is a floating-point kind.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32)
    }

    /// Result type of combining two operands, following the usual
    /// widening lattice: same kind stays, F32 dominates, and the two
    /// 16-bit kinds widen to F32 when mixed.
    pub fn promote(self, other: DType) -> DType {
        if self == other {
            return self;
        }
        match (self, other) {
            (DType::U32, f) | (f, DType::U32) => f,
            (DType::F32, _) | (_, DType::F32) => DType::F32,
            // F16 x BF16: neither can represent the other exactly
            _ => DType::F32,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::F32 => write!(f, "f32"),
            DType::U32 => write!(f, "u32"),
        }
    }
}
