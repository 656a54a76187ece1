//! Fast-path eligibility policy, separated from the operator math so the
//! gates can be tuned or disabled without touching correctness-critical
//! code.

use opal_core::Stream;

/// Whether an operator may take its accelerated path on this stream.
///
/// The normalization, rotary-encoding, and quantization operators gate on
/// this alone: GPU-class targets build an accelerated-path node, anything
/// else evaluates the decomposition immediately.
pub fn fast_path_eligible(stream: &Stream) -> bool {
    stream.device.is_gpu()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::{Device, Stream};

    #[test]
    fn test_gpu_class_only() {
        assert!(fast_path_eligible(&Stream::new(Device::Gpu(0))));
        assert!(!fast_path_eligible(&Stream::new(Device::Cpu)));
    }
}
