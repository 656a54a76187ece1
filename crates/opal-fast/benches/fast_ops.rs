//! Benchmark: fused-operator decomposition throughput on CPU.

use std::time::Instant;

use opal_core::Tensor;
use opal_fast::{affine_dequantize, affine_quantize, rms_norm, rope, scaled_dot_product_attention};

fn bench<F: FnMut()>(mut f: F, iters: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        f();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn main() {
    println!("=== Opal Fused Operator Benchmark (decomposition path) ===\n");

    println!("{:<24} {:>14}", "Case", "Time (ms)");
    println!("{}", "-".repeat(40));

    for &(batch, seq, dim) in &[(8usize, 128usize, 256usize), (8, 512, 512)] {
        let x_data: Vec<f32> = (0..batch * seq * dim)
            .map(|i| ((i * 7 + 3) % 13) as f32 * 0.1 - 0.6)
            .collect();
        let x = Tensor::from_f32(&x_data, &[batch, seq, dim]);
        let w = Tensor::ones(&[dim]);

        let iters = if seq <= 128 { 50 } else { 10 };
        let t = bench(|| drop(rms_norm(&x, &w, 1e-5, None).unwrap()), iters);
        println!("{:<24} {:>12.3}ms", format!("rms_norm {batch}x{seq}x{dim}"), t * 1000.0);

        let t = bench(
            || drop(rope(&x, dim.min(128), false, 10000.0, 1.0, 0, None).unwrap()),
            iters,
        );
        println!("{:<24} {:>12.3}ms", format!("rope {batch}x{seq}x{dim}"), t * 1000.0);
    }

    for &(heads, seq, hd) in &[(8usize, 64usize, 64usize), (8, 128, 64)] {
        let n = heads * seq * hd;
        let data: Vec<f32> = (0..n).map(|i| ((i * 11 + 5) % 17) as f32 * 0.1 - 0.8).collect();
        let q = Tensor::from_f32(&data, &[1, heads, seq, hd]);
        let scale = 1.0 / (hd as f32).sqrt();

        let iters = if seq <= 64 { 20 } else { 5 };
        let t = bench(
            || drop(scaled_dot_product_attention(&q, &q, &q, scale, None, None).unwrap()),
            iters,
        );
        println!("{:<24} {:>12.3}ms", format!("sdpa h{heads} L{seq} d{hd}"), t * 1000.0);
    }

    for &(rows, cols, bits) in &[(64usize, 512usize, 4u32), (64, 512, 8)] {
        let data: Vec<f32> = (0..rows * cols)
            .map(|i| ((i * 13 + 1) % 23) as f32 * 0.05 - 0.5)
            .collect();
        let w = Tensor::from_f32(&data, &[rows, cols]);

        let t = bench(
            || {
                let (wq, s, b) = affine_quantize(&w, 64, bits, None).unwrap();
                drop(affine_dequantize(&wq, &s, &b, 64, bits, None).unwrap());
            },
            20,
        );
        println!(
            "{:<24} {:>12.3}ms",
            format!("quant rt {rows}x{cols} b{bits}"),
            t * 1000.0
        );
    }
}
