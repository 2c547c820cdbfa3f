//! Example: Batched GEMM
//!
//! Lowers a batched bf16 gemm and prints the hex image of the first
//! descriptor, then shows how an invalid request is rejected.
//!
//! Run with: cargo run --example bgemm

use mme_descgen::params::ReductionOp;
use mme_descgen::{
    check_params, generate_activations, Chip, DataType, LayerParams, OpType, TensorView,
};

fn bgemm(dt: DataType, batch: u32) -> LayerParams {
    let mut params = LayerParams::new(OpType::Ab);
    params.x = TensorView::dense(dt, [64, 32, batch, 1, 1]);
    params.w = TensorView::dense(dt, [128, 64, batch, 1, 1]);
    params.y = TensorView::dense(dt, [128, 32, batch, 1, 1]);
    params
}

fn main() {
    println!("=== Batched GEMM Example ===\n");

    for batch in [1, 2, 8] {
        let params = bgemm(DataType::Bf16, batch);
        for chip in [Chip::Gaudi2, Chip::Gaudi3] {
            let activations = generate_activations(chip, &params).unwrap();
            let descriptors: usize = activations.iter().map(|a| a.num_descriptors()).sum();
            println!(
                "batch {}, {}: {} activation(s), {} descriptor(s), bgemm bit = {}",
                batch,
                chip,
                activations.len(),
                descriptors,
                activations[0].desc(0).header().bgemm
            );
        }
    }
    println!();

    println!("First Gaudi3 descriptor of batch 2:");
    let activations = generate_activations(Chip::Gaudi3, &bgemm(DataType::Bf16, 2)).unwrap();
    for line in activations[0].desc(0).hex_dump() {
        println!("  {}", line);
    }
    println!();

    // fp8 outputs cannot be reduced in memory
    let mut params = bgemm(DataType::Fp8_152, 2);
    params.memory.reduction_op = ReductionOp::Add;
    match check_params(Chip::Gaudi2, &params) {
        Some(message) => println!("Rejected: {}", message),
        None => println!("Unexpectedly accepted"),
    }
}
