//! Example: 3x3 Forward Convolution
//!
//! Lowers a bf16 3x3 convolution on both chips, then patches the scheduler
//! owned fields (tensor addresses and sync objects) the way a graph compiler
//! would once memory is allocated.
//!
//! Run with: cargo run --example fwd_conv

use mme_descgen::params::Operand;
use mme_descgen::{Chip, DataType, DescriptorGenerator, LayerParams, OpType, TensorView};

fn conv(op_type: OpType, padding: i32) -> LayerParams {
    let out = (32 + 2 * padding - 3 + 1) as u32;
    let mut params = LayerParams::new(op_type);
    params.x = TensorView::dense(DataType::Bf16, [64, 32, 32, 1, 4]);
    params.w = TensorView::dense(DataType::Bf16, [128, 64, 3, 3, 1]);
    params.y = TensorView::dense(DataType::Bf16, [128, out, out, 1, 4]);
    params.conv.padding = [padding, padding, 0];
    params
}

fn main() {
    println!("=== 3x3 Forward Convolution Example ===\n");

    for chip in [Chip::Gaudi2, Chip::Gaudi3] {
        for padding in [0, 1] {
            let params = conv(OpType::Fwd, padding);
            let mut generator = DescriptorGenerator::new(chip);
            match generator.generate(&params) {
                Ok(activations) => {
                    let count = activations.len();
                    println!("{} fwd, padding {}: {} activation(s)", chip, padding, count);
                }
                Err(e) => {
                    println!("{} fwd, padding {}: rejected: {}", chip, padding, e);
                    continue;
                }
            }
            for line in generator.recipe_debug_info(true) {
                println!("  {}", line);
            }
        }
    }
    println!();

    // Patch addresses once the tensors are placed
    println!("Patching a Gaudi2 fwd conv:");
    let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
    generator.generate(&conv(OpType::Fwd, 0)).unwrap();
    generator.patch_input_tensor(Operand::X, 0x1000_0000, false);
    generator.patch_input_tensor(Operand::W, 0x2000_0000, true);
    generator.patch_output_tensor(0x3000_0000, false, None);
    generator.mme_patch_sync_objects(0, 0x4000, 0x4004, 0, 0);
    generator.mme_patch_sync_objects(1, 0x4008, 0x400c, 0, 0);

    for (idx, activation) in generator.activations().iter().enumerate() {
        let desc = activation.desc(0);
        println!(
            "  activation {}: base A/B/C = {:x?}, signals = {}, so0 = {:#x}",
            idx,
            desc.base_addrs(),
            activation.num_signals,
            desc.sync_object().so0_addr
        );
    }
    println!();

    // The gradients of the same layer
    for op_type in [OpType::Dedx, OpType::Dedw] {
        let params = conv(op_type, 0);
        match DescriptorGenerator::new(Chip::Gaudi3).generate(&params) {
            Ok(activations) => {
                println!("gaudi3 {:?}: {} activation(s)", op_type, activations.len())
            }
            Err(e) => println!("gaudi3 {:?}: rejected: {}", op_type, e),
        }
    }
}
