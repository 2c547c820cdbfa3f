//! Example: Descriptor Cache
//!
//! Several generators share one cache. Identical params are generated once
//! and served from the cache afterwards; the least recently used entry is
//! evicted when the cache is full.
//!
//! Run with: RUST_LOG=info cargo run --example desc_cache

use std::sync::Arc;

use mme_descgen::{
    Chip, DataType, DescriptorCache, DescriptorGenerator, LayerParams, OpType, TensorView,
};

fn gemm(k: u32) -> LayerParams {
    let mut params = LayerParams::new(OpType::Ab);
    params.x = TensorView::dense(DataType::Bf16, [k, 64, 1, 1, 1]);
    params.w = TensorView::dense(DataType::Bf16, [128, k, 1, 1, 1]);
    params.y = TensorView::dense(DataType::Bf16, [128, 64, 1, 1, 1]);
    params
}

fn main() {
    env_logger::init();
    println!("=== Descriptor Cache Example ===\n");

    let cache = Arc::new(DescriptorCache::new(2));
    let mut generators: Vec<DescriptorGenerator> = (0..2)
        .map(|_| DescriptorGenerator::with_cache(Chip::Gaudi2, Arc::clone(&cache)))
        .collect();

    for (step, k) in [64, 64, 128, 64, 256, 128].into_iter().enumerate() {
        let params = gemm(k);
        let cached = cache.is_element_in_des_cache(&params);
        let generator = &mut generators[step % 2];
        let activations = generator.generate(&params).unwrap().len();
        println!(
            "step {}: k = {:3}, cached before = {:5}, activations = {}, {}",
            step,
            k,
            cached,
            activations,
            cache.debug_info()
        );
    }
}
