//! MME Descriptor Generator
//!
//! This library lowers one MME tensor operation (convolution forward, dedx,
//! dedw, batched gemm or DMA) into the ordered list of packed hardware
//! descriptors that run it on a Gaudi2 or Gaudi3 matrix engine.
//!
//! # Example
//!
//! ```rust
//! use mme_descgen::{generate_activations, Chip, DataType, LayerParams, OpType, TensorView};
//!
//! let mut params = LayerParams::new(OpType::Ab);
//! params.x = TensorView::dense(DataType::Bf16, [64, 32, 2, 1, 1]);
//! params.w = TensorView::dense(DataType::Bf16, [128, 64, 2, 1, 1]);
//! params.y = TensorView::dense(DataType::Bf16, [128, 32, 2, 1, 1]);
//!
//! let activations = generate_activations(Chip::Gaudi2, &params).unwrap();
//! assert!(!activations.is_empty());
//! ```

pub mod agu;
pub mod cache;
pub mod descriptor;
pub mod error;
pub mod generator;
pub mod geo_attr;
pub mod hardware;
pub mod params;
pub mod recipe;
pub mod sb_reuse;
pub mod signaling;
pub mod sub_problems;

pub use cache::{CachedActivations, DescriptorCache};
pub use descriptor::{Activation, Descriptor};
pub use error::{DescGenError, DescGenResult};
pub use generator::DescriptorGenerator;
pub use geo_attr::GeoAttr;
pub use hardware::{Chip, GeneratorConfig, MmeHal};
pub use params::{DataType, LayerParams, OpType, TensorView};
pub use recipe::{Recipe, RecipeBuilder};

/// Validate `params` and generate its activations without a cache
pub fn generate_activations(chip: Chip, params: &LayerParams) -> DescGenResult<Vec<Activation>> {
    let mut generator = DescriptorGenerator::new(chip);
    generator.generate(params)?;
    Ok(generator.take_activations())
}

/// Validate `params` and return the failure message, if any
pub fn check_params(chip: Chip, params: &LayerParams) -> Option<String> {
    match generator::validation::validate_params(chip, params) {
        Ok(()) => None,
        Err(err) => Some(err.validation_message().map_or_else(|| err.to_string(), str::to_string)),
    }
}
