//! AGU (address generation unit) configuration
//!
//! The common pass computes generation independent tensor and port tables.
//! Each generation copies them into its descriptor layout and adds its own
//! SB routing.

pub mod common;
pub mod gaudi2;
pub mod gaudi3;

use crate::descriptor::Descriptor;
use crate::geo_attr::GeoAttr;
use crate::hardware::Chip;
use crate::params::{InternalOperand, MAX_TENSOR_DIMS};
use crate::recipe::Recipe;
use crate::sub_problems::OffsetArray;

pub use common::{CommonAgu, PortAttr, PortGrid, TensorAttr};
pub use gaudi2::Gaudi2Agu;
pub use gaudi3::Gaudi3Agu;

/// Writes the address generation part of one descriptor
pub trait AguConfigurator: Send + Sync {
    fn chip(&self) -> Chip;

    /// Configure tensors, ports, loops and routing of `desc` for MME
    /// `mme_idx`. `address_offset` is the element offset of the current
    /// sub-problem per operand.
    fn config(
        &self,
        desc: &mut Descriptor,
        recipe: &Recipe,
        geo: &GeoAttr,
        mme_idx: u32,
        address_offset: &OffsetArray,
    );
}

pub fn for_chip(chip: Chip) -> Box<dyn AguConfigurator> {
    match chip {
        Chip::Gaudi2 => Box::new(Gaudi2Agu),
        Chip::Gaudi3 => Box::new(Gaudi3Agu),
    }
}

/// Copy one operand's tensor table into the descriptor. The descriptor has
/// no spatial field for the fcd dim, so spatial strides and start offsets
/// are shifted down by one.
pub(crate) fn config_tensor(desc: &mut Descriptor, agu: &CommonAgu, operand: InternalOperand) {
    let tensor = agu.tensor(operand);
    let port_start_offset = agu.geo().is_port_start_offset(operand);
    let out = desc.tensor_mut(operand);
    for dim in 0..MAX_TENSOR_DIMS {
        if dim < MAX_TENSOR_DIMS - 1 {
            out.roi_size[dim] = tensor.roi_size[dim] as u32;
            out.spatial_strides[dim] = tensor.spatial_strides[dim + 1] as u32;
            out.start_offset[dim] = if port_start_offset {
                tensor.base_offset[dim + 1]
            } else {
                tensor.start_offset[dim + 1]
            } as i32;
        }
        out.valid_elements[dim] = tensor.valid_elements[dim] as u32;
        out.loop_stride[dim] = tensor.loop_stride[dim] as i32;
    }
}

/// Last step sizes and the header bits every generation shares
pub(crate) fn config_tensor_params(
    desc: &mut Descriptor,
    agu: &CommonAgu,
    operand: InternalOperand,
) {
    let tensor = *agu.tensor(operand);
    let geo = agu.geo();
    let fwd_or_dedx = agu.params().is_fwd_or_dedx();
    let port_start_offset = geo.is_port_start_offset(operand);

    desc.set_spatial_size_minus1(operand, tensor.last_spatial_step - 1);
    desc.tensor_mut(operand).roi_size[0] = tensor.last_fcd_step;
    let header = desc.header_mut();
    match operand {
        InternalOperand::A => {
            header.trans_a = geo.is_transposed(operand);
            header.advance_a = fwd_or_dedx;
            header.swap_base_and_offset_a = port_start_offset;
            header.te_bypass_a = false;
        }
        InternalOperand::B => {
            header.trans_b = geo.is_transposed(operand);
            header.advance_b = false;
            header.swap_base_and_offset_b = port_start_offset;
            header.te_bypass_b = false;
        }
        InternalOperand::C => {
            header.advance_c = fwd_or_dedx;
            header.swap_base_and_offset_out = port_start_offset;
        }
    }
}

/// Bitmask of the SBs an input operand reads from
pub(crate) fn sb_mask(sb_indices: &[usize]) -> u8 {
    sb_indices.iter().fold(0u8, |mask, &sb| mask | (1 << sb))
}

pub(crate) fn to_roi_base_offset(port: &PortAttr) -> [i32; MAX_TENSOR_DIMS] {
    let mut out = [0i32; MAX_TENSOR_DIMS];
    for (dst, &src) in out.iter_mut().zip(port.port_offset.iter()) {
        *dst = src as i32;
    }
    out
}
