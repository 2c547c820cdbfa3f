//! Memory directives
//!
//! Output reduction is requested through the AXI user bits of the output
//! writes. Gaudi3 additionally tags every operand's transactions with a
//! cache directive, a class, a QoS bucket and a memory context id.

use crate::descriptor::Descriptor;
use crate::params::{DataType, InternalOperand, LayerParams, ReductionOp, ReductionRm};
use crate::recipe::Recipe;

/// Reduction data type groups of the user bits
fn reduction_dt_class(dt: DataType) -> u16 {
    match dt {
        DataType::Fp32 | DataType::Fp32Ieee | DataType::Tf32 => 0,
        DataType::Bf16 => 1,
        DataType::Fp16 | DataType::Ufp16 => 2,
        DataType::Fp8_143 => 3,
        DataType::Fp8_152 => 4,
        _ => 5,
    }
}

/// Reduction op and rounding of the current activation. Partials written
/// to memory after the first always add with round down.
pub fn reduction(params: &LayerParams, recipe: &Recipe) -> (ReductionOp, ReductionRm) {
    let op = params.memory.reduction_op;
    if recipe.is_reduction_en() {
        assert!(
            matches!(op, ReductionOp::Add | ReductionOp::None),
            "overriding reduction decision"
        );
        return (ReductionOp::Add, ReductionRm::RoundDown);
    }
    (op, params.memory.reduction_rm)
}

/// AXI user bits of the output writes. Zero means a plain write.
pub fn reduction_user_bits(
    op: ReductionOp,
    rm: ReductionRm,
    output_dt: DataType,
    clip: bool,
) -> u16 {
    if op == ReductionOp::None {
        return 0;
    }
    1 | (op as u16) << 1
        | (rm as u16) << 4
        | reduction_dt_class(output_dt) << 6
        | u16::from(clip) << 9
}

/// Write the reduction bits and, on Gaudi3, the per-operand cache bits
pub fn configure_memory_directives(desc: &mut Descriptor, params: &LayerParams, recipe: &Recipe) {
    let (op, rm) = reduction(params, recipe);
    let output_dt = recipe.operand(InternalOperand::C).element_type;
    let bits = reduction_user_bits(op, rm, output_dt, params.controls.clipping_en);
    let memory = &params.memory;

    match desc {
        Descriptor::Gaudi2(d) => {
            d.axi_user_data.first = bits;
            d.axi_user_data.steady = bits;
            d.axi_user_data.mask = 0;
        }
        Descriptor::Gaudi3(d) => {
            d.axi_aw_user_data.first = bits;
            d.axi_aw_user_data.steady = bits;
            d.axi_aw_user_data.mask = 0;

            for operand in InternalOperand::ALL {
                let idx = operand as usize;
                let user = match operand {
                    InternalOperand::A => &mut d.axi_user_data_a,
                    InternalOperand::B => &mut d.axi_user_data_b,
                    InternalOperand::C => &mut d.axi_user_data_cout,
                };
                user.qos_first = memory.qos[idx] as u8;
                user.qos_steady = memory.qos[idx] as u8;
                user.qos_mask = 0;
                user.mcid = memory.mc_id[idx];
                user.clss = memory.class[idx] as u8;
            }
            let directive =
                |operand: InternalOperand| memory.cache_directive[operand as usize] as u8;
            d.axi_cache_data.agu_a = directive(InternalOperand::A);
            d.axi_cache_data.agu_b = directive(InternalOperand::B);
            d.axi_cache_data.agu_out = directive(InternalOperand::C);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_attr::GeoAttr;
    use crate::hardware::{Chip, MmeHal};
    use crate::params::{CacheClass, CacheDirective, CacheQos, OpType, TensorView};
    use crate::recipe::RecipeBuilder;

    fn gemm(chip: Chip) -> (LayerParams, Recipe) {
        let mut params = LayerParams::new(OpType::Ab);
        params.x = TensorView::dense(DataType::Bf16, [64, 64, 1, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [64, 64, 1, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 64, 1, 1, 1]);
        let hal = MmeHal::for_chip(chip);
        let geo = GeoAttr::new(&params, &hal);
        let recipe = RecipeBuilder::new(&params, &geo, &hal).build();
        (params, recipe)
    }

    #[test]
    fn test_user_bits_encoding() {
        let bits =
            reduction_user_bits(ReductionOp::None, ReductionRm::RoundDown, DataType::Bf16, true);
        assert_eq!(bits, 0);
        let bits =
            reduction_user_bits(ReductionOp::Add, ReductionRm::RoundDown, DataType::Bf16, false);
        assert_eq!(bits, 1 | 3 << 4 | 1 << 6);
        let bits = reduction_user_bits(
            ReductionOp::Max,
            ReductionRm::RoundHalfToNearestEven,
            DataType::Fp32,
            true,
        );
        assert_eq!(bits, 1 | 3 << 1 | 1 << 9);
    }

    #[test]
    fn test_plain_write_has_no_user_bits() {
        let (params, recipe) = gemm(Chip::Gaudi2);
        let mut desc = Descriptor::new_for(Chip::Gaudi2);
        configure_memory_directives(&mut desc, &params, &recipe);
        match desc {
            Descriptor::Gaudi2(d) => assert_eq!(d.axi_user_data.first, 0),
            Descriptor::Gaudi3(_) => unreachable!(),
        }
    }

    #[test]
    fn test_gaudi3_cache_bits() {
        let (mut params, recipe) = gemm(Chip::Gaudi3);
        params.memory.reduction_op = ReductionOp::Add;
        params.memory.cache_directive[InternalOperand::B as usize] = CacheDirective::NoAllocate;
        params.memory.class[InternalOperand::C as usize] = CacheClass::High;
        params.memory.qos[InternalOperand::A as usize] = CacheQos::BucketBp;
        params.memory.mc_id[InternalOperand::C as usize] = 0x1234;
        let mut desc = Descriptor::new_for(Chip::Gaudi3);
        configure_memory_directives(&mut desc, &params, &recipe);
        match desc {
            Descriptor::Gaudi3(d) => {
                assert_eq!(d.axi_aw_user_data.first, 1 | 3 << 4 | 1 << 6);
                assert_eq!(d.axi_aw_user_data.steady, d.axi_aw_user_data.first);
                assert_eq!(d.axi_user_data_a.qos_first, 0xf);
                assert_eq!(d.axi_user_data_b.qos_first, CacheQos::Bucket1 as u8);
                assert_eq!(d.axi_user_data_cout.clss, CacheClass::High as u8);
                assert_eq!(d.axi_user_data_cout.mcid, 0x1234);
                assert_eq!(d.axi_cache_data.agu_b, CacheDirective::NoAllocate as u8);
                assert_eq!(d.axi_cache_data.agu_out, CacheDirective::DcoreAllocate as u8);
            }
            Descriptor::Gaudi2(_) => unreachable!(),
        }
    }
}
