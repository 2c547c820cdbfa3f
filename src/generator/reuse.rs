//! SB reuse attributes of one activation
//!
//! Which hardware loops walk the dense (output fcd) and spatial directions,
//! how many geometry sized steps each direction takes, and how large the
//! last step is. The SB reuse configurator turns these into repeat counts
//! and masks; the engine brains use the selectors directly.

use crate::geo_attr::GeoAttr;
use crate::hardware::AccumBudget;
use crate::params::{
    div_round_up, pattern_to_loop_mask, round_to_multiple, InternalOperand, LayerParams, LoopDim,
    LoopMask, OpType, Pattern, ReuseType, MAX_CONV_DIMS,
};
use crate::recipe::Recipe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReuseAttr {
    pub dense_steps_nr: u32,
    pub a_partial_height_steps_nr: u32,
    pub spatial_steps_nr: u32,
    /// One-hot selectors, possibly several loops for the spatial direction
    pub dense_loop_selector: u8,
    pub a_partial_height_loop_selector: u8,
    pub spatial_loop_selector: u8,
    pub last_dense_step_size: u32,
    pub last_a_partial_height_step_size: u32,
    pub dense_loop_mask: LoopMask,
    pub spatial_loop_mask: LoopMask,
    /// Loops the accumulators stay on while the common dim is walked
    pub accum_dim_loop_mask: LoopMask,
    /// Loop of the outer operand of a 2D reuse; gemm loop otherwise
    pub reuse_2d_loop_mask: LoopMask,
}

impl ReuseAttr {
    /// Reuse attributes of the recipe's current iteration
    pub fn new(params: &LayerParams, geo: &GeoAttr, recipe: &Recipe) -> Self {
        let pattern = params.strategy.pattern;
        let op = params.op_type;
        let dedw = params.is_dedw();
        let conv_view = recipe.cur_non_spatial();
        let fcd_view = recipe.cur_fcd();
        let sp_view = recipe.cur_sp();
        let geo_height = geo.geometry_height();
        let geo_width = geo.geometry_width();

        let filter_steps_nr: u32 = if dedw { conv_view.sizes[2..].iter().product() } else { 1 };
        let a_spatial_size = if dedw { conv_view.sizes[1] } else { sp_view.view_size };
        let a_partial_height_steps_nr = div_round_up(a_spatial_size, geo_height);
        let dense_steps_nr = div_round_up(fcd_view.view_size, geo_width);

        let dense_loop_mask =
            dense_loop_mask(op, pattern, a_partial_height_steps_nr, dense_steps_nr);

        let spatial_dim = if params.is_dedw_or_gemm() { LoopDim::C } else { LoopDim::S };
        let mut spatial_loop_mask = pattern_to_loop_mask(pattern, spatial_dim);
        let a_partial_height_loop_selector = spatial_loop_mask.loop_bit();

        let (filter_loop_mask, filter_loop_selector) = if dedw {
            let mask = pattern_to_loop_mask(pattern, LoopDim::F);
            (mask, filter_loop_selector(mask))
        } else {
            (LoopMask::Gemm, 0)
        };

        let with_filter = (
            a_partial_height_loop_selector | filter_loop_selector,
            filter_steps_nr * a_partial_height_steps_nr,
        );
        let without_filter = (a_partial_height_loop_selector, a_partial_height_steps_nr);
        let (spatial_loop_selector, spatial_steps_nr) = match pattern {
            Pattern::SpReductionCkf => {
                if !dedw || dense_steps_nr == 1 {
                    with_filter
                } else {
                    spatial_loop_mask = filter_loop_mask;
                    (filter_loop_selector, filter_steps_nr)
                }
            }
            // c and f are adjacent so both can be reused
            Pattern::SpReductionKcf
            | Pattern::SpReductionKfc
            | Pattern::SpReductionCfk
            | Pattern::SpReductionFck => {
                with_filter
            }
            Pattern::SpReductionFkc => {
                if dense_steps_nr == 1 {
                    with_filter
                } else {
                    without_filter
                }
            }
            Pattern::ZReductionSkf | Pattern::ZReductionKsf => without_filter,
        };

        let sp_rem = last_step(a_spatial_size, geo_height);
        let dense_rem = last_step(fcd_view.view_size, geo_width);
        let last_a_partial_height_step_size = if params.is_transposed(InternalOperand::A) {
            round_to_multiple(sp_rem, geo.interleaved_spatial_ports_nr(InternalOperand::A))
        } else {
            sp_rem
        };
        let last_dense_step_size = dense_rem.min(geo.eu_width());

        let accum_dim_loop_mask =
            if dedw || params.is_gemm() { LoopMask::Gemm } else { LoopMask::Conv2 };
        let reuse_2d_loop_mask = match recipe.reuse_type() {
            ReuseType::AB => spatial_loop_mask,
            ReuseType::BA => dense_loop_mask,
            _ => LoopMask::Gemm,
        };

        Self {
            dense_steps_nr,
            a_partial_height_steps_nr,
            spatial_steps_nr,
            dense_loop_selector: dense_loop_mask.loop_bit(),
            a_partial_height_loop_selector,
            spatial_loop_selector,
            last_dense_step_size,
            last_a_partial_height_step_size,
            dense_loop_mask,
            spatial_loop_mask,
            accum_dim_loop_mask,
            reuse_2d_loop_mask,
        }
    }
}

/// Loop the output fcd is walked on. A forward conv that takes a single
/// step in either direction walks it like skf.
pub fn dense_loop_mask(
    op: OpType,
    pattern: Pattern,
    a_partial_height_steps_nr: u32,
    dense_steps_nr: u32,
) -> LoopMask {
    let single_step = a_partial_height_steps_nr == 1 || dense_steps_nr == 1;
    if op == OpType::Fwd && (single_step || pattern == Pattern::ZReductionSkf) {
        pattern_to_loop_mask(Pattern::ZReductionSkf, LoopDim::K)
    } else {
        pattern_to_loop_mask(pattern, LoopDim::K)
    }
}

/// Selectors of the filter loops, starting at the pattern's filter loop and
/// skipping the tetris loop
fn filter_loop_selector(first: LoopMask) -> u8 {
    let tetris = LoopMask::Tetris.bits();
    let mut cur = first.bits();
    let mut selector = 0;
    for _ in 0..MAX_CONV_DIMS - 1 {
        assert!(cur <= LoopMask::Outer.bits(), "loop mask cannot be above outer loop");
        selector |= (cur + 1) >> 1;
        loop {
            cur = (cur << 1) + 1;
            if cur != tetris {
                break;
            }
        }
    }
    selector
}

/// Size of the last step; a full step when `size` divides evenly
fn last_step(size: u32, step: u32) -> u32 {
    match size % step {
        0 => step,
        rem => rem,
    }
}

/// Accumulators to skip at the end of a descriptor so the next one starts
/// on the first accumulator. Half an accumulator is the unit, except in
/// 8x bgemm mode where every gemm owns half an accumulator.
pub fn roll_accums_val(
    budget: AccumBudget,
    last_or_to_memory: bool,
    accum_nr_sp: u32,
    accum_nr_dense: u32,
    bgemm_8x: bool,
    inc_in_last: bool,
) -> u32 {
    if last_or_to_memory {
        return u32::from(inc_in_last);
    }
    assert!(
        accum_nr_sp == 1 || accum_nr_dense == 1,
        "spatial or dense size of accums needs to be 1"
    );
    let accum_nr = if accum_nr_sp != 1 { accum_nr_sp } else { accum_nr_dense };
    if bgemm_8x {
        assert!(
            accum_nr <= budget.accums_nr_2x,
            "calculated accum number is above total num of accums"
        );
        budget.accums_nr_2x - accum_nr
    } else {
        assert!(
            accum_nr <= budget.accums_nr,
            "calculated accum number is above total num of accums"
        );
        2 * (budget.accums_nr - accum_nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MmeHal;
    use crate::params::{DataType, Geometry, TensorView};
    use crate::recipe::{IterVals, RecipeBuilder};
    use pretty_assertions::assert_eq;

    fn reuse_attr(params: &LayerParams) -> ReuseAttr {
        let hal = MmeHal::gaudi2();
        let geo = GeoAttr::new(params, &hal);
        let recipe = RecipeBuilder::new(params, &geo, &hal).build();
        ReuseAttr::new(params, &geo, &recipe)
    }

    /// Walk every activation and check its steps against the accumulators
    /// and the SB repeat counter
    fn assert_every_step_fits(params: &LayerParams, hal: &MmeHal) {
        let geo = GeoAttr::new(params, hal);
        let mut recipe = RecipeBuilder::new(params, &geo, hal).build();
        let vals: Vec<IterVals> = recipe.iterator().iter().collect();
        for val in vals {
            recipe.iterator_mut().set_cur_iter_vals(val);
            let attr = ReuseAttr::new(params, &geo, &recipe);
            if recipe.reuse_a() {
                assert!(attr.dense_steps_nr <= hal.max_sb_reuse);
            }
            if recipe.reuse_b() {
                assert!(attr.spatial_steps_nr <= hal.max_sb_reuse);
            }
            roll_accums_val(
                hal.accum_budget(),
                recipe.is_last_partial() || recipe.is_partial_to_memory(),
                attr.spatial_steps_nr,
                attr.dense_steps_nr,
                geo.bgemm_bit(),
                false,
            );
        }
    }

    fn reused_dedw(geometry: Geometry) -> LayerParams {
        let mut params = LayerParams::new(OpType::Dedw);
        params.x = TensorView::dense(DataType::Bf16, [256, 56, 56, 1, 2]);
        params.y = TensorView::dense(DataType::Bf16, [512, 56, 56, 1, 2]);
        params.w = TensorView::dense(DataType::Bf16, [512, 256, 3, 3, 1]);
        params.conv.padding = [1, 1, 0];
        params.strategy.geometry = geometry;
        params.strategy.pattern = Pattern::SpReductionKfc;
        params.strategy.sb_reuse = true;
        params
    }

    #[test]
    fn test_reused_dedw_partials_fit_accumulators() {
        assert_every_step_fits(&reused_dedw(Geometry::Geo2xh), &MmeHal::gaudi2());
        assert_every_step_fits(&reused_dedw(Geometry::Geo2xh), &MmeHal::gaudi3());
        assert_every_step_fits(&reused_dedw(Geometry::Geo4xw), &MmeHal::gaudi3());
    }

    #[test]
    fn test_reused_dedw_partials_to_memory_fit_repeat() {
        let mut params = reused_dedw(Geometry::Geo2xh);
        params.strategy.partials_to_memory_en = true;
        assert_every_step_fits(&params, &MmeHal::gaudi2());
    }

    #[test]
    fn test_reused_fwd_spatial_fits_repeat() {
        let mut params = LayerParams::new(OpType::Fwd);
        params.x = TensorView::dense(DataType::Bf16, [3, 224, 224, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [64, 3, 7, 7, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 218, 218, 1, 1]);
        params.strategy.geometry = Geometry::Geo4xw;
        params.strategy.sb_reuse = true;
        assert_every_step_fits(&params, &MmeHal::gaudi2());
    }

    #[test]
    fn test_fwd_single_step_walks_dense_like_skf() {
        let mut params = LayerParams::new(OpType::Fwd);
        params.x = TensorView::dense(DataType::Bf16, [16, 10, 10, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [64, 16, 1, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 10, 10, 1, 1]);
        params.strategy.pattern = Pattern::SpReductionKfc;
        let attr = reuse_attr(&params);
        assert_eq!(attr.a_partial_height_steps_nr, 1);
        assert_eq!(attr.dense_steps_nr, 1);
        assert_eq!(attr.dense_loop_mask, pattern_to_loop_mask(Pattern::ZReductionSkf, LoopDim::K));
        assert_eq!(attr.dense_loop_selector, LoopMask::Conv3.loop_bit());
        assert_eq!(attr.accum_dim_loop_mask, LoopMask::Conv2);
        assert_eq!(attr.last_dense_step_size, 64);
    }

    #[test]
    fn test_dedx_keeps_pattern_dense_loop() {
        let mut params = LayerParams::new(OpType::Dedx);
        params.x = TensorView::dense(DataType::Bf16, [16, 8, 8, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [32, 16, 1, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [32, 8, 8, 1, 1]);
        params.strategy.pattern = Pattern::SpReductionKfc;
        let attr = reuse_attr(&params);
        assert_eq!(attr.dense_loop_selector, LoopMask::Outer.loop_bit());
        assert_eq!(attr.a_partial_height_loop_selector, LoopMask::Tetris.loop_bit());
        assert_eq!(attr.spatial_steps_nr, attr.a_partial_height_steps_nr);
    }

    #[test]
    fn test_dense_loop_mask_override() {
        let skf_k = pattern_to_loop_mask(Pattern::ZReductionSkf, LoopDim::K);
        assert_eq!(dense_loop_mask(OpType::Fwd, Pattern::SpReductionKfc, 1, 1), skf_k);
        assert_eq!(dense_loop_mask(OpType::Fwd, Pattern::SpReductionKfc, 3, 1), skf_k);
        assert_eq!(dense_loop_mask(OpType::Fwd, Pattern::SpReductionKfc, 3, 2), LoopMask::Outer);
        assert_eq!(dense_loop_mask(OpType::Dedx, Pattern::SpReductionKfc, 1, 1), LoopMask::Outer);
    }

    #[test]
    fn test_filter_loop_selector_skips_tetris() {
        // conv0, conv1, conv2
        assert_eq!(filter_loop_selector(LoopMask::Conv0), 0b111);
        // conv2, conv3, outer
        assert_eq!(filter_loop_selector(LoopMask::Conv2), 0b101100);
    }

    #[test]
    fn test_last_step() {
        assert_eq!(last_step(512, 256), 256);
        assert_eq!(last_step(300, 256), 44);
        assert_eq!(last_step(10, 256), 10);
    }

    #[test]
    fn test_roll_accums() {
        let budget = AccumBudget {
            accums_nr: 8,
            accums_nr_2x: 4,
        };
        assert_eq!(roll_accums_val(budget, false, 1, 3, false, false), 10);
        assert_eq!(roll_accums_val(budget, false, 1, 3, true, false), 1);
        assert_eq!(roll_accums_val(budget, false, 2, 1, false, false), 12);
        assert_eq!(roll_accums_val(budget, true, 1, 3, false, true), 1);
        assert_eq!(roll_accums_val(budget, true, 1, 3, true, false), 0);
    }

    #[test]
    fn test_roll_accums_hal_budget() {
        let budget = MmeHal::gaudi2().accum_budget();
        assert_eq!(roll_accums_val(budget, false, 1, 1, false, false), 2 * (budget.accums_nr - 1));
        assert_eq!(roll_accums_val(budget, false, 1, 1, true, false), budget.accums_nr_2x - 1);
    }

    #[test]
    #[should_panic(expected = "spatial or dense size of accums needs to be 1")]
    fn test_roll_accums_two_directions_panics() {
        roll_accums_val(MmeHal::gaudi2().accum_budget(), false, 2, 2, false, false);
    }
}
