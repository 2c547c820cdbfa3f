//! SB reuse configuration
//!
//! When an input stays resident in its SBs the engine re-reads it instead of
//! fetching it again. The configurator writes how many times each input is
//! repeated, on which loop the repeat happens and which loops the input AGU
//! holds still on. The choice of loops is made by `ReuseAttr`; everything
//! here is field writes.

use crate::descriptor::Descriptor;
use crate::generator::reuse::ReuseAttr;
use crate::hardware::Chip;
use crate::params::{LayerParams, ReuseType};
use crate::recipe::Recipe;

pub trait SbReuseConfigurator: Send + Sync {
    fn chip(&self) -> Chip;

    /// Steps are counts; the descriptor holds them minus one and zero steps
    /// is written as zero
    fn set_desc_sb_repeat_steps(
        &self,
        desc: &mut Descriptor,
        repeat_dense_steps: u32,
        repeat_spatial_steps: u32,
    ) {
        let sb_repeat = desc.sb_repeat_mut();
        sb_repeat.repeat_a_minus1 = minus1(repeat_dense_steps);
        sb_repeat.repeat_b_minus1 = minus1(repeat_spatial_steps);
    }

    fn set_desc_sb_repeat_mask(&self, desc: &mut Descriptor, repeat_a_mask: u8, repeat_b_mask: u8) {
        let sb_repeat = desc.sb_repeat_mut();
        sb_repeat.repeat_a_mask = repeat_a_mask;
        sb_repeat.repeat_b_mask = repeat_b_mask;
    }

    /// Loops the input AGUs do not advance on
    fn set_desc_brains_agu(&self, desc: &mut Descriptor, a_loop_mask: u8, b_loop_mask: u8) {
        let brains = desc.brains_mut();
        brains.agu_a.loop_mask = a_loop_mask;
        brains.agu_b.loop_mask = b_loop_mask;
    }

    fn set_desc_accums(
        &self,
        desc: &mut Descriptor,
        roll_accums: u8,
        accum_en: bool,
        store_en: bool,
    );

    /// Write the reuse part of `desc` for the recipe's current iteration
    fn config_desc_sb_reuse(
        &self,
        desc: &mut Descriptor,
        params: &LayerParams,
        recipe: &Recipe,
        reuse: &ReuseAttr,
    ) {
        let reuse_type = recipe.reuse_type();
        if !params.is_sb_reuse() || reuse_type == ReuseType::None {
            self.set_desc_sb_repeat_steps(desc, 0, 0);
            self.set_desc_sb_repeat_mask(desc, 0, 0);
            return;
        }

        let dense_steps = if recipe.reuse_a() { reuse.dense_steps_nr } else { 0 };
        let spatial_steps = if recipe.reuse_b() { reuse.spatial_steps_nr } else { 0 };
        self.set_desc_sb_repeat_steps(desc, dense_steps, spatial_steps);

        // the outer operand of a 2d reuse repeats on the 2d loop
        let mut a_mask = if recipe.reuse_a() { reuse.dense_loop_mask.bits() } else { 0 };
        let mut b_mask = if recipe.reuse_b() { reuse.spatial_loop_mask.bits() } else { 0 };
        match reuse_type {
            ReuseType::AB => a_mask = reuse.reuse_2d_loop_mask.bits(),
            ReuseType::BA => b_mask = reuse.reuse_2d_loop_mask.bits(),
            _ => {}
        }
        self.set_desc_sb_repeat_mask(desc, a_mask, b_mask);

        let a_selector = if recipe.reuse_a() { reuse.dense_loop_selector } else { 0 };
        let b_selector = if recipe.reuse_b() { reuse.spatial_loop_selector } else { 0 };
        self.set_desc_brains_agu(desc, a_selector, b_selector);

        let header = desc.header();
        let (roll_accums, accum_en) = (header.roll_accums, header.accum_en);
        self.set_desc_accums(desc, roll_accums, accum_en, recipe.is_store_en());
    }
}

fn minus1(steps: u32) -> u8 {
    let value = steps.saturating_sub(1);
    assert!(value <= u8::MAX as u32, "sb repeat of {} steps does not fit the descriptor", steps);
    value as u8
}

pub struct Gaudi2SbReuse;

impl SbReuseConfigurator for Gaudi2SbReuse {
    fn chip(&self) -> Chip {
        Chip::Gaudi2
    }

    /// Both write buffers store together
    fn set_desc_accums(
        &self,
        desc: &mut Descriptor,
        roll_accums: u8,
        accum_en: bool,
        store_en: bool,
    ) {
        let header = desc.header_mut();
        header.roll_accums = roll_accums;
        header.accum_en = accum_en;
        header.store_en0 = store_en;
        let brains = desc.brains_mut();
        for agu_out in brains.agu_out.iter_mut() {
            agu_out.master_en = store_en;
            agu_out.slave_en = store_en;
        }
    }
}

pub struct Gaudi3SbReuse;

impl SbReuseConfigurator for Gaudi3SbReuse {
    fn chip(&self) -> Chip {
        Chip::Gaudi3
    }

    fn set_desc_accums(
        &self,
        desc: &mut Descriptor,
        roll_accums: u8,
        accum_en: bool,
        store_en: bool,
    ) {
        let header = desc.header_mut();
        header.roll_accums = roll_accums;
        header.accum_en = accum_en;
        header.store_en0 = store_en;
        let agu_out = &mut desc.brains_mut().agu_out[0];
        agu_out.master_en = store_en;
        agu_out.slave_en = store_en;
    }
}

pub fn for_chip(chip: Chip) -> Box<dyn SbReuseConfigurator> {
    match chip {
        Chip::Gaudi2 => Box::new(Gaudi2SbReuse),
        Chip::Gaudi3 => Box::new(Gaudi3SbReuse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_attr::GeoAttr;
    use crate::hardware::MmeHal;
    use crate::params::{DataType, OpType, Pattern, TensorView};
    use crate::recipe::RecipeBuilder;

    #[test]
    fn test_repeat_steps_minus_one() {
        let reuse = for_chip(Chip::Gaudi2);
        let mut desc = Descriptor::new_for(Chip::Gaudi2);
        reuse.set_desc_sb_repeat_steps(&mut desc, 4, 0);
        assert_eq!(desc.sb_repeat().repeat_a_minus1, 3);
        assert_eq!(desc.sb_repeat().repeat_b_minus1, 0);
        reuse.set_desc_sb_repeat_steps(&mut desc, 1, 256);
        assert_eq!(desc.sb_repeat().repeat_a_minus1, 0);
        assert_eq!(desc.sb_repeat().repeat_b_minus1, 255);
    }

    #[test]
    #[should_panic(expected = "does not fit the descriptor")]
    fn test_repeat_steps_overflow() {
        let mut desc = Descriptor::new_for(Chip::Gaudi3);
        for_chip(Chip::Gaudi3).set_desc_sb_repeat_steps(&mut desc, 300, 1);
    }

    #[test]
    fn test_accums_gate_output_brains() {
        let mut g2 = Descriptor::new_for(Chip::Gaudi2);
        for_chip(Chip::Gaudi2).set_desc_accums(&mut g2, 6, true, true);
        assert_eq!(g2.header().roll_accums, 6);
        assert!(g2.header().accum_en);
        assert!(g2.brains().agu_out.iter().all(|b| b.master_en && b.slave_en));

        let mut g3 = Descriptor::new_for(Chip::Gaudi3);
        for_chip(Chip::Gaudi3).set_desc_accums(&mut g3, 0, false, true);
        assert!(g3.brains().agu_out[0].master_en);
        assert!(!g3.brains().agu_out[1].master_en);
    }

    #[test]
    fn test_config_without_reuse_clears_repeats() {
        let mut params = LayerParams::new(OpType::Ab);
        params.x = TensorView::dense(DataType::Bf16, [64, 64, 1, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [64, 64, 1, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 64, 1, 1, 1]);
        let hal = MmeHal::gaudi2();
        let geo = GeoAttr::new(&params, &hal);
        let recipe = RecipeBuilder::new(&params, &geo, &hal).build();
        let attr = ReuseAttr::new(&params, &geo, &recipe);
        let mut desc = Descriptor::new_for(Chip::Gaudi2);
        desc.sb_repeat_mut().repeat_a_minus1 = 7;
        for_chip(Chip::Gaudi2).config_desc_sb_reuse(&mut desc, &params, &recipe, &attr);
        assert_eq!(*desc.sb_repeat(), Default::default());
    }

    #[test]
    fn test_config_reuse_a_repeats_on_dense_loop() {
        let mut params = LayerParams::new(OpType::Ab);
        params.x = TensorView::dense(DataType::Bf16, [8192, 128, 1, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [1024, 8192, 1, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [1024, 128, 1, 1, 1]);
        params.strategy.flatten_en = false;
        params.strategy.sb_reuse = true;
        params.strategy.pattern = Pattern::SpReductionFck;
        let hal = MmeHal::gaudi2();
        let geo = GeoAttr::new(&params, &hal);
        let recipe = RecipeBuilder::new(&params, &geo, &hal).build();
        assert_eq!(recipe.reuse_type(), ReuseType::A);
        let attr = ReuseAttr::new(&params, &geo, &recipe);
        let mut desc = Descriptor::new_for(Chip::Gaudi2);
        for_chip(Chip::Gaudi2).config_desc_sb_reuse(&mut desc, &params, &recipe, &attr);
        assert_eq!(desc.sb_repeat().repeat_a_minus1 as u32, attr.dense_steps_nr - 1);
        assert_eq!(desc.sb_repeat().repeat_a_mask, attr.dense_loop_mask.bits());
        assert_eq!(desc.sb_repeat().repeat_b_mask, 0);
        assert_eq!(desc.brains().agu_a.loop_mask, attr.dense_loop_selector);
        assert_eq!(desc.header().store_en0, recipe.is_store_en());
    }
}
