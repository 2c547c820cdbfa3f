//! Descriptor generation
//!
//! `DescriptorGenerator` lowers one validated `LayerParams` to the ordered
//! list of activations that implement it. Per conv sub-problem it builds a
//! geometry and a recipe, walks the recipe and builds one descriptor per
//! master MME for every iteration:
//!
//! 1. reuse attributes of the iteration
//! 2. header and brain fields derived from the params
//! 3. AGU configuration (tensors, ports, loops, routing)
//! 4. SB reuse configuration
//! 5. signaling, memory directives, rate limiters
//!
//! Once every activation is assembled, skip flags and perf events are
//! applied over the whole list. Sync object addresses, color sets and tensor
//! base addresses are only known after scheduling and are patched later.

pub mod memory;
pub mod perf;
pub mod reuse;
pub mod validation;

use std::sync::Arc;

use log::{debug, info};

use crate::agu::{self, AguConfigurator};
use crate::cache::DescriptorCache;
use crate::descriptor::{gaudi2, gaudi3, Activation, Descriptor, EnableAndMask};
use crate::error::DescGenResult;
use crate::geo_attr::GeoAttr;
use crate::hardware::{Chip, GeneratorConfig, MmeHal};
use crate::params::{
    div_round_up, DataType, InternalOperand, LayerParams, LoopMask, Operand, SignalingMode,
    TensorRole, GEMM_DIM_B1, MAX_TENSOR_DIMS,
};
use crate::recipe::{Recipe, RecipeBuilder};
use crate::sb_reuse::{self, SbReuseConfigurator};
use crate::signaling::SignalingInfo;
use crate::sub_problems::{ConvSubProblems, OffsetArray};

use reuse::{roll_accums_val, ReuseAttr};

/// Gaudi2 PCU rate limiter saturation is 24 bits wide
const GAUDI2_PCU_SATURATION_MAX: u32 = (1 << 24) - 1;
/// Gaudi3 PMU rate limiter saturation is 20 bits wide
const GAUDI3_PMU_SATURATION_MAX: u32 = (1 << 20) - 1;

/// Geometry and recipe of one conv sub-problem
#[derive(Debug, Clone)]
struct SubProblemPlan {
    address_offset: OffsetArray,
    geo: GeoAttr,
    recipe: Recipe,
}

impl SubProblemPlan {
    fn params(&self) -> &LayerParams {
        self.geo.params()
    }
}

/// Where one descriptor sits in the whole operation
#[derive(Debug, Clone, Copy)]
struct DescPosition {
    mme_idx: u32,
    last_sub_problem: bool,
}

pub struct DescriptorGenerator {
    chip: Chip,
    hal: MmeHal,
    agu: Box<dyn AguConfigurator>,
    sb_reuse: Box<dyn SbReuseConfigurator>,
    signaling: SignalingInfo,
    cache: Option<Arc<DescriptorCache>>,
    /// Working copy of the last generated params, after forced reductions
    params: Option<LayerParams>,
    plans: Vec<SubProblemPlan>,
    activations: Vec<Activation>,
}

impl DescriptorGenerator {
    pub fn new(chip: Chip) -> Self {
        Self {
            chip,
            hal: MmeHal::for_chip(chip),
            agu: agu::for_chip(chip),
            sb_reuse: sb_reuse::for_chip(chip),
            signaling: SignalingInfo,
            cache: None,
            params: None,
            plans: Vec::new(),
            activations: Vec::new(),
        }
    }

    /// A generator that memoizes its results in a shared cache. The cache
    /// must only be shared between generators of the same chip.
    pub fn with_cache(chip: Chip, cache: Arc<DescriptorCache>) -> Self {
        let mut generator = Self::new(chip);
        generator.cache = Some(cache);
        generator
    }

    pub fn from_config(config: &GeneratorConfig) -> DescGenResult<Self> {
        config.validate()?;
        let generator = if config.use_cache {
            Self::with_cache(config.chip, Arc::new(DescriptorCache::new(config.cache_capacity)))
        } else {
            Self::new(config.chip)
        };
        Ok(generator)
    }

    pub fn chip(&self) -> Chip {
        self.chip
    }

    pub fn hal(&self) -> &MmeHal {
        &self.hal
    }

    pub fn cache(&self) -> Option<&Arc<DescriptorCache>> {
        self.cache.as_ref()
    }

    /// Params of the last generation, with forced reductions applied
    pub fn params(&self) -> Option<&LayerParams> {
        self.params.as_ref()
    }

    pub fn validate_params(&self, params: &LayerParams) -> DescGenResult<()> {
        validation::validate_params(self.chip, params)
    }

    /// Validation result in its boolean plus message form
    pub fn check_params(&self, params: &LayerParams) -> (bool, String) {
        validation::check_params(self.chip, params)
    }

    /// Validate `params` and generate its activations. On a validation
    /// error nothing is generated and the cache is not touched.
    pub fn generate(&mut self, params: &LayerParams) -> DescGenResult<&[Activation]> {
        self.validate_params(params)?;
        let mut working = params.clone();
        validation::force_output_reduction(self.chip, &mut working);

        let mut plans = self.plan(&working);
        for (idx, plan) in plans.iter().enumerate() {
            for line in plan.recipe.debug_info(false) {
                info!("{} sub-problem {}: {}", self.chip, idx, line);
            }
        }

        let activations = match (&self.cache, params.use_desc_cache) {
            (Some(cache), true) => {
                let cache = Arc::clone(cache);
                // keyed on the caller's params, the forced reduction is a function of them
                let cached = cache.generate_descriptors_cache(params, || {
                    self.build_activations(&working, &mut plans)
                });
                cached.as_ref().clone()
            }
            _ => self.build_activations(&working, &mut plans),
        };

        self.params = Some(working);
        self.plans = plans;
        self.activations = activations;
        Ok(&self.activations)
    }

    fn plan(&self, params: &LayerParams) -> Vec<SubProblemPlan> {
        ConvSubProblems::new(params)
            .iter()
            .map(|sub| {
                let geo = GeoAttr::new(&sub.params, &self.hal);
                let recipe = RecipeBuilder::new(&sub.params, &geo, &self.hal).build();
                SubProblemPlan {
                    address_offset: sub.address_offset,
                    geo,
                    recipe,
                }
            })
            .collect()
    }

    fn build_activations(
        &self,
        params: &LayerParams,
        plans: &mut [SubProblemPlan],
    ) -> Vec<Activation> {
        let mut activations = Vec::new();
        let plans_nr = plans.len();
        for (plan_idx, plan) in plans.iter_mut().enumerate() {
            let last_sub_problem = plan_idx + 1 == plans_nr;
            for vals in plan.recipe.iterator().iter() {
                plan.recipe.iterator_mut().set_cur_iter_vals(vals);
                let activation = self.build_activation(plan, last_sub_problem);
                debug!(
                    "activation {}: {} descriptors, signals={}, tetrises={}, mask={}",
                    activations.len(),
                    activation.num_descriptors(),
                    activation.num_signals,
                    activation.num_tetrises,
                    activation.is_mask
                );
                activations.push(activation);
            }
            assert!(plan.recipe.iterator().is_last_iteration(), "should be on last activation");
        }

        count_skip_signals(&mut activations, params);
        let tracing = &params.tracing;
        perf::configure_perf_events(&mut activations, tracing.trace_mode, tracing.ctx_id);
        activations
    }

    fn build_activation(&self, plan: &mut SubProblemPlan, last_sub_problem: bool) -> Activation {
        let is_mask = plan.recipe.is_mask_activation();
        plan.geo.set_primary_tensors(!is_mask);
        let plan: &SubProblemPlan = plan;

        let descriptors: Vec<Descriptor> = (0..plan.geo.mme_nr())
            .map(|mme_idx| {
                let position = DescPosition {
                    mme_idx,
                    last_sub_problem,
                };
                self.build_desc(plan, position)
            })
            .collect();

        let mut activation = Activation::new(descriptors);
        activation.is_gemm = plan.params().is_gemm();
        activation.is_mask = is_mask;
        if is_mask {
            activation.operand_roles[InternalOperand::A as usize] = TensorRole::AuxMaskedBgemmA;
            activation.operand_roles[InternalOperand::B as usize] = TensorRole::AuxMaskedBgemmB;
        }

        let first = activation.desc(0);
        let num_signals = self.signaling.count_signals(first);
        for desc in &activation.descriptors[1..] {
            assert_eq!(
                num_signals,
                self.signaling.count_signals(desc),
                "num of signals should be equal between all descriptors"
            );
        }
        let num_tetrises = first.loop_iterations_outside(first.agu_out_loop_mask());
        let no_rollup = first.header().no_rollup;

        activation.num_signals = num_signals;
        activation.num_tetrises = num_tetrises;
        activation.num_rollups = if no_rollup { 0 } else { num_tetrises };
        activation.sp_view = *plan.recipe.cur_sp();
        activation.fcd_view = *plan.recipe.cur_fcd();
        activation.non_spatial_view = *plan.recipe.cur_non_spatial();
        activation
    }

    fn build_desc(&self, plan: &SubProblemPlan, position: DescPosition) -> Descriptor {
        let params = plan.params();
        let recipe = &plan.recipe;
        let mut desc = Descriptor::new_for(self.chip);
        let reuse = ReuseAttr::new(params, &plan.geo, recipe);

        if self.chip == Chip::Gaudi3 && params.is_native_dma() {
            set_dma_fields(&mut desc, params, recipe);
        } else {
            self.set_fields_from_params(&mut desc, plan, &reuse);
            set_engine_brains(&mut desc, params, recipe, &reuse);
        }

        self.agu
            .config(&mut desc, recipe, &plan.geo, position.mme_idx, &plan.address_offset);
        self.sb_reuse.config_desc_sb_reuse(&mut desc, params, recipe, &reuse);
        self.common_descriptor_config_post(&mut desc, plan, position);

        if self.chip == Chip::Gaudi3 {
            add_dcore_offsets(&mut desc, params);
        }
        desc
    }

    fn set_fields_from_params(
        &self,
        desc: &mut Descriptor,
        plan: &SubProblemPlan,
        reuse: &ReuseAttr,
    ) {
        let params = plan.params();
        let recipe = &plan.recipe;
        let geo = &plan.geo;
        let bgemm = geo.bgemm_bit();

        let mut extra_roll_in_last = false;
        if geo.supports_concurrency() {
            let batch_view = recipe.cur_non_spatial();
            let mut batch_loops = [0u32; 3];
            batch_loops.copy_from_slice(&batch_view.sizes[GEMM_DIM_B1..MAX_TENSOR_DIMS]);
            if let Some(concurrent_idx) = geo.concurrent_dim().checked_sub(GEMM_DIM_B1) {
                if let Some(loops) = batch_loops.get_mut(concurrent_idx) {
                    *loops = div_round_up(*loops, geo.geometry_concurrency());
                }
            }
            let accums_per_dcore: u32 = batch_loops.iter().product();
            extra_roll_in_last = bgemm && accums_per_dcore % 2 == 1;
        }
        let roll_accums = roll_accums_val(
            self.hal.accum_budget(),
            recipe.is_last_partial() || recipe.is_partial_to_memory(),
            reuse.spatial_steps_nr,
            reuse.dense_steps_nr,
            bgemm,
            extra_roll_in_last,
        );

        let controls = &params.controls;
        let header = desc.header_mut();
        header.lower_a = recipe.lowering;
        header.accum_en = recipe.is_accum_en();
        header.roll_accums = roll_accums as u8;
        header.store_en0 = recipe.is_store_en();
        header.relu_en = controls.relu_en;
        header.no_rollup = false;
        header.rounding_mode = controls.conversion_rounding_mode as u8;
        header.sb_a_cache_en = controls.sb_cache_en;
        header.sb_b_cache_en = controls.sb_cache_en;
        header.bgemm = bgemm;

        let input_dt = recipe.operand(InternalOperand::A).element_type;
        let output_dt = output_data_type(recipe.operand(InternalOperand::C).element_type);
        match desc {
            Descriptor::Gaudi2(d) => {
                let header = &mut d.header;
                header.lower_b = false;
                header.double_accums = !(bgemm || geo.double_accums_bit());
                header.data_type_in = gaudi2_data_type(input_dt);
                header.data_type_out = gaudi2_data_type(output_dt);
                header.hx2 = geo.hx2_bit();
                header.dec_en = input_dt.is_fp8() && bgemm;
                header.clip_fp_eu = controls.clipping_en;
                header.clip_fp_ap = controls.clipping_en;

                d.fp8_bias.a = (controls.fp8_bias_in & 0xf) as u8;
                d.fp8_bias.b = (controls.fp8_bias_in2 & 0xf) as u8;
                d.fp8_bias.out = (controls.fp8_bias_out & 0x1f) as u8;
            }
            Descriptor::Gaudi3(d) => {
                // gaudi3 reads its input type from B, A may be a narrower fp8/fp16 flavor
                let b_dt = recipe.operand(InternalOperand::B).element_type;
                let header = &mut d.header;
                header.dual_gemm = params.strategy.dual_gemm;
                header.lower_b = params.is_gemm_dma();
                header.double_accums = !geo.double_accums_bit();
                header.op_a_non_shared = geo.non_share_a_bit();
                header.wb_cache_en = true;
                header.data_type_in = gaudi3_data_type(b_dt);
                header.data_type_out = gaudi3_data_type(output_dt);
                header.ftz = controls.flush_denormals;
                header.sftz_fp32_to_fp8 = controls.stochastic_flush;
                header.clip_fp_eu = controls.clipping_en;
                header.clip_fp_ap = controls.clipping_en;

                let a_dt = recipe.operand(InternalOperand::A).element_type;
                let c_dt = recipe.operand(InternalOperand::C).element_type;
                let numerics = &mut d.numerics;
                numerics.acc_rounding_mode = controls.acc_rounding_mode as u8 & 0x3;
                numerics.bias_a = (controls.fp8_bias_in & 0x3f) as u8;
                numerics.bias_b = (controls.fp8_bias_in2 & 0x3f) as u8;
                numerics.bias_out = (controls.fp8_bias_out & 0x3f) as u8;
                numerics.fp8_flavor_a = a_dt == DataType::Fp8_152;
                numerics.fp8_flavor_b = b_dt == DataType::Fp8_152;
                numerics.fp8_flavor_out = c_dt == DataType::Fp8_152;
                numerics.fp16_flavor_a = a_dt == DataType::Ufp16;
                numerics.fp16_flavor_b = b_dt == DataType::Ufp16;
                numerics.fp16_flavor_out = c_dt == DataType::Ufp16;
                numerics.inf_nan_mode_a = controls.inf_nan_mode_a as u8;
                numerics.inf_nan_mode_b = controls.inf_nan_mode_b as u8;
                numerics.inf_nan_mode_out = controls.inf_nan_mode_out as u8;
            }
        }
    }

    /// Signaling, memory directives, rate limiters and power saturation
    fn common_descriptor_config_post(
        &self,
        desc: &mut Descriptor,
        plan: &SubProblemPlan,
        position: DescPosition,
    ) {
        let params = plan.params();
        let controls = &params.controls;
        let is_last = plan.recipe.iterator().is_last_iteration() && position.last_sub_problem;
        let signal_amount = if plan.recipe.signal_amount != 0 {
            plan.recipe.signal_amount
        } else {
            controls.signal_amount
        };
        self.signaling.add_signal_info(
            desc,
            controls.signaling_mode,
            controls.slave_signaling,
            is_last,
            controls.squash_io_rois,
            signal_amount,
        );
        memory::configure_memory_directives(desc, params, &plan.recipe);

        let limits = self.hal.rate_limits;
        let limiter = desc.rate_limiter_mut();
        limiter.agu_a = limits.agu_a;
        limiter.agu_b = limits.agu_b;
        limiter.agu_out = limits.agu_out;
        limiter.eu = limits.eu;

        match desc {
            Descriptor::Gaudi2(d) => {
                d.pcu_rl_saturation = controls.pmu_saturation_val.min(GAUDI2_PCU_SATURATION_MAX);
            }
            Descriptor::Gaudi3(d) => {
                d.power.pmu_rl_saturation =
                    controls.pmu_saturation_val.min(GAUDI3_PMU_SATURATION_MAX);
            }
        }
    }

    // --- results ---

    pub fn activations(&self) -> &[Activation] {
        &self.activations
    }

    pub fn activations_mut(&mut self) -> &mut [Activation] {
        &mut self.activations
    }

    pub fn take_activations(&mut self) -> Vec<Activation> {
        std::mem::take(&mut self.activations)
    }

    // --- patching ---

    /// Set the sync object addresses of MME `mme_idx` in every activation
    pub fn mme_patch_sync_objects(
        &mut self,
        mme_idx: usize,
        addr0: u32,
        addr1: u32,
        slave_addr0: u32,
        slave_addr1: u32,
    ) {
        for activation in &mut self.activations {
            let desc = activation.desc_mut(mme_idx);
            self.signaling.patch_sync_object(desc, addr0, addr1, slave_addr0, slave_addr1);
        }
    }

    /// Select the store color sets of one activation from the memory its
    /// outputs are written to
    pub fn patch_signal_coloring(
        &mut self,
        act_idx: usize,
        addr0_is_sram: bool,
        addr1_is_sram: bool,
    ) {
        let use_same_color_set =
            self.params.as_ref().is_some_and(|p| p.controls.use_same_color_set);
        for desc in &mut self.activations[act_idx].descriptors {
            self.signaling
                .patch_signal_coloring(desc, addr0_is_sram, addr1_is_sram, use_same_color_set);
        }
    }

    pub fn patch_context_id(&mut self, ctx_id: u16) {
        perf::patch_context_id(&mut self.activations, ctx_id);
    }

    pub fn patch_debug_wkld_id(&mut self, wkld_id: u32) {
        perf::patch_debug_wkld_id(&mut self.activations, wkld_id);
    }

    /// Add `offset` bytes to the base address of `operand` in every
    /// descriptor. The output offset moves both output ports.
    pub fn increment_tensor_addresses(&mut self, operand: InternalOperand, offset: u64) {
        for desc in self.activations.iter_mut().flat_map(|a| a.descriptors.iter_mut()) {
            let mut addrs = desc.base_addrs();
            let mut out1 = desc.base_addr_out1();
            addrs[operand as usize] += offset;
            if operand == InternalOperand::C {
                out1 += offset;
            }
            desc.set_base_addrs(addrs[0], addrs[1], addrs[2]);
            desc.set_base_addr_out1(out1);
        }
    }

    /// Bind an input tensor to its device address
    pub fn patch_input_tensor(&mut self, operand: Operand, addr: u64, is_sram: bool) {
        let Some(params) = &self.params else {
            panic!("layer params have not been initialized");
        };
        let internal = internal_operand(params, operand);
        assert!(internal.is_input(), "{:?} is not an input of {:?}", operand, params.op_type);
        let aligned = addr % self.hal.cl_size as u64 == 0;
        let elem_size = params.operand(internal).element_type.element_size();
        let cl_size = self.hal.cl_size;
        for desc in self.activations.iter_mut().flat_map(|a| a.descriptors.iter_mut()) {
            set_sb_cache_disable(desc, internal, elem_size, cl_size, is_sram, aligned);
        }
        self.increment_tensor_addresses(internal, addr);
    }

    /// Bind the output tensor, and optionally the secondary output, to
    /// their device addresses. A secondary output turns on the second store.
    pub fn patch_output_tensor(
        &mut self,
        addr0: u64,
        is_sram0: bool,
        secondary: Option<(u64, bool)>,
    ) {
        let is_sram1 = secondary.map_or(is_sram0, |(_, sram)| sram);
        for act_idx in 0..self.activations.len() {
            self.patch_signal_coloring(act_idx, is_sram0, is_sram1);
        }
        self.increment_tensor_addresses(InternalOperand::C, addr0);
        if let Some((addr1, _)) = secondary {
            for desc in self.activations.iter_mut().flat_map(|a| a.descriptors.iter_mut()) {
                let header = desc.header_mut();
                header.store_en1 = header.store_en0;
                desc.set_base_addr_out1(desc.base_addr_out1() - addr0 + addr1);
            }
        }
    }

    // --- queries ---

    /// Output ROIs can be squashed to a single range when the whole output
    /// is written by one signaling activation
    pub fn can_squash_rois(&self) -> bool {
        let Some(params) = &self.params else {
            return false;
        };
        if params.controls.squash_io_rois {
            return true;
        }
        if params.controls.signaling_mode != SignalingMode::DescWithStore
            || params.strategy.masked_bgemm
        {
            return false;
        }
        let storing = self.activations.iter().filter(|a| a.desc(0).header().store_en0).count();
        storing == 1
    }

    /// Recipe summary of every sub-problem. The verbose form adds the split
    /// details and the partial, SB repeat and activation counts.
    pub fn recipe_debug_info(&self, verbose: bool) -> Vec<String> {
        let mut info = Vec::new();
        let single = self.plans.len() == 1;
        for (idx, plan) in self.plans.iter().enumerate() {
            let mut lines = plan.recipe.debug_info(verbose);
            if lines.is_empty() {
                continue;
            }
            let title = if single {
                "MME Recipe: ".to_string()
            } else {
                format!("MME Recipe {}: ", idx)
            };
            let mut summary = title + &lines[0];
            if verbose {
                summary.push_str(&self.verbose_suffix(&plan.recipe));
            }
            lines[0] = summary;
            info.extend(lines);
        }
        info
    }

    fn verbose_suffix(&self, recipe: &Recipe) -> String {
        let mut suffix = String::new();
        if recipe.partials_nr() > 1 {
            suffix.push_str(&format!(", partials={}", recipe.partials_nr()));
        }
        let sb_repeats: u32 = self
            .activations
            .iter()
            .filter_map(|a| a.descriptors.last())
            .map(|d| {
                let repeat = d.sb_repeat();
                [repeat.repeat_a_minus1, repeat.repeat_b_minus1]
                    .iter()
                    .filter(|&&r| r != 0)
                    .map(|&r| r as u32 + 1)
                    .sum::<u32>()
            })
            .sum();
        if sb_repeats > 1 {
            suffix.push_str(&format!(", SBRepeats={}", sb_repeats));
        }
        if self.activations.len() > 1 {
            suffix.push_str(&format!(", activations={}", self.activations.len()));
        }
        suffix
    }

    /// Hex dump of every descriptor, grouped per activation
    pub fn dump_descriptors(&self) -> Vec<Vec<String>> {
        self.activations
            .iter()
            .enumerate()
            .map(|(act_idx, activation)| {
                let mut lines = Vec::new();
                for (desc_idx, desc) in activation.descriptors.iter().enumerate() {
                    lines.push(format!("Activation {} Descriptor {}:", act_idx, desc_idx));
                    lines.extend(desc.hex_dump());
                }
                lines
            })
            .collect()
    }
}

fn internal_operand(params: &LayerParams, operand: Operand) -> InternalOperand {
    let operand = if operand == Operand::O { Operand::Y } else { operand };
    InternalOperand::ALL
        .into_iter()
        .find(|&internal| params.external_operand(internal) == operand)
        .unwrap_or_else(|| panic!("invalid operand {:?}", operand))
}

/// tf32 and ieee fp32 outputs are written as plain fp32
fn output_data_type(dt: DataType) -> DataType {
    match dt {
        DataType::Tf32 | DataType::Fp32Ieee => DataType::Fp32,
        other => other,
    }
}

fn gaudi2_data_type(dt: DataType) -> u8 {
    gaudi2::data_type_code(dt).unwrap_or_else(|| panic!("invalid data type {:?}", dt))
}

fn gaudi3_data_type(dt: DataType) -> u8 {
    let dt = if dt == DataType::Ufp16 { DataType::Fp16 } else { dt };
    gaudi3::data_type_code(dt).unwrap_or_else(|| panic!("invalid data type {:?}", dt))
}

fn set_engine_brains(
    desc: &mut Descriptor,
    params: &LayerParams,
    recipe: &Recipe,
    reuse: &ReuseAttr,
) {
    let gemm_dma = params.is_gemm_dma();
    let out_mask = if gemm_dma { LoopMask::Conv0 } else { reuse.accum_dim_loop_mask };
    let header = *desc.header();
    let chip = desc.chip();
    let brains = desc.brains_mut();

    brains.agu_a = EnableAndMask {
        loop_mask: if recipe.reuse_a() { reuse.dense_loop_selector } else { 0 },
        master_en: true,
        slave_en: true,
    };
    brains.agu_b = EnableAndMask {
        loop_mask: if recipe.reuse_b() { reuse.spatial_loop_selector } else { 0 },
        master_en: true,
        slave_en: true,
    };
    brains.eu = EnableAndMask::enabled(if gemm_dma { LoopMask::Conv0 } else { LoopMask::Gemm });
    brains.ap = EnableAndMask {
        loop_mask: out_mask.bits(),
        master_en: !header.no_rollup,
        slave_en: !header.no_rollup,
    };
    brains.agu_out[0] = EnableAndMask {
        loop_mask: out_mask.bits(),
        master_en: header.store_en0,
        slave_en: header.store_en0,
    };
    brains.agu_out[1] = if chip == Chip::Gaudi2 {
        brains.agu_out[0]
    } else {
        EnableAndMask::default()
    };
    brains.agu_out_dma = EnableAndMask::default();
}

/// Gaudi3 native DMA: a plain copy from A to the output through the DMA
/// output AGU
fn set_dma_fields(desc: &mut Descriptor, params: &LayerParams, recipe: &Recipe) {
    let header = desc.header_mut();
    header.dma_mode = true;
    header.dual_gemm = false;
    header.data_type_in = gaudi3_data_type(params.x.element_type);
    header.data_type_out = gaudi3_data_type(output_data_type(params.y.element_type));
    header.store_en0 = true;
    header.double_accums = true;
    header.lower_a = false;
    header.lower_b = false;
    header.no_rollup = true;
    header.te_bypass_a = false;
    header.te_bypass_b = false;
    header.sb_a_cache_en = params.controls.sb_cache_en;
    header.wb_cache_en = true;
    if recipe.te_acceleration != 0 {
        let direction = if recipe.accelerated_operand == InternalOperand::A { 0 } else { 1 };
        header.te_accel_a = (direction << 2 | recipe.te_acceleration) as u8;
    }

    let brains = desc.brains_mut();
    brains.agu_a = EnableAndMask::enabled(LoopMask::Gemm);
    brains.agu_b = EnableAndMask::default();
    brains.eu = EnableAndMask::enabled(LoopMask::Gemm);
    brains.ap = EnableAndMask::default();
    brains.agu_out = [EnableAndMask::default(); 2];
    brains.agu_out_dma = EnableAndMask::enabled(LoopMask::Gemm);

    desc.set_wkld_id(params.tracing.ctx_id as u32);
}

/// Every dcore reads its slice of the tensors from its own base
fn add_dcore_offsets(desc: &mut Descriptor, params: &LayerParams) {
    let mut addrs = desc.base_addrs();
    for operand in InternalOperand::ALL {
        let view = params.operand(operand);
        let elem_size = view.element_type.element_size() as u64;
        let elements: u64 = view
            .dcore_bases
            .iter()
            .zip(view.strides.iter())
            .map(|(&base, &stride)| base as u64 * stride as u64)
            .sum();
        addrs[operand as usize] += elements * elem_size;
    }
    desc.set_base_addrs(addrs[0], addrs[1], addrs[2]);
}

/// Turn the Gaudi2 SB cache off for inputs read in short strided bursts,
/// where every 128B line would be split into two 64B HBM accesses of which
/// only one is used
fn set_sb_cache_disable(
    desc: &mut Descriptor,
    operand: InternalOperand,
    elem_size: u32,
    cl_size: u32,
    is_sram: bool,
    address_aligned: bool,
) {
    if is_sram || desc.chip() != Chip::Gaudi2 {
        return;
    }
    let tensor = desc.tensor(operand);
    let fcd = elem_size * tensor.valid_elements[0];
    let stride = elem_size * tensor.spatial_strides[0];
    let enable_cache = !(fcd <= cl_size / 2 && stride >= cl_size);
    let header = desc.header_mut();
    match operand {
        // an unaligned A still benefits from the cache
        InternalOperand::A => {
            header.sb_a_cache_en = if address_aligned { enable_cache } else { true }
        }
        InternalOperand::B => header.sb_b_cache_en = enable_cache,
        InternalOperand::C => panic!("invalid operand"),
    }
}

/// Activations that never signal do not close any output region, so the
/// ROI of their output tensor is not tracked
fn count_skip_signals(activations: &mut [Activation], params: &LayerParams) {
    let output = params.external_operand(InternalOperand::C);
    for activation in activations.iter_mut().filter(|a| a.num_signals == 0) {
        match output {
            Operand::X => activation.roi_x_skip = true,
            Operand::W => activation.roi_w_skip = true,
            Operand::Y | Operand::O => activation.roi_y_skip = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{
        BoolWithUndef, Geometry, OpType, Pattern, ReductionOp, TensorView, TraceMode,
    };
    use pretty_assertions::assert_eq;

    fn bgemm(dt: DataType) -> LayerParams {
        let mut params = LayerParams::new(OpType::Ab);
        params.x = TensorView::dense(dt, [64, 32, 2, 1, 1]);
        params.w = TensorView::dense(dt, [128, 64, 2, 1, 1]);
        params.y = TensorView::dense(dt, [128, 32, 2, 1, 1]);
        params
    }

    fn fwd() -> LayerParams {
        let mut params = LayerParams::new(OpType::Fwd);
        params.x = TensorView::dense(DataType::Bf16, [64, 32, 32, 1, 4]);
        params.w = TensorView::dense(DataType::Bf16, [128, 64, 3, 3, 1]);
        params.y = TensorView::dense(DataType::Bf16, [128, 30, 30, 1, 4]);
        params
    }

    fn bytes(activations: &[Activation]) -> Vec<Vec<u8>> {
        activations.iter().map(|a| a.to_bytes()).collect()
    }

    #[test]
    fn test_generation_is_deterministic() {
        for chip in [Chip::Gaudi2, Chip::Gaudi3] {
            let params = fwd();
            let first = bytes(DescriptorGenerator::new(chip).generate(&params).unwrap());
            let second = bytes(DescriptorGenerator::new(chip).generate(&params).unwrap());
            assert!(!first.is_empty());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_gaudi2_activation_has_descriptor_per_mme() {
        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        let activations = generator.generate(&bgemm(DataType::Bf16)).unwrap();
        for activation in activations {
            assert_eq!(activation.num_descriptors(), 2);
            assert!(activation.is_gemm);
            assert!(!activation.is_mask);
            assert_eq!(activation.operand_roles[2], TensorRole::OutputTensorC);
        }
    }

    #[test]
    fn test_last_activation_stores_and_signals() {
        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        let activations = generator.generate(&fwd()).unwrap();
        let last = activations.last().unwrap();
        for desc in &last.descriptors {
            assert!(desc.header().store_en0);
            assert!(desc.brains().agu_out[0].master_en);
            assert!(desc.sync_object().signal_en0);
        }
        assert!(last.num_signals > 0);
        assert!(!last.roi_y_skip);
        assert_eq!(last.num_rollups, last.num_tetrises);
    }

    #[test]
    fn test_rejected_params_generate_nothing() {
        let cache = Arc::new(DescriptorCache::new(4));
        let mut generator = DescriptorGenerator::with_cache(Chip::Gaudi2, Arc::clone(&cache));
        let mut params = bgemm(DataType::Bf16);
        params.y.element_type = DataType::Fp8_152;
        params.memory.reduction_op = ReductionOp::Add;
        let err = generator.generate(&params).unwrap_err();
        assert!(err.validation_message().is_some());
        assert!(generator.activations().is_empty());
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_cache_returns_identical_activations() {
        let cache = Arc::new(DescriptorCache::new(4));
        let mut first = DescriptorGenerator::with_cache(Chip::Gaudi2, Arc::clone(&cache));
        let mut second = DescriptorGenerator::with_cache(Chip::Gaudi2, Arc::clone(&cache));
        let params = bgemm(DataType::Bf16);
        let a = bytes(first.generate(&params).unwrap());
        let b = bytes(second.generate(&params).unwrap());
        assert_eq!(a, b);
        assert_eq!(cache.cache_size(), 1);
        assert!(cache.is_element_in_des_cache(&params));

        let mut uncached = params.clone();
        uncached.use_desc_cache = false;
        first.generate(&uncached).unwrap();
        assert!(!cache.is_element_in_des_cache(&uncached));
    }

    #[test]
    fn test_atomic_add_forces_reduction_on_working_copy() {
        let mut generator = DescriptorGenerator::new(Chip::Gaudi3);
        let mut params = bgemm(DataType::Bf16);
        params.controls.atomic_add = true;
        generator.generate(&params).unwrap();
        assert_eq!(params.memory.reduction_op, ReductionOp::None);
        assert_eq!(generator.params().map(|p| p.memory.reduction_op), Some(ReductionOp::Add));
        match generator.activations()[0].desc(0) {
            Descriptor::Gaudi3(d) => assert_eq!(d.axi_aw_user_data.first & 1, 1),
            Descriptor::Gaudi2(_) => unreachable!(),
        }
    }

    #[test]
    fn test_rate_limiters() {
        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        generator.generate(&bgemm(DataType::Bf16)).unwrap();
        let desc = generator.activations()[0].desc(0).clone();
        match desc {
            Descriptor::Gaudi2(d) => {
                assert_eq!((d.rate_limiter.agu_a, d.rate_limiter.eu), (4, 0));
            }
            Descriptor::Gaudi3(_) => unreachable!(),
        }
    }

    #[test]
    fn test_patch_sync_objects_and_coloring() {
        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        generator.generate(&fwd()).unwrap();
        generator.mme_patch_sync_objects(1, 0x100, 0x104, 0, 0);
        let last = generator.activations().last().unwrap();
        assert_eq!(last.desc(1).sync_object().so0_addr, 0x100);
        assert_eq!(last.desc(0).sync_object().so0_addr, 0);

        // the default params use a single color set
        generator.patch_signal_coloring(0, false, false);
        assert!(!generator.activations()[0].desc(0).header().store_color_set0);
    }

    #[test]
    fn test_patch_tensors() {
        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        generator.generate(&bgemm(DataType::Bf16)).unwrap();
        let before: Vec<[u64; 3]> =
            generator.activations()[0].descriptors.iter().map(|d| d.base_addrs()).collect();
        generator.patch_input_tensor(Operand::X, 0x1000, false);
        generator.patch_output_tensor(0x8000, false, Some((0x9000, true)));
        for (desc, before) in generator.activations()[0].descriptors.iter().zip(before) {
            let addrs = desc.base_addrs();
            assert_eq!(addrs[0], before[0] + 0x1000);
            assert_eq!(addrs[1], before[1]);
            assert_eq!(addrs[2], before[2] + 0x8000);
            assert_eq!(desc.base_addr_out1(), before[2] + 0x9000);
            assert_eq!(desc.header().store_en1, desc.header().store_en0);
        }
    }

    #[test]
    fn test_sb_cache_disable() {
        let mut desc = Descriptor::new_for(Chip::Gaudi2);
        desc.tensor_mut(InternalOperand::B).valid_elements[0] = 16;
        desc.tensor_mut(InternalOperand::B).spatial_strides[0] = 1024;
        desc.header_mut().sb_b_cache_en = true;
        set_sb_cache_disable(&mut desc, InternalOperand::B, 2, 128, false, true);
        assert!(!desc.header().sb_b_cache_en);

        desc.tensor_mut(InternalOperand::A).valid_elements[0] = 16;
        desc.tensor_mut(InternalOperand::A).spatial_strides[0] = 1024;
        set_sb_cache_disable(&mut desc, InternalOperand::A, 2, 128, false, false);
        assert!(desc.header().sb_a_cache_en);

        desc.header_mut().sb_b_cache_en = true;
        set_sb_cache_disable(&mut desc, InternalOperand::B, 2, 128, true, true);
        assert!(desc.header().sb_b_cache_en);
    }

    #[test]
    fn test_perf_events_follow_tracing() {
        let mut params = fwd();
        params.tracing.trace_mode = TraceMode::LayerAct;
        params.tracing.ctx_id = 9;
        let mut generator = DescriptorGenerator::new(Chip::Gaudi3);
        generator.generate(&params).unwrap();
        let first = generator.activations()[0].desc(0);
        assert_eq!(first.perf_evt_in().value, 9);
        generator.patch_context_id(11);
        assert_eq!(generator.activations()[0].desc(0).perf_evt_in().value, 11);
    }

    #[test]
    fn test_recipe_debug_info() {
        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        generator.generate(&fwd()).unwrap();
        let info = generator.recipe_debug_info(false);
        assert!(info[0].starts_with("MME Recipe: lower="), "{}", info[0]);
        let dump = generator.dump_descriptors();
        assert_eq!(dump.len(), generator.activations().len());
        assert_eq!(dump[0][0], "Activation 0 Descriptor 0:");
    }

    #[test]
    fn test_skip_signals_mark_output_operand() {
        let mut acts = vec![
            Activation::new(vec![Descriptor::new_for(Chip::Gaudi2)]),
            Activation::new(vec![Descriptor::new_for(Chip::Gaudi2)]),
        ];
        acts[1].num_signals = 1;
        let mut params = LayerParams::new(OpType::Dedx);
        count_skip_signals(&mut acts, &params);
        assert!(acts[0].roi_x_skip && !acts[0].roi_y_skip);
        assert!(!acts[1].roi_x_skip);

        params.op_type = OpType::Dedw;
        count_skip_signals(&mut acts, &params);
        assert!(acts[0].roi_w_skip);
    }

    #[test]
    fn test_can_squash_rois() {
        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        assert!(!generator.can_squash_rois());
        let mut params = bgemm(DataType::Bf16);
        params.controls.squash_io_rois = true;
        generator.generate(&params).unwrap();
        assert!(generator.can_squash_rois());
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

    fn assert_repeats_fit(activations: &[Activation], max_sb_reuse: u32) {
        for activation in activations {
            for desc in &activation.descriptors {
                let repeat = desc.sb_repeat();
                assert!(u32::from(repeat.repeat_a_minus1) < max_sb_reuse);
                assert!(u32::from(repeat.repeat_b_minus1) < max_sb_reuse);
            }
        }
    }

    #[test]
    fn test_sb_reuse_dedw_with_partials() {
        let cases = [
            (Chip::Gaudi2, Geometry::Geo2xh),
            (Chip::Gaudi3, Geometry::Geo2xh),
            (Chip::Gaudi3, Geometry::Geo4xw),
        ];
        for (chip, geometry) in cases {
            let params = reused_dedw(geometry);
            let max_sb_reuse = MmeHal::for_chip(chip).max_sb_reuse;
            let mut generator = DescriptorGenerator::new(chip);
            let activations = generator.generate(&params).unwrap();
            assert!(!activations.is_empty());
            assert_repeats_fit(activations, max_sb_reuse);
            let last = activations.last().unwrap();
            assert!(last.desc(0).header().store_en0);
        }
    }

    #[test]
    fn test_sb_reuse_fwd_splits_long_spatial_repeat() {
        let mut params = LayerParams::new(OpType::Fwd);
        params.x = TensorView::dense(DataType::Bf16, [3, 224, 224, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [64, 3, 7, 7, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 218, 218, 1, 1]);
        params.strategy.geometry = Geometry::Geo4xw;
        params.strategy.sb_reuse = true;
        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        let activations = generator.generate(&params).unwrap();
        assert!(activations.len() > 1);
        assert_repeats_fit(activations, MmeHal::gaudi2().max_sb_reuse);
    }

    #[test]
    fn test_gaudi2_4xw_dedw_batch_concurrency_generates() {
        let mut params = LayerParams::new(OpType::Dedw);
        params.x = TensorView::dense(DataType::Bf16, [16, 8, 8, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [16, 8, 8, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [16, 16, 1, 1, 1]);
        params.strategy.geometry = Geometry::Geo4xw;
        params.strategy.batch_concurrency_en = BoolWithUndef::TurnedOn;
        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        let activations = generator.generate(&params).unwrap();
        assert!(!activations.is_empty());
    }

    /// Gaudi2 dedw with cd concurrency on a single 2xh MME: hx2 output and
    /// four A ports per MME
    fn cd_concurrent_dedw(channels: u32) -> LayerParams {
        let mut params = LayerParams::new(OpType::Dedw);
        params.x = TensorView::dense(DataType::Bf16, [channels, 8, 8, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [128, 8, 8, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [128, channels, 1, 1, 1]);
        params.strategy.geometry = Geometry::Geo2xh;
        params.strategy.mme_limit = 1;
        params.strategy.cd_concurrency_en = BoolWithUndef::TurnedOn;
        params
    }

    #[test]
    fn test_fake_spatial_loop_on_multi_step_hx2() {
        let params = cd_concurrent_dedw(300);
        let hal = MmeHal::gaudi2();
        let geo = GeoAttr::new(&params, &hal);
        assert!(geo.hx2_bit());
        assert_eq!(geo.mme_ports_nr(InternalOperand::A), 4);
        assert!(300 > geo.geometry_height());

        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        for activation in generator.generate(&params).unwrap() {
            for desc in &activation.descriptors {
                assert_eq!(desc.header().partial_height_loop_a, LoopMask::Tetris.bits());
                assert_eq!(desc.spatial_size_minus1(InternalOperand::C), 63);
            }
        }
    }

    #[test]
    fn test_no_fake_spatial_loop_on_single_step() {
        let params = cd_concurrent_dedw(100);
        let hal = MmeHal::gaudi2();
        let geo = GeoAttr::new(&params, &hal);
        assert!(geo.hx2_bit());
        assert!(100 <= geo.geometry_height());

        let mut generator = DescriptorGenerator::new(Chip::Gaudi2);
        for activation in generator.generate(&params).unwrap() {
            for desc in &activation.descriptors {
                assert_ne!(desc.header().partial_height_loop_a, LoopMask::Tetris.bits());
            }
        }
    }
}
