//! Tiling plan
//!
//! A `Recipe` splits one operation into sub-views along three axes: the
//! output fcd, the output spatial dims and the non-spatial (convolution or
//! batch) dims. The `RecipeIterator` walks every combination exactly once;
//! each combination becomes one activation.
//!
//! `RecipeBuilder` is the planner. It applies lowering, flattening and TE
//! acceleration to the operand views, pads the ROI sizes to the port
//! interleaving, picks the reused operand and cuts the grids.

use log::{debug, trace};

use crate::geo_attr::GeoAttr;
use crate::hardware::MmeHal;
use crate::params::{
    div_round_up, is_transposed, round_to_multiple, InternalOperand, LayerParams, OpType, Pattern,
    ReuseType, SizeArray, TensorView, GEMM_DIM_B1, GEMM_DIM_B3, MAX_TENSOR_DIMS,
};
use crate::sub_problems::ConvSubProblem;

/// Bgemm recipes carry more than one batch per non-spatial sub-view
const MAX_BATCH_NR_FOR_SB_REUSE: u32 = 16;
/// Outer and conv loop counters are one byte wide
const ONE_BYTE_MAX_LOOPS_NR: u32 = 1 << 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SingleDimSubView {
    pub view_base: u32,
    pub view_size: u32,
    /// Size before padding
    pub view_orig_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MultiDimSubView {
    pub bases: SizeArray,
    pub sizes: SizeArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubViewType {
    Fcd = 0,
    Sp = 1,
    NonSpatial = 2,
}

impl SubViewType {
    pub const ALL: [SubViewType; 3] = [SubViewType::Fcd, SubViewType::Sp, SubViewType::NonSpatial];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecipeType {
    Conv,
    Bgemm,
}

/// Coordinates of one iteration. `pos` is the walk position, `idx` the
/// sub-view index; they differ only on a reversed walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterVals {
    idx: [usize; 3],
    pos: [usize; 3],
}

impl IterVals {
    pub fn idx(&self, kind: SubViewType) -> usize {
        self.idx[kind as usize]
    }

    pub fn pos(&self, kind: SubViewType) -> usize {
        self.pos[kind as usize]
    }
}

#[derive(Debug, Clone)]
pub struct RecipeIterator {
    sizes: [usize; 3],
    /// Loops from outermost to innermost
    order: [SubViewType; 3],
    /// The non-spatial loop changes direction every time its outer loops
    /// advance
    snake_non_spatial: bool,
    cur: IterVals,
}

impl RecipeIterator {
    pub fn new(
        op_type: OpType,
        raster: bool,
        fcd_nr: usize,
        sp_nr: usize,
        non_spatial_nr: usize,
        enable_reversed_order: bool,
    ) -> Self {
        assert!(fcd_nr > 0 && sp_nr > 0 && non_spatial_nr > 0, "empty recipe sub-views");
        let dedw = matches!(op_type, OpType::Dedw | OpType::DeterministicDedw);
        // the common dim is always the innermost loop
        let order = match (dedw, raster) {
            (true, true) => [SubViewType::NonSpatial, SubViewType::Fcd, SubViewType::Sp],
            (true, false) => [SubViewType::Fcd, SubViewType::NonSpatial, SubViewType::Sp],
            (false, true) => [SubViewType::Sp, SubViewType::Fcd, SubViewType::NonSpatial],
            (false, false) => [SubViewType::Fcd, SubViewType::Sp, SubViewType::NonSpatial],
        };
        Self {
            sizes: [fcd_nr, sp_nr, non_spatial_nr],
            order,
            snake_non_spatial: enable_reversed_order
                && matches!(op_type, OpType::Dedx | OpType::TransposedDedx),
            cur: IterVals::default(),
        }
    }

    /// Total number of iterations
    pub fn size(&self) -> usize {
        self.sizes.iter().product()
    }

    pub fn subviews_nr(&self, kind: SubViewType) -> usize {
        self.sizes[kind as usize]
    }

    /// A fresh walk over all iterations
    pub fn iter(&self) -> RecipeIter {
        RecipeIter {
            sizes: self.sizes,
            order: self.order,
            snake_non_spatial: self.snake_non_spatial,
            next: 0,
            total: self.size(),
        }
    }

    pub fn set_cur_iter_vals(&mut self, vals: IterVals) {
        self.cur = vals;
    }

    pub fn cur_iter_vals(&self) -> IterVals {
        self.cur
    }

    pub fn idx(&self, kind: SubViewType) -> usize {
        self.cur.idx(kind)
    }

    pub fn non_spatial_idx(&self) -> usize {
        self.idx(SubViewType::NonSpatial)
    }

    pub fn is_first(&self, kind: SubViewType) -> bool {
        self.cur.pos(kind) == 0
    }

    pub fn is_last(&self, kind: SubViewType) -> bool {
        self.cur.pos(kind) + 1 == self.sizes[kind as usize]
    }

    /// True on the very last iteration of the walk
    pub fn is_last_iteration(&self) -> bool {
        SubViewType::ALL.iter().all(|&kind| self.is_last(kind))
    }
}

/// Owned walk over a `RecipeIterator`'s coordinates
#[derive(Debug, Clone)]
pub struct RecipeIter {
    sizes: [usize; 3],
    order: [SubViewType; 3],
    snake_non_spatial: bool,
    next: usize,
    total: usize,
}

impl Iterator for RecipeIter {
    type Item = IterVals;

    fn next(&mut self) -> Option<IterVals> {
        if self.next >= self.total {
            return None;
        }
        let mut vals = IterVals::default();
        let mut rem = self.next;
        // innermost loop is the fastest
        for (depth, &kind) in self.order.iter().enumerate().rev() {
            let size = self.sizes[kind as usize];
            let pos = rem % size;
            rem /= size;
            vals.pos[kind as usize] = pos;
            vals.idx[kind as usize] = pos;
            if kind == SubViewType::NonSpatial && self.snake_non_spatial {
                let inner: usize =
                    self.order[depth + 1..].iter().map(|k| self.sizes[*k as usize]).product();
                let outer_walks = self.next / (size * inner);
                if outer_walks % 2 == 1 {
                    vals.idx[kind as usize] = size - 1 - pos;
                }
            }
        }
        self.next += 1;
        Some(vals)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for RecipeIter {}

/// Which operand is resident in the SBs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReuseInfo {
    pub reuse_type: ReuseType,
    /// Fraction of the SB that holds useful data
    pub sb_utilization: f32,
}

impl Default for ReuseInfo {
    fn default() -> Self {
        Self {
            reuse_type: ReuseType::None,
            sb_utilization: 1.0,
        }
    }
}

impl ReuseInfo {
    fn set_reuse(&mut self, operand: InternalOperand) {
        assert_eq!(self.reuse_type, ReuseType::None, "trying to set reuse type more than once");
        self.reuse_type = match operand {
            InternalOperand::A => ReuseType::A,
            InternalOperand::B => ReuseType::B,
            InternalOperand::C => panic!("output operand cannot be reused"),
        };
    }
}

#[derive(Debug, Clone)]
pub struct Recipe {
    op_type: OpType,
    recipe_type: RecipeType,
    /// One entry per gemm; masked bgemm has two
    pub a_views: Vec<TensorView>,
    pub b_views: Vec<TensorView>,
    pub c_views: Vec<TensorView>,
    pub a_roi_sizes: Vec<SizeArray>,
    pub b_roi_sizes: Vec<SizeArray>,
    pub c_roi_sizes: Vec<SizeArray>,
    fcd_subviews: Vec<SingleDimSubView>,
    sp_subviews: Vec<SingleDimSubView>,
    non_spatial_subviews: Vec<MultiDimSubView>,
    pub lowering: bool,
    pub raster: bool,
    pub te_acceleration: u32,
    pub accelerated_operand: InternalOperand,
    pub signal_amount: u32,
    partials_nr: u32,
    partials_nr_per_gemm: Vec<u32>,
    split_on_batch_dims: bool,
    partial_to_memory: bool,
    pub masked_bgemm: bool,
    pub reuse_info: ReuseInfo,
    internal_sp_strides: SizeArray,
    iterator: RecipeIterator,
}

impl Recipe {
    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    pub fn recipe_type(&self) -> RecipeType {
        self.recipe_type
    }

    pub fn iterator(&self) -> &RecipeIterator {
        &self.iterator
    }

    pub fn iterator_mut(&mut self) -> &mut RecipeIterator {
        &mut self.iterator
    }

    pub fn fcd_subviews(&self) -> &[SingleDimSubView] {
        &self.fcd_subviews
    }

    pub fn sp_subviews(&self) -> &[SingleDimSubView] {
        &self.sp_subviews
    }

    pub fn non_spatial_subviews(&self) -> &[MultiDimSubView] {
        &self.non_spatial_subviews
    }

    pub fn cur_fcd(&self) -> &SingleDimSubView {
        &self.fcd_subviews[self.iterator.idx(SubViewType::Fcd)]
    }

    pub fn cur_sp(&self) -> &SingleDimSubView {
        &self.sp_subviews[self.iterator.idx(SubViewType::Sp)]
    }

    pub fn cur_non_spatial(&self) -> &MultiDimSubView {
        &self.non_spatial_subviews[self.iterator.non_spatial_idx()]
    }

    pub fn gemm_nr(&self) -> usize {
        self.c_views.len()
    }

    /// Index of the gemm the current activation belongs to
    pub fn tensor_idx(&self) -> usize {
        if self.is_mask_activation() {
            1
        } else {
            0
        }
    }

    pub fn operand(&self, operand: InternalOperand) -> &TensorView {
        let idx = self.tensor_idx();
        match operand {
            InternalOperand::A => &self.a_views[idx],
            InternalOperand::B => &self.b_views[idx],
            InternalOperand::C => &self.c_views[idx],
        }
    }

    pub fn roi_sizes(&self, operand: InternalOperand) -> &SizeArray {
        let idx = self.tensor_idx();
        match operand {
            InternalOperand::A => &self.a_roi_sizes[idx],
            InternalOperand::B => &self.b_roi_sizes[idx],
            InternalOperand::C => &self.c_roi_sizes[idx],
        }
    }

    pub fn elem_size(&self) -> u32 {
        self.a_views[0].element_type.element_size()
    }

    pub fn partials_nr(&self) -> u32 {
        self.partials_nr
    }

    pub fn partials_nr_per_gemm(&self, gemm: usize) -> u32 {
        self.partials_nr_per_gemm[gemm]
    }

    pub fn is_split_on_batch_dims(&self) -> bool {
        self.split_on_batch_dims
    }

    pub fn is_partial_to_memory(&self) -> bool {
        self.partial_to_memory
    }

    pub fn reuse_type(&self) -> ReuseType {
        self.reuse_info.reuse_type
    }

    pub fn reuse_a(&self) -> bool {
        self.reuse_type().reuses_a()
    }

    pub fn reuse_b(&self) -> bool {
        self.reuse_type().reuses_b()
    }

    fn is_dedw(&self) -> bool {
        matches!(self.op_type, OpType::Dedw | OpType::DeterministicDedw)
    }

    pub fn is_first_partial(&self) -> bool {
        if self.split_on_batch_dims {
            return true;
        }
        if self.recipe_type == RecipeType::Bgemm {
            return self.iterator.non_spatial_idx() % self.partials_nr as usize == 0;
        }
        if self.is_dedw() {
            return self.iterator.is_first(SubViewType::Sp);
        }
        self.iterator.is_first(SubViewType::NonSpatial)
    }

    pub fn is_last_partial(&self) -> bool {
        if self.split_on_batch_dims {
            return true;
        }
        if self.recipe_type == RecipeType::Bgemm {
            let partials = self.partials_nr as usize;
            return self.iterator.non_spatial_idx() % partials == partials - 1;
        }
        if self.is_dedw() {
            return self.iterator.is_last(SubViewType::Sp);
        }
        self.iterator.is_last(SubViewType::NonSpatial)
    }

    /// The current activation computes the auxiliary gemm of a masked bgemm
    pub fn is_mask_activation(&self) -> bool {
        if self.gemm_nr() != 2 {
            return false;
        }
        let idx = self.iterator.non_spatial_idx() as u32;
        idx % self.partials_nr >= self.partials_nr_per_gemm[0]
    }

    pub fn is_store_en(&self) -> bool {
        self.partial_to_memory || self.is_last_partial()
    }

    /// Partials after the first reduce into memory
    pub fn is_reduction_en(&self) -> bool {
        self.partial_to_memory && !self.is_first_partial()
    }

    /// Partials after the first accumulate in the accumulators
    pub fn is_accum_en(&self) -> bool {
        !self.partial_to_memory && !self.is_first_partial()
    }

    /// Map an offset inside the flattened spatial dims to a position per
    /// dim. Entry `i` of the result is the position along tensor dim `i + 1`.
    pub fn calc_sp_pos(&self, offset: u32) -> SizeArray {
        let mut pos = [0; MAX_TENSOR_DIMS];
        let mut rem = offset;
        for dim in (0..MAX_TENSOR_DIMS - 1).rev() {
            pos[dim] = rem / self.internal_sp_strides[dim + 1];
            rem %= self.internal_sp_strides[dim + 1];
        }
        pos
    }

    fn subviews_debug_info(name: &str, sizes: Vec<String>) -> Option<String> {
        if sizes.len() <= 1 {
            return None;
        }
        let mut parts: Vec<String> = Vec::new();
        let mut repeats = 1;
        for i in 0..sizes.len() {
            if i != 0 && sizes[i - 1] == sizes[i] {
                repeats += 1;
                continue;
            }
            if repeats != 1 {
                if let Some(last) = parts.last_mut() {
                    last.push_str(&format!("x{}", repeats));
                }
                repeats = 1;
            }
            parts.push(sizes[i].clone());
        }
        if repeats != 1 {
            if let Some(last) = parts.last_mut() {
                last.push_str(&format!("x{}", repeats));
            }
        }
        Some(format!("    {} splits: {{ {} }}", name, parts.join(", ")))
    }

    /// One summary line, followed by the split details when verbose
    pub fn debug_info(&self, verbose: bool) -> Vec<String> {
        let reuse = match self.reuse_type() {
            ReuseType::None => "N/A",
            ReuseType::A => "A",
            ReuseType::B => "B",
            ReuseType::AB => "AB",
            ReuseType::BA => "BA",
        };
        let is_conv = self.recipe_type == RecipeType::Conv;
        let non_spatial_name = if is_conv { "CONV" } else { "BATCH" };
        let bool_str = |b: bool| if b { "True" } else { "False" };

        let mut summary = String::new();
        if is_conv {
            summary.push_str(&format!("lower={}, ", bool_str(self.lowering)));
        }
        summary.push_str(&format!(
            "raster={}, reuse={}, FCD={}, SP={}, {}={}",
            bool_str(self.raster),
            reuse,
            self.fcd_subviews.len(),
            self.sp_subviews.len(),
            non_spatial_name,
            self.non_spatial_subviews.len()
        ));
        if self.reuse_type() != ReuseType::None {
            let utilization = (self.reuse_info.sb_utilization * 100.0) as u32;
            summary.push_str(&format!(", SBUtilization={}%", utilization));
        }

        let mut info = vec![summary];
        if verbose {
            let single = |views: &[SingleDimSubView]| {
                views.iter().map(|v| v.view_size.to_string()).collect()
            };
            let multi = self
                .non_spatial_subviews
                .iter()
                .map(|v| {
                    let dims: Vec<String> = v.sizes.iter().map(|s| s.to_string()).collect();
                    format!("[{}]", dims.join(", "))
                })
                .collect();
            info.extend(Self::subviews_debug_info("FCD", single(&self.fcd_subviews)));
            info.extend(Self::subviews_debug_info("SP", single(&self.sp_subviews)));
            info.extend(Self::subviews_debug_info(non_spatial_name, multi));
        }
        info
    }
}

/// Splits an operation into a `Recipe`
pub struct RecipeBuilder<'a> {
    params: &'a LayerParams,
    geo: &'a GeoAttr,
    hal: &'a MmeHal,
}

impl<'a> RecipeBuilder<'a> {
    pub fn new(params: &'a LayerParams, geo: &'a GeoAttr, hal: &'a MmeHal) -> Self {
        Self { params, geo, hal }
    }

    pub fn build(&self) -> Recipe {
        let p = self.params;
        trace!("generating recipe for op {:?}", p.op_type);
        let recipe_type = if p.is_conv() { RecipeType::Conv } else { RecipeType::Bgemm };
        let mut recipe = Recipe {
            op_type: p.op_type,
            recipe_type,
            a_views: vec![*p.operand(InternalOperand::A)],
            b_views: vec![*p.operand(InternalOperand::B)],
            c_views: vec![*p.operand(InternalOperand::C)],
            a_roi_sizes: Vec::new(),
            b_roi_sizes: Vec::new(),
            c_roi_sizes: Vec::new(),
            fcd_subviews: Vec::new(),
            sp_subviews: Vec::new(),
            non_spatial_subviews: Vec::new(),
            lowering: false,
            raster: p.is_pattern_raster(),
            te_acceleration: 0,
            accelerated_operand: InternalOperand::C,
            signal_amount: p.controls.signal_amount.max(1),
            partials_nr: 1,
            partials_nr_per_gemm: Vec::new(),
            split_on_batch_dims: false,
            partial_to_memory: false,
            masked_bgemm: false,
            reuse_info: ReuseInfo::default(),
            internal_sp_strides: [0; MAX_TENSOR_DIMS],
            iterator: RecipeIterator::new(p.op_type, false, 1, 1, 1, false),
        };

        if p.can_lower() {
            recipe.lowering = true;
            Self::apply_lowering(&mut recipe);
        }
        if p.can_flatten() {
            Self::apply_flattening(&mut recipe);
        }
        if self.calc_te_acceleration(&recipe) {
            self.apply_te_acceleration(&mut recipe);
        }
        if p.strategy.masked_bgemm {
            recipe.a_views.push(p.x_aux);
            recipe.b_views.push(p.w_aux);
            recipe.c_views.push(p.y_aux);
            recipe.masked_bgemm = true;
        }
        for gemm in 0..recipe.gemm_nr() {
            self.set_roi_sizes(&mut recipe, gemm);
        }

        let fcd_geo_per_reuse = div_round_up(recipe.c_views[0].sizes[0], self.geo.geometry_width());
        let sp_geo_per_reuse =
            div_round_up(self.spatial_roi_size(&recipe), self.available_sp_size(&recipe));
        self.calc_reuse_operand(&mut recipe, fcd_geo_per_reuse, sp_geo_per_reuse);
        self.calc_sb_utilization(&mut recipe);

        self.split(&mut recipe);
        recipe.internal_sp_strides = self.internal_sp_strides(&recipe);
        let enable_reversed = true;
        recipe.iterator = RecipeIterator::new(
            p.op_type,
            recipe.raster,
            recipe.fcd_subviews.len(),
            recipe.sp_subviews.len(),
            recipe.non_spatial_subviews.len(),
            enable_reversed,
        );

        debug!("recipe: {}", recipe.debug_info(false).join(" "));
        for line in recipe.debug_info(true).iter().skip(1) {
            trace!("{}", line);
        }
        recipe
    }

    // --- view transformations ---

    fn apply_lowering(recipe: &mut Recipe) {
        let w = match recipe.op_type {
            OpType::Fwd | OpType::TransposedDedx => &mut recipe.b_views[0],
            OpType::Dedw | OpType::DeterministicDedw => &mut recipe.c_views[0],
            other => panic!("lowering is not supported for {:?}", other),
        };
        let filter_s = w.sizes[2];
        w.sizes[1] *= filter_s;
        w.strides[2] *= filter_s;
        w.sizes[2] = 1;
        recipe.a_views[0].sizes[0] *= filter_s;
        trace!("applied lowering, A sizes {:?}", recipe.a_views[0].sizes);
    }

    fn apply_flattening(recipe: &mut Recipe) {
        let (a, c) = (&mut recipe.a_views[0], &mut recipe.c_views[0]);
        assert_eq!(a.sizes[1], c.sizes[1], "expected same height for A and C");
        assert_eq!(a.sizes[2], c.sizes[2], "expected same batch for A and C");
        let height = c.sizes[1];
        for view in [a, c] {
            view.dcore_bases[1] = view.dcore_bases[2] * height;
            view.dcore_bases[2] = 0;
            view.sizes[1] *= view.sizes[2];
            view.sizes[2] = 1;
            view.strides[2] = view.strides[1] * view.sizes[1];
        }
        trace!("applied flattening, C sizes {:?}", recipe.c_views[0].sizes);
    }

    fn te_accelerated_operand(recipe: &Recipe) -> InternalOperand {
        let a = &recipe.a_views[0];
        if a.sizes[0] < a.sizes[1] {
            InternalOperand::A
        } else {
            InternalOperand::C
        }
    }

    /// log2 of how many rows fit a cache line, capped at 3
    fn te_acceleration(&self, view: &TensorView) -> u32 {
        let rows = self.hal.cl_size / (view.sizes[0] * view.element_type.element_size()).max(1);
        match rows {
            0 | 1 => 0,
            2 | 3 => 1,
            4..=7 => 2,
            _ => 3,
        }
    }

    fn calc_te_acceleration(&self, recipe: &Recipe) -> bool {
        if self.params.op_type != OpType::Trans || !self.params.strategy.te_acceleration_en {
            return false;
        }
        let operand = Self::te_accelerated_operand(recipe);
        let view = match operand {
            InternalOperand::A => &recipe.a_views[0],
            _ => &recipe.c_views[0],
        };
        if view.element_type.is_fp8() && (operand == InternalOperand::C || view.sizes[0] % 2 != 0) {
            return false;
        }
        if view.sizes[0] != view.strides[1] {
            return false;
        }
        let te = self.te_acceleration(view);
        te != 0 && view.sizes[1] % (1 << te) == 0
    }

    fn apply_te_acceleration(&self, recipe: &mut Recipe) {
        let operand = Self::te_accelerated_operand(recipe);
        let view = match operand {
            InternalOperand::A => &mut recipe.a_views[0],
            _ => &mut recipe.c_views[0],
        };
        let te = self.te_acceleration(view);
        view.sizes[0] <<= te;
        view.strides[1] <<= te;
        view.sizes[1] >>= te;
        recipe.accelerated_operand = operand;
        recipe.te_acceleration = te;
        trace!("applied TE acceleration {} on {:?}", te, operand);
    }

    // --- ROI padding ---

    fn set_roi_sizes(&self, recipe: &mut Recipe, gemm: usize) {
        let geo = self.geo;
        let op = self.params.op_type;
        let mut a = recipe.a_views[gemm].sizes;
        let mut b = recipe.b_views[gemm].sizes;
        let mut c = recipe.c_views[gemm].sizes;
        if op == OpType::GemmTranspose {
            b[1] = a[0];
        }

        // zero common dim
        let a_cd = if is_transposed(op, InternalOperand::A) { 0 } else { 1 };
        let b_cd = if is_transposed(op, InternalOperand::B) { 0 } else { 1 };
        a[a_cd] = a[a_cd].max(1);
        b[b_cd] = b[b_cd].max(1);
        // a memset dedx sub-problem has an empty filter
        if ConvSubProblem::is_memset(self.params) {
            for size in b.iter_mut() {
                *size = (*size).max(1);
            }
        }

        // spatial padding to the interleaved readers
        let interleaved_a = geo.interleaved_spatial_ports_nr(InternalOperand::A);
        let interleaved_b = geo.interleaved_spatial_ports_nr(InternalOperand::B);
        let interleaved_c = geo.interleaved_spatial_ports_nr(InternalOperand::C);
        if self.params.is_gemm() {
            a[1] = round_to_multiple(a[1], interleaved_a);
            b[1] = round_to_multiple(b[1], interleaved_b);
            let c_readers =
                if geo.is_transposed(InternalOperand::A) { interleaved_a } else { interleaved_c };
            c[1] = round_to_multiple(c[1], c_readers);
        } else if op == OpType::Fwd {
            b[1] = round_to_multiple(b[1], interleaved_b);
        }
        let sp_dim_a = geo.sp_interleaving_dim(InternalOperand::A);
        let sp_dim_b = geo.sp_interleaving_dim(InternalOperand::B);
        let sp_dim_c = geo.sp_interleaving_dim(InternalOperand::C);
        a[sp_dim_a] = a[sp_dim_a].max(interleaved_a);
        b[sp_dim_b] = b[sp_dim_b].max(interleaved_b);
        c[sp_dim_c] = if geo.is_transposed(InternalOperand::A) {
            c[sp_dim_c].max(interleaved_c.max(interleaved_a))
        } else {
            c[sp_dim_c].max(interleaved_c)
        };

        // batch padding to the concurrency
        if geo.supports_concurrency() {
            let dim = geo.concurrent_dim();
            let concurrency = geo.geometry_concurrency();
            if !self.params.is_dedw() {
                a[dim] = round_to_multiple(a[dim], concurrency);
                b[dim] = round_to_multiple(b[dim], concurrency);
            }
            c[dim] = round_to_multiple(c[dim], concurrency);
        }

        recipe.a_roi_sizes.push(a);
        recipe.b_roi_sizes.push(b);
        recipe.c_roi_sizes.push(c);
    }

    // --- reuse ---

    fn spatial_roi_size(&self, recipe: &Recipe) -> u32 {
        let c = &recipe.c_roi_sizes[0];
        if self.params.is_gemm() || self.params.is_native_dma() {
            c[1]
        } else if self.params.is_dedw() {
            recipe.c_views[0].sizes[1]
        } else {
            c[1..].iter().product()
        }
    }

    /// Output rows a single geometry step can produce
    fn available_sp_size(&self, recipe: &Recipe) -> u32 {
        let geo = self.geo;
        let mut available = geo.geometry_height();
        if recipe.te_acceleration != 0 && recipe.accelerated_operand == InternalOperand::C {
            available >>= recipe.te_acceleration;
        }
        let interleaving_size = recipe.c_views[0].sizes[1];
        let interleaved_a = geo.interleaved_spatial_ports_nr(InternalOperand::A);
        if interleaving_size < interleaved_a {
            available = available / interleaved_a * interleaving_size;
        }
        available.max(1)
    }

    fn calc_reuse_operand(
        &self,
        recipe: &mut Recipe,
        fcd_geo_per_reuse: u32,
        sp_geo_per_reuse: u32,
    ) {
        let p = self.params;
        if !p.is_sb_reuse() {
            return;
        }
        let mut can_transfer_raster = true;
        if p.is_gemm() {
            let batches: u32 = recipe.c_views[0].sizes[GEMM_DIM_B1..].iter().product();
            if batches > MAX_BATCH_NR_FOR_SB_REUSE && !p.strategy.masked_bgemm {
                return;
            }
            match p.strategy.pattern {
                Pattern::SpReductionKcf | Pattern::SpReductionCkf => return,
                Pattern::SpReductionKfc | Pattern::SpReductionCfk => can_transfer_raster = false,
                _ => {}
            }
        }

        if recipe.raster {
            if fcd_geo_per_reuse > 1 {
                recipe.reuse_info.set_reuse(InternalOperand::A);
            } else if can_transfer_raster && sp_geo_per_reuse > 1 {
                recipe.reuse_info.set_reuse(InternalOperand::B);
                recipe.raster = false;
            }
        } else if sp_geo_per_reuse > 1 {
            recipe.reuse_info.set_reuse(InternalOperand::B);
        } else if can_transfer_raster && fcd_geo_per_reuse > 1 {
            recipe.reuse_info.set_reuse(InternalOperand::A);
            recipe.raster = true;
        }
    }

    fn reused_operand(recipe: &Recipe) -> Option<InternalOperand> {
        match recipe.reuse_type() {
            ReuseType::None => None,
            ReuseType::A | ReuseType::AB => Some(InternalOperand::A),
            ReuseType::B | ReuseType::BA => Some(InternalOperand::B),
        }
    }

    fn is_input_aligned(&self, operand: InternalOperand) -> bool {
        let view = self.params.operand(operand);
        let elems_per_cl = self.hal.elements_per_cl(view.element_type.element_size());
        view.are_strides_fully_aligned(elems_per_cl)
    }

    fn calc_sb_utilization(&self, recipe: &mut Recipe) {
        if let Some(operand) = Self::reused_operand(recipe) {
            recipe.reuse_info.sb_utilization =
                if self.is_input_aligned(operand) { 1.0 } else { 0.5 };
        }
    }

    /// Common dim elements the SB of the reused operand can hold
    fn sb_span(&self, recipe: &Recipe, operand: InternalOperand) -> u32 {
        let controls = &self.params.controls;
        let sb_cls = if controls.sb_size_in_cls > 0 {
            controls.sb_size_in_cls as u32
        } else {
            self.hal.sb_size
        };
        let sb_cls = (recipe.reuse_info.sb_utilization * sb_cls as f32) as u32;
        let elem_size = self.params.operand(operand).element_type.element_size();
        let sb_elements = sb_cls * self.hal.elements_per_cl(elem_size);
        let mut span = sb_elements / self.geo.eu_facing_port_size(operand);
        if !self.geo.is_transposed(operand) {
            span *= self.geo.core_spatial_eu_port(operand) * self.geo.geometry_cd_concurrency();
        }
        let alignment = self.cd_alignment();
        (span / alignment * alignment).max(alignment)
    }

    fn cd_alignment(&self) -> u32 {
        let b_type = self.params.operand(InternalOperand::B).element_type;
        let mut alignment = 1;
        for operand in InternalOperand::INPUTS {
            if !self.geo.is_transposed(operand) {
                alignment = alignment.max(self.geo.interleaved_spatial_ports_nr(operand));
            }
        }
        alignment * self.geo.cd_dt_alignment(b_type)
    }

    /// Common dim elements of a single gemm as held in the SB
    fn sb_common_dim_size(&self, operand: InternalOperand) -> u32 {
        let mut size = self.params.single_gemm_cd();
        if self.geo.is_transposed(operand) {
            let elem = self.params.operand(operand).element_type.element_size();
            size = round_to_multiple(size * elem, self.hal.cl_size) / elem;
        }
        round_to_multiple(size, self.cd_alignment())
    }

    // --- grids ---

    fn split(&self, recipe: &mut Recipe) {
        let p = self.params;
        let geo = self.geo;
        let reused = Self::reused_operand(recipe);
        let partial_span = reused.and_then(|operand| {
            let span = self.sb_span(recipe, operand);
            let needs_partials = self.sb_common_dim_size(operand) > span || recipe.gemm_nr() > 1;
            needs_partials.then_some(span)
        });
        let partials = partial_span.is_some() || recipe.gemm_nr() > 1;
        let (fcd_capacity, sp_capacity) = self.step_capacities(reused, partials);

        // FCD
        let fcd_step = if p.op_type == OpType::Memcpy {
            u32::MAX
        } else {
            geo.geometry_width().saturating_mul(fcd_capacity)
        };
        let c_view = &recipe.c_views[0];
        recipe.fcd_subviews =
            split_single_dim(c_view.bases[0], c_view.sizes[0], c_view.sizes[0], fcd_step);

        // Spatial and common dim
        if p.is_dedw() {
            let output_capacity = match reused {
                Some(InternalOperand::A) if partial_span.is_some() => Some(1),
                Some(InternalOperand::B) => Some(sp_capacity),
                _ => None,
            };
            self.split_dedw(recipe, partial_span, output_capacity);
        } else {
            let (base, size, orig) = if p.is_conv() {
                let c = &recipe.c_views[0];
                (
                    p.sp_base,
                    recipe.c_roi_sizes[0][1..].iter().product(),
                    c.sizes[1..].iter().product(),
                )
            } else {
                (recipe.c_views[0].bases[1], recipe.c_roi_sizes[0][1], recipe.c_views[0].sizes[1])
            };
            let sp_step = self.available_sp_size(recipe).saturating_mul(sp_capacity);
            recipe.sp_subviews = split_single_dim(base, size, orig, sp_step);

            if p.is_conv() {
                self.split_conv_common_dim(recipe, partial_span);
            } else {
                self.split_batch_common_dim(recipe, partial_span);
            }
        }
    }

    /// Geometry steps one activation may take on the fcd and on the spatial
    /// direction. The reused operand repeats at most `max_sb_reuse` times.
    /// Accumulating partials also keep every step of the reused direction in
    /// its own accumulator, and the other direction takes a single step.
    fn step_capacities(&self, reused: Option<InternalOperand>, partials: bool) -> (u32, u32) {
        let mut fcd_capacity = ONE_BYTE_MAX_LOOPS_NR;
        // fwd and dedx walk the spatial dims on the tetris loop
        let mut sp_capacity = if self.params.is_fwd_or_dedx() {
            u32::MAX
        } else {
            ONE_BYTE_MAX_LOOPS_NR
        };
        let operand = match reused {
            Some(operand) => operand,
            // the two gemms of a masked bgemm accumulate without reuse
            None if partials => InternalOperand::A,
            None => return (fcd_capacity, sp_capacity),
        };

        let reuse_capacity = if partials && !self.params.strategy.partials_to_memory_en {
            self.accum_capacity()
        } else {
            self.hal.max_sb_reuse
        };
        if operand == InternalOperand::A {
            fcd_capacity = fcd_capacity.min(reuse_capacity);
            if partials {
                sp_capacity = 1;
            }
        } else {
            sp_capacity = sp_capacity.min(reuse_capacity);
            if partials {
                fcd_capacity = 1;
            }
        }
        (fcd_capacity, sp_capacity)
    }

    /// Accumulators one activation can fill before it has to roll
    fn accum_capacity(&self) -> u32 {
        let budget = self.hal.accum_budget();
        let accums_nr = if self.geo.bgemm_bit() {
            budget.accums_nr_2x
        } else {
            budget.accums_nr
        };
        accums_nr.min(self.hal.max_sb_reuse)
    }

    fn split_dedw(
        &self,
        recipe: &mut Recipe,
        partial_span: Option<u32>,
        output_capacity: Option<u32>,
    ) {
        // the spatial walk of dedw is its common dim
        let b_roi = recipe.b_roi_sizes[0];
        let b_orig = recipe.b_views[0].sizes;
        let cd: u32 = b_roi[1..].iter().product();
        let cd_orig: u32 = b_orig[1..].iter().product();
        let step = partial_span.unwrap_or(u32::MAX);
        recipe.sp_subviews = split_single_dim(0, cd, cd_orig, step);
        recipe.partials_nr = recipe.sp_subviews.len() as u32;
        recipe.partials_nr_per_gemm = vec![recipe.partials_nr];
        recipe.partial_to_memory =
            recipe.partials_nr > 1 && self.params.strategy.partials_to_memory_en;

        let c = &recipe.c_views[0];
        let mut bases = c.bases;
        let mut sizes = c.sizes;
        bases[0] = 0;
        sizes[0] = 0;
        if self.geo.supports_concurrency() {
            let dim = self.geo.concurrent_dim();
            sizes[dim] = div_round_up(sizes[dim], self.geo.geometry_concurrency());
        }
        recipe.non_spatial_subviews = match output_capacity {
            Some(capacity) => self.split_dedw_output(&bases, &sizes, capacity),
            None => vec![MultiDimSubView { bases, sizes }],
        };
    }

    /// Cut the dedw output rows and filter taps so one activation takes at
    /// most `capacity` spatial steps. A step is one geometry of rows at one
    /// filter tap.
    fn split_dedw_output(
        &self,
        bases: &SizeArray,
        sizes: &SizeArray,
        capacity: u32,
    ) -> Vec<MultiDimSubView> {
        assert!(capacity != 0, "invalid dedw output capacity");
        let rows_step = self.geo.geometry_height();
        let row_steps = div_round_up(sizes[1], rows_step);
        if row_steps >= capacity {
            return split_multi_dim(bases, sizes, 1, rows_step.saturating_mul(capacity));
        }
        let mut filter_sizes = *sizes;
        filter_sizes[1] = 0;
        let (split_dim, step) = included_dims_split(&filter_sizes, capacity / row_steps);
        split_multi_dim(bases, sizes, split_dim, step)
    }

    fn split_conv_common_dim(&self, recipe: &mut Recipe, partial_span: Option<u32>) {
        let fcd_dim = if self.geo.is_transposed(InternalOperand::B) { 1 } else { 0 };
        let b = &recipe.b_views[0];
        let mut bases = b.bases;
        let mut sizes = b.sizes;
        bases[fcd_dim] = 0;
        sizes[fcd_dim] = 0;

        let (split_dim, step) = match partial_span {
            Some(span) => included_dims_split(&sizes, span),
            None => {
                let top = (0..MAX_TENSOR_DIMS).rev().find(|&d| sizes[d] != 0).unwrap_or(0);
                (top, sizes[top].max(1))
            }
        };
        recipe.non_spatial_subviews = split_multi_dim(&bases, &sizes, split_dim, step);
        recipe.partials_nr = recipe.non_spatial_subviews.len() as u32;
        recipe.partials_nr_per_gemm = vec![recipe.partials_nr];
        recipe.partial_to_memory =
            recipe.partials_nr > 1 && self.params.strategy.partials_to_memory_en;
    }

    fn split_batch_common_dim(&self, recipe: &mut Recipe, partial_span: Option<u32>) {
        let p = self.params;
        let geo = self.geo;
        let forced_partial = recipe.gemm_nr() > 1;
        let mut per_gemm_subviews = Vec::new();
        let mut per_gemm_partials = Vec::new();

        for gemm in 0..recipe.gemm_nr() {
            let c = &recipe.c_views[gemm];
            let mut bases = [0; MAX_TENSOR_DIMS];
            let mut sizes = [0; MAX_TENSOR_DIMS];
            if !p.is_native_dma() {
                let cd_view =
                    if p.is_gemm_dma() { &recipe.a_views[gemm] } else { &recipe.b_views[gemm] };
                let fcd_dim = if geo.is_transposed(InternalOperand::B) { 1 } else { 0 };
                let cd_dim = 1 - fcd_dim;
                bases[cd_dim] = cd_view.bases[cd_dim];
                sizes[cd_dim] = cd_view.sizes[cd_dim];
            } else {
                sizes[1] = 1;
            }
            for dim in GEMM_DIM_B1..MAX_TENSOR_DIMS {
                bases[dim] = c.bases[dim];
                sizes[dim] = c.sizes[dim];
            }

            let loop_size = |dim: usize| {
                if geo.supports_concurrency() && dim == geo.concurrent_dim() {
                    ONE_BYTE_MAX_LOOPS_NR * geo.geometry_concurrency()
                } else {
                    ONE_BYTE_MAX_LOOPS_NR
                }
            };

            let (split_dim, step, partials) = match partial_span {
                Some(span) if !p.is_native_dma() => {
                    let cd_dim = (0..GEMM_DIM_B1).find(|&d| sizes[d] != 0).unwrap_or(1);
                    let step = span.min(sizes[cd_dim]);
                    (cd_dim, step, div_round_up(sizes[cd_dim], step))
                }
                _ => {
                    let mut last = GEMM_DIM_B1;
                    while last < GEMM_DIM_B3 && sizes[last] <= loop_size(last) && !forced_partial {
                        last += 1;
                    }
                    let max_fit = if forced_partial { 1 } else { sizes[last] };
                    (last, max_fit.min(loop_size(last)).max(1), 1)
                }
            };
            let subviews = split_multi_dim(&bases, &sizes, split_dim, step);
            if gemm == 0 && !forced_partial && split_dim >= GEMM_DIM_B1 && subviews.len() > 1 {
                recipe.split_on_batch_dims = true;
            }
            per_gemm_partials.push(partials);
            per_gemm_subviews.push(subviews);
        }

        recipe.partials_nr = per_gemm_partials.iter().sum();
        recipe.partials_nr_per_gemm = per_gemm_partials.clone();
        recipe.non_spatial_subviews = if per_gemm_subviews.len() == 1 {
            per_gemm_subviews.remove(0)
        } else {
            interleave_gemms(&per_gemm_subviews, &per_gemm_partials)
        };
    }

    fn internal_sp_strides(&self, recipe: &Recipe) -> SizeArray {
        let roi = if self.params.is_dedw() { recipe.b_roi_sizes[0] } else { recipe.c_roi_sizes[0] };
        let mut strides = [1; MAX_TENSOR_DIMS];
        for dim in 1..MAX_TENSOR_DIMS - 1 {
            strides[dim + 1] = strides[dim] * roi[dim];
            assert!(strides[dim + 1] != 0, "invalid spatial sizes {:?}", roi);
        }
        strides
    }
}

fn split_single_dim(base: u32, size: u32, orig_size: u32, step: u32) -> Vec<SingleDimSubView> {
    assert!(size != 0, "cannot split an empty view");
    if size <= step {
        return vec![SingleDimSubView {
            view_base: base,
            view_size: size,
            view_orig_size: orig_size,
        }];
    }
    let mut views = Vec::new();
    let mut offset = 0;
    while offset < size {
        let view_size = step.min(size - offset);
        views.push(SingleDimSubView {
            view_base: base + offset,
            view_size,
            view_orig_size: view_size,
        });
        offset += view_size;
    }
    views
}

/// Include dims from the lowest up while they fit the span. The first dim
/// that does not fit is split.
fn included_dims_split(sizes: &SizeArray, span: u32) -> (usize, u32) {
    let mut included = 1u32;
    let mut last_dim = 0;
    for dim in 0..MAX_TENSOR_DIMS {
        if sizes[dim] == 0 {
            continue;
        }
        last_dim = dim;
        if included * sizes[dim] > span {
            return (dim, (span / included).max(1));
        }
        included *= sizes[dim];
    }
    (last_dim, sizes[last_dim].max(1))
}

/// Split `split_dim` into steps. Dims below it keep their full size, dims
/// above it are walked one element at a time. Zero sizes mark excluded
/// dims.
fn split_multi_dim(
    bases: &SizeArray,
    sizes: &SizeArray,
    split_dim: usize,
    step: u32,
) -> Vec<MultiDimSubView> {
    assert!(step != 0, "invalid split step");
    let outer_dims: Vec<usize> =
        (split_dim + 1..MAX_TENSOR_DIMS).filter(|&d| sizes[d] != 0).collect();
    let outer_nr: u32 = outer_dims.iter().map(|&d| sizes[d]).product();
    let split_size = sizes[split_dim].max(1);

    let mut views = Vec::new();
    for outer in 0..outer_nr {
        let mut rem = outer;
        let mut outer_pos = [0; MAX_TENSOR_DIMS];
        for &dim in &outer_dims {
            outer_pos[dim] = rem % sizes[dim];
            rem /= sizes[dim];
        }
        let mut offset = 0;
        while offset < split_size {
            let mut view = MultiDimSubView {
                bases: *bases,
                sizes: *sizes,
            };
            view.sizes[split_dim] = step.min(split_size - offset);
            view.bases[split_dim] += offset;
            for &dim in &outer_dims {
                view.sizes[dim] = 1;
                view.bases[dim] += outer_pos[dim];
            }
            views.push(view);
            offset += step;
        }
    }
    views
}

/// Interleave the partials of every gemm so both gemms of one batch
/// accumulate together
fn interleave_gemms(per_gemm: &[Vec<MultiDimSubView>], partials: &[u32]) -> Vec<MultiDimSubView> {
    let batches = per_gemm[0].len() / partials[0] as usize;
    let mut next = vec![0usize; per_gemm.len()];
    let mut views = Vec::new();
    for _ in 0..batches {
        for (gemm, subviews) in per_gemm.iter().enumerate() {
            for _ in 0..partials[gemm] {
                views.push(subviews[next[gemm]]);
                next[gemm] += 1;
            }
        }
    }
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{DataType, Geometry, TensorView};
    use pretty_assertions::assert_eq;

    fn bgemm(fcd: u32, sp: u32, cd: u32, batch: u32) -> LayerParams {
        let mut params = LayerParams::new(OpType::Ab);
        params.x = TensorView::dense(DataType::Bf16, [cd, sp, batch, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [fcd, cd, batch, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [fcd, sp, batch, 1, 1]);
        params.strategy.flatten_en = false;
        params
    }

    fn build(params: &LayerParams) -> Recipe {
        let hal = MmeHal::gaudi2();
        let geo = GeoAttr::new(params, &hal);
        RecipeBuilder::new(params, &geo, &hal).build()
    }

    #[test]
    fn test_iterator_walks_every_combination_once() {
        let it = RecipeIterator::new(OpType::Fwd, false, 2, 3, 2, true);
        let vals: Vec<IterVals> = it.iter().collect();
        assert_eq!(vals.len(), 12);
        let mut seen: Vec<(usize, usize, usize)> = vals
            .iter()
            .map(|v| {
                (
                    v.idx(SubViewType::Fcd),
                    v.idx(SubViewType::Sp),
                    v.idx(SubViewType::NonSpatial),
                )
            })
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn test_iterator_is_restartable() {
        let it = RecipeIterator::new(OpType::Dedw, true, 2, 2, 2, true);
        let first: Vec<IterVals> = it.iter().collect();
        let second: Vec<IterVals> = it.iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_iterator_inner_loop_is_common_dim() {
        let it = RecipeIterator::new(OpType::Fwd, false, 1, 2, 3, false);
        let vals: Vec<usize> = it.iter().map(|v| v.idx(SubViewType::NonSpatial)).collect();
        assert_eq!(vals, vec![0, 1, 2, 0, 1, 2]);
        let it = RecipeIterator::new(OpType::Dedw, false, 1, 3, 2, false);
        let vals: Vec<usize> = it.iter().map(|v| v.idx(SubViewType::Sp)).collect();
        assert_eq!(vals, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_dedx_walk_snakes_over_partials() {
        let mut it = RecipeIterator::new(OpType::Dedx, false, 1, 2, 3, true);
        let vals: Vec<IterVals> = it.iter().collect();
        let idx: Vec<usize> = vals.iter().map(|v| v.idx(SubViewType::NonSpatial)).collect();
        assert_eq!(idx, vec![0, 1, 2, 2, 1, 0]);
        it.set_cur_iter_vals(vals[3]);
        assert!(it.is_first(SubViewType::NonSpatial));
        it.set_cur_iter_vals(vals[5]);
        assert!(it.is_last(SubViewType::NonSpatial));
        assert!(it.is_last_iteration());
    }

    #[test]
    fn test_small_bgemm_has_single_activation() {
        let recipe = build(&bgemm(64, 64, 64, 4));
        assert_eq!(recipe.iterator().size(), 1);
        assert_eq!(recipe.partials_nr(), 1);
        assert!(!recipe.is_split_on_batch_dims());
        assert!(recipe.is_first_partial() && recipe.is_last_partial());
        assert!(recipe.is_store_en());
        assert!(!recipe.is_accum_en());
    }

    #[test]
    fn test_large_batch_splits_on_batch_dims() {
        let mut params = bgemm(64, 64, 64, 1);
        params.x.sizes[3] = 300;
        params.w.sizes[3] = 300;
        params.y.sizes[3] = 300;
        params.x = TensorView::dense(DataType::Bf16, params.x.sizes);
        params.w = TensorView::dense(DataType::Bf16, params.w.sizes);
        params.y = TensorView::dense(DataType::Bf16, params.y.sizes);
        let recipe = build(&params);
        assert!(recipe.is_split_on_batch_dims());
        assert_eq!(recipe.non_spatial_subviews().len(), 2);
        assert_eq!(recipe.non_spatial_subviews()[0].sizes[3], 256);
        assert_eq!(recipe.non_spatial_subviews()[1].bases[3], 256);
    }

    #[test]
    fn test_reuse_with_large_cd_creates_partials() {
        let mut params = bgemm(1024, 128, 8192, 1);
        params.strategy.sb_reuse = true;
        params.strategy.pattern = crate::params::Pattern::SpReductionFck;
        let mut recipe = build(&params);
        assert_eq!(recipe.reuse_type(), ReuseType::A);
        assert!(recipe.partials_nr() > 1);
        let vals: Vec<IterVals> = recipe.iterator().iter().collect();
        recipe.iterator_mut().set_cur_iter_vals(vals[0]);
        assert!(recipe.is_first_partial());
        assert!(!recipe.is_store_en());
        recipe.iterator_mut().set_cur_iter_vals(vals[1]);
        assert!(recipe.is_accum_en());
    }

    fn build_with_geo(params: &LayerParams) -> (Recipe, GeoAttr) {
        let hal = MmeHal::gaudi2();
        let geo = GeoAttr::new(params, &hal);
        let recipe = RecipeBuilder::new(params, &geo, &hal).build();
        (recipe, geo)
    }

    #[test]
    fn test_partial_reuse_a_fcd_fits_accumulators() {
        let mut params = bgemm(4096, 512, 65536, 1);
        params.strategy.sb_reuse = true;
        params.strategy.pattern = Pattern::SpReductionFck;
        let (recipe, geo) = build_with_geo(&params);
        assert_eq!(recipe.reuse_type(), ReuseType::A);
        assert!(recipe.partials_nr() > 1);
        let hal = MmeHal::gaudi2();
        let accums = if geo.bgemm_bit() { hal.accums_nr_2x } else { hal.accums_nr };
        assert!(recipe.fcd_subviews().len() > 1);
        assert!(recipe
            .fcd_subviews()
            .iter()
            .all(|v| v.view_size <= geo.geometry_width() * accums));
        assert!(recipe
            .sp_subviews()
            .iter()
            .all(|v| v.view_size <= geo.geometry_height()));
    }

    #[test]
    fn test_partial_reuse_b_takes_single_fcd_step() {
        let mut params = bgemm(1024, 4096, 65536, 1);
        params.strategy.sb_reuse = true;
        params.strategy.pattern = Pattern::SpReductionKfc;
        let (recipe, geo) = build_with_geo(&params);
        assert_eq!(recipe.reuse_type(), ReuseType::B);
        assert!(recipe.partials_nr() > 1);
        let hal = MmeHal::gaudi2();
        let accums = if geo.bgemm_bit() { hal.accums_nr_2x } else { hal.accums_nr };
        assert_eq!(
            recipe.fcd_subviews().len() as u32,
            div_round_up(1024, geo.geometry_width())
        );
        assert!(recipe
            .fcd_subviews()
            .iter()
            .all(|v| v.view_size <= geo.geometry_width()));
        assert!(recipe
            .sp_subviews()
            .iter()
            .all(|v| div_round_up(v.view_size, geo.geometry_height()) <= accums));
    }

    #[test]
    fn test_reuse_b_fwd_spatial_fits_sb_repeat() {
        let mut params = LayerParams::new(OpType::Fwd);
        params.x = TensorView::dense(DataType::Bf16, [3, 224, 224, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [64, 3, 7, 7, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 218, 218, 1, 1]);
        params.strategy.geometry = Geometry::Geo4xw;
        params.strategy.sb_reuse = true;
        let (recipe, geo) = build_with_geo(&params);
        assert_eq!(recipe.reuse_type(), ReuseType::B);
        assert_eq!(recipe.partials_nr(), 1);
        let max_sb_reuse = MmeHal::gaudi2().max_sb_reuse;
        assert!(recipe.sp_subviews().len() > 1);
        for view in recipe.sp_subviews() {
            assert!(div_round_up(view.view_size, geo.geometry_height()) <= max_sb_reuse);
        }
        let covered: u32 = recipe.sp_subviews().iter().map(|v| v.view_size).sum();
        assert_eq!(covered, 218 * 218);
    }

    #[test]
    fn test_reuse_without_partials_keeps_fwd_spatial_whole() {
        let mut params = LayerParams::new(OpType::Fwd);
        params.x = TensorView::dense(DataType::Bf16, [3, 224, 224, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [64, 3, 7, 7, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 218, 218, 1, 1]);
        params.strategy.geometry = Geometry::Geo4xw;
        let recipe = build(&params);
        assert_eq!(recipe.reuse_type(), ReuseType::None);
        assert_eq!(recipe.sp_subviews().len(), 1);
    }

    fn reused_dedw() -> LayerParams {
        let mut params = LayerParams::new(OpType::Dedw);
        params.x = TensorView::dense(DataType::Bf16, [256, 56, 56, 1, 2]);
        params.y = TensorView::dense(DataType::Bf16, [512, 56, 56, 1, 2]);
        params.w = TensorView::dense(DataType::Bf16, [512, 256, 3, 3, 1]);
        params.conv.padding = [1, 1, 0];
        params.strategy.pattern = Pattern::SpReductionKfc;
        params.strategy.sb_reuse = true;
        params
    }

    #[test]
    fn test_dedw_partial_reuse_splits_output_rows_and_taps() {
        let (recipe, geo) = build_with_geo(&reused_dedw());
        assert!(recipe.partials_nr() > 1);
        assert!(recipe.non_spatial_subviews().len() > 1);

        let accums = MmeHal::gaudi2().accums_nr;
        for view in recipe.non_spatial_subviews() {
            let taps: u32 = view.sizes[2..].iter().product();
            let steps = div_round_up(view.sizes[1], geo.geometry_height()) * taps;
            if recipe.reuse_b() {
                assert!(steps <= accums);
            } else {
                assert_eq!(steps, 1);
            }
        }
        if recipe.reuse_b() {
            assert!(recipe
                .fcd_subviews()
                .iter()
                .all(|v| v.view_size <= geo.geometry_width()));
        }
    }

    #[test]
    fn test_split_dedw_output_by_capacity() {
        let params = reused_dedw();
        let hal = MmeHal::gaudi2();
        let geo = GeoAttr::new(&params, &hal);
        let builder = RecipeBuilder::new(&params, &geo, &hal);
        let rows = geo.geometry_height();
        let sizes = [0, rows, 3, 3, 1];

        // two taps of the first filter dim per view
        let views = builder.split_dedw_output(&[0; 5], &sizes, 2);
        assert_eq!(views.len(), 6);
        assert_eq!(views[0].sizes, [0, rows, 2, 1, 1]);
        assert_eq!(views[1].bases, [0, 0, 2, 0, 0]);

        // rows alone exhaust the capacity
        let sizes = [0, 3 * rows, 3, 1, 1];
        let views = builder.split_dedw_output(&[0; 5], &sizes, 2);
        assert_eq!(views.len(), 6);
        assert_eq!(views[0].sizes, [0, 2 * rows, 1, 1, 1]);
        assert_eq!(views[1].sizes, [0, rows, 1, 1, 1]);
    }

    #[test]
    fn test_fwd_lowering() {
        let mut params = LayerParams::new(OpType::Fwd);
        params.x = TensorView::dense(DataType::Bf16, [16, 30, 30, 1, 2]);
        params.w = TensorView::dense(DataType::Bf16, [64, 16, 3, 3, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 28, 28, 1, 2]);
        let recipe = build(&params);
        assert!(recipe.lowering);
        assert_eq!(recipe.a_views[0].sizes[0], 48);
        assert_eq!(recipe.b_views[0].sizes[1], 48);
        assert_eq!(recipe.b_views[0].sizes[2], 1);
        assert_eq!(
            recipe.debug_info(false)[0],
            "lower=True, raster=True, reuse=N/A, FCD=1, SP=1, CONV=1"
        );
    }

    #[test]
    fn test_calc_sp_pos() {
        let mut params = LayerParams::new(OpType::Fwd);
        params.x = TensorView::dense(DataType::Bf16, [16, 10, 10, 1, 2]);
        params.w = TensorView::dense(DataType::Bf16, [64, 16, 1, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 10, 10, 1, 2]);
        let recipe = build(&params);
        assert_eq!(recipe.calc_sp_pos(0), [0, 0, 0, 0, 0]);
        assert_eq!(recipe.calc_sp_pos(23), [3, 2, 0, 0, 0]);
        assert_eq!(recipe.calc_sp_pos(105), [5, 0, 0, 1, 0]);
    }

    #[test]
    fn test_split_multi_dim_walks_outer_dims() {
        let views = split_multi_dim(&[0; 5], &[0, 10, 2, 1, 1], 1, 4);
        assert_eq!(views.len(), 6);
        assert_eq!(views[2].sizes, [0, 2, 1, 1, 1]);
        assert_eq!(views[3].bases, [0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_debug_info_compacts_repeats() {
        let line = Recipe::subviews_debug_info("SP", vec!["4".into(), "4".into(), "2".into()]);
        assert_eq!(line.as_deref(), Some("    SP splits: { 4x2, 2 }"));
    }
}
