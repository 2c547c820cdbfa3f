//! Generation independent part of the AGU configuration
//!
//! For one descriptor, `CommonAgu` computes for every operand a
//! `TensorAttr` (sizes, strides and offsets per tensor dim) and a grid of
//! `PortAttr` (offset of every logical port relative to the tensor). The
//! loop association (which loop advances which dim) is written directly
//! into the descriptor. The generation back end then copies both tables into
//! its own layout.
//!
//! All values are in elements until `finalize_sizes` multiplies them by the
//! view strides.

use log::trace;

use crate::descriptor::{AssociatedDims, Descriptor};
use crate::geo_attr::GeoAttr;
use crate::params::{
    div_round_up, pattern_to_loop_mask, round_to_multiple, DataType, InternalOperand, LayerParams,
    LoopDim, LoopMask, OpType, DIM_B, DIM_C, WEIGHT_DIM_K, DIM_Q, DIM_R, DIM_S, DIM_W, GEMM_DIM_B1,
    GEMM_DIM_B3, GEMM_DIM_H, GEMM_DIM_W, MAX_CONV_DIMS, MAX_TENSOR_DIMS, WEIGHT_DIM_C,
};
use crate::recipe::Recipe;
use crate::sub_problems::{ConvSubProblem, OffsetArray};

use InternalOperand::{A, B, C};

type DimArray = [i64; MAX_TENSOR_DIMS];

/// Marks a logical port that no physical port backs
pub const INVALID_PORT_OFFSET: i64 = -10;

/// Address generation of one operand, indexed by tensor dim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TensorAttr {
    pub spatial_strides: DimArray,
    pub roi_size: DimArray,
    pub valid_elements: DimArray,
    pub base_offset: DimArray,
    pub start_offset: DimArray,
    pub loop_stride: DimArray,
    /// Rows read in the last spatial step
    pub last_spatial_step: u32,
    /// Elements read in the last fcd step
    pub last_fcd_step: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortAttr {
    pub port_offset: DimArray,
}

impl PortAttr {
    pub fn is_valid(&self) -> bool {
        self.port_offset[MAX_TENSOR_DIMS - 1] != INVALID_PORT_OFFSET
    }
}

/// Logical ports of one operand, indexed core, cd, batch, fcd, spatial
#[derive(Debug, Clone, Default)]
pub struct PortGrid {
    shape: [usize; 5],
    ports: Vec<PortAttr>,
}

impl PortGrid {
    fn new(shape: [usize; 5]) -> Self {
        Self {
            shape,
            ports: vec![PortAttr::default(); shape.iter().product()],
        }
    }

    fn index(&self, core: usize, cd: usize, batch: usize, fcd: usize, sp: usize) -> usize {
        let idx = [core, cd, batch, fcd, sp];
        for (axis, (&i, &n)) in idx.iter().zip(self.shape.iter()).enumerate() {
            assert!(i < n, "port index {} out of range {} on axis {}", i, n, axis);
        }
        let s = &self.shape;
        (((core * s[1] + cd) * s[2] + batch) * s[3] + fcd) * s[4] + sp
    }

    pub fn shape(&self) -> [usize; 5] {
        self.shape
    }

    pub fn get(&self, core: usize, cd: usize, batch: usize, fcd: usize, sp: usize) -> &PortAttr {
        &self.ports[self.index(core, cd, batch, fcd, sp)]
    }

    fn get_mut(
        &mut self,
        core: usize,
        cd: usize,
        batch: usize,
        fcd: usize,
        sp: usize,
    ) -> &mut PortAttr {
        let idx = self.index(core, cd, batch, fcd, sp);
        &mut self.ports[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortAttr> {
        self.ports.iter()
    }
}

pub struct CommonAgu<'a> {
    params: &'a LayerParams,
    geo: &'a GeoAttr,
    recipe: &'a Recipe,
    mme_idx: u32,
    address_offset: OffsetArray,
    tensors: [TensorAttr; 3],
    ports: [PortGrid; 3],
}

impl<'a> CommonAgu<'a> {
    pub fn new(
        geo: &'a GeoAttr,
        recipe: &'a Recipe,
        mme_idx: u32,
        address_offset: OffsetArray,
    ) -> Self {
        Self {
            params: geo.params(),
            geo,
            recipe,
            mme_idx,
            address_offset,
            tensors: [TensorAttr::default(); 3],
            ports: Default::default(),
        }
    }

    pub fn params(&self) -> &LayerParams {
        self.params
    }

    pub fn geo(&self) -> &GeoAttr {
        self.geo
    }

    pub fn recipe(&self) -> &Recipe {
        self.recipe
    }

    pub fn mme_idx(&self) -> u32 {
        self.mme_idx
    }

    pub fn tensor(&self, operand: InternalOperand) -> &TensorAttr {
        &self.tensors[operand as usize]
    }

    pub fn ports(&self, operand: InternalOperand) -> &PortGrid {
        &self.ports[operand as usize]
    }

    /// Compute the tensor and port tables and write the loop association
    pub fn run(&mut self, desc: &mut Descriptor) {
        match self.params.op_type {
            OpType::GemmTranspose => {
                self.configure_gemm_transpose();
                self.set_associated_dims_dma(desc);
            }
            OpType::Memcpy => {
                self.configure_dma();
                self.set_associated_dims_dma(desc);
            }
            OpType::Trans => {
                self.configure_transpose();
                self.set_associated_dims_dma(desc);
            }
            OpType::Ab | OpType::Atb | OpType::Abt | OpType::Atbt | OpType::ReductionAdd => {
                self.configure_bgemm();
                self.set_associated_dims_bgemm_dedw(desc);
            }
            OpType::Dedw | OpType::DeterministicDedw => {
                self.configure_dedw();
                self.set_associated_dims_bgemm_dedw(desc);
            }
            OpType::Fwd => {
                self.configure_fwd();
                self.set_associated_dims_fwd_dedx(desc);
            }
            OpType::Dedx | OpType::TransposedDedx => {
                self.configure_dedx();
                self.set_associated_dims_fwd_dedx(desc);
            }
        }

        for &operand in self.geo.operands() {
            self.set_port_offsets(operand);
            self.multiply_strides(operand);
            self.finalize_sizes(operand);
        }
    }

    fn is_memset_desc(&self) -> bool {
        ConvSubProblem::is_memset(self.params)
    }

    /// An accelerated operand covers fewer rows per step and more columns
    fn fix_for_te_acceleration(
        &self,
        operand: InternalOperand,
        size: u32,
        is_spatial: bool,
    ) -> u32 {
        if self.recipe.accelerated_operand != operand {
            return size;
        }
        if is_spatial {
            size >> self.recipe.te_acceleration
        } else {
            size << self.recipe.te_acceleration
        }
    }

    fn padded_common_dim(&self, original: u32, data_type: DataType) -> u32 {
        let geo = self.geo;
        let dt_alignment = geo.cd_dt_alignment(data_type);
        let readers = |operand| {
            if self.params.is_transposed(operand) {
                1
            } else {
                geo.core_spatial_eu_port(operand)
            }
        };
        let core_alignment = readers(A).max(readers(B)).max(dt_alignment);
        round_to_multiple(original, core_alignment * geo.geometry_cd_concurrency())
    }

    fn single_port_fcd_size(&self, operand: InternalOperand) -> u32 {
        let port_size = self.geo.port_size(operand);
        if self.params.op_type == OpType::Memcpy {
            let fcd_ports = self.geo.chip_fcd_ports(operand);
            let steps = div_round_up(self.recipe.cur_fcd().view_size, fcd_ports * port_size);
            steps * port_size
        } else {
            port_size
        }
    }

    fn is_filter_dim_reversed(&self, dim: usize) -> bool {
        self.params.op_type == OpType::TransposedDedx && dim == DIM_S
    }

    // --- tensor configuration per operation ---

    fn configure_dma(&mut self) {
        for &operand in self.geo.operands() {
            let view = self.recipe.operand(operand);
            let roi = self.recipe.roi_sizes(operand);
            let mut t = TensorAttr::default();
            t.spatial_strides[0] = 1;
            t.roi_size[0] = roi[0] as i64;
            t.valid_elements[0] = view.sizes[0] as i64;
            // no fcd steps
            t.loop_stride[0] = 0;
            for dim in 1..MAX_TENSOR_DIMS {
                t.spatial_strides[dim] = 1;
                t.roi_size[dim] = roi[dim] as i64;
                t.valid_elements[dim] = view.sizes[dim] as i64;
                t.loop_stride[dim] = 1;
            }
            // a single fcd step covers the whole view
            t.last_fcd_step = self.single_port_fcd_size(operand);
            t.last_spatial_step = self.calc_last_step_size(operand, true, self.params.sp_size);
            self.tensors[operand as usize] = t;
        }
    }

    fn configure_transpose(&mut self) {
        let geo = self.geo;
        let view_a = self.recipe.operand(A);
        let view_c = self.recipe.operand(C);
        let fcd_view = *self.recipe.cur_fcd();
        let sp_view = *self.recipe.cur_sp();
        let padded_fcd_a = self.padded_common_dim(view_a.sizes[0], self.params.x.element_type);
        let padded_sp_c = self.padded_common_dim(view_c.sizes[1], self.params.y.element_type);
        // the recipe fcd view is in accelerated output units
        let original_sp_a = self.fix_for_te_acceleration(C, fcd_view.view_size, true);

        let width_a = self.fix_for_te_acceleration(A, geo.geometry_width(), true);
        let height_a = self.fix_for_te_acceleration(A, geo.geometry_height(), false);
        let width_c = self.fix_for_te_acceleration(C, geo.geometry_width(), false);
        let height_c = self.fix_for_te_acceleration(C, geo.geometry_height(), true);
        let single_port_fcd_a = self.fix_for_te_acceleration(A, geo.port_size(A), false);
        let single_port_fcd_c = self.fix_for_te_acceleration(C, geo.port_size(C), true);

        let mut a = TensorAttr::default();
        a.spatial_strides[0] = 1;
        a.roi_size[0] = padded_fcd_a as i64;
        a.valid_elements[0] = view_a.sizes[0] as i64;
        a.loop_stride[0] = height_a as i64;
        a.start_offset[0] = self.fix_for_te_acceleration(C, sp_view.view_base, false) as i64;
        a.spatial_strides[1] = 1;
        a.roi_size[1] = view_a.sizes[1] as i64;
        a.valid_elements[1] = view_a.sizes[1] as i64;
        // rows of A advance by the output width
        a.loop_stride[1] = width_a as i64;
        a.base_offset[1] = (fcd_view.view_base >> self.recipe.te_acceleration) as i64;
        a.last_spatial_step =
            self.calc_last_step_size(A, false, original_sp_a % geo.geometry_width());
        a.last_fcd_step = padded_fcd_a.min(single_port_fcd_a);

        let mut c = TensorAttr::default();
        c.spatial_strides[0] = 1;
        c.roi_size[0] = view_c.sizes[0] as i64;
        c.valid_elements[0] = view_c.sizes[0] as i64;
        c.loop_stride[0] = width_c as i64;
        c.base_offset[0] = fcd_view.view_base as i64;
        c.spatial_strides[1] = 1;
        c.roi_size[1] = padded_sp_c as i64;
        c.valid_elements[1] = view_c.sizes[1] as i64;
        c.loop_stride[1] = height_c as i64;
        c.start_offset[1] = sp_view.view_base as i64;
        c.last_spatial_step = padded_sp_c.min(single_port_fcd_c);
        c.last_fcd_step =
            self.calc_last_step_size(C, false, fcd_view.view_size % geo.geometry_width());

        let batch_view = self.recipe.cur_non_spatial();
        for (operand, t) in [(A, &mut a), (C, &mut c)] {
            let view = self.params.operand(operand);
            for dim in 2..MAX_TENSOR_DIMS {
                t.spatial_strides[dim] = 1;
                t.roi_size[dim] = view.sizes[dim] as i64;
                t.valid_elements[dim] = view.sizes[dim] as i64;
                t.base_offset[dim] = batch_view.bases[dim] as i64;
                t.loop_stride[dim] = 1;
            }
        }
        self.tensors[A as usize] = a;
        self.tensors[C as usize] = c;
    }

    fn configure_unit_matrix(&self, b: &mut TensorAttr) {
        let mme_width = self.geo.mme_width() as i64;
        // the EU width is filled with zeros
        b.valid_elements[WEIGHT_DIM_K] = mme_width;
        b.roi_size[WEIGHT_DIM_K] = mme_width;
        b.spatial_strides[WEIGHT_DIM_K] = 0;
        b.loop_stride[WEIGHT_DIM_K] = 0;

        // one valid element per row builds the unit matrix
        b.valid_elements[WEIGHT_DIM_C] = 1;
        b.roi_size[WEIGHT_DIM_C] = mme_width;
        b.spatial_strides[WEIGHT_DIM_C] = 1;
        b.loop_stride[WEIGHT_DIM_C] = -(self.geo.interleaved_spatial_ports_nr(B) as i64);

        b.last_spatial_step = 1;
        b.last_fcd_step = self.geo.port_size(B);
        self.configure_batch_loops(B, b);
    }

    fn configure_gemm_transpose(&mut self) {
        let a = self.configure_bgemm_non_transposed_a();
        let mut b = TensorAttr::default();
        self.configure_unit_matrix(&mut b);
        let c = self.configure_bgemm_output();
        self.tensors = [a, b, c];
    }

    fn configure_bgemm(&mut self) {
        let a = if self.geo.is_transposed(A) {
            self.configure_bgemm_transposed_a()
        } else {
            self.configure_bgemm_non_transposed_a()
        };
        let b = if self.geo.is_transposed(B) {
            self.configure_bgemm_transposed_b()
        } else {
            self.configure_bgemm_non_transposed_b()
        };
        let c = self.configure_bgemm_output();
        self.tensors = [a, b, c];
    }

    fn configure_non_conv_dims_non_transposed_b(&self, b: &mut TensorAttr, padded_cd: u32) {
        let conv_view = self.recipe.cur_non_spatial();
        let fcd_view = self.recipe.cur_fcd();
        let view_b = self.recipe.operand(B);
        let roi_b = self.recipe.roi_sizes(B);

        b.roi_size[WEIGHT_DIM_K] = roi_b[WEIGHT_DIM_K] as i64;
        b.valid_elements[WEIGHT_DIM_K] = view_b.sizes[WEIGHT_DIM_K] as i64;
        b.loop_stride[WEIGHT_DIM_K] = self.geo.geometry_width() as i64;
        b.spatial_strides[WEIGHT_DIM_K] = 1;
        b.start_offset[WEIGHT_DIM_K] = fcd_view.view_base as i64;
        b.base_offset[WEIGHT_DIM_K] = 0;

        b.spatial_strides[WEIGHT_DIM_C] = 1;
        b.roi_size[WEIGHT_DIM_C] = padded_cd as i64;
        b.valid_elements[WEIGHT_DIM_C] = if self.is_memset_desc() {
            0
        } else {
            view_b.sizes[WEIGHT_DIM_C] as i64
        };
        b.loop_stride[WEIGHT_DIM_C] = 0;
        b.start_offset[WEIGHT_DIM_C] = 0;
        b.base_offset[WEIGHT_DIM_C] = conv_view.bases[WEIGHT_DIM_C] as i64;

        b.last_spatial_step = self.calc_last_step_size(B, true, padded_cd);
        b.last_fcd_step = self.geo.port_size(B);
    }

    fn configure_non_conv_dims_transposed_b(&self, b: &mut TensorAttr, padded_cd: u32) {
        let conv_view = self.recipe.cur_non_spatial();
        let fcd_view = self.recipe.cur_fcd();
        let view_b = self.recipe.operand(B);
        let roi_b = self.recipe.roi_sizes(B);

        b.roi_size[WEIGHT_DIM_K] = padded_cd as i64;
        b.valid_elements[WEIGHT_DIM_K] = if self.is_memset_desc() {
            0
        } else {
            view_b.sizes[WEIGHT_DIM_K] as i64
        };
        b.loop_stride[WEIGHT_DIM_K] = 0;
        b.spatial_strides[WEIGHT_DIM_K] = 1;
        b.base_offset[WEIGHT_DIM_K] = conv_view.bases[WEIGHT_DIM_K] as i64;
        b.start_offset[WEIGHT_DIM_K] = 0;

        b.spatial_strides[WEIGHT_DIM_C] = 1;
        b.roi_size[WEIGHT_DIM_C] = roi_b[WEIGHT_DIM_C] as i64;
        b.valid_elements[WEIGHT_DIM_C] = view_b.sizes[WEIGHT_DIM_C] as i64;
        b.loop_stride[WEIGHT_DIM_C] = self.geo.geometry_width() as i64;
        b.base_offset[WEIGHT_DIM_C] = 0;
        b.start_offset[WEIGHT_DIM_C] = fcd_view.view_base as i64;

        b.last_spatial_step =
            self.calc_last_step_size(B, false, fcd_view.view_size % self.geo.geometry_width());
        b.last_fcd_step = padded_cd;
    }

    fn configure_dedx(&mut self) {
        let geo = self.geo;
        let conv = &self.params.conv;
        let conv_view = *self.recipe.cur_non_spatial();
        let fcd_view = *self.recipe.cur_fcd();
        let sp_view = *self.recipe.cur_sp();
        let view_a = self.recipe.operand(A);
        let view_b = self.recipe.operand(B);
        let view_c = self.recipe.operand(C);
        let roi_a = self.recipe.roi_sizes(A);
        let roi_b = self.recipe.roi_sizes(B);
        let roi_c = self.recipe.roi_sizes(C);
        let memset = self.is_memset_desc();

        let cd_dim = if geo.is_transposed(B) { WEIGHT_DIM_K } else { WEIGHT_DIM_C };
        // void dX pixels get a single zero CD element
        let cd = if memset { 1 } else { conv_view.sizes[cd_dim] };
        let padded_cd = self.padded_common_dim(cd, self.params.w.element_type);

        let mut a = TensorAttr::default();
        let mut b = TensorAttr::default();
        let mut c = TensorAttr::default();

        a.roi_size[WEIGHT_DIM_K] = padded_cd as i64;
        a.valid_elements[WEIGHT_DIM_K] = if memset { 0 } else { view_a.sizes[WEIGHT_DIM_K] as i64 };
        a.loop_stride[WEIGHT_DIM_K] = 0;
        a.spatial_strides[WEIGHT_DIM_K] = 0;
        a.base_offset[WEIGHT_DIM_K] = conv_view.bases[cd_dim] as i64;
        a.start_offset[WEIGHT_DIM_K] = 0;

        if geo.is_transposed(B) {
            self.configure_non_conv_dims_transposed_b(&mut b, padded_cd);
        } else {
            self.configure_non_conv_dims_non_transposed_b(&mut b, padded_cd);
        }

        c.roi_size[DIM_C] = roi_c[DIM_C] as i64;
        c.valid_elements[DIM_C] = view_c.sizes[DIM_C] as i64;
        c.loop_stride[DIM_C] = geo.geometry_width() as i64;
        c.spatial_strides[DIM_C] = 0;
        c.base_offset[DIM_C] = 0;
        c.start_offset[DIM_C] = fcd_view.view_base as i64;

        let sp_pos = self.recipe.calc_sp_pos(sp_view.view_base);
        for conv_dim in 0..MAX_CONV_DIMS - 1 {
            let act_dim = conv_dim + 1;
            let weight_dim = conv_dim + 2;
            let stride = conv.stride[conv_dim] as i64;
            let dilation = conv.dilation[conv_dim] as i64;

            a.spatial_strides[act_dim] = stride;
            let conv_size = if self.recipe.lowering && self.is_filter_dim_reversed(weight_dim) {
                self.params.operand(B).sizes[weight_dim]
            } else {
                conv_view.sizes[weight_dim]
            } as i64;
            a.base_offset[act_dim] =
                -(conv_size - 1 + conv_view.bases[weight_dim] as i64) * dilation
                    + conv.padding[conv_dim] as i64;
            a.roi_size[act_dim] = roi_c[act_dim] as i64 * stride;
            a.valid_elements[act_dim] = view_a.sizes[act_dim] as i64;
            a.loop_stride[act_dim] = dilation;
            a.start_offset[act_dim] = sp_pos[conv_dim] as i64 * stride;

            c.spatial_strides[act_dim] = 1;
            c.base_offset[act_dim] = 0;
            c.roi_size[act_dim] = roi_c[act_dim] as i64;
            c.valid_elements[act_dim] = view_c.sizes[act_dim] as i64;
            c.loop_stride[act_dim] = 1;
            c.start_offset[act_dim] = sp_pos[conv_dim] as i64;

            b.spatial_strides[weight_dim] = 0;
            b.base_offset[weight_dim] = 0;
            b.roi_size[weight_dim] = roi_b[weight_dim] as i64;
            b.valid_elements[weight_dim] = view_b.sizes[weight_dim] as i64;
            if self.is_filter_dim_reversed(weight_dim) {
                b.loop_stride[weight_dim] = 1;
                b.start_offset[weight_dim] = conv_view.bases[weight_dim] as i64;
            } else {
                // the filter is walked backwards
                b.loop_stride[weight_dim] = -1;
                b.start_offset[weight_dim] =
                    (conv_view.bases[weight_dim] + conv_view.sizes[weight_dim]) as i64 - 1;
            }
        }

        a.spatial_strides[DIM_B] = 1;
        a.base_offset[DIM_B] = 0;
        a.start_offset[DIM_B] = sp_pos[DIM_B - 1] as i64;
        a.roi_size[DIM_B] = roi_a[DIM_B] as i64;
        a.valid_elements[DIM_B] = view_a.sizes[DIM_B] as i64;
        a.loop_stride[DIM_B] = 0;

        c.spatial_strides[DIM_B] = 1;
        c.base_offset[DIM_B] = 0;
        c.start_offset[DIM_B] = sp_pos[DIM_B - 1] as i64;
        c.roi_size[DIM_B] = roi_c[DIM_B] as i64;
        c.valid_elements[DIM_B] = view_c.sizes[DIM_B] as i64;
        c.loop_stride[DIM_B] = 1;

        let sp_rem = sp_view.view_size % geo.geometry_height();
        a.last_spatial_step = self.calc_last_step_size(A, true, sp_rem);
        a.last_fcd_step = padded_cd;
        c.last_spatial_step = self.calc_last_step_size(C, true, sp_rem);
        c.last_fcd_step =
            self.calc_last_step_size(C, false, fcd_view.view_size % geo.geometry_width());
        self.tensors = [a, b, c];
    }

    fn configure_fwd(&mut self) {
        let geo = self.geo;
        let conv = &self.params.conv;
        let conv_view = *self.recipe.cur_non_spatial();
        let fcd_view = *self.recipe.cur_fcd();
        let sp_view = *self.recipe.cur_sp();
        let view_a = self.recipe.operand(A);
        let view_b = self.recipe.operand(B);
        let view_c = self.recipe.operand(C);
        let roi_a = self.recipe.roi_sizes(A);
        let roi_b = self.recipe.roi_sizes(B);
        let roi_c = self.recipe.roi_sizes(C);

        let is_last_partial_in_fcd =
            conv_view.sizes[WEIGHT_DIM_C] + conv_view.bases[WEIGHT_DIM_C] == view_a.sizes[DIM_C];
        let original_cd = conv_view.sizes[WEIGHT_DIM_C];
        let padded_cd = self.padded_common_dim(original_cd, self.params.w.element_type);
        if !is_last_partial_in_fcd {
            // the middle of the fcd cannot be padded
            assert_eq!(padded_cd, original_cd, "subView size isnt aligned to interleaving ports");
        }

        let mut a = TensorAttr::default();
        let mut b = TensorAttr::default();
        let mut c = TensorAttr::default();

        a.roi_size[DIM_C] = roi_a[DIM_C] as i64;
        a.valid_elements[DIM_C] = view_a.sizes[DIM_C] as i64;
        a.loop_stride[DIM_C] = 0;
        a.spatial_strides[DIM_C] = 1;
        a.start_offset[DIM_C] = 0;
        a.base_offset[DIM_C] = conv_view.bases[WEIGHT_DIM_C] as i64;

        self.configure_non_conv_dims_non_transposed_b(&mut b, padded_cd);

        c.roi_size[WEIGHT_DIM_K] = roi_c[WEIGHT_DIM_K] as i64;
        c.valid_elements[WEIGHT_DIM_K] = view_c.sizes[WEIGHT_DIM_K] as i64;
        c.loop_stride[WEIGHT_DIM_K] = geo.geometry_width() as i64;
        c.start_offset[WEIGHT_DIM_K] = fcd_view.view_base as i64;
        c.base_offset[WEIGHT_DIM_K] = 0;

        let sp_pos = self.recipe.calc_sp_pos(sp_view.view_base);
        for conv_dim in 0..MAX_CONV_DIMS - 1 {
            let act_dim = conv_dim + 1;
            let weight_dim = conv_dim + 2;
            let stride = conv.stride[conv_dim] as i64;
            let dilation = conv.dilation[conv_dim] as i64;

            // start and base offsets are swapped for the input
            a.spatial_strides[act_dim] = stride;
            a.start_offset[act_dim] = sp_pos[conv_dim] as i64 * stride;
            a.roi_size[act_dim] = roi_c[act_dim] as i64 * stride;
            a.valid_elements[act_dim] = view_a.sizes[act_dim] as i64;
            a.loop_stride[act_dim] = dilation;
            a.base_offset[act_dim] =
                dilation * conv_view.bases[weight_dim] as i64 - conv.padding[conv_dim] as i64;

            c.spatial_strides[act_dim] = 1;
            c.start_offset[act_dim] = sp_pos[conv_dim] as i64;
            c.base_offset[act_dim] = 0;
            c.roi_size[act_dim] = roi_c[act_dim] as i64;
            c.valid_elements[act_dim] = view_c.sizes[act_dim] as i64;
            c.loop_stride[act_dim] = 0;

            b.spatial_strides[weight_dim] = 1;
            b.start_offset[weight_dim] = 0;
            b.roi_size[weight_dim] = roi_b[weight_dim] as i64;
            b.valid_elements[weight_dim] = view_b.sizes[weight_dim] as i64;
            b.loop_stride[weight_dim] = 1;
            b.base_offset[weight_dim] = conv_view.bases[weight_dim] as i64;
        }

        a.spatial_strides[DIM_B] = 1;
        a.start_offset[DIM_B] = sp_pos[DIM_B - 1] as i64;
        a.base_offset[DIM_B] = 0;
        a.roi_size[DIM_B] = roi_a[DIM_B] as i64;
        a.valid_elements[DIM_B] = view_a.sizes[DIM_B] as i64;
        a.loop_stride[DIM_B] = 0;

        c.spatial_strides[DIM_B] = 1;
        c.start_offset[DIM_B] = sp_pos[DIM_B - 1] as i64;
        c.base_offset[DIM_B] = 0;
        c.roi_size[DIM_B] = roi_c[DIM_B] as i64;
        c.valid_elements[DIM_B] = view_c.sizes[DIM_B] as i64;
        c.loop_stride[DIM_B] = 0;

        let sp_rem = sp_view.view_size % geo.geometry_height();
        a.last_spatial_step = self.calc_last_step_size(A, true, sp_rem);
        a.last_fcd_step = padded_cd;
        c.last_spatial_step = self.calc_last_step_size(C, true, sp_rem);
        c.last_fcd_step =
            self.calc_last_step_size(C, false, fcd_view.view_size % geo.geometry_width());
        self.tensors = [a, b, c];
    }

    fn configure_dedw(&mut self) {
        let geo = self.geo;
        let conv = &self.params.conv;
        let conv_view = *self.recipe.cur_non_spatial();
        let fcd_view = *self.recipe.cur_fcd();
        let sp_view = *self.recipe.cur_sp();
        let view_a = self.recipe.operand(A);
        let view_b = self.recipe.operand(B);
        let view_c = self.recipe.operand(C);
        let roi_a = self.recipe.roi_sizes(A);
        let roi_b = self.recipe.roi_sizes(B);
        let roi_c = self.recipe.roi_sizes(C);

        let mut a = TensorAttr::default();
        let mut b = TensorAttr::default();
        let mut c = TensorAttr::default();

        a.roi_size[DIM_C] = roi_a[DIM_C] as i64;
        a.valid_elements[DIM_C] = view_a.sizes[DIM_C] as i64;
        a.loop_stride[DIM_C] = geo.geometry_height() as i64;
        a.start_offset[DIM_C] = conv_view.bases[1] as i64;

        b.roi_size[WEIGHT_DIM_K] = roi_b[WEIGHT_DIM_K] as i64;
        b.valid_elements[WEIGHT_DIM_K] = view_b.sizes[WEIGHT_DIM_K] as i64;
        b.loop_stride[WEIGHT_DIM_K] = geo.geometry_width() as i64;
        b.start_offset[WEIGHT_DIM_K] = fcd_view.view_base as i64;

        c.roi_size[WEIGHT_DIM_K] = roi_c[WEIGHT_DIM_K] as i64;
        c.valid_elements[WEIGHT_DIM_K] = view_c.sizes[WEIGHT_DIM_K] as i64;
        c.loop_stride[WEIGHT_DIM_K] = geo.geometry_width() as i64;
        c.start_offset[WEIGHT_DIM_K] = fcd_view.view_base as i64;

        // the output rows are padded to a full geometry
        c.roi_size[WEIGHT_DIM_C] = roi_c[WEIGHT_DIM_C].max(geo.geometry_height()) as i64;
        c.valid_elements[WEIGHT_DIM_C] = view_c.sizes[WEIGHT_DIM_C] as i64;
        c.loop_stride[WEIGHT_DIM_C] = geo.geometry_height() as i64;
        c.spatial_strides[WEIGHT_DIM_C] = 1;
        c.start_offset[WEIGHT_DIM_C] = conv_view.bases[1] as i64;

        let sp_pos = self.recipe.calc_sp_pos(sp_view.view_base);
        for conv_dim in 0..MAX_CONV_DIMS - 1 {
            let act_dim = conv_dim + 1;
            let weight_dim = conv_dim + 2;
            let stride = conv.stride[conv_dim] as i64;
            let dilation = conv.dilation[conv_dim] as i64;
            let concurrent = geo.supports_concurrency() && geo.concurrent_dim() == weight_dim;
            let batch_concurrency = if concurrent {
                geo.geometry_concurrency() as i64
            } else {
                1
            };

            a.spatial_strides[act_dim] = stride;
            a.base_offset[act_dim] =
                dilation * conv_view.bases[weight_dim] as i64 * batch_concurrency
                    - conv.padding[conv_dim] as i64;
            a.start_offset[act_dim] = sp_pos[conv_dim] as i64 * stride;
            a.roi_size[act_dim] = roi_b[act_dim] as i64 * stride;
            a.valid_elements[act_dim] = view_a.sizes[act_dim] as i64;
            a.loop_stride[act_dim] = dilation;

            b.spatial_strides[act_dim] = 1;
            b.base_offset[act_dim] = 0;
            b.start_offset[act_dim] = sp_pos[conv_dim] as i64;
            b.roi_size[act_dim] = roi_b[act_dim] as i64;
            b.valid_elements[act_dim] = view_b.sizes[act_dim] as i64;
            b.loop_stride[act_dim] = 0;

            c.spatial_strides[weight_dim] = 1;
            c.base_offset[weight_dim] = 0;
            c.start_offset[weight_dim] = conv_view.bases[weight_dim] as i64 * batch_concurrency;
            c.roi_size[weight_dim] = roi_c[weight_dim] as i64;
            c.valid_elements[weight_dim] = view_c.sizes[weight_dim] as i64;
            c.loop_stride[weight_dim] = 1;
        }

        for (t, view) in [(&mut a, view_a), (&mut b, view_b)] {
            t.spatial_strides[DIM_B] = 1;
            t.base_offset[DIM_B] = 0;
            t.start_offset[DIM_B] = sp_pos[DIM_B - 1] as i64;
            t.valid_elements[DIM_B] = view.sizes[DIM_B] as i64;
            t.loop_stride[DIM_B] = 0;
        }

        // a misaligned cd pads the whole spatial size
        let sp_size_cd = self.padded_common_dim(sp_view.view_size, view_b.element_type);
        a.last_spatial_step = self.calc_last_step_size(A, true, sp_size_cd);
        b.last_spatial_step = self.calc_last_step_size(B, true, sp_size_cd);
        c.last_spatial_step = if geo.mme_concurrency() > 1 {
            // several filters share the EU height
            128
        } else {
            self.calc_last_step_size(C, true, conv_view.sizes[1] % geo.geometry_height())
        };
        a.last_fcd_step = geo.port_size(A);
        b.last_fcd_step = geo.port_size(B);
        c.last_fcd_step =
            self.calc_last_step_size(C, false, fcd_view.view_size % geo.geometry_width());
        self.tensors = [a, b, c];
    }

    fn configure_batch_loops(&self, operand: InternalOperand, t: &mut TensorAttr) {
        let view = self.recipe.operand(operand);
        let batch_view = self.recipe.cur_non_spatial();
        let roi = self.recipe.roi_sizes(operand);
        for dim in GEMM_DIM_B1..=GEMM_DIM_B3 {
            let broadcast = self.geo.is_operand_broadcasted(operand, dim);
            t.spatial_strides[dim] = 1;
            t.base_offset[dim] = 0;
            t.start_offset[dim] = if broadcast { 0 } else { batch_view.bases[dim] as i64 };
            t.roi_size[dim] = roi[dim] as i64;
            t.valid_elements[dim] = view.sizes[dim] as i64;
            t.loop_stride[dim] = if broadcast { 0 } else { 1 };
        }
    }

    /// Padded common dim of a bgemm input. Only the last partial may be
    /// padded.
    fn bgemm_common_dim(&self, original: u32) -> u32 {
        let padded = self.padded_common_dim(original, self.params.w.element_type);
        if !self.recipe.is_last_partial() && !self.recipe.masked_bgemm {
            assert_eq!(original, padded, "subView size is not aligned");
        }
        padded
    }

    fn configure_bgemm_transposed_a(&self) -> TensorAttr {
        let view = self.recipe.operand(A);
        let roi = self.recipe.roi_sizes(A);
        let batch_view = self.recipe.cur_non_spatial();
        let sp_view = self.recipe.cur_sp();
        let cd_idx = if self.geo.is_transposed(B) { 0 } else { 1 };
        let padded_cd = self.bgemm_common_dim(batch_view.sizes[cd_idx]);

        let mut a = TensorAttr::default();
        a.spatial_strides[DIM_C] = 1;
        a.base_offset[DIM_C] = batch_view.bases[cd_idx] as i64;
        a.start_offset[DIM_C] = 0;
        a.roi_size[DIM_C] = padded_cd as i64;
        a.valid_elements[DIM_C] = view.sizes[DIM_C] as i64;
        a.loop_stride[DIM_C] = 0;

        a.spatial_strides[DIM_W] = 1;
        a.base_offset[DIM_W] = 0;
        a.start_offset[DIM_W] = sp_view.view_base as i64;
        a.roi_size[DIM_W] = roi[DIM_W] as i64;
        a.valid_elements[DIM_W] = view.sizes[DIM_W] as i64;
        a.loop_stride[DIM_W] = self.geo.geometry_height() as i64;

        a.last_spatial_step =
            self.calc_last_step_size(A, true, sp_view.view_size % self.geo.geometry_height());
        a.last_fcd_step = padded_cd;
        self.configure_batch_loops(A, &mut a);
        a
    }

    fn configure_bgemm_transposed_b(&self) -> TensorAttr {
        let view = self.recipe.operand(B);
        let roi = self.recipe.roi_sizes(B);
        let batch_view = self.recipe.cur_non_spatial();
        let fcd_view = self.recipe.cur_fcd();
        let padded_cd = self.bgemm_common_dim(batch_view.sizes[DIM_C]);

        let mut b = TensorAttr::default();
        b.spatial_strides[DIM_C] = 1;
        b.base_offset[DIM_C] = batch_view.bases[DIM_C] as i64;
        b.start_offset[DIM_C] = 0;
        b.roi_size[DIM_C] = padded_cd as i64;
        b.valid_elements[DIM_C] = view.sizes[DIM_C] as i64;
        b.loop_stride[DIM_C] = 0;

        b.spatial_strides[DIM_W] = 1;
        b.base_offset[DIM_W] = 0;
        b.start_offset[DIM_W] = fcd_view.view_base as i64;
        b.roi_size[DIM_W] = roi[DIM_W] as i64;
        b.valid_elements[DIM_W] = view.sizes[DIM_W] as i64;
        b.loop_stride[DIM_W] = self.geo.geometry_width() as i64;

        b.last_spatial_step =
            self.calc_last_step_size(B, false, fcd_view.view_size % self.geo.geometry_width());
        b.last_fcd_step = padded_cd;
        self.configure_batch_loops(B, &mut b);
        b
    }

    fn configure_bgemm_non_transposed_a(&self) -> TensorAttr {
        let geo = self.geo;
        let view = self.recipe.operand(A);
        let roi = self.recipe.roi_sizes(A);
        let batch_view = self.recipe.cur_non_spatial();
        let sp_view = self.recipe.cur_sp();
        let cd_idx = if geo.is_transposed(B) { 0 } else { 1 };
        let padded_cd = self.bgemm_common_dim(batch_view.sizes[cd_idx]);

        let mut a = TensorAttr::default();
        a.base_offset[DIM_C] = 0;
        a.start_offset[DIM_C] = sp_view.view_base as i64;
        a.roi_size[DIM_C] = roi[DIM_C] as i64;
        a.valid_elements[DIM_C] = view.sizes[DIM_C] as i64;
        a.spatial_strides[DIM_C] = 1;
        a.loop_stride[DIM_C] = geo.geometry_height() as i64;

        a.base_offset[DIM_W] = batch_view.bases[cd_idx] as i64;
        a.start_offset[DIM_W] = 0;
        a.roi_size[DIM_W] = padded_cd as i64;
        a.valid_elements[DIM_W] = view.sizes[DIM_W] as i64;
        a.spatial_strides[DIM_W] = 1;
        a.loop_stride[DIM_W] = 0;

        if self.params.is_gemm_dma() {
            // input rows become output columns through the unit matrix, so
            // the row loop walks the output width
            a.loop_stride[DIM_W] = geo.geometry_width() as i64;
            a.start_offset[DIM_W] = self.recipe.cur_fcd().view_base as i64;
            a.last_spatial_step = self.calc_last_step_size(A, true, geo.mme_width());
        } else {
            assert!(
                padded_cd % geo.mme_spatial_ports(A) == 0,
                "spatial dim must be aligned to spatial port num in bgemm"
            );
            a.last_spatial_step = self.calc_last_step_size(A, true, padded_cd);
        }
        a.last_fcd_step = geo.port_size(A);
        self.configure_batch_loops(A, &mut a);
        a
    }

    fn configure_bgemm_non_transposed_b(&self) -> TensorAttr {
        let geo = self.geo;
        let view = self.recipe.operand(B);
        let roi = self.recipe.roi_sizes(B);
        let batch_view = self.recipe.cur_non_spatial();
        let fcd_view = self.recipe.cur_fcd();
        let padded_cd = self.bgemm_common_dim(batch_view.sizes[WEIGHT_DIM_C]);

        let mut b = TensorAttr::default();
        b.base_offset[WEIGHT_DIM_K] = 0;
        b.start_offset[WEIGHT_DIM_K] = fcd_view.view_base as i64;
        b.roi_size[WEIGHT_DIM_K] = roi[WEIGHT_DIM_K] as i64;
        b.valid_elements[WEIGHT_DIM_K] = view.sizes[WEIGHT_DIM_K] as i64;
        b.spatial_strides[WEIGHT_DIM_K] = 1;
        b.loop_stride[WEIGHT_DIM_K] = geo.geometry_width() as i64;

        b.base_offset[WEIGHT_DIM_C] = batch_view.bases[WEIGHT_DIM_C] as i64;
        b.start_offset[WEIGHT_DIM_C] = 0;
        b.roi_size[WEIGHT_DIM_C] = padded_cd as i64;
        b.valid_elements[WEIGHT_DIM_C] = view.sizes[WEIGHT_DIM_C] as i64;
        b.spatial_strides[WEIGHT_DIM_C] = 1;
        b.loop_stride[WEIGHT_DIM_C] = 0;

        assert!(
            padded_cd % geo.mme_spatial_ports(B) == 0,
            "spatial dim must be aligned to spatial port num in bgemm"
        );
        b.last_spatial_step = self.calc_last_step_size(B, true, padded_cd);
        b.last_fcd_step = geo.port_size(B);
        self.configure_batch_loops(B, &mut b);
        b
    }

    fn configure_bgemm_output(&self) -> TensorAttr {
        let geo = self.geo;
        let view = self.recipe.operand(C);
        let roi = self.recipe.roi_sizes(C);
        let fcd_view = self.recipe.cur_fcd();
        let sp_view = self.recipe.cur_sp();

        let mut c = TensorAttr::default();
        c.base_offset[WEIGHT_DIM_K] = 0;
        c.start_offset[WEIGHT_DIM_K] = fcd_view.view_base as i64;
        c.roi_size[WEIGHT_DIM_K] = roi[WEIGHT_DIM_K] as i64;
        c.valid_elements[WEIGHT_DIM_K] = view.sizes[WEIGHT_DIM_K] as i64;
        c.spatial_strides[WEIGHT_DIM_K] = 1;
        c.loop_stride[WEIGHT_DIM_K] = geo.geometry_width() as i64;

        c.base_offset[DIM_W] = 0;
        c.start_offset[DIM_W] = sp_view.view_base as i64;
        c.roi_size[DIM_W] = roi[DIM_W] as i64;
        c.valid_elements[DIM_W] = view.sizes[DIM_W] as i64;
        c.spatial_strides[DIM_W] = 1;
        c.loop_stride[DIM_W] = geo.geometry_height() as i64;

        c.last_spatial_step =
            self.calc_last_step_size(C, true, sp_view.view_size % geo.geometry_height());
        c.last_fcd_step =
            self.calc_last_step_size(C, false, fcd_view.view_size % geo.geometry_width());
        self.configure_batch_loops(C, &mut c);
        c
    }

    /// Size of the last step of the current MME along one axis. A zero
    /// `last_step` means the view is a whole number of steps.
    pub fn calc_last_step_size(
        &self,
        operand: InternalOperand,
        is_spatial: bool,
        last_step: u32,
    ) -> u32 {
        let geo = self.geo;
        let geo_size = if is_spatial {
            geo.geometry_height()
        } else {
            geo.geometry_width()
        };
        let last_step = if last_step == 0 { geo_size } else { last_step };
        if is_spatial && geo.is_spatially_interleaved_across_cores(operand) {
            // interleaved ports share the step
            return div_round_up(last_step, geo.interleaved_spatial_ports_nr(operand));
        }

        // only one MME hits the partial step, the others get a full or an
        // empty step
        let mme_grid = geo.mme_idx_to_grid(self.mme_idx);
        let (mme_pos, mme_size) = if is_spatial {
            (mme_grid.spatial, geo.mme_height())
        } else {
            (mme_grid.fcd, geo.mme_width())
        };
        let mme_offset = self.fix_for_te_acceleration(operand, mme_pos * mme_size, true);
        if mme_offset >= last_step {
            return 1;
        }

        let full_step = if operand == C {
            if self.params.is_native_dma() {
                geo.port_size(operand)
            } else if is_spatial {
                geo.eu_height() / geo.interleaved_spatial_ports_nr(operand)
            } else {
                geo.eu_width()
            }
        } else {
            self.fix_for_te_acceleration(operand, geo.eu_facing_port_size(operand), true)
        };
        let core_size = self.fix_for_te_acceleration(
            operand,
            if is_spatial { geo.eu_height() } else { geo.eu_width() },
            true,
        );
        let remaining = last_step - mme_offset;
        if remaining >= core_size {
            full_step
        } else if is_spatial && geo.is_spatially_interleaved_inside_core(operand) {
            div_round_up(remaining, geo.interleaved_spatial_ports_nr(operand))
        } else {
            remaining.min(full_step)
        }
    }

    // --- port offsets ---

    /// Offset of the current MME, shared by all its ports
    fn set_mme_offset(&mut self, operand: InternalOperand) {
        let geo = self.geo;
        let params = self.params;
        let grid = geo.mme_idx_to_grid(self.mme_idx);

        if operand == A || operand == C {
            if operand == A && (!geo.is_transposed(A) || params.op_type == OpType::Trans) {
                // the MME spatial offset moves the fcd of a non transposed A
                self.tensors[A as usize].base_offset[GEMM_DIM_W] +=
                    (grid.spatial * geo.mme_height()) as i64;
            } else if geo.is_spatially_interleaved_across_mmes(operand) {
                // interleaved MMEs are one row apart, which is one conv
                // stride of input pixels
                let mut offset = grid.spatial as i64;
                if operand == A {
                    offset *= params.conv.stride[0] as i64;
                }
                self.tensors[operand as usize].start_offset[GEMM_DIM_H] += offset;
            } else {
                let offset =
                    self.fix_for_te_acceleration(operand, grid.spatial * geo.mme_height(), true);
                self.tensors[operand as usize].base_offset[GEMM_DIM_H] += offset as i64;
            }
        }

        // a DMA A port behaves like a B port
        if operand == B || operand == C || (operand == A && params.is_dma()) {
            let mut offset = if params.op_type == OpType::Memcpy {
                grid.fcd * geo.mme_fcd_ports(operand) * self.single_port_fcd_size(operand)
            } else {
                grid.fcd * geo.mme_width()
            };
            let dim = if (operand != C && geo.is_transposed(operand))
                || (operand == A && params.is_gemm_dma())
            {
                offset = self.fix_for_te_acceleration(operand, offset, true);
                GEMM_DIM_H
            } else {
                GEMM_DIM_W
            };
            self.tensors[operand as usize].base_offset[dim] += offset as i64;
        }

        if geo.supports_concurrency() {
            let batch_idx = (grid.batch * geo.mme_concurrency()) as i64;
            let concurrent_dim = geo.concurrent_dim();
            if !geo.is_operand_broadcasted(operand, concurrent_dim) {
                let t = &mut self.tensors[operand as usize];
                if operand == A && params.is_dedw() {
                    // a filter step of the output is a dilation step of the input
                    let sp_dim = concurrent_dim - DIM_W;
                    let conv_dim = concurrent_dim - DIM_S;
                    t.base_offset[sp_dim] += batch_idx * params.conv.dilation[conv_dim] as i64;
                } else {
                    t.base_offset[concurrent_dim] += batch_idx;
                }
            }
        }

        if operand.is_input() && geo.is_spatially_interleaved_across_mmes(operand) {
            let sp_dim = geo.sp_interleaving_dim(operand);
            let mut offset = grid.cd as i64;
            if operand == A && params.is_dedw() {
                offset *= params.conv.stride[sp_dim - 1] as i64;
            }
            self.tensors[operand as usize].start_offset[sp_dim] += offset;
        }
    }

    fn set_core_offset(&self, operand: InternalOperand, core: usize, port: &mut PortAttr) {
        let geo = self.geo;
        let grid = geo.core_idx_to_effective_grid(operand, core as u32);

        port.port_offset[GEMM_DIM_W] +=
            (grid.fcd * geo.core_fcd_ports(operand) * geo.port_size(operand)) as i64;

        let sp_dim = geo.sp_interleaving_dim(operand);
        let mut offset = grid.spatial * self.tensor(operand).spatial_strides[sp_dim] as u32;
        if geo.is_spatially_interleaved_across_cores(operand) {
            // one row per interleaved port
            if geo.is_spatially_interleaved_across_mmes(operand) {
                offset *= geo.spatial_mme_nr(operand);
            }
        } else if operand == C {
            offset *= geo.eu_height();
        } else {
            offset *= geo.te_height() * geo.core_spatial_ports(operand);
        }
        port.port_offset[sp_dim] += self.fix_for_te_acceleration(operand, offset, true) as i64;

        self.set_port_batch_offset(operand, grid.batch * geo.core_concurrency(), port);
    }

    fn base_port(&self, operand: InternalOperand) -> PortAttr {
        let t = self.tensor(operand);
        let mut port = PortAttr::default();
        // the start offset has no fcd field, so the fcd offset is folded in
        if self.geo.is_port_start_offset(operand) {
            port.port_offset = t.start_offset;
            port.port_offset[0] += t.base_offset[0];
        } else {
            port.port_offset = t.base_offset;
            port.port_offset[0] += t.start_offset[0];
        }
        port
    }

    fn set_port_spatial_offset(&self, operand: InternalOperand, sp_idx: u32, port: &mut PortAttr) {
        let geo = self.geo;
        let t = self.tensor(operand);
        let mut offset = sp_idx * t.spatial_strides[DIM_W] as u32;
        if geo.is_spatially_interleaved_inside_core(operand) {
            if geo.is_spatially_interleaved_across_cores(operand) {
                offset *= geo.effective_core_grid(operand).spatial;
                if geo.is_spatially_interleaved_across_mmes(operand) {
                    offset *= geo.spatial_mme_nr(operand);
                }
            }
        } else if operand == C {
            if self.params.op_type == OpType::Trans {
                offset *= geo.port_size(A);
            } else {
                offset *= geo.eu_height();
            }
        } else {
            offset *= geo.te_height();
        }

        let dim = geo.sp_interleaving_dim(operand);
        let last_dim = geo.last_spatial_dim(operand);
        let overall =
            port.port_offset[dim] + self.fix_for_te_acceleration(operand, offset, true) as i64;
        let max = t.roi_size[dim];
        if overall < max || last_dim == DIM_W || !geo.is_port_start_offset(operand) {
            port.port_offset[dim] = overall;
            return;
        }

        // wrap around into the next spatial dims
        port.port_offset[dim] = overall - max;
        for sp_dim in dim + 1..=last_dim {
            port.port_offset[sp_dim] += t.spatial_strides[sp_dim];
            if port.port_offset[sp_dim] == t.roi_size[sp_dim] {
                // past the last dim only padding is read
                if sp_dim < last_dim {
                    port.port_offset[sp_dim] = 0;
                }
            } else {
                assert!(
                    port.port_offset[sp_dim] < t.roi_size[sp_dim],
                    "expected offset to be inside ROI"
                );
                break;
            }
        }
    }

    fn set_port_batch_offset(&self, operand: InternalOperand, batch_idx: u32, port: &mut PortAttr) {
        let geo = self.geo;
        if !geo.supports_concurrency() {
            return;
        }
        let mut dim = geo.concurrent_dim();
        if geo.is_operand_broadcasted(operand, dim) {
            return;
        }
        let mut offset = batch_idx as i64;
        if self.params.is_dedw() && operand == A {
            offset *= self.params.conv.dilation[dim - DIM_S] as i64;
            dim -= 1;
        }
        port.port_offset[dim] += offset;
    }

    /// Each B port of a gemm transpose holds one row of the unit matrix
    fn unit_matrix_offsets(&self) -> PortGrid {
        let cores = self.geo.cores_per_mme() as usize;
        let sp_ports = self.geo.core_spatial_ports(B) as usize;
        let mut grid = PortGrid::new([cores, 1, 1, 1, sp_ports]);
        for core in 0..cores {
            for sp in 0..sp_ports {
                grid.get_mut(core, 0, 0, 0, sp).port_offset[1] -= (core * sp_ports + sp) as i64;
            }
        }
        grid
    }

    fn set_port_offsets(&mut self, operand: InternalOperand) {
        self.set_mme_offset(operand);
        let base = self.base_port(operand);

        if operand == B && self.params.op_type == OpType::GemmTranspose {
            self.ports[B as usize] = self.unit_matrix_offsets();
            return;
        }

        let geo = self.geo;
        let cores = geo.cores_per_mme() as usize;
        let fcd_ports = geo.core_fcd_ports(operand) as usize;
        let sp_ports = geo.core_spatial_ports(operand) as usize;
        let batch_ports = geo.core_batch_ports(operand) as usize;
        let cd_ports = geo.core_cd_ports(operand) as usize;
        let fcd_size = self.single_port_fcd_size(operand) as i64;

        let mut grid = PortGrid::new([cores, cd_ports, batch_ports, fcd_ports, sp_ports]);
        for core in 0..cores {
            let mut core_base = base;
            self.set_core_offset(operand, core, &mut core_base);
            for cd in 0..cd_ports {
                for batch in 0..batch_ports {
                    for fcd in 0..fcd_ports {
                        for sp in 0..sp_ports {
                            let port = grid.get_mut(core, cd, batch, fcd, sp);
                            let pos = [cd, batch, fcd, sp].map(|p| p as u32);
                            if geo.is_port_valid(operand, core, pos[0], pos[1], pos[2], pos[3]) {
                                *port = core_base;
                                port.port_offset[GEMM_DIM_W] += fcd as i64 * fcd_size;
                                self.set_port_spatial_offset(operand, sp as u32, port);
                                self.set_port_batch_offset(operand, batch as u32, port);
                            } else {
                                port.port_offset[MAX_TENSOR_DIMS - 1] = INVALID_PORT_OFFSET;
                            }
                            trace!(
                                "{:?} port core={} cd={} batch={} fcd={} sp={}: {:?}",
                                operand,
                                core,
                                cd,
                                batch,
                                fcd,
                                sp,
                                port.port_offset
                            );
                        }
                    }
                }
            }
        }
        self.ports[operand as usize] = grid;
    }

    fn multiply_strides(&mut self, operand: InternalOperand) {
        let geo = self.geo;
        let is_dedw = self.params.is_dedw();
        let t = &mut self.tensors[operand as usize];
        t.spatial_strides[geo.sp_interleaving_dim(operand)] *=
            geo.interleaved_spatial_ports_nr(operand) as i64;
        if geo.supports_concurrency() {
            let mut dim = geo.concurrent_dim();
            if operand == A && is_dedw {
                // batch moves A spatially
                dim -= 1;
            }
            t.loop_stride[dim] *= geo.geometry_concurrency() as i64;
        }
    }

    /// Scale every element count by the view strides and apply the
    /// sub-problem offset
    fn finalize_sizes(&mut self, operand: InternalOperand) {
        if operand == B && self.params.op_type == OpType::GemmTranspose {
            return;
        }
        let strides = self.recipe.operand(operand).strides;
        let start_offset_mode = self.geo.is_port_start_offset(operand);
        let address_offset = self.address_offset[operand as usize] as i64;

        let t = &mut self.tensors[operand as usize];
        for dim in 0..MAX_TENSOR_DIMS {
            let stride = strides[dim] as i64;
            t.spatial_strides[dim] *= stride;
            t.roi_size[dim] *= stride;
            t.valid_elements[dim] *= stride;
            t.base_offset[dim] *= stride;
            t.start_offset[dim] *= stride;
            t.loop_stride[dim] *= stride;
        }
        if start_offset_mode {
            t.base_offset[0] += address_offset;
        } else {
            t.start_offset[0] += address_offset;
        }

        for port in self.ports[operand as usize].ports.iter_mut() {
            for dim in 0..MAX_TENSOR_DIMS {
                port.port_offset[dim] *= strides[dim] as i64;
            }
        }
    }

    // --- loop association ---

    fn set_associated_dim_and_size(
        &self,
        desc: &mut Descriptor,
        mask: LoopMask,
        size: u32,
        dim_a: usize,
        dim_b: usize,
        dim_out: usize,
    ) {
        assert!(size >= 1 && size - 1 <= u8::MAX as u32, "loop size {} out of range", size);
        let dims = AssociatedDims::new(dim_a, dim_b, dim_out);
        let size_minus1 = (size - 1) as u8;
        let conv_idx = match mask {
            LoopMask::Conv0 => 0,
            LoopMask::Conv1 => 1,
            LoopMask::Conv2 => 2,
            LoopMask::Conv3 => 3,
            LoopMask::Outer => {
                let outer = desc.outer_loop_mut();
                outer.size_minus1 = size_minus1;
                outer.associated_dims = dims;
                return;
            }
            _ => panic!("invalid loop mask {:?} for associated dims", mask),
        };
        let conv = desc.conv_mut();
        conv.kernel_size_minus1[conv_idx] = size_minus1;
        conv.associated_dims[conv_idx] = dims;
    }

    fn set_spatial_loop_size(&self, desc: &mut Descriptor, size: u32) {
        desc.set_num_iterations_minus1(size - 1);
    }

    fn set_partial_height_loops(&self, desc: &mut Descriptor, a: LoopMask, b: LoopMask) {
        let header = desc.header_mut();
        header.partial_height_loop_a = a.loop_bit();
        header.partial_height_loop_b = b.loop_bit();
    }

    fn set_associated_dims_dma(&self, desc: &mut Descriptor) {
        let geo = self.geo;
        let params = self.params;
        let batch_view = *self.recipe.cur_non_spatial();
        let fcd_view = *self.recipe.cur_fcd();
        let sp_view = *self.recipe.cur_sp();
        const NONE: usize = MAX_TENSOR_DIMS;
        let mut mask = LoopMask::Conv0;

        if params.op_type == OpType::GemmTranspose {
            // the first batch loop carries the virtual cd, so a 5 dim tensor
            // cannot be transposed
            assert_eq!(
                batch_view.sizes[GEMM_DIM_B3],
                1,
                "expected the last batch dim to be trivial"
            );
            let cd_steps = div_round_up(geo.mme_width(), geo.interleaved_spatial_ports_nr(B));
            self.set_associated_dim_and_size(desc, mask, cd_steps, NONE, 1, NONE);
            mask = mask.next();
        }

        let dense_steps = div_round_up(fcd_view.view_size, geo.geometry_width());
        let fcd_mask = mask;
        if geo.is_transposed(A) || params.is_gemm_dma() {
            self.set_associated_dim_and_size(desc, fcd_mask, dense_steps, 1, NONE, 0);
        } else {
            self.set_associated_dim_and_size(desc, fcd_mask, 1, 0, NONE, 0);
        }
        mask = mask.next();

        // memcpy covers the whole spatial dim in the gemm loop
        let spatial_steps = if params.op_type == OpType::Memcpy {
            1
        } else {
            div_round_up(
                self.fix_for_te_acceleration(C, sp_view.view_size, false),
                geo.geometry_height(),
            )
        };
        let sp_mask = mask;
        self.set_associated_dim_and_size(desc, sp_mask, spatial_steps, 0, NONE, 1);
        mask = mask.next();

        let max_batch = geo.batch_dims_nr();
        let mut batch_dim = 0;
        loop {
            if mask == LoopMask::Tetris {
                self.set_spatial_loop_size(desc, 1);
            } else if batch_dim < max_batch {
                let dim = batch_dim + 2;
                let size = if params.op_type == OpType::Memcpy {
                    1
                } else {
                    batch_view.sizes[dim]
                };
                self.set_associated_dim_and_size(desc, mask, size, dim, NONE, dim);
                batch_dim += 1;
            } else {
                self.set_associated_dim_and_size(desc, LoopMask::Outer, 1, NONE, NONE, NONE);
            }
            if mask == LoopMask::Outer {
                break;
            }
            mask = mask.next();
        }

        if params.is_gemm_dma() {
            self.set_partial_height_loops(desc, sp_mask, fcd_mask);
        } else {
            // a transpose swaps width and height
            self.set_partial_height_loops(desc, fcd_mask, LoopMask::Tetris);
        }
    }

    fn set_associated_dims_bgemm_dedw(&self, desc: &mut Descriptor) {
        let geo = self.geo;
        let params = self.params;
        const NONE: usize = MAX_TENSOR_DIMS;
        let batch_view = *self.recipe.cur_non_spatial();
        let mut batch_loops = [
            batch_view.sizes[GEMM_DIM_B1],
            batch_view.sizes[GEMM_DIM_B1 + 1],
            batch_view.sizes[GEMM_DIM_B3],
        ];
        if params.is_gemm() && geo.supports_concurrency() {
            let idx = geo.concurrent_dim() - GEMM_DIM_B1;
            batch_loops[idx] = div_round_up(batch_loops[idx], geo.geometry_concurrency());
        }

        let max_batch = geo.batch_dims_nr();
        let mut batch_mask = pattern_to_loop_mask(params.strategy.pattern, LoopDim::B);
        for (batch_dim, &loop_size) in batch_loops.iter().enumerate().take(max_batch) {
            let (dim_a, dim_b, mut dim_c);
            if params.is_dedw() {
                dim_a = batch_dim + 1;
                dim_b = NONE;
                dim_c = batch_dim + 2;
            } else {
                assert!(params.is_gemm(), "expected gemm operation");
                let dim = batch_dim + 2;
                dim_a = if self.recipe.operand(A).sizes[dim] == 1 { NONE } else { dim };
                dim_b = if self.recipe.operand(B).sizes[dim] == 1 { NONE } else { dim };
                dim_c = dim;
                // the virtual output dim takes the next loop
                if geo.is_mme_concurrency_routing_work_around() && geo.is_transposed(A) {
                    dim_c += 1;
                }
            }
            self.set_associated_dim_and_size(desc, batch_mask, loop_size, dim_a, dim_b, dim_c);
            if batch_dim + 1 < max_batch {
                batch_mask = batch_mask.next();
                if batch_mask == LoopMask::Tetris {
                    batch_mask = batch_mask.next();
                }
            }
        }

        let fcd_view = self.recipe.cur_fcd();
        let a_spatial = if params.is_dedw() {
            batch_view.sizes[1]
        } else {
            self.recipe.cur_sp().view_size
        };
        let dense_steps = div_round_up(fcd_view.view_size, geo.geometry_width());
        let spatial_steps = div_round_up(a_spatial, geo.geometry_height());

        let k_mask = pattern_to_loop_mask(params.strategy.pattern, LoopDim::K);
        assert_ne!(k_mask, LoopMask::Tetris, "kMask cannot be tetris loop");
        let b_dim = if geo.is_transposed(B) { 1 } else { 0 };
        self.set_associated_dim_and_size(desc, k_mask, dense_steps, NONE, b_dim, 0);

        let c_mask = pattern_to_loop_mask(params.strategy.pattern, LoopDim::C);
        assert_ne!(c_mask, LoopMask::Tetris, "cMask cannot be tetris loop");
        let a_dim = if geo.is_transposed(A) { 1 } else { 0 };
        self.set_associated_dim_and_size(desc, c_mask, spatial_steps, a_dim, NONE, 1);

        // no spatial loop in bgemm
        self.set_spatial_loop_size(desc, 1);
        self.set_partial_height_loops(desc, c_mask, k_mask);
    }

    fn set_associated_dims_fwd_dedx(&self, desc: &mut Descriptor) {
        let geo = self.geo;
        let params = self.params;
        const NONE: usize = MAX_TENSOR_DIMS;
        let conv_view = *self.recipe.cur_non_spatial();
        let weight_sizes = [conv_view.sizes[DIM_S], conv_view.sizes[DIM_R], conv_view.sizes[DIM_Q]];
        let memset = self.is_memset_desc();

        let mut filter_mask = pattern_to_loop_mask(params.strategy.pattern, LoopDim::F);
        for (conv_dim, &size) in weight_sizes.iter().enumerate() {
            if memset {
                self.set_associated_dim_and_size(desc, filter_mask, 1, NONE, NONE, NONE);
            } else {
                self.set_associated_dim_and_size(
                    desc,
                    filter_mask,
                    size,
                    conv_dim + 1,
                    conv_dim + 2,
                    NONE,
                );
            }
            if conv_dim + 1 < weight_sizes.len() {
                filter_mask = filter_mask.next();
            }
        }

        let dense_steps = div_round_up(self.recipe.cur_fcd().view_size, geo.geometry_width());
        let spatial_steps = div_round_up(self.recipe.cur_sp().view_size, geo.geometry_height());
        self.set_spatial_loop_size(desc, spatial_steps);

        let dense_mask = pattern_to_loop_mask(params.strategy.pattern, LoopDim::K);
        let b_dim = if geo.is_transposed(B) { WEIGHT_DIM_C } else { WEIGHT_DIM_K };
        self.set_associated_dim_and_size(desc, dense_mask, dense_steps, NONE, b_dim, WEIGHT_DIM_K);
        let unused = if dense_mask == LoopMask::Conv3 {
            LoopMask::Outer
        } else {
            LoopMask::Conv3
        };
        self.set_associated_dim_and_size(desc, unused, 1, NONE, NONE, NONE);

        self.set_partial_height_loops(desc, LoopMask::Tetris, dense_mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_grid_indexing() {
        let mut grid = PortGrid::new([2, 1, 1, 2, 4]);
        grid.get_mut(1, 0, 0, 1, 3).port_offset[0] = 7;
        assert_eq!(grid.get(1, 0, 0, 1, 3).port_offset[0], 7);
        assert_eq!(grid.iter().filter(|p| p.port_offset[0] == 7).count(), 1);
        assert_eq!(grid.shape(), [2, 1, 1, 2, 4]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_port_grid_bounds() {
        let grid = PortGrid::new([2, 1, 1, 1, 1]);
        grid.get(0, 0, 0, 1, 0);
    }

    #[test]
    fn test_invalid_port_marker() {
        let mut port = PortAttr::default();
        assert!(port.is_valid());
        port.port_offset[MAX_TENSOR_DIMS - 1] = INVALID_PORT_OFFSET;
        assert!(!port.is_valid());
    }
}
