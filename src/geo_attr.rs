//! Geometry attributes
//!
//! `GeoAttr` derives, once per layer, how the operation is spread over the
//! chip: how many MMEs work along each axis, how the two cores of an MME
//! split the work, and how many ports every operand uses per core along the
//! fcd / spatial / batch / cd axes. Every later stage (recipe planning, AGU
//! configuration, SB reuse, descriptor fields) reads these facts and never
//! recomputes them.
//!
//! Port counts that fall outside {1, 2, 4} indicate a bug in the grid setup
//! and panic.

use log::debug;

use crate::agu::gaudi2::{is_routable, SharedOperand};
use crate::hardware::{Chip, MmeHal};
use crate::params::{
    div_round_up, BoolWithUndef, DataType, Geometry, InternalOperand, LayerParams, OpType, Operand,
    BATCH_DIMS_NR, DIM_B, DIM_R, DIM_S, DIM_W, GEMM_DIM_B1, GEMM_DIM_B2, GEMM_DIM_B3, GEMM_DIM_H,
    MAX_TENSOR_DIMS, WEIGHT_DIM_C,
};

/// Index of the master core inside an MME
pub const MASTER_CORE: usize = 0;
/// Index of the slave core inside an MME
pub const SLAVE_CORE: usize = 1;

/// Position or extent along the four axes the engine can split on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryGrid {
    pub fcd: u32,
    pub spatial: u32,
    pub batch: u32,
    pub cd: u32,
}

impl Default for GeometryGrid {
    fn default() -> Self {
        Self {
            fcd: 1,
            spatial: 1,
            batch: 1,
            cd: 1,
        }
    }
}

impl GeometryGrid {
    pub fn new(fcd: u32, spatial: u32, batch: u32, cd: u32) -> Self {
        Self { fcd, spatial, batch, cd }
    }

    /// All-zero position, the origin of a grid
    pub fn origin() -> Self {
        Self::new(0, 0, 0, 0)
    }

    pub fn size(&self) -> u32 {
        self.fcd * self.spatial * self.batch * self.cd
    }

    /// Position of a linear index inside this grid. The cd axis is the
    /// fastest, followed by batch, fcd and spatial.
    pub fn idx_to_grid(&self, idx: u32) -> GeometryGrid {
        let mut cur = idx;
        let cd = cur % self.cd;
        cur /= self.cd;
        let batch = cur % self.batch;
        cur /= self.batch;
        let fcd = cur % self.fcd;
        cur /= self.fcd;
        let spatial = cur % self.spatial;
        cur /= self.spatial;
        assert_eq!(cur, 0, "index {} is outside of grid {:?}", idx, self);
        GeometryGrid { fcd, spatial, batch, cd }
    }
}

#[derive(Debug, Clone)]
pub struct GeoAttr {
    params: LayerParams,
    hal: MmeHal,
    trans_a: bool,
    trans_b: bool,
    is_fp8: bool,
    mme_grid: GeometryGrid,
    core_grid: GeometryGrid,
    a_grid: GeometryGrid,
    b_grid: GeometryGrid,
    c_grid: GeometryGrid,
    four_xw_concurrency: bool,
    asym_port_config: bool,
    interleaved_cd_dim: usize,
    concurrent_dim: usize,
    primary_tensors: bool,
}

impl GeoAttr {
    pub fn new(params: &LayerParams, hal: &MmeHal) -> Self {
        let is_fp8 = params.operand(InternalOperand::A).element_type.is_fp8();
        let mut geo = Self {
            params: params.clone(),
            hal: *hal,
            trans_a: params.is_transposed(InternalOperand::A),
            trans_b: params.is_transposed(InternalOperand::B),
            is_fp8,
            mme_grid: GeometryGrid::default(),
            core_grid: GeometryGrid::default(),
            a_grid: GeometryGrid::default(),
            b_grid: GeometryGrid::default(),
            c_grid: GeometryGrid::default(),
            four_xw_concurrency: false,
            asym_port_config: false,
            interleaved_cd_dim: DIM_W,
            concurrent_dim: 0,
            primary_tensors: true,
        };
        geo.concurrent_dim = geo.default_concurrent_dim();
        geo.init();
        geo
    }

    fn init(&mut self) {
        assert!(
            !self.supports_concurrency()
                || (self.params.strategy.batch_concurrency_en != BoolWithUndef::Undefined
                    && self.params.strategy.cd_concurrency_en != BoolWithUndef::Undefined),
            "geometry requested while concurrency flags are undefined"
        );
        self.set_grids();
        self.set_chip_concurrency();
        self.interleaved_cd_dim = DIM_W;
        if self.supports_concurrency() && self.params.is_gemm() {
            self.concurrent_dim = self.concurrent_dim_for_gemm();
        }
        self.validate_port_counts();
    }

    fn validate_port_counts(&self) {
        for &operand in self.operands() {
            let grid = self.operand_grid(operand);
            let total = self.core_ports_nr(operand);
            for (axis, ports) in [("fcd", grid.fcd), ("spatial", grid.spatial), ("total", total)] {
                assert!(
                    matches!(ports, 1 | 2 | 4),
                    "invalid {} port count {} for operand {:?}",
                    axis,
                    ports,
                    operand
                );
            }
        }
    }

    pub fn params(&self) -> &LayerParams {
        &self.params
    }

    pub fn chip(&self) -> Chip {
        self.hal.chip
    }

    pub fn hal(&self) -> &MmeHal {
        &self.hal
    }

    /// Select whether broadcast queries look at the primary or the
    /// auxiliary (masked bgemm) tensors
    pub fn set_primary_tensors(&mut self, primary: bool) {
        self.primary_tensors = primary;
    }

    // --- grid setup ---

    fn reset_grids(&mut self) {
        self.mme_grid = GeometryGrid::default();
        self.core_grid = GeometryGrid::default();
        self.a_grid = GeometryGrid::default();
        self.b_grid = GeometryGrid::default();
        self.c_grid = GeometryGrid::default();
    }

    fn set_grids(&mut self) {
        self.reset_grids();
        self.asym_port_config = false;
        let limit = self.params.strategy.mme_limit.max(1);
        match self.chip() {
            Chip::Gaudi2 => match self.params.strategy.geometry {
                Geometry::Geo4xw => {
                    self.mme_grid.fcd = limit;
                    self.set_2xw_ports();
                }
                Geometry::Geo2xw => {
                    self.mme_grid.fcd = limit;
                    self.set_sym_ports();
                }
                Geometry::Geo2xh => {
                    self.mme_grid.spatial = limit;
                    self.set_sym_ports();
                }
                Geometry::Geo4xh => {
                    self.mme_grid.spatial = limit;
                    self.set_2xh_ports();
                }
            },
            Chip::Gaudi3 => {
                let (fcd, spatial) = match self.params.strategy.geometry {
                    Geometry::Geo4xw => (limit, 1),
                    Geometry::Geo2xw => {
                        let fcd = (limit / 2).max(1);
                        (fcd, limit / fcd)
                    }
                    Geometry::Geo2xh => {
                        let spatial = (limit / 2).max(1);
                        (limit / spatial, spatial)
                    }
                    Geometry::Geo4xh => (1, limit),
                };
                self.mme_grid.fcd = fcd;
                self.mme_grid.spatial = spatial;
                self.set_sym_ports();
                // a single output port per core
                self.c_grid = GeometryGrid::default();
            }
        }
    }

    fn set_2xw_ports(&mut self) {
        self.a_grid.fcd = 1;
        self.a_grid.spatial = 1;
        if self.trans_b {
            self.b_grid.fcd = 1;
            self.b_grid.spatial = 4;
        } else if self.is_fp8 {
            self.b_grid.fcd = 2;
            self.b_grid.spatial = 2;
        } else {
            self.b_grid.fcd = 4;
            self.b_grid.spatial = 1;
        }
        self.c_grid.fcd = 2;
        self.c_grid.spatial = 1;
        self.core_grid.fcd = 2;
        self.core_grid.spatial = 1;
    }

    fn set_2xh_ports(&mut self) {
        if self.trans_a {
            self.a_grid.fcd = 1;
            self.a_grid.spatial = 4;
        } else if self.is_fp8 {
            self.a_grid.fcd = 2;
            self.a_grid.spatial = 2;
        } else {
            self.a_grid.fcd = 4;
            self.a_grid.spatial = 1;
        }
        self.b_grid.fcd = 1;
        self.b_grid.spatial = 1;
        self.c_grid.fcd = 1;
        self.c_grid.spatial = 2;
        self.core_grid.fcd = 1;
        self.core_grid.spatial = 2;
    }

    fn set_sym_ports(&mut self) {
        let (fcd, spatial) = if self.trans_a || self.is_fp8 { (1, 2) } else { (2, 1) };
        self.a_grid.fcd = fcd;
        self.a_grid.spatial = spatial;
        let (fcd, spatial) = if self.trans_b || self.is_fp8 { (1, 2) } else { (2, 1) };
        self.b_grid.fcd = fcd;
        self.b_grid.spatial = spatial;
        self.c_grid.fcd = 2;
        self.c_grid.spatial = 1;
        self.core_grid.fcd = 1;
        self.core_grid.spatial = 2;
    }

    // --- concurrency ---

    /// Only bgemm and dedw can spread batches or the common dim over MMEs
    pub fn supports_concurrency(&self) -> bool {
        let p = &self.params;
        if !p.is_dedw() && !p.is_gemm() {
            return false;
        }
        if p.op_type == OpType::ReductionAdd || p.is_gemm_dma() {
            return false;
        }
        if p.is_dedw()
            && p.strategy.cd_concurrency_en == BoolWithUndef::TurnedOn
            && p.operand(InternalOperand::C).element_type.is_fp8()
        {
            return false;
        }
        true
    }

    fn set_chip_concurrency(&mut self) {
        if !self.supports_concurrency() {
            return;
        }
        let fcd = self.params.fcd_size();
        let sp = self.params.spatial_size();
        let cd_concurrency = self.params.strategy.cd_concurrency_en == BoolWithUndef::TurnedOn;

        while self.geometry_width() / 2 >= fcd && self.mme_grid.fcd > 1 {
            self.mme_grid.fcd /= 2;
            if cd_concurrency {
                self.mme_grid.cd *= 2;
            } else {
                self.mme_grid.batch *= 2;
            }
        }
        while self.geometry_height() / 2 >= sp && self.mme_grid.spatial > 1 {
            self.mme_grid.spatial /= 2;
            if cd_concurrency {
                self.mme_grid.cd *= 2;
            } else {
                self.mme_grid.batch *= 2;
            }
        }

        if self.mme_grid.spatial == 1 && self.mme_grid.fcd == 1 {
            self.set_mme_concurrency();
        }
    }

    fn set_mme_concurrency(&mut self) {
        if self.chip() == Chip::Gaudi3 {
            // Gaudi3 spreads batches over MMEs only
            return;
        }
        if self.params.is_gemm() {
            self.set_bgemm_concurrency();
        } else {
            assert!(self.params.is_dedw(), "unexpected op type {:?}", self.params.op_type);
            if self.params.strategy.batch_concurrency_en == BoolWithUndef::TurnedOn {
                self.set_dedw_concurrency();
            } else if self.params.strategy.cd_concurrency_en == BoolWithUndef::TurnedOn {
                self.set_cd_concurrency();
            }
        }
    }

    fn set_bgemm_4x(&mut self) {
        self.a_grid = GeometryGrid::new(1, 1, 2, 1);
        self.b_grid = GeometryGrid::new(1, 1, 2, 1);
        self.c_grid = GeometryGrid::new(1, 1, 2, 1);
        self.core_grid = GeometryGrid::new(1, 1, 2, 1);
    }

    fn set_bgemm_2x(&mut self) {
        self.c_grid.fcd = 1;
        self.c_grid.spatial = 2;
        self.core_grid.fcd = 1;
        self.core_grid.spatial = 1;
        self.core_grid.batch = 2;
    }

    fn set_bgemm_concurrency(&mut self) {
        let fcd = self.params.fcd_size();
        let sp = self.params.spatial_size();
        assert!(
            self.mme_grid.fcd == 1 && self.mme_grid.spatial == 1,
            "expected only batch or cd MMEs"
        );

        // two gemms per EU
        let b_port = self.port_size(InternalOperand::B);
        if fcd <= b_port && sp <= b_port {
            let b_view = self.params.operand(InternalOperand::B);
            let first_dim_dense = b_view.sizes[0] == b_view.strides[1];
            if !self.is_fp8 && first_dim_dense {
                self.set_bgemm_4x();
                return;
            }
        }

        if self.is_port_shared_between_cores(InternalOperand::A) {
            if fcd <= self.eu_width()
                && sp <= self.eu_height() / 2
                && self.params.operand(InternalOperand::C).sizes[GEMM_DIM_B3] == 1
            {
                assert_eq!(
                    self.params.strategy.geometry,
                    Geometry::Geo4xw,
                    "shared A concurrency is only expected in 4xw"
                );
                if !self.is_fp8 || self.trans_a {
                    self.core_grid.fcd = 1;
                    self.core_grid.batch = 2;
                    self.four_xw_concurrency = true;
                }
            }
        } else if self.is_port_shared_between_cores(InternalOperand::B) {
            if self.params.strategy.geometry == Geometry::Geo4xh {
                if fcd <= b_port && sp <= self.eu_height() && (!self.is_fp8 || self.trans_b) {
                    self.set_bgemm_2x();
                }
            } else if fcd <= self.eu_width() / 2 && sp <= self.eu_height() {
                self.set_bgemm_2x();
            }
        }
    }

    fn set_dedw_concurrency(&mut self) {
        if self.is_fp8 {
            return;
        }
        if self.mme_grid.fcd != 1 || self.mme_grid.spatial != 1 {
            self.set_grids();
            return;
        }

        let ports = (self.a_grid, self.b_grid, self.c_grid, self.core_grid);
        let fcd = self.params.fcd_size();
        let sp = self.params.spatial_size();
        while self.mme_fcd_ports(InternalOperand::A) > 1 {
            let a_fcd_ports = self.mme_fcd_ports(InternalOperand::A);
            let half_fcd = (a_fcd_ports / 2) * self.port_size(InternalOperand::A);
            if fcd <= self.eu_width() && sp <= half_fcd {
                if self.core_grid.spatial > 1 || self.core_grid.fcd > 1 {
                    self.core_grid = GeometryGrid::new(1, 1, 2, 1);
                } else {
                    self.a_grid.fcd /= 2;
                    self.a_grid.batch *= 2;
                }
            } else {
                break;
            }
        }

        if self.can_apply_asym_port_config() {
            self.asym_port_config = true;
        }

        if !self.has_routable_ports() {
            debug!("dedw batch concurrency leaves unroutable ports, keeping one batch per core");
            (self.a_grid, self.b_grid, self.c_grid, self.core_grid) = ports;
            self.asym_port_config = false;
        }
    }

    /// The Gaudi2 EU wiring can route the input ports of the current grids
    fn has_routable_ports(&self) -> bool {
        let a_shared = self.is_port_shared_between_cores(InternalOperand::A);
        let b_shared = self.is_port_shared_between_cores(InternalOperand::B);
        let shared = match (a_shared, b_shared) {
            (true, true) => return false,
            (true, false) => SharedOperand::A,
            (false, true) => SharedOperand::B,
            (false, false) => SharedOperand::None,
        };
        is_routable(
            self.core_ports_nr(InternalOperand::A),
            self.core_ports_nr(InternalOperand::B),
            shared,
        )
    }

    /// The MME has more input ports than SBs. When only part of the ports
    /// are actually used they can be arranged so no two used ports share an
    /// SB.
    fn can_apply_asym_port_config(&self) -> bool {
        if self.mme_grid.cd == 1 {
            return false;
        }
        let input_ports =
            self.mme_ports_nr(InternalOperand::A) + self.mme_ports_nr(InternalOperand::B);
        if input_ports <= self.hal.input_ports_per_mme {
            return false;
        }
        if self.core_ports_nr(InternalOperand::B) != 1 || self.trans_a {
            return false;
        }

        let sp = self.params.spatial_size();
        let fcd = self.params.fcd_size();
        let ports_per_batch = div_round_up(sp, self.port_size(InternalOperand::A));
        let fcd_ports_per_core = self.core_ports_nr(InternalOperand::A);
        let batch_size = self.params.operand(InternalOperand::C).sizes[self.concurrent_dim()];
        let effective_concurrency = self.geometry_concurrency().min(batch_size);
        let effective_ports = ports_per_batch * effective_concurrency;

        if effective_ports < self.a_grid.fcd {
            return false;
        }
        if fcd > self.port_size(InternalOperand::B) {
            return false;
        }
        if effective_ports >= 2 * fcd_ports_per_core {
            return false;
        }
        if effective_ports <= 2 * (fcd_ports_per_core - 1) {
            return true;
        }
        ports_per_batch > fcd_ports_per_core && ports_per_batch <= 2 * (fcd_ports_per_core - 1)
    }

    fn set_cd_concurrency(&mut self) {
        let fcd = self.params.fcd_size();
        let sp = self.params.spatial_size();
        if !self.is_port_shared_between_cores(InternalOperand::B) {
            return;
        }
        if fcd <= self.eu_width() / 2 {
            let remainder = sp % self.mme_height();
            if sp <= self.eu_height() || (remainder <= self.eu_height() && remainder > 0) {
                self.c_grid = GeometryGrid::default();
                self.core_grid = GeometryGrid::default();
                self.core_grid.cd = self.cores_per_mme();
                self.c_grid.spatial = 2;
            }
        }
        if !self.is_fp8
            && fcd <= self.port_size(InternalOperand::B)
            && sp <= self.port_size(InternalOperand::A)
        {
            self.a_grid = GeometryGrid::default();
            self.a_grid.spatial = 2;
            self.b_grid = GeometryGrid::default();
            self.b_grid.spatial = 2;
            self.c_grid = GeometryGrid::default();
            self.c_grid.cd = 2;
        }
    }

    fn default_concurrent_dim(&self) -> usize {
        if self.params.is_gemm() {
            if self.params.can_flatten() {
                GEMM_DIM_B2
            } else {
                GEMM_DIM_B1
            }
        } else if self.params.is_dma() {
            GEMM_DIM_B3
        } else if self.params.can_lower() {
            DIM_R
        } else {
            DIM_S
        }
    }

    /// Pick the batch dim that minimises the number of batch steps
    fn concurrent_dim_for_gemm(&self) -> usize {
        let concurrency = self.geometry_concurrency();
        let first = if self.params.can_flatten() { GEMM_DIM_B2 } else { GEMM_DIM_B1 };
        let last = self.batch_dims_nr() + GEMM_DIM_B1 - 1;
        let y = &self.params.y;
        let mut best_dim = first;
        let mut best_steps = u32::MAX;
        for dim in first..=last {
            let mut steps = div_round_up(y.sizes[dim], concurrency);
            for other in first..=last {
                if other != dim {
                    steps *= y.sizes[other];
                }
            }
            if steps < best_steps {
                best_dim = dim;
                best_steps = steps;
            }
        }
        best_dim
    }

    pub fn concurrent_dim(&self) -> usize {
        self.concurrent_dim
    }

    pub fn batch_dims_nr(&self) -> usize {
        if self.is_mme_concurrency_routing_work_around() && self.trans_a {
            BATCH_DIMS_NR - 1
        } else {
            BATCH_DIMS_NR
        }
    }

    /// The 4xw bgemm concurrency mode shares the A port between cores even
    /// though each core works on a different batch. The junk rows this
    /// produces are dropped by a virtual output dimension.
    pub fn is_mme_concurrency_routing_work_around(&self) -> bool {
        self.four_xw_concurrency
    }

    pub fn is_asym_port_config_mode(&self) -> bool {
        self.asym_port_config
    }

    // --- grids ---

    pub fn mme_grid(&self) -> GeometryGrid {
        self.mme_grid
    }

    pub fn core_grid(&self) -> GeometryGrid {
        self.core_grid
    }

    pub fn mme_nr(&self) -> u32 {
        self.mme_grid.size()
    }

    pub fn mme_idx_to_grid(&self, mme_idx: u32) -> GeometryGrid {
        self.mme_grid.idx_to_grid(mme_idx)
    }

    pub fn core_idx_to_grid(&self, core_idx: u32) -> GeometryGrid {
        self.core_grid.idx_to_grid(core_idx)
    }

    fn operand_grid(&self, operand: InternalOperand) -> GeometryGrid {
        match operand {
            InternalOperand::A => self.a_grid,
            InternalOperand::B => self.b_grid,
            InternalOperand::C => self.c_grid,
        }
    }

    /// Position of a core as seen by an operand's ports. Input ports may
    /// advance on a different axis than the output they feed.
    pub fn core_idx_to_effective_grid(
        &self,
        operand: InternalOperand,
        core_idx: u32,
    ) -> GeometryGrid {
        let mut grid = self.core_idx_to_grid(core_idx);
        if operand.is_input() {
            if self.do_port_advance_spatially(operand) {
                grid.spatial += grid.fcd;
                grid.fcd = 0;
            } else {
                grid.fcd += grid.spatial;
                grid.spatial = 0;
            }
            if self.core_grid.cd > 1 {
                assert!(
                    !self.is_transposed(operand),
                    "cd concurrency is not supported for transposed inputs"
                );
                grid.spatial += grid.cd;
                grid.cd = 0;
            }
            if operand == InternalOperand::B && self.is_port_shared_between_cores(operand) {
                if self.is_transposed(operand) {
                    grid.spatial += grid.batch;
                } else {
                    grid.fcd += grid.batch;
                }
                grid.batch = 0;
            }
        }
        grid
    }

    /// Number of cores an operand's ports span on each axis
    pub fn effective_core_grid(&self, operand: InternalOperand) -> GeometryGrid {
        let mut grid = self.core_idx_to_effective_grid(operand, self.cores_per_mme() - 1);
        grid.fcd += 1;
        grid.spatial += 1;
        grid.batch += 1;
        grid
    }

    // --- port counts ---

    pub fn core_fcd_ports(&self, operand: InternalOperand) -> u32 {
        self.operand_grid(operand).fcd
    }

    pub fn core_spatial_ports(&self, operand: InternalOperand) -> u32 {
        self.operand_grid(operand).spatial
    }

    pub fn core_batch_ports(&self, operand: InternalOperand) -> u32 {
        self.operand_grid(operand).batch
    }

    pub fn core_cd_ports(&self, operand: InternalOperand) -> u32 {
        self.operand_grid(operand).cd
    }

    pub fn core_ports_nr(&self, operand: InternalOperand) -> u32 {
        self.core_fcd_ports(operand)
            * self.core_spatial_ports(operand)
            * self.core_batch_ports(operand)
    }

    pub fn mme_fcd_ports(&self, operand: InternalOperand) -> u32 {
        self.core_fcd_ports(operand) * self.effective_core_grid(operand).fcd
    }

    pub fn mme_spatial_ports(&self, operand: InternalOperand) -> u32 {
        self.core_spatial_ports(operand) * self.effective_core_grid(operand).spatial
    }

    pub fn mme_batch_ports(&self, operand: InternalOperand) -> u32 {
        self.core_batch_ports(operand) * self.effective_core_grid(operand).batch
    }

    pub fn mme_ports_nr(&self, operand: InternalOperand) -> u32 {
        self.mme_fcd_ports(operand)
            * self.mme_spatial_ports(operand)
            * self.mme_batch_ports(operand)
    }

    pub fn chip_fcd_ports(&self, operand: InternalOperand) -> u32 {
        self.mme_fcd_ports(operand) * self.mme_grid.fcd
    }

    pub fn chip_spatial_ports(&self, operand: InternalOperand) -> u32 {
        self.mme_spatial_ports(operand) * self.mme_grid.spatial
    }

    pub fn chip_batch_ports(&self, operand: InternalOperand) -> u32 {
        self.mme_batch_ports(operand) * self.mme_grid.batch
    }

    pub fn chip_ports_nr(&self, operand: InternalOperand) -> u32 {
        self.chip_fcd_ports(operand)
            * self.chip_spatial_ports(operand)
            * self.chip_batch_ports(operand)
    }

    /// Number of ports that interleave spatially inside one MME
    pub fn mme_interleaved_spatial_ports_nr(&self, operand: InternalOperand) -> u32 {
        if self.is_spatially_interleaved_across_cores(operand) {
            self.mme_spatial_ports(operand)
        } else if self.is_spatially_interleaved_inside_core(operand) {
            self.core_spatial_ports(operand)
        } else {
            1
        }
    }

    /// Number of ports that interleave spatially over the whole chip
    pub fn interleaved_spatial_ports_nr(&self, operand: InternalOperand) -> u32 {
        if self.is_spatially_interleaved_across_mmes(operand) {
            self.mme_spatial_ports(operand) * self.spatial_mme_nr(operand)
        } else {
            self.mme_interleaved_spatial_ports_nr(operand)
        }
    }

    pub fn spatial_mme_nr(&self, operand: InternalOperand) -> u32 {
        match operand {
            InternalOperand::A => {
                if self.trans_a {
                    self.mme_grid.spatial
                } else {
                    self.mme_grid.cd
                }
            }
            InternalOperand::B => {
                if self.trans_b {
                    self.mme_grid.fcd
                } else {
                    self.mme_grid.cd
                }
            }
            InternalOperand::C => self.mme_grid.spatial,
        }
    }

    pub fn fcd_mme_nr(&self, operand: InternalOperand) -> u32 {
        match operand {
            InternalOperand::A | InternalOperand::B => {
                if self.is_transposed(operand) {
                    1
                } else {
                    self.mme_grid.fcd
                }
            }
            InternalOperand::C => self.mme_grid.fcd,
        }
    }

    pub fn spatial_cores_in_mme_nr(&self) -> u32 {
        self.core_grid.spatial
    }

    /// Spatial ports of a single core that feed the EU side by side
    pub fn core_spatial_eu_port(&self, operand: InternalOperand) -> u32 {
        if self.is_fp8 && !self.is_transposed(operand) {
            self.core_spatial_ports(operand)
        } else {
            1
        }
    }

    // --- sizes ---

    /// Elements a single port reads along its fcd
    pub fn port_size(&self, operand: InternalOperand) -> u32 {
        let cl = self.hal.cl_size;
        match (self.chip(), operand) {
            (Chip::Gaudi2, InternalOperand::C) => cl,
            (Chip::Gaudi2, _) => {
                if self.is_fp8 {
                    cl
                } else {
                    cl / 2
                }
            }
            (Chip::Gaudi3, InternalOperand::C) => 2 * cl,
            (Chip::Gaudi3, _) => {
                if self.is_fp8 {
                    2 * cl
                } else {
                    cl
                }
            }
        }
    }

    /// Contiguous elements a port pushes towards the EU
    pub fn eu_facing_port_size(&self, operand: InternalOperand) -> u32 {
        assert!(operand.is_input(), "expected an input operand");
        if self.is_transposed(operand) {
            self.te_height()
        } else {
            self.port_size(operand)
        }
    }

    pub fn te_height(&self) -> u32 {
        match self.chip() {
            Chip::Gaudi2 => self.hal.cl_size / 2,
            Chip::Gaudi3 => self.hal.cl_size,
        }
    }

    pub fn acc_height(&self) -> u32 {
        match self.chip() {
            Chip::Gaudi2 => self.hal.cl_size,
            Chip::Gaudi3 => 2 * self.hal.cl_size,
        }
    }

    /// Output rows of a full EU in one output port
    fn eu_rows_per_port(&self) -> u32 {
        self.acc_height()
    }

    pub fn eu_width(&self) -> u32 {
        let port = self.port_size(InternalOperand::C);
        if self.mme_concurrency() == 1 || self.is_operand_fully_broadcasted(InternalOperand::B) {
            return self.c_grid.fcd * port;
        }
        if self.trans_b {
            self.b_grid.spatial * self.te_height()
        } else {
            self.b_grid.fcd * self.port_size(InternalOperand::B)
        }
    }

    pub fn eu_height(&self) -> u32 {
        if self.double_accums_bit() {
            return self.acc_height() / 2;
        }
        if (self.mme_concurrency() == 1
            || self.is_operand_fully_broadcasted(InternalOperand::A)
            || self.four_xw_concurrency)
            && self.mme_cd_concurrency() == 1
        {
            return self.c_grid.spatial * self.eu_rows_per_port();
        }
        if self.trans_a {
            self.a_grid.spatial * self.te_height()
        } else {
            self.a_grid.fcd * self.port_size(InternalOperand::A)
        }
    }

    pub fn mme_width(&self) -> u32 {
        self.core_grid.fcd * self.eu_width()
    }

    pub fn mme_height(&self) -> u32 {
        self.core_grid.spatial * self.eu_height()
    }

    pub fn geometry_width(&self) -> u32 {
        self.mme_grid.fcd * self.mme_width()
    }

    pub fn geometry_height(&self) -> u32 {
        self.mme_grid.spatial * self.mme_height()
    }

    pub fn cores_per_mme(&self) -> u32 {
        self.hal.cores_per_mme
    }

    pub fn core_concurrency(&self) -> u32 {
        self.a_grid.batch.max(self.b_grid.batch)
    }

    pub fn mme_concurrency(&self) -> u32 {
        self.core_concurrency() * self.core_grid.batch
    }

    pub fn geometry_concurrency(&self) -> u32 {
        self.mme_grid.batch * self.mme_concurrency()
    }

    pub fn effective_batch_concurrency(&self) -> u32 {
        let concurrency = self.geometry_concurrency();
        if !self.asym_port_config {
            return concurrency;
        }
        let batch = self.params.operand(InternalOperand::C).sizes[self.concurrent_dim()];
        concurrency.min(batch)
    }

    pub fn core_cd_concurrency(&self) -> u32 {
        self.c_grid.cd
    }

    pub fn mme_cd_concurrency(&self) -> u32 {
        self.core_grid.cd * self.core_cd_concurrency()
    }

    pub fn geometry_cd_concurrency(&self) -> u32 {
        self.mme_grid.cd * self.mme_cd_concurrency()
    }

    // --- descriptor bits ---

    /// Two gemms share one EU
    pub fn bgemm_bit(&self) -> bool {
        self.c_grid.batch > 1 || self.c_grid.cd > 1
    }

    /// The output uses a single fcd port per MME
    pub fn hx2_bit(&self) -> bool {
        self.chip() == Chip::Gaudi2 && self.mme_fcd_ports(InternalOperand::C) == 1
    }

    pub fn double_accums_bit(&self) -> bool {
        match self.chip() {
            Chip::Gaudi2 => {
                if self.a_grid.batch > 1 && self.c_grid.batch == 1 {
                    return false;
                }
                self.bgemm_bit()
            }
            Chip::Gaudi3 => self.common_double_accums_bit(),
        }
    }

    /// Use half of the accumulators when the output is short enough
    fn common_double_accums_bit(&self) -> bool {
        if self.params.strategy.dual_gemm || self.params.is_native_dma() {
            return false;
        }
        let interleaving = if self.trans_a { InternalOperand::A } else { InternalOperand::C };
        let c = self.params.operand(InternalOperand::C);
        let c_sp = c.sizes[self.sp_interleaving_dim(InternalOperand::C)];
        if c_sp >= self.interleaved_spatial_ports_nr(interleaving) {
            return div_round_up(
                self.params.spatial_size(),
                self.interleaved_spatial_ports_nr(InternalOperand::C),
            ) <= self.acc_height() / 2;
        }
        false
    }

    /// Gaudi3 only: A is read by each core separately
    pub fn non_share_a_bit(&self) -> bool {
        !self.is_port_shared_between_cores(InternalOperand::A)
    }

    // --- operand queries ---

    pub fn is_fp8(&self) -> bool {
        self.is_fp8
    }

    pub fn is_transposed(&self, operand: InternalOperand) -> bool {
        match operand {
            InternalOperand::A => self.trans_a,
            InternalOperand::B => self.trans_b,
            InternalOperand::C => panic!("transposition is only defined for input operands"),
        }
    }

    /// Dimension the spatial ports of an operand interleave on
    pub fn sp_interleaving_dim(&self, operand: InternalOperand) -> usize {
        if operand.is_input() {
            self.interleaved_cd_dim
        } else {
            DIM_W
        }
    }

    pub fn is_operand_broadcasted(&self, operand: InternalOperand, dim: usize) -> bool {
        if self.params.is_dedw() && operand == InternalOperand::B {
            return true;
        }
        self.params.is_gemm()
            && self.params.operand_view(operand, self.primary_tensors).sizes[dim] == 1
            && self.params.operand(InternalOperand::C).sizes[dim] != 1
    }

    pub fn is_operand_fully_broadcasted(&self, operand: InternalOperand) -> bool {
        if !self.params.is_dedw_or_gemm() {
            return false;
        }
        (self.concurrent_dim()..MAX_TENSOR_DIMS)
            .all(|dim| self.is_operand_broadcasted(operand, dim))
    }

    pub fn last_spatial_dim(&self, operand: InternalOperand) -> usize {
        let p = &self.params;
        if p.is_gemm() {
            GEMM_DIM_H
        } else if p.is_conv() {
            match p.external_operand(operand) {
                Operand::W => WEIGHT_DIM_C,
                _ => DIM_B,
            }
        } else {
            DIM_B
        }
    }

    /// Ports carry their offsets in the start offset (inside the ROI)
    /// rather than in the base offset
    pub fn is_port_start_offset(&self, operand: InternalOperand) -> bool {
        let start = self.mme_interleaved_spatial_ports_nr(operand) > 1 && !self.params.is_gemm();
        let base =
            self.params.is_dedw() && self.mme_concurrency() > 1 && operand == InternalOperand::A;
        assert!(!(start && base), "cannot use both start and base port offsets");
        start
    }

    pub fn is_spatially_interleaved_across_mmes(&self, operand: InternalOperand) -> bool {
        if self.params.is_dma() {
            return false;
        }
        match operand {
            InternalOperand::A => true,
            InternalOperand::B => !self.trans_b,
            InternalOperand::C => self.trans_a,
        }
    }

    pub fn is_spatially_interleaved_across_cores(&self, operand: InternalOperand) -> bool {
        match operand {
            InternalOperand::A | InternalOperand::B => {
                self.is_spatially_interleaved_inside_core(operand)
            }
            InternalOperand::C => self.c_interleaved_across_cores(),
        }
    }

    fn c_interleaved_across_cores(&self) -> bool {
        let op_type = self.params.op_type;
        (self.trans_a && op_type != OpType::Trans) || op_type == OpType::Memcpy
    }

    pub fn is_spatially_interleaved_inside_core(&self, operand: InternalOperand) -> bool {
        match operand {
            InternalOperand::A => self.params.op_type != OpType::Trans,
            InternalOperand::B => !self.trans_b,
            InternalOperand::C => self.cores_per_mme() > 1 || self.c_interleaved_across_cores(),
        }
    }

    pub fn is_port_shared_between_cores(&self, operand: InternalOperand) -> bool {
        if operand == InternalOperand::A && self.four_xw_concurrency {
            return true;
        }
        if self.params.is_gemm() && self.mme_concurrency() > 1 {
            return false;
        }
        match operand {
            InternalOperand::A => {
                self.core_grid.fcd > 1
                    || (self.core_grid.batch > 1 && self.is_operand_fully_broadcasted(operand))
            }
            InternalOperand::B => {
                self.core_grid.spatial > 1
                    || (self.core_grid.batch > 1 && self.is_operand_fully_broadcasted(operand))
            }
            InternalOperand::C => panic!("output ports are never shared between cores"),
        }
    }

    pub fn do_port_advance_spatially(&self, operand: InternalOperand) -> bool {
        if self.is_transposed(operand) {
            return true;
        }
        if self.is_fp8 {
            let geometry = self.params.strategy.geometry;
            if operand == InternalOperand::A && geometry == Geometry::Geo4xw {
                return true;
            }
            if operand == InternalOperand::B && geometry == Geometry::Geo4xh {
                return true;
            }
        }
        false
    }

    pub fn is_port_valid(
        &self,
        operand: InternalOperand,
        core: usize,
        cd_idx: u32,
        batch_idx: u32,
        fcd_idx: u32,
        sp_idx: u32,
    ) -> bool {
        if !self.asym_port_config {
            return true;
        }
        assert_eq!(cd_idx, 0, "asymmetric port config expects a single cd port");
        if operand == InternalOperand::A {
            assert_eq!(sp_idx, 0, "asymmetric port config expects a single A spatial port");
        }
        if operand == InternalOperand::C {
            assert_eq!(fcd_idx, 0, "asymmetric port config expects a single C fcd port");
        }
        !(core == SLAVE_CORE && (batch_idx == 1 || fcd_idx >= 2))
    }

    pub fn should_swap_master_and_slave(&self, operand: InternalOperand) -> bool {
        self.asym_port_config && matches!(operand, InternalOperand::A | InternalOperand::C)
    }

    /// Operands the AGU configures: native DMA has no B
    pub fn operands(&self) -> &'static [InternalOperand] {
        if self.params.is_native_dma() {
            &[InternalOperand::A, InternalOperand::C]
        } else {
            &InternalOperand::ALL
        }
    }

    /// Elements the common dim has to be padded to for the reduction tree
    pub fn cd_dt_alignment(&self, data_type: DataType) -> u32 {
        if data_type.is_integer() {
            return 1;
        }
        4 / data_type.element_size().min(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TensorView;
    use pretty_assertions::assert_eq;

    fn bgemm_params(fcd: u32, sp: u32, cd: u32, batch: u32) -> LayerParams {
        let mut params = LayerParams::new(OpType::Ab);
        params.x = TensorView::dense(DataType::Bf16, [cd, sp, batch, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [fcd, cd, batch, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [fcd, sp, batch, 1, 1]);
        params.strategy.flatten_en = false;
        params
    }

    fn fwd_params() -> LayerParams {
        let mut params = LayerParams::new(OpType::Fwd);
        params.x = TensorView::dense(DataType::Bf16, [64, 32, 32, 1, 4]);
        params.w = TensorView::dense(DataType::Bf16, [128, 64, 3, 3, 1]);
        params.y = TensorView::dense(DataType::Bf16, [128, 30, 30, 1, 4]);
        params
    }

    #[test]
    fn test_idx_to_grid() {
        let grid = GeometryGrid::new(2, 2, 1, 2);
        assert_eq!(grid.idx_to_grid(0), GeometryGrid::origin());
        assert_eq!(grid.idx_to_grid(1), GeometryGrid::new(0, 0, 0, 1));
        assert_eq!(grid.idx_to_grid(2), GeometryGrid::new(1, 0, 0, 0));
        assert_eq!(grid.idx_to_grid(7), GeometryGrid::new(1, 1, 0, 1));
    }

    #[test]
    #[should_panic(expected = "outside of grid")]
    fn test_idx_outside_grid_panics() {
        GeometryGrid::new(2, 1, 1, 1).idx_to_grid(2);
    }

    #[test]
    fn test_gaudi2_2xh_geometry() {
        let geo = GeoAttr::new(&fwd_params(), &MmeHal::gaudi2());
        assert_eq!(geo.mme_grid(), GeometryGrid::new(1, 2, 1, 1));
        assert_eq!(geo.core_grid(), GeometryGrid::new(1, 2, 1, 1));
        assert_eq!(geo.eu_width(), 256);
        assert_eq!(geo.eu_height(), 128);
        assert_eq!(geo.geometry_width(), 256);
        assert_eq!(geo.geometry_height(), 512);
        assert_eq!(geo.core_ports_nr(InternalOperand::A), 2);
        assert!(geo.is_port_shared_between_cores(InternalOperand::B));
        assert!(!geo.is_port_shared_between_cores(InternalOperand::A));
        assert!(!geo.supports_concurrency());
    }

    #[test]
    fn test_gaudi2_4xh_has_hx2() {
        let mut params = fwd_params();
        params.strategy.geometry = Geometry::Geo4xh;
        let geo = GeoAttr::new(&params, &MmeHal::gaudi2());
        assert_eq!(geo.core_ports_nr(InternalOperand::A), 4);
        assert_eq!(geo.mme_fcd_ports(InternalOperand::C), 1);
        assert!(geo.hx2_bit());
        assert_eq!(geo.mme_ports_nr(InternalOperand::A), 8);
    }

    #[test]
    fn test_gaudi2_port_start_offset() {
        let geo = GeoAttr::new(&fwd_params(), &MmeHal::gaudi2());
        assert!(geo.is_port_start_offset(InternalOperand::A));
        let geo = GeoAttr::new(&bgemm_params(64, 64, 64, 1), &MmeHal::gaudi2());
        assert!(!geo.is_port_start_offset(InternalOperand::A));
    }

    #[test]
    fn test_gaudi2_bgemm_4x_concurrency() {
        let mut params = bgemm_params(64, 64, 64, 16);
        params.strategy.batch_concurrency_en = BoolWithUndef::TurnedOn;
        let geo = GeoAttr::new(&params, &MmeHal::gaudi2());
        assert!(geo.supports_concurrency());
        assert!(geo.bgemm_bit());
        assert!(geo.double_accums_bit());
        assert_eq!(geo.mme_concurrency(), 4);
        assert_eq!(geo.geometry_concurrency(), 8);
        assert_eq!(geo.concurrent_dim(), GEMM_DIM_B1);
    }

    #[test]
    fn test_gaudi2_4xw_routing_work_around() {
        let mut params = bgemm_params(200, 32, 64, 8);
        params.strategy.geometry = Geometry::Geo4xw;
        params.strategy.mme_limit = 1;
        params.strategy.batch_concurrency_en = BoolWithUndef::TurnedOn;
        let geo = GeoAttr::new(&params, &MmeHal::gaudi2());
        assert!(geo.is_mme_concurrency_routing_work_around());
        assert!(geo.is_port_shared_between_cores(InternalOperand::A));
        assert_eq!(geo.core_grid(), GeometryGrid::new(1, 1, 2, 1));
        assert_eq!(geo.batch_dims_nr(), BATCH_DIMS_NR - 1);
    }

    #[test]
    fn test_gaudi2_4xw_dedw_batch_concurrency_keeps_routable_ports() {
        let mut params = LayerParams::new(OpType::Dedw);
        params.x = TensorView::dense(DataType::Bf16, [16, 8, 8, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [16, 8, 8, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [16, 16, 1, 1, 1]);
        params.strategy.geometry = Geometry::Geo4xw;
        params.strategy.batch_concurrency_en = BoolWithUndef::TurnedOn;
        let geo = GeoAttr::new(&params, &MmeHal::gaudi2());
        assert!(geo.has_routable_ports());
        assert_eq!(geo.core_grid().batch, 1);
        assert_eq!(geo.mme_concurrency(), 1);
        assert!(!geo.is_port_shared_between_cores(InternalOperand::B));
    }

    #[test]
    fn test_gaudi3_geometry_splits_mmes() {
        let mut params = fwd_params();
        params.strategy.mme_limit = 8;
        params.strategy.geometry = Geometry::Geo2xh;
        let geo = GeoAttr::new(&params, &MmeHal::gaudi3());
        assert_eq!(geo.mme_nr(), 8);
        assert_eq!(geo.mme_grid().fcd, 2);
        assert_eq!(geo.mme_grid().spatial, 4);
        assert_eq!(geo.port_size(InternalOperand::A), 128);
        assert_eq!(geo.eu_width(), 256);
        assert!(!geo.hx2_bit());
    }

    #[test]
    fn test_gaudi3_chip_concurrency_on_small_gemm() {
        let mut params = bgemm_params(64, 64, 64, 32);
        params.strategy.mme_limit = 8;
        params.strategy.geometry = Geometry::Geo4xw;
        params.strategy.batch_concurrency_en = BoolWithUndef::TurnedOn;
        let geo = GeoAttr::new(&params, &MmeHal::gaudi3());
        assert_eq!(geo.mme_grid().fcd, 1);
        assert_eq!(geo.mme_grid().batch, 8);
        assert_eq!(geo.geometry_concurrency(), 8);
    }

    #[test]
    fn test_last_spatial_dim() {
        let geo = GeoAttr::new(&fwd_params(), &MmeHal::gaudi2());
        assert_eq!(geo.last_spatial_dim(InternalOperand::A), DIM_B);
        assert_eq!(geo.last_spatial_dim(InternalOperand::B), WEIGHT_DIM_C);
        let geo = GeoAttr::new(&bgemm_params(64, 64, 64, 1), &MmeHal::gaudi2());
        assert_eq!(geo.last_spatial_dim(InternalOperand::C), GEMM_DIM_H);
    }

    #[test]
    fn test_dedw_b_is_broadcasted() {
        let mut params = LayerParams::new(OpType::Dedw);
        params.x = TensorView::dense(DataType::Bf16, [64, 16, 16, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 16, 16, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [64, 64, 1, 1, 1]);
        let geo = GeoAttr::new(&params, &MmeHal::gaudi2());
        assert!(geo.is_operand_broadcasted(InternalOperand::B, DIM_S));
        assert!(geo.is_operand_fully_broadcasted(InternalOperand::B));
    }
}
