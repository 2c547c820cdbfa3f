//! Hardware descriptors
//!
//! A descriptor is the fixed-size instruction one MME executes. Both
//! generations share most field groups (brains, header, tensor descriptors,
//! AGU offsets, loops, sync objects, perf events) but place and pack them
//! differently, so the groups are defined once here and every generation
//! module owns its layout and `to_bytes` packing.
//!
//! `Descriptor` is the generation-tagged value the generator works on. Its
//! accessors cover the shared groups; generation-only fields are reached by
//! matching on the variant.

pub mod bits;
pub mod gaudi2;
pub mod gaudi3;

use serde::Serialize;

use crate::hardware::Chip;
use crate::params::{InternalOperand, LoopMask, TensorRole, MAX_TENSOR_DIMS};
use crate::recipe::{MultiDimSubView, SingleDimSubView};

use bits::BitPacker;
pub use gaudi2::{Gaudi2Desc, GAUDI2_DESC_SIZE};
pub use gaudi3::{Gaudi3Desc, GAUDI3_DESC_SIZE};

/// Loop control of one engine unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EnableAndMask {
    /// Loops the unit does not advance on
    pub loop_mask: u8,
    pub master_en: bool,
    pub slave_en: bool,
}

impl EnableAndMask {
    pub fn enabled(loop_mask: LoopMask) -> Self {
        Self {
            loop_mask: loop_mask.bits(),
            master_en: true,
            slave_en: true,
        }
    }

    fn pack(&self, p: &mut BitPacker) {
        p.field(self.loop_mask as u64, 6).flag(self.master_en).flag(self.slave_en);
    }
}

/// Brain enables of every unit. `agu_out[1]` and `agu_out_dma` only exist
/// on one generation each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Brains {
    pub agu_a: EnableAndMask,
    pub agu_b: EnableAndMask,
    pub agu_out: [EnableAndMask; 2],
    pub eu: EnableAndMask,
    pub ap: EnableAndMask,
    pub agu_out_dma: EnableAndMask,
}

/// Engine control bits. The two layouts spread these over their brains and
/// header words; fields a layout has no room for must stay at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Header {
    pub trans_a: bool,
    pub trans_b: bool,
    pub sb_trans_a: bool,
    pub sb_trans_b: bool,
    pub advance_a: bool,
    pub advance_b: bool,
    pub advance_c: bool,
    pub lower_a: bool,
    pub lower_b: bool,
    pub accum_en: bool,
    pub roll_accums: u8,
    pub agu_reads_a: u8,
    pub agu_reads_b: u8,
    pub double_accums: bool,
    pub store_en0: bool,
    pub store_en1: bool,
    pub data_type_in: u8,
    pub data_type_out: u8,
    pub swap_base_and_offset_a: bool,
    pub swap_base_and_offset_b: bool,
    pub swap_base_and_offset_out: bool,
    pub store_color_set0: bool,
    pub store_color_set1: bool,
    pub hx2: bool,
    pub partial_height_loop_a: u8,
    pub partial_height_loop_b: u8,
    pub te_bypass_a: bool,
    pub te_bypass_b: bool,
    pub te_accel_a: u8,
    pub dec_en: bool,
    pub shuffle_a: u8,
    pub bgemm: bool,
    pub clip_fp_eu: bool,
    pub clip_fp_ap: bool,
    pub sb_a_cache_en: bool,
    pub sb_b_cache_en: bool,
    pub rounding_mode: u8,
    pub relu_en: bool,
    pub no_rollup: bool,
    pub null_desc: bool,
    pub op_a_non_shared: bool,
    pub sftz_fp32_to_fp8: bool,
    pub wb_cache_en: bool,
    pub dual_gemm: bool,
    pub dma_mode: bool,
    pub ftz: bool,
}

/// Address generation of one operand. Index 0 of the per-dim arrays is the
/// fcd for `valid_elements` and `loop_stride` and the first spatial dim for
/// the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TensorDesc {
    pub valid_elements: [u32; MAX_TENSOR_DIMS],
    pub loop_stride: [i32; MAX_TENSOR_DIMS],
    pub roi_size: [u32; MAX_TENSOR_DIMS - 1],
    pub spatial_strides: [u32; MAX_TENSOR_DIMS - 1],
    pub start_offset: [i32; MAX_TENSOR_DIMS - 1],
}

impl TensorDesc {
    pub const SIZE: usize = 88;
}

/// Offsets of one port relative to its tensor base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AguCoreDesc {
    pub roi_base_offset: [i32; MAX_TENSOR_DIMS],
}

impl AguCoreDesc {
    pub const SIZE: usize = 20;

    fn pack(&self, p: &mut BitPacker) {
        p.i32s(&self.roi_base_offset);
    }
}

/// Tensor dims a loop advances per operand. `MAX_TENSOR_DIMS` means none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AssociatedDims {
    pub dim_a: u8,
    pub dim_b: u8,
    pub dim_out: u8,
}

impl AssociatedDims {
    pub const NONE: u8 = MAX_TENSOR_DIMS as u8;

    pub fn new(dim_a: usize, dim_b: usize, dim_out: usize) -> Self {
        Self {
            dim_a: dim_a as u8,
            dim_b: dim_b as u8,
            dim_out: dim_out as u8,
        }
    }

    fn pack(&self, p: &mut BitPacker) {
        p.field(self.dim_a as u64, 3)
            .field(self.dim_b as u64, 3)
            .field(self.dim_out as u64, 3)
            .reserved(7);
    }
}

impl Default for AssociatedDims {
    fn default() -> Self {
        Self::new(MAX_TENSOR_DIMS, MAX_TENSOR_DIMS, MAX_TENSOR_DIMS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConvDesc {
    pub kernel_size_minus1: [u8; 4],
    pub associated_dims: [AssociatedDims; 4],
}

impl ConvDesc {
    fn pack(&self, p: &mut BitPacker) {
        for size in self.kernel_size_minus1 {
            p.u8(size);
        }
        for dims in &self.associated_dims {
            dims.pack(p);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OuterLoop {
    pub associated_dims: AssociatedDims,
    pub size_minus1: u8,
}

impl OuterLoop {
    fn pack(&self, p: &mut BitPacker) {
        self.associated_dims.pack(p);
        p.u8(self.size_minus1).reserved(8);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SbRepeat {
    pub repeat_a_minus1: u8,
    pub repeat_b_minus1: u8,
    pub repeat_a_mask: u8,
    pub repeat_b_mask: u8,
}

impl SbRepeat {
    fn pack(&self, p: &mut BitPacker) {
        p.u8(self.repeat_a_minus1)
            .u8(self.repeat_b_minus1)
            .field(self.repeat_a_mask as u64, 6)
            .reserved(2)
            .field(self.repeat_b_mask as u64, 6)
            .reserved(2);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncObjectVal {
    pub value: u16,
    pub perf_en: bool,
    /// Zero writes the value, one adds it
    pub op: bool,
}

impl SyncObjectVal {
    pub const OP_ADD: bool = true;

    fn pack(&self, p: &mut BitPacker) {
        p.field(self.value as u64, 15).reserved(15).flag(self.perf_en).flag(self.op);
    }
}

/// Output signaling. The slave addresses live inside this group on Gaudi3
/// and after the PCU word on Gaudi2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncObject {
    pub signal_mask0: u8,
    pub signal_en0: bool,
    pub signal_mask1: u8,
    pub signal_en1: bool,
    pub master_wait_for_slave_fence: bool,
    pub slave_send_fence2master: bool,
    pub slave_signal_en: bool,
    pub slave0_use_slave_so_addr: bool,
    pub slave1_use_slave_so_addr: bool,
    pub slave0_use_master_so_addr_plus4: bool,
    pub slave1_use_master_so_addr_plus4: bool,
    pub so0_addr: u32,
    pub so0_val: SyncObjectVal,
    pub so1_addr: u32,
    pub so1_val: SyncObjectVal,
    pub slave_so0_addr: u32,
    pub slave_so1_addr: u32,
}

impl SyncObject {
    fn pack_control(&self, p: &mut BitPacker) {
        p.field(self.signal_mask0 as u64, 6)
            .flag(self.signal_en0)
            .reserved(1)
            .field(self.signal_mask1 as u64, 6)
            .flag(self.signal_en1)
            .flag(self.master_wait_for_slave_fence)
            .flag(self.slave_send_fence2master)
            .flag(self.slave_signal_en)
            .flag(self.slave0_use_slave_so_addr)
            .flag(self.slave1_use_slave_so_addr)
            .flag(self.slave0_use_master_so_addr_plus4)
            .flag(self.slave1_use_master_so_addr_plus4)
            .reserved(10);
    }

    fn pack_objects(&self, p: &mut BitPacker) {
        p.u32(self.so0_addr);
        self.so0_val.pack(p);
        p.u32(self.so1_addr);
        self.so1_val.pack(p);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PerfEvt {
    pub value: u16,
    pub rst: bool,
    pub inc_en: bool,
    pub start_end_mask: u8,
    pub loop_mask: u8,
    pub operand: u8,
    pub slave_sends_perf_event: bool,
}

impl PerfEvt {
    /// Emit the event at the start and at the end of the descriptor
    pub const START_END: u8 = 0b11;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RateLimiter {
    pub agu_a: u8,
    pub agu_b: u8,
    pub agu_out: u8,
    pub eu: u8,
}

impl RateLimiter {
    fn pack(&self, p: &mut BitPacker) {
        p.u8(self.agu_a).u8(self.agu_b).u8(self.agu_out).u8(self.eu);
    }
}

/// Free per-unit words, used for the debug workload id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Spare {
    pub values: [u16; 8],
}

impl Spare {
    fn pack(&self, p: &mut BitPacker) {
        for v in self.values {
            p.u16(v);
        }
    }
}

/// One hardware descriptor of either generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Descriptor {
    Gaudi2(Box<Gaudi2Desc>),
    Gaudi3(Box<Gaudi3Desc>),
}

macro_rules! with_desc {
    ($self:expr, $d:ident => $body:expr) => {
        match $self {
            Descriptor::Gaudi2($d) => $body,
            Descriptor::Gaudi3($d) => $body,
        }
    };
}

impl Descriptor {
    /// An all-zero descriptor of the given generation
    pub fn new_for(chip: Chip) -> Self {
        match chip {
            Chip::Gaudi2 => Descriptor::Gaudi2(Box::default()),
            Chip::Gaudi3 => Descriptor::Gaudi3(Box::default()),
        }
    }

    pub fn chip(&self) -> Chip {
        match self {
            Descriptor::Gaudi2(_) => Chip::Gaudi2,
            Descriptor::Gaudi3(_) => Chip::Gaudi3,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Descriptor::Gaudi2(_) => GAUDI2_DESC_SIZE,
            Descriptor::Gaudi3(_) => GAUDI3_DESC_SIZE,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        with_desc!(self, d => d.to_bytes())
    }

    /// Bytes the engine actually reads for this configuration
    pub fn valid_mask(&self) -> Vec<bool> {
        with_desc!(self, d => d.valid_mask())
    }

    pub fn header(&self) -> &Header {
        with_desc!(self, d => &d.header)
    }

    pub fn header_mut(&mut self) -> &mut Header {
        with_desc!(self, d => &mut d.header)
    }

    pub fn brains(&self) -> &Brains {
        with_desc!(self, d => &d.brains)
    }

    pub fn brains_mut(&mut self) -> &mut Brains {
        with_desc!(self, d => &mut d.brains)
    }

    pub fn tensor(&self, operand: InternalOperand) -> &TensorDesc {
        with_desc!(self, d => match operand {
            InternalOperand::A => &d.tensor_a,
            InternalOperand::B => &d.tensor_b,
            InternalOperand::C => &d.tensor_c,
        })
    }

    pub fn tensor_mut(&mut self, operand: InternalOperand) -> &mut TensorDesc {
        with_desc!(self, d => match operand {
            InternalOperand::A => &mut d.tensor_a,
            InternalOperand::B => &mut d.tensor_b,
            InternalOperand::C => &mut d.tensor_c,
        })
    }

    pub fn spatial_size_minus1(&self, operand: InternalOperand) -> u32 {
        with_desc!(self, d => match operand {
            InternalOperand::A => d.spatial_size_minus1_a,
            InternalOperand::B => d.spatial_size_minus1_b,
            InternalOperand::C => d.spatial_size_minus1_cout,
        })
    }

    pub fn set_spatial_size_minus1(&mut self, operand: InternalOperand, value: u32) {
        with_desc!(self, d => match operand {
            InternalOperand::A => d.spatial_size_minus1_a = value,
            InternalOperand::B => d.spatial_size_minus1_b = value,
            InternalOperand::C => d.spatial_size_minus1_cout = value,
        })
    }

    pub fn conv(&self) -> &ConvDesc {
        with_desc!(self, d => &d.conv)
    }

    pub fn conv_mut(&mut self) -> &mut ConvDesc {
        with_desc!(self, d => &mut d.conv)
    }

    pub fn outer_loop(&self) -> &OuterLoop {
        with_desc!(self, d => &d.outer_loop)
    }

    pub fn outer_loop_mut(&mut self) -> &mut OuterLoop {
        with_desc!(self, d => &mut d.outer_loop)
    }

    pub fn num_iterations_minus1(&self) -> u32 {
        with_desc!(self, d => d.num_iterations_minus1)
    }

    pub fn set_num_iterations_minus1(&mut self, value: u32) {
        with_desc!(self, d => d.num_iterations_minus1 = value)
    }

    pub fn sb_repeat_mut(&mut self) -> &mut SbRepeat {
        with_desc!(self, d => &mut d.sb_repeat)
    }

    pub fn sb_repeat(&self) -> &SbRepeat {
        with_desc!(self, d => &d.sb_repeat)
    }

    pub fn sync_object(&self) -> &SyncObject {
        with_desc!(self, d => &d.sync_object)
    }

    pub fn sync_object_mut(&mut self) -> &mut SyncObject {
        with_desc!(self, d => &mut d.sync_object)
    }

    pub fn perf_evt_in_mut(&mut self) -> &mut PerfEvt {
        with_desc!(self, d => &mut d.perf_evt_in)
    }

    pub fn perf_evt_out_mut(&mut self) -> &mut PerfEvt {
        with_desc!(self, d => &mut d.perf_evt_out)
    }

    pub fn perf_evt_in(&self) -> &PerfEvt {
        with_desc!(self, d => &d.perf_evt_in)
    }

    pub fn perf_evt_out(&self) -> &PerfEvt {
        with_desc!(self, d => &d.perf_evt_out)
    }

    pub fn rate_limiter_mut(&mut self) -> &mut RateLimiter {
        with_desc!(self, d => &mut d.rate_limiter)
    }

    pub fn spare_mut(&mut self) -> &mut [Spare; 2] {
        with_desc!(self, d => &mut d.spare)
    }

    pub fn wkld_id(&self) -> u32 {
        with_desc!(self, d => d.wkld_id)
    }

    pub fn set_wkld_id(&mut self, value: u32) {
        with_desc!(self, d => d.wkld_id = value)
    }

    pub fn base_addr_a(&self) -> u64 {
        with_desc!(self, d => d.base_addr_a)
    }

    /// Base addresses of A, B and output 0
    pub fn base_addrs(&self) -> [u64; 3] {
        with_desc!(self, d => [d.base_addr_a, d.base_addr_b, d.base_addr_c_out0])
    }

    /// Set the operand base addresses. Output 1 mirrors output 0.
    pub fn set_base_addrs(&mut self, a: u64, b: u64, c: u64) {
        with_desc!(self, d => {
            d.base_addr_a = a;
            d.base_addr_b = b;
            d.base_addr_c_out0 = c;
            d.base_addr_c_out1 = c;
        })
    }

    pub fn base_addr_out1(&self) -> u64 {
        with_desc!(self, d => d.base_addr_c_out1)
    }

    pub fn set_base_addr_out1(&mut self, addr: u64) {
        with_desc!(self, d => d.base_addr_c_out1 = addr)
    }

    /// Number of input suspension buffers per core
    pub fn sb_nr(&self) -> usize {
        match self {
            Descriptor::Gaudi2(_) => gaudi2::SB_NR,
            Descriptor::Gaudi3(_) => gaudi3::SB_NR,
        }
    }

    pub fn agu_in_mut(&mut self, sb: usize, core: usize) -> &mut AguCoreDesc {
        match self {
            Descriptor::Gaudi2(d) => &mut d.agu_in[sb][core],
            Descriptor::Gaudi3(d) => &mut d.agu_in[core][sb],
        }
    }

    pub fn agu_in(&self, sb: usize, core: usize) -> &AguCoreDesc {
        match self {
            Descriptor::Gaudi2(d) => &d.agu_in[sb][core],
            Descriptor::Gaudi3(d) => &d.agu_in[core][sb],
        }
    }

    /// Output AGU of a write buffer. Gaudi3 has a single write buffer.
    pub fn agu_out_mut(&mut self, wb: usize, core: usize) -> &mut AguCoreDesc {
        match self {
            Descriptor::Gaudi2(d) => &mut d.agu_out[wb][core],
            Descriptor::Gaudi3(d) => {
                assert_eq!(wb, 0, "gaudi3 has a single write buffer");
                &mut d.agu_out[core]
            }
        }
    }

    pub fn agu_out(&self, wb: usize, core: usize) -> &AguCoreDesc {
        match self {
            Descriptor::Gaudi2(d) => &d.agu_out[wb][core],
            Descriptor::Gaudi3(d) => &d.agu_out[core],
        }
    }

    pub fn wb_nr(&self) -> usize {
        match self {
            Descriptor::Gaudi2(_) => gaudi2::WB_NR,
            Descriptor::Gaudi3(_) => 1,
        }
    }

    /// Store is enabled on either output port
    pub fn is_store_en(&self) -> bool {
        let header = self.header();
        header.store_en0 || header.store_en1
    }

    /// Loop mask of the first output AGU
    pub fn agu_out_loop_mask(&self) -> u8 {
        self.brains().agu_out[0].loop_mask
    }

    /// Iterations of every loop that `mask` does not cover. Conv loops are
    /// bits 0-3, the tetris loop bit 4 and the outer loop bit 5.
    pub fn loop_iterations_outside(&self, mask: u8) -> u32 {
        let mut iterations = 1u32;
        for (dim, &size_minus1) in self.conv().kernel_size_minus1.iter().enumerate() {
            if mask & (1 << dim) == 0 {
                iterations *= size_minus1 as u32 + 1;
            }
        }
        if mask & LoopMask::Tetris.loop_bit() == 0 {
            iterations *= self.num_iterations_minus1() + 1;
        }
        if mask & LoopMask::Outer.loop_bit() == 0 {
            iterations *= self.outer_loop().size_minus1 as u32 + 1;
        }
        iterations
    }

    pub fn is_null_desc(&self) -> bool {
        self.header().null_desc
    }

    /// Lower-case hex dump, 32 bytes per line
    pub fn hex_dump(&self) -> Vec<String> {
        self.to_bytes()
            .chunks(32)
            .enumerate()
            .map(|(line, chunk)| {
                let hex: Vec<String> = chunk
                    .chunks(4)
                    .map(|w| w.iter().map(|b| format!("{:02x}", b)).collect())
                    .collect();
                format!("{:04x}: {}", line * 32, hex.join(" "))
            })
            .collect()
    }
}

/// One schedulable unit of work: a descriptor per master MME plus the
/// bookkeeping the scheduler needs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activation {
    pub descriptors: Vec<Descriptor>,
    pub is_gemm: bool,
    pub is_mask: bool,
    /// Indexed by `InternalOperand`
    pub operand_roles: [TensorRole; 3],
    pub num_signals: u32,
    pub num_tetrises: u32,
    pub num_rollups: u32,
    pub roi_x_skip: bool,
    pub roi_y_skip: bool,
    pub roi_w_skip: bool,
    #[serde(skip)]
    pub sp_view: SingleDimSubView,
    #[serde(skip)]
    pub fcd_view: SingleDimSubView,
    #[serde(skip)]
    pub non_spatial_view: MultiDimSubView,
}

impl Activation {
    pub fn new(descriptors: Vec<Descriptor>) -> Self {
        Self {
            descriptors,
            is_gemm: false,
            is_mask: false,
            operand_roles: [
                TensorRole::InputTensorA,
                TensorRole::InputTensorB,
                TensorRole::OutputTensorC,
            ],
            num_signals: 0,
            num_tetrises: 0,
            num_rollups: 0,
            roi_x_skip: false,
            roi_y_skip: false,
            roi_w_skip: false,
            sp_view: SingleDimSubView::default(),
            fcd_view: SingleDimSubView::default(),
            non_spatial_view: MultiDimSubView::default(),
        }
    }

    pub fn desc(&self, idx: usize) -> &Descriptor {
        &self.descriptors[idx]
    }

    pub fn desc_mut(&mut self, idx: usize) -> &mut Descriptor {
        &mut self.descriptors[idx]
    }

    pub fn num_descriptors(&self) -> usize {
        self.descriptors.len()
    }

    /// Packed bytes of every descriptor, in order
    pub fn to_bytes(&self) -> Vec<u8> {
        self.descriptors.iter().flat_map(|d| d.to_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_for_chip() {
        let g2 = Descriptor::new_for(Chip::Gaudi2);
        assert_eq!(g2.chip(), Chip::Gaudi2);
        assert_eq!(g2.to_bytes().len(), GAUDI2_DESC_SIZE);
        let g3 = Descriptor::new_for(Chip::Gaudi3);
        assert_eq!(g3.chip(), Chip::Gaudi3);
        assert_eq!(g3.to_bytes().len(), GAUDI3_DESC_SIZE);
    }

    #[test]
    fn test_shared_accessors_reach_both_layouts() {
        for chip in [Chip::Gaudi2, Chip::Gaudi3] {
            let mut desc = Descriptor::new_for(chip);
            desc.header_mut().store_en0 = true;
            desc.tensor_mut(InternalOperand::C).roi_size[0] = 64;
            desc.set_spatial_size_minus1(InternalOperand::C, 127);
            assert!(desc.is_store_en());
            assert_eq!(desc.tensor(InternalOperand::C).roi_size[0], 64);
            assert_eq!(desc.spatial_size_minus1(InternalOperand::C), 127);
        }
    }

    #[test]
    fn test_associated_dims_default_to_none() {
        let dims = AssociatedDims::default();
        assert_eq!(dims.dim_a, AssociatedDims::NONE);
        let mut p = BitPacker::with_capacity(4);
        dims.pack(&mut p);
        p.u16(0);
        let bytes = p.finish();
        // three 3-bit fields of 5
        assert_eq!(bits::read_u32(&bytes, 0) & 0x1ff, 5 | (5 << 3) | (5 << 6));
    }

    #[test]
    fn test_hex_dump_lines() {
        let desc = Descriptor::new_for(Chip::Gaudi3);
        let dump = desc.hex_dump();
        assert_eq!(dump.len(), GAUDI3_DESC_SIZE.div_ceil(32));
        assert!(dump[1].starts_with("0020: 00000000"));
    }
}
