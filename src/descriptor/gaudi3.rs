//! Gaudi3 descriptor layout

use serde::Serialize;

use super::bits::BitPacker;
use super::{
    AguCoreDesc, Brains, ConvDesc, Header, OuterLoop, PerfEvt, RateLimiter, SbRepeat, Spare,
    SyncObject, TensorDesc,
};
use crate::params::DataType;

pub const GAUDI3_DESC_SIZE: usize = 656;
pub const SB_NR: usize = 4;
pub const CORES_NR: usize = 2;

pub mod offsets {
    use super::{AguCoreDesc, TensorDesc};

    pub const BASE_ADDR_C_OUT1: usize = 0;
    pub const BASE_ADDR_C_OUT0: usize = 8;
    pub const BASE_ADDR_A: usize = 16;
    pub const BASE_ADDR_B: usize = 24;
    pub const BRAINS: usize = 32;
    pub const HEADER: usize = 40;
    pub const TENSOR_A: usize = 48;
    pub const TENSOR_B: usize = TENSOR_A + TensorDesc::SIZE;
    pub const TENSOR_C: usize = TENSOR_B + TensorDesc::SIZE;
    /// roiSize[0] inside a tensor descriptor
    pub const TENSOR_ROI_SIZE: usize = 20;
    pub const AGU_IN: usize = 312;
    pub const SPATIAL_SIZE_MINUS1_A: usize = 472;
    pub const SPATIAL_SIZE_MINUS1_B: usize = 476;
    pub const AGU_OUT: usize = 480;
    pub const SPATIAL_SIZE_MINUS1_COUT: usize = 520;
    pub const CONV: usize = 524;
    pub const OUTER_LOOP: usize = 536;
    pub const NUM_ITERATIONS_MINUS1: usize = 540;
    pub const SB_REPEAT: usize = 544;
    pub const SYNC_OBJECT: usize = 548;
    pub const SO0_ADDR: usize = 552;
    pub const SO1_ADDR: usize = 560;
    pub const SLAVE_SO0_ADDR: usize = 568;
    pub const SLAVE_SO1_ADDR: usize = 572;
    pub const NUMERICS: usize = 576;
    pub const AXI_AW_USER_DATA: usize = 580;
    pub const AXI_USER_DATA_A: usize = 584;
    pub const AXI_CACHE_DATA: usize = 596;
    pub const PERF_EVT_IN: usize = 600;
    pub const PERF_EVT_OUT: usize = 604;
    pub const PERF_EVT_EU: usize = 608;
    pub const RATE_LIMITER: usize = 612;
    pub const POWER: usize = 616;
    pub const SPARE: usize = 620;
    pub const WKLD_ID: usize = 652;

    pub fn agu_in(core: usize, sb: usize) -> usize {
        AGU_IN + (core * super::SB_NR + sb) * AguCoreDesc::SIZE
    }

    pub fn agu_out(core: usize) -> usize {
        AGU_OUT + core * AguCoreDesc::SIZE
    }
}

/// Exponent biases, flavors and special value handling of the operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Numerics {
    pub bias_a: u8,
    pub bias_b: u8,
    pub bias_out: u8,
    pub acc_rounding_mode: u8,
    pub fp8_flavor_a: bool,
    pub fp8_flavor_b: bool,
    pub fp8_flavor_out: bool,
    pub fp16_flavor_a: bool,
    pub fp16_flavor_b: bool,
    pub fp16_flavor_out: bool,
    pub inf_nan_mode_a: u8,
    pub inf_nan_mode_b: u8,
    pub inf_nan_mode_out: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AxiAwUserData {
    pub first: u16,
    pub steady: u16,
    pub mask: u8,
}

/// Memory-side attributes of one operand's transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AxiUserData {
    pub qos_first: u8,
    pub qos_steady: u8,
    pub qos_mask: u8,
    pub mcid: u16,
    pub clss: u8,
}

impl AxiUserData {
    fn pack(&self, p: &mut BitPacker) {
        p.field(self.qos_first as u64, 4)
            .field(self.qos_steady as u64, 4)
            .field(self.qos_mask as u64, 6)
            .u16(self.mcid)
            .field(self.clss as u64, 2);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AxiCacheData {
    pub agu_a: u8,
    pub agu_b: u8,
    pub agu_out: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Power {
    pub loop_ctrl: u8,
    pub loop_md: u8,
    pub pmu_rl_saturation: u32,
    pub sb_opp_dis_a: bool,
    pub sb_opp_dis_b: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Gaudi3Desc {
    pub base_addr_c_out1: u64,
    pub base_addr_c_out0: u64,
    pub base_addr_a: u64,
    pub base_addr_b: u64,
    pub brains: Brains,
    pub header: Header,
    pub tensor_a: TensorDesc,
    pub tensor_b: TensorDesc,
    pub tensor_c: TensorDesc,
    /// Indexed by core, then suspension buffer
    pub agu_in: [[AguCoreDesc; SB_NR]; CORES_NR],
    pub spatial_size_minus1_a: u32,
    pub spatial_size_minus1_b: u32,
    pub agu_out: [AguCoreDesc; CORES_NR],
    pub spatial_size_minus1_cout: u32,
    pub conv: ConvDesc,
    pub outer_loop: OuterLoop,
    pub num_iterations_minus1: u32,
    pub sb_repeat: SbRepeat,
    pub sync_object: SyncObject,
    pub numerics: Numerics,
    pub axi_aw_user_data: AxiAwUserData,
    pub axi_user_data_a: AxiUserData,
    pub axi_user_data_b: AxiUserData,
    pub axi_user_data_cout: AxiUserData,
    pub axi_cache_data: AxiCacheData,
    pub perf_evt_in: PerfEvt,
    pub perf_evt_out: PerfEvt,
    pub perf_evt_eu: PerfEvt,
    pub rate_limiter: RateLimiter,
    pub power: Power,
    pub spare: [Spare; 2],
    pub wkld_id: u32,
}

pub fn data_type_code(dt: DataType) -> Option<u8> {
    match dt {
        DataType::Fp16 => Some(0x8),
        DataType::Bf16 => Some(0x9),
        DataType::Fp32 | DataType::Fp32Ieee => Some(0xa),
        DataType::Tf32 => Some(0xb),
        DataType::Fp8_143 | DataType::Fp8_152 => Some(0xc),
        _ => None,
    }
}

fn pack_tensor(t: &TensorDesc, p: &mut BitPacker) {
    p.u32s(&t.valid_elements)
        .u32s(&t.roi_size)
        .u32s(&t.spatial_strides)
        .i32s(&t.start_offset)
        .i32s(&t.loop_stride);
}

fn pack_perf_evt(e: &PerfEvt, p: &mut BitPacker) {
    p.u16(e.value)
        .flag(e.rst)
        .flag(e.inc_en)
        .field(e.start_end_mask as u64, 2)
        .field(e.loop_mask as u64, 6)
        .field(e.operand as u64, 4)
        .flag(e.slave_sends_perf_event)
        .reserved(1);
}

fn unset(mask: &mut [bool], offset: usize, len: usize) {
    mask[offset..offset + len].iter_mut().for_each(|b| *b = false);
}

impl Gaudi3Desc {
    fn pack_header(&self, p: &mut BitPacker) {
        let h = &self.header;
        p.flag(h.trans_a)
            .flag(h.trans_b)
            .flag(h.sb_trans_a)
            .flag(h.sb_trans_b)
            .flag(h.advance_a)
            .flag(h.advance_b)
            .flag(h.advance_c)
            .flag(h.accum_en);
        p.flag(h.lower_a)
            .flag(h.lower_b)
            .field(h.roll_accums as u64, 3)
            .flag(h.store_en0)
            .flag(h.store_en1)
            .flag(h.relu_en);
        p.flag(h.double_accums)
            .flag(h.bgemm)
            .field(h.shuffle_a as u64, 1)
            .field(h.rounding_mode as u64, 3)
            .flag(h.no_rollup)
            .flag(h.null_desc);
        p.field(h.data_type_in as u64, 4).field(h.data_type_out as u64, 4);
        p.flag(h.swap_base_and_offset_a)
            .flag(h.swap_base_and_offset_b)
            .flag(h.swap_base_and_offset_out)
            .flag(h.op_a_non_shared)
            .flag(h.clip_fp_eu)
            .flag(h.clip_fp_ap)
            .flag(h.sb_a_cache_en)
            .flag(h.sb_b_cache_en);
        p.field(h.partial_height_loop_a as u64, 6)
            .flag(h.store_color_set0)
            .flag(h.store_color_set1);
        p.field(h.partial_height_loop_b as u64, 6)
            .flag(h.te_bypass_a)
            .flag(h.te_bypass_b);
        p.field(h.te_accel_a as u64, 3)
            .flag(h.sftz_fp32_to_fp8)
            .flag(h.wb_cache_en)
            .flag(h.dual_gemm)
            .flag(h.dma_mode)
            .flag(h.ftz);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut p = BitPacker::with_capacity(GAUDI3_DESC_SIZE);
        p.u64(self.base_addr_c_out1)
            .u64(self.base_addr_c_out0)
            .u64(self.base_addr_a)
            .u64(self.base_addr_b);
        let b = &self.brains;
        for unit in [&b.agu_a, &b.agu_b, &b.agu_out[0], &b.eu, &b.ap, &b.agu_out_dma] {
            unit.pack(&mut p);
        }
        p.reserved(16);
        self.pack_header(&mut p);
        debug_assert_eq!(p.byte_pos(), offsets::TENSOR_A);
        for tensor in [&self.tensor_a, &self.tensor_b, &self.tensor_c] {
            pack_tensor(tensor, &mut p);
        }
        for core in &self.agu_in {
            for sb in core {
                sb.pack(&mut p);
            }
        }
        p.u32(self.spatial_size_minus1_a).u32(self.spatial_size_minus1_b);
        for core in &self.agu_out {
            core.pack(&mut p);
        }
        p.u32(self.spatial_size_minus1_cout);
        self.conv.pack(&mut p);
        self.outer_loop.pack(&mut p);
        p.u32(self.num_iterations_minus1);
        self.sb_repeat.pack(&mut p);
        debug_assert_eq!(p.byte_pos(), offsets::SYNC_OBJECT);
        self.sync_object.pack_control(&mut p);
        self.sync_object.pack_objects(&mut p);
        p.u32(self.sync_object.slave_so0_addr).u32(self.sync_object.slave_so1_addr);

        let n = &self.numerics;
        p.field(n.bias_a as u64, 6)
            .field(n.bias_b as u64, 6)
            .field(n.bias_out as u64, 6)
            .field(n.acc_rounding_mode as u64, 2)
            .flag(n.fp8_flavor_a)
            .flag(n.fp8_flavor_b)
            .flag(n.fp8_flavor_out)
            .flag(n.fp16_flavor_a)
            .flag(n.fp16_flavor_b)
            .flag(n.fp16_flavor_out)
            .field(n.inf_nan_mode_a as u64, 2)
            .field(n.inf_nan_mode_b as u64, 2)
            .field(n.inf_nan_mode_out as u64, 2);
        p.field(self.axi_aw_user_data.first as u64, 11)
            .field(self.axi_aw_user_data.steady as u64, 11)
            .field(self.axi_aw_user_data.mask as u64, 6)
            .reserved(4);
        self.axi_user_data_a.pack(&mut p);
        self.axi_user_data_b.pack(&mut p);
        self.axi_user_data_cout.pack(&mut p);
        p.field(self.axi_cache_data.agu_a as u64, 4)
            .field(self.axi_cache_data.agu_b as u64, 4)
            .field(self.axi_cache_data.agu_out as u64, 4)
            .reserved(20);
        debug_assert_eq!(p.byte_pos(), offsets::PERF_EVT_IN);
        pack_perf_evt(&self.perf_evt_in, &mut p);
        pack_perf_evt(&self.perf_evt_out, &mut p);
        pack_perf_evt(&self.perf_evt_eu, &mut p);
        self.rate_limiter.pack(&mut p);
        p.field(self.power.loop_ctrl as u64, 2)
            .u8(self.power.loop_md)
            .field(self.power.pmu_rl_saturation as u64, 20)
            .flag(self.power.sb_opp_dis_a)
            .flag(self.power.sb_opp_dis_b);
        for spare in &self.spare {
            spare.pack(&mut p);
        }
        p.u32(self.wkld_id);
        let bytes = p.finish();
        assert_eq!(bytes.len(), GAUDI3_DESC_SIZE, "gaudi3 descriptor size mismatch");
        bytes
    }

    pub fn valid_mask(&self) -> Vec<bool> {
        let mut mask = vec![true; GAUDI3_DESC_SIZE];
        let h = &self.header;
        let so = &self.sync_object;
        let unit = &self.brains.agu_out[0];
        let used = h.store_en0 || h.store_en1 || so.signal_en0 || so.signal_en1;

        let mut any_agu_out = false;
        for (core, en) in [unit.master_en, unit.slave_en].into_iter().enumerate() {
            if !en || !used {
                unset(&mut mask, offsets::agu_out(core), AguCoreDesc::SIZE);
            } else {
                any_agu_out = true;
            }
        }
        if !h.store_en0 {
            unset(&mut mask, offsets::BASE_ADDR_C_OUT0, 8);
        }
        if !h.store_en1 {
            unset(&mut mask, offsets::BASE_ADDR_C_OUT1, 8);
        }
        if !any_agu_out || !(h.store_en0 || h.store_en1) {
            unset(&mut mask, offsets::TENSOR_C, TensorDesc::SIZE);
            let roi = offsets::TENSOR_C + offsets::TENSOR_ROI_SIZE;
            mask[roi..roi + 4].iter_mut().for_each(|b| *b = true);
        }
        if !self.brains.eu.slave_en {
            for sb in 0..SB_NR {
                unset(&mut mask, offsets::agu_in(1, sb), AguCoreDesc::SIZE);
            }
            unset(&mut mask, offsets::agu_out(1), AguCoreDesc::SIZE);
        }
        let low_precision = |code: u8| code == 0x8 || code == 0xc;
        if !low_precision(h.data_type_in) && !low_precision(h.data_type_out) {
            unset(&mut mask, offsets::NUMERICS, 4);
        }
        if !so.signal_en0 {
            unset(&mut mask, offsets::SO0_ADDR, 8);
        }
        if !so.signal_en1 {
            unset(&mut mask, offsets::SO1_ADDR, 8);
        }
        if !so.signal_en0 || !so.slave_signal_en || !so.slave0_use_slave_so_addr {
            unset(&mut mask, offsets::SLAVE_SO0_ADDR, 4);
        }
        if !so.signal_en1 || !so.slave_signal_en || !so.slave1_use_slave_so_addr {
            unset(&mut mask, offsets::SLAVE_SO1_ADDR, 4);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::bits::read_u32;

    #[test]
    fn test_size() {
        assert_eq!(Gaudi3Desc::default().to_bytes().len(), GAUDI3_DESC_SIZE);
    }

    #[test]
    fn test_field_offsets() {
        let mut desc = Gaudi3Desc::default();
        desc.tensor_c.roi_size[0] = 0x80;
        desc.tensor_a.loop_stride[4] = 3;
        desc.agu_in[0][3].roi_base_offset[1] = 11;
        desc.agu_out[1].roi_base_offset[0] = 5;
        desc.outer_loop.size_minus1 = 2;
        desc.sync_object.slave_so0_addr = 0x40;
        desc.axi_user_data_b.mcid = 0x1234;
        desc.perf_evt_eu.value = 7;
        desc.wkld_id = 3;
        let bytes = desc.to_bytes();

        assert_eq!(read_u32(&bytes, 244), 0x80);
        assert_eq!(read_u32(&bytes, offsets::TENSOR_A + 84), 3);
        assert_eq!(read_u32(&bytes, offsets::agu_in(0, 3) + 4), 11);
        assert_eq!(read_u32(&bytes, offsets::agu_out(1)), 5);
        assert_eq!((read_u32(&bytes, offsets::OUTER_LOOP) >> 16) & 0xff, 2);
        assert_eq!(read_u32(&bytes, offsets::SLAVE_SO0_ADDR), 0x40);
        assert_eq!((read_u32(&bytes, offsets::AXI_USER_DATA_A + 4) >> 14) & 0xffff, 0x1234);
        assert_eq!(read_u32(&bytes, offsets::PERF_EVT_EU) & 0xffff, 7);
        assert_eq!(read_u32(&bytes, offsets::WKLD_ID), 3);
    }

    #[test]
    fn test_header_bits() {
        let mut desc = Gaudi3Desc::default();
        desc.header.roll_accums = 3;
        desc.header.null_desc = true;
        desc.header.op_a_non_shared = true;
        desc.header.te_accel_a = 2;
        let bytes = desc.to_bytes();
        let header = &bytes[offsets::HEADER..offsets::HEADER + 8];
        assert_eq!((header[1] >> 2) & 0b111, 3);
        assert_eq!(header[2] >> 7, 1);
        assert_eq!(header[4], 1 << 3);
        assert_eq!(header[7] & 0b111, 2);
    }

    #[test]
    fn test_valid_mask() {
        let mut desc = Gaudi3Desc::default();
        desc.header.data_type_in = 0x9;
        desc.header.data_type_out = 0x9;
        let mask = desc.valid_mask();
        assert!(!mask[offsets::NUMERICS]);
        assert!(!mask[offsets::agu_in(1, 0)]);
        assert!(mask[offsets::agu_in(0, 0)]);
        assert!(!mask[offsets::agu_out(0)]);

        desc.header.data_type_out = 0x8;
        assert!(desc.valid_mask()[offsets::NUMERICS]);
    }
}
