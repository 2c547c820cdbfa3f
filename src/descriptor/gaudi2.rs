//! Gaudi2 descriptor layout

use serde::Serialize;

use super::bits::BitPacker;
use super::{
    AguCoreDesc, Brains, ConvDesc, EnableAndMask, Header, OuterLoop, PerfEvt, RateLimiter, SbRepeat,
    Spare, SyncObject, TensorDesc,
};
use crate::params::DataType;

pub const GAUDI2_DESC_SIZE: usize = 728;
pub const SB_NR: usize = 5;
pub const WB_NR: usize = 2;
pub const CORES_NR: usize = 2;

/// Byte offsets of the field groups
pub mod offsets {
    use super::{AguCoreDesc, TensorDesc};

    pub const BASE_ADDR_C_OUT1: usize = 0;
    pub const BASE_ADDR_C_OUT0: usize = 8;
    pub const BASE_ADDR_A: usize = 16;
    pub const BASE_ADDR_B: usize = 24;
    pub const BRAINS: usize = 32;
    pub const HEADER: usize = 40;
    pub const CTRL: usize = 48;
    pub const TENSOR_A: usize = 56;
    pub const TENSOR_B: usize = TENSOR_A + TensorDesc::SIZE;
    pub const TENSOR_C: usize = TENSOR_B + TensorDesc::SIZE;
    /// roiSize[0] inside a tensor descriptor
    pub const TENSOR_ROI_SIZE: usize = 40;
    pub const SYNC_OBJECT: usize = 320;
    pub const SO0_ADDR: usize = 324;
    pub const SO1_ADDR: usize = 332;
    pub const AGU_IN: usize = 340;
    pub const SPATIAL_SIZE_MINUS1_A: usize = 540;
    pub const SPATIAL_SIZE_MINUS1_B: usize = 544;
    pub const AGU_OUT: usize = 548;
    pub const SPATIAL_SIZE_MINUS1_COUT: usize = 628;
    pub const CONV: usize = 632;
    pub const OUTER_LOOP: usize = 644;
    pub const NUM_ITERATIONS_MINUS1: usize = 648;
    pub const SB_REPEAT: usize = 652;
    pub const FP8_BIAS: usize = 656;
    pub const RATE_LIMITER: usize = 660;
    pub const AXI_USER_DATA: usize = 664;
    pub const PERF_EVT_IN: usize = 668;
    pub const PERF_EVT_OUT: usize = 672;
    pub const PCU: usize = 676;
    pub const SLAVE_SO0_ADDR: usize = 680;
    pub const SLAVE_SO1_ADDR: usize = 684;
    pub const POWER_LOOP: usize = 688;
    pub const SPARE: usize = 692;
    pub const WKLD_ID: usize = 724;

    pub fn agu_in(sb: usize, core: usize) -> usize {
        AGU_IN + (sb * super::CORES_NR + core) * AguCoreDesc::SIZE
    }

    pub fn agu_out(wb: usize, core: usize) -> usize {
        AGU_OUT + (wb * super::CORES_NR + core) * AguCoreDesc::SIZE
    }
}

/// Selector of an EU input port. Ports 0..3 read A, 4..7 read B.
pub const fn sel_a(port: u8) -> u8 {
    port
}

pub const fn sel_b(port: u8) -> u8 {
    4 + port
}

/// Which AGU port feeds each suspension buffer of one EU, and which ports
/// are forwarded to the neighbour core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EuRouting {
    pub sb_en: [bool; SB_NR],
    pub in_en: [bool; 2],
    pub sb_sel: [u8; SB_NR],
    pub in_sel: [u8; 2],
    pub sb0_out_en: bool,
    pub sb2_out_en: bool,
    pub sb3_out_en: bool,
}

impl EuRouting {
    fn pack(&self, p: &mut BitPacker) {
        for en in self.sb_en {
            p.flag(en);
        }
        for en in self.in_en {
            p.flag(en);
        }
        for sel in self.sb_sel {
            p.field(sel as u64, 3);
        }
        for sel in self.in_sel {
            p.field(sel as u64, 3);
        }
        p.flag(self.sb0_out_en).flag(self.sb2_out_en).flag(self.sb3_out_en).reserved(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Fp8Bias {
    pub a: u8,
    pub b: u8,
    pub out: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AxiUserData {
    pub first: u16,
    pub steady: u16,
    pub mask: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PowerLoop {
    pub ctrl_mstr: u8,
    pub ctrl_slv: u8,
    pub md: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Gaudi2Desc {
    pub base_addr_c_out1: u64,
    pub base_addr_c_out0: u64,
    pub base_addr_a: u64,
    pub base_addr_b: u64,
    pub brains: Brains,
    pub header: Header,
    /// Indexed by core, master first
    pub eus: [EuRouting; CORES_NR],
    pub tensor_a: TensorDesc,
    pub tensor_b: TensorDesc,
    pub tensor_c: TensorDesc,
    pub sync_object: SyncObject,
    /// Indexed by suspension buffer, then core
    pub agu_in: [[AguCoreDesc; CORES_NR]; SB_NR],
    pub spatial_size_minus1_a: u32,
    pub spatial_size_minus1_b: u32,
    /// Indexed by write buffer, then core
    pub agu_out: [[AguCoreDesc; CORES_NR]; WB_NR],
    pub spatial_size_minus1_cout: u32,
    pub conv: ConvDesc,
    pub outer_loop: OuterLoop,
    pub num_iterations_minus1: u32,
    pub sb_repeat: SbRepeat,
    pub fp8_bias: Fp8Bias,
    pub rate_limiter: RateLimiter,
    pub axi_user_data: AxiUserData,
    pub perf_evt_in: PerfEvt,
    pub perf_evt_out: PerfEvt,
    pub pcu_rl_saturation: u32,
    pub power_loop: PowerLoop,
    pub spare: [Spare; 2],
    pub wkld_id: u32,
}

/// Hardware data type code
pub fn data_type_code(dt: DataType) -> Option<u8> {
    match dt {
        DataType::Fp16 => Some(0x8),
        DataType::Bf16 => Some(0x9),
        DataType::Fp32 => Some(0xa),
        DataType::Tf32 => Some(0xb),
        DataType::Fp8_143 => Some(0xc),
        DataType::Fp8_152 => Some(0xd),
        DataType::Fp32Ieee => Some(0xe),
        _ => None,
    }
}

fn is_fp8_code(code: u8) -> bool {
    code == 0xc || code == 0xd
}

fn pack_tensor(t: &TensorDesc, p: &mut BitPacker) {
    p.u32s(&t.valid_elements)
        .i32s(&t.loop_stride)
        .u32s(&t.roi_size)
        .u32s(&t.spatial_strides)
        .i32s(&t.start_offset);
}

fn pack_perf_evt(e: &PerfEvt, p: &mut BitPacker) {
    p.u16(e.value)
        .flag(e.rst)
        .flag(e.inc_en)
        .field(e.start_end_mask as u64, 2)
        .field(e.loop_mask as u64, 6)
        .field(e.operand as u64, 5)
        .flag(e.slave_sends_perf_event);
}

fn unset(mask: &mut [bool], offset: usize, len: usize) {
    mask[offset..offset + len].iter_mut().for_each(|b| *b = false);
}

impl Gaudi2Desc {
    fn pack_brains(&self, p: &mut BitPacker) {
        let b = &self.brains;
        let units: [&EnableAndMask; 6] =
            [&b.agu_a, &b.agu_b, &b.agu_out[0], &b.agu_out[1], &b.eu, &b.ap];
        for unit in units {
            unit.pack(p);
        }
        let h = &self.header;
        p.flag(h.dec_en)
            .field(h.shuffle_a as u64, 2)
            .flag(h.bgemm)
            .flag(h.clip_fp_eu)
            .flag(h.clip_fp_ap)
            .flag(h.sb_a_cache_en)
            .flag(h.sb_b_cache_en)
            .field(h.rounding_mode as u64, 3)
            .flag(h.relu_en)
            .flag(h.no_rollup)
            .flag(h.null_desc)
            .reserved(2);
    }

    fn pack_header(&self, p: &mut BitPacker) {
        let h = &self.header;
        p.flag(h.trans_a)
            .flag(h.trans_b)
            .flag(h.advance_a)
            .flag(h.advance_b)
            .flag(h.advance_c)
            .flag(h.lower_a)
            .flag(h.lower_b)
            .flag(h.accum_en);
        p.field(h.roll_accums as u64, 3).field(h.agu_reads_a as u64, 5);
        p.field(h.agu_reads_b as u64, 5)
            .flag(h.double_accums)
            .flag(h.store_en0)
            .flag(h.store_en1);
        p.field(h.data_type_in as u64, 4).field(h.data_type_out as u64, 4);
        p.flag(h.swap_base_and_offset_a)
            .flag(h.swap_base_and_offset_b)
            .flag(h.swap_base_and_offset_out)
            .reserved(5);
        p.flag(h.store_color_set0).flag(h.store_color_set1).flag(h.hx2).reserved(5);
        p.field(h.partial_height_loop_a as u64, 6).reserved(2);
        p.field(h.partial_height_loop_b as u64, 6)
            .flag(h.te_bypass_a)
            .flag(h.te_bypass_b);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut p = BitPacker::with_capacity(GAUDI2_DESC_SIZE);
        p.u64(self.base_addr_c_out1)
            .u64(self.base_addr_c_out0)
            .u64(self.base_addr_a)
            .u64(self.base_addr_b);
        self.pack_brains(&mut p);
        self.pack_header(&mut p);
        for eu in &self.eus {
            eu.pack(&mut p);
        }
        debug_assert_eq!(p.byte_pos(), offsets::TENSOR_A);
        for tensor in [&self.tensor_a, &self.tensor_b, &self.tensor_c] {
            pack_tensor(tensor, &mut p);
        }
        self.sync_object.pack_control(&mut p);
        self.sync_object.pack_objects(&mut p);
        debug_assert_eq!(p.byte_pos(), offsets::AGU_IN);
        for sb in &self.agu_in {
            for core in sb {
                core.pack(&mut p);
            }
        }
        p.u32(self.spatial_size_minus1_a).u32(self.spatial_size_minus1_b);
        for wb in &self.agu_out {
            for core in wb {
                core.pack(&mut p);
            }
        }
        p.u32(self.spatial_size_minus1_cout);
        self.conv.pack(&mut p);
        self.outer_loop.pack(&mut p);
        p.u32(self.num_iterations_minus1);
        self.sb_repeat.pack(&mut p);
        debug_assert_eq!(p.byte_pos(), offsets::FP8_BIAS);
        p.field(self.fp8_bias.a as u64, 4)
            .field(self.fp8_bias.b as u64, 4)
            .field(self.fp8_bias.out as u64, 5)
            .reserved(19);
        self.rate_limiter.pack(&mut p);
        p.field(self.axi_user_data.first as u64, 10)
            .field(self.axi_user_data.steady as u64, 10)
            .field(self.axi_user_data.mask as u64, 6)
            .reserved(6);
        pack_perf_evt(&self.perf_evt_in, &mut p);
        pack_perf_evt(&self.perf_evt_out, &mut p);
        p.field(self.pcu_rl_saturation as u64, 24).reserved(8);
        p.u32(self.sync_object.slave_so0_addr).u32(self.sync_object.slave_so1_addr);
        p.field(self.power_loop.ctrl_mstr as u64, 2)
            .field(self.power_loop.ctrl_slv as u64, 2)
            .u8(self.power_loop.md)
            .reserved(20);
        for spare in &self.spare {
            spare.pack(&mut p);
        }
        p.u32(self.wkld_id);
        let bytes = p.finish();
        assert_eq!(bytes.len(), GAUDI2_DESC_SIZE, "gaudi2 descriptor size mismatch");
        bytes
    }

    /// Bytes the engine reads. Unused output ports, disabled slave offsets,
    /// inactive sync objects and the fp8 bias of non-fp8 layers are masked
    /// out so that comparisons ignore them.
    pub fn valid_mask(&self) -> Vec<bool> {
        let mut mask = vec![true; GAUDI2_DESC_SIZE];
        let h = &self.header;
        let so = &self.sync_object;
        let store_en = [h.store_en0, h.store_en1];
        let signal_en = [so.signal_en0, so.signal_en1];

        let mut any_agu_out = false;
        for wb in 0..WB_NR {
            let unit = &self.brains.agu_out[wb];
            let used = store_en[wb] || signal_en[wb];
            for (core, en) in [unit.master_en, unit.slave_en].into_iter().enumerate() {
                if !en || !used {
                    unset(&mut mask, offsets::agu_out(wb, core), AguCoreDesc::SIZE);
                } else {
                    any_agu_out = true;
                }
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
            // the output roi width is still used by the EU
            let roi = offsets::TENSOR_C + offsets::TENSOR_ROI_SIZE;
            mask[roi..roi + 4].iter_mut().for_each(|b| *b = true);
        }
        if !self.brains.eu.slave_en {
            for sb in 0..SB_NR {
                unset(&mut mask, offsets::agu_in(sb, 1), AguCoreDesc::SIZE);
            }
            for wb in 0..WB_NR {
                unset(&mut mask, offsets::agu_out(wb, 1), AguCoreDesc::SIZE);
            }
        }
        if !is_fp8_code(h.data_type_in) && !is_fp8_code(h.data_type_out) {
            unset(&mut mask, offsets::FP8_BIAS, 4);
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
    use crate::descriptor::SyncObjectVal;

    #[test]
    fn test_size() {
        assert_eq!(Gaudi2Desc::default().to_bytes().len(), GAUDI2_DESC_SIZE);
    }

    #[test]
    fn test_field_offsets() {
        let mut desc = Gaudi2Desc::default();
        desc.base_addr_a = 0x1122_3344_5566_7788;
        desc.tensor_c.roi_size[0] = 0xabcd;
        desc.sync_object.so0_addr = 0x1000;
        desc.sync_object.so0_val = SyncObjectVal {
            value: 1,
            perf_en: false,
            op: SyncObjectVal::OP_ADD,
        };
        desc.agu_in[2][1].roi_base_offset[0] = -7;
        desc.spatial_size_minus1_cout = 63;
        desc.num_iterations_minus1 = 9;
        desc.sync_object.slave_so1_addr = 0x2000;
        desc.wkld_id = 42;
        let bytes = desc.to_bytes();

        assert_eq!(read_u32(&bytes, offsets::BASE_ADDR_A), 0x5566_7788);
        assert_eq!(read_u32(&bytes, 272), 0xabcd);
        assert_eq!(read_u32(&bytes, offsets::SO0_ADDR), 0x1000);
        assert_eq!(read_u32(&bytes, 328), 1 | (1 << 31));
        assert_eq!(read_u32(&bytes, offsets::agu_in(2, 1)) as i32, -7);
        assert_eq!(read_u32(&bytes, offsets::SPATIAL_SIZE_MINUS1_COUT), 63);
        assert_eq!(read_u32(&bytes, offsets::NUM_ITERATIONS_MINUS1), 9);
        assert_eq!(read_u32(&bytes, offsets::SLAVE_SO1_ADDR), 0x2000);
        assert_eq!(read_u32(&bytes, offsets::WKLD_ID), 42);
    }

    #[test]
    fn test_header_bits() {
        let mut desc = Gaudi2Desc::default();
        desc.header.trans_a = true;
        desc.header.roll_accums = 5;
        desc.header.store_en0 = true;
        desc.header.data_type_in = 0x9;
        desc.header.data_type_out = 0xa;
        desc.header.null_desc = true;
        let bytes = desc.to_bytes();
        let header = &bytes[offsets::HEADER..offsets::HEADER + 8];
        assert_eq!(header[0], 0b1);
        assert_eq!(header[1] & 0b111, 5);
        assert_eq!(header[2] & (1 << 6), 1 << 6);
        assert_eq!(header[3], 0xa9);
        // null desc is the 14th bit after the six unit bytes
        assert_eq!(bytes[offsets::BRAINS + 7] & (1 << 5), 1 << 5);
    }

    #[test]
    fn test_routing_packing() {
        let mut desc = Gaudi2Desc::default();
        desc.eus[1].sb_en[0] = true;
        desc.eus[1].sb_sel[0] = sel_b(1);
        let bytes = desc.to_bytes();
        let ctrl = read_u32(&bytes, offsets::CTRL + 4);
        assert_eq!(ctrl & 1, 1);
        assert_eq!((ctrl >> 7) & 0b111, 5);
    }

    #[test]
    fn test_valid_mask_hides_unused_outputs() {
        let mut desc = Gaudi2Desc::default();
        let mask = desc.valid_mask();
        assert!(!mask[offsets::BASE_ADDR_C_OUT0]);
        assert!(!mask[offsets::agu_out(0, 0)]);
        assert!(mask[offsets::TENSOR_C + offsets::TENSOR_ROI_SIZE]);
        assert!(!mask[offsets::TENSOR_C]);
        assert!(!mask[offsets::FP8_BIAS]);
        assert!(!mask[offsets::agu_in(0, 1)]);

        desc.header.store_en0 = true;
        desc.brains.agu_out[0] = EnableAndMask {
            loop_mask: 0,
            master_en: true,
            slave_en: true,
        };
        desc.brains.eu.slave_en = true;
        desc.header.data_type_in = 0xc;
        let mask = desc.valid_mask();
        assert!(mask[offsets::BASE_ADDR_C_OUT0]);
        assert!(!mask[offsets::BASE_ADDR_C_OUT1]);
        assert!(mask[offsets::agu_out(0, 1)]);
        assert!(!mask[offsets::agu_out(1, 0)]);
        assert!(mask[offsets::TENSOR_C]);
        assert!(mask[offsets::FP8_BIAS]);
        assert!(mask[offsets::agu_in(0, 1)]);
        assert!(!mask[offsets::SLAVE_SO0_ADDR]);
    }

    #[test]
    fn test_data_type_codes() {
        assert_eq!(data_type_code(DataType::Bf16), Some(0x9));
        assert_eq!(data_type_code(DataType::Fp8_152), Some(0xd));
        assert_eq!(data_type_code(DataType::Int8), None);
    }
}
