//! Gaudi2 AGU back end: SB selection, EU input routing and the two
//! geometry workarounds of the Gaudi2 EU.

use log::debug;

use super::{
    config_tensor, config_tensor_params, sb_mask, to_roi_base_offset, AguConfigurator, CommonAgu,
};
use crate::descriptor::gaudi2::{sel_a, sel_b, EuRouting, Gaudi2Desc, CORES_NR};
use crate::descriptor::Descriptor;
use crate::geo_attr::{GeoAttr, MASTER_CORE};
use crate::hardware::Chip;
use crate::params::{
    div_round_up, InternalOperand, LoopMask, GEMM_DIM_H, GEMM_DIM_W, MAX_TENSOR_DIMS,
};
use crate::recipe::Recipe;
use crate::sub_problems::OffsetArray;

use InternalOperand::{A, B, C};

/// Half of the EU height, used when only the lower half holds valid rows
const HALF_EU_SPATIAL_SIZE_MINUS1: u32 = 63;

pub struct Gaudi2Agu;

impl AguConfigurator for Gaudi2Agu {
    fn chip(&self) -> Chip {
        Chip::Gaudi2
    }

    fn config(
        &self,
        desc: &mut Descriptor,
        recipe: &Recipe,
        geo: &GeoAttr,
        mme_idx: u32,
        address_offset: &OffsetArray,
    ) {
        let mut agu = CommonAgu::new(geo, recipe, mme_idx, *address_offset);
        agu.run(desc);

        for &operand in geo.operands() {
            config_tensor(desc, &agu, operand);
            config_ports(desc, &agu, operand);
            config_tensor_params(desc, &agu, operand);
        }

        let d = gaudi2_desc_mut(desc);
        d.header.shuffle_a = shuffle_a_mode(geo);
        configure_routing(d, geo);
        apply_workarounds(d, &agu);
    }
}

fn gaudi2_desc_mut(desc: &mut Descriptor) -> &mut Gaudi2Desc {
    match desc {
        Descriptor::Gaudi2(d) => &mut **d,
        Descriptor::Gaudi3(_) => panic!("gaudi2 AGU configuration on a gaudi3 descriptor"),
    }
}

/// SBs an operand is served from, in logical port order
pub fn sb_indices(operand: InternalOperand, ports_nr: u32) -> &'static [usize] {
    if operand == C {
        return &[0, 1];
    }
    match (ports_nr, operand) {
        (1, _) => &[0],
        (2, A) => &[0, 4],
        (2, _) => &[2, 3],
        (4, A) => &[2, 4, 3, 1],
        (4, _) => &[2, 3, 4, 1],
        _ => panic!("invalid number of ports {}", ports_nr),
    }
}

fn config_ports(desc: &mut Descriptor, agu: &CommonAgu, operand: InternalOperand) {
    let geo = agu.geo();
    let sbs = sb_indices(operand, geo.core_ports_nr(operand));
    if operand == A {
        desc.header_mut().agu_reads_a = sb_mask(sbs);
    } else if operand == B {
        desc.header_mut().agu_reads_b = sb_mask(sbs);
    }

    let grid = agu.ports(operand);
    let [cores, cd_ports, batch_ports, fcd_ports, sp_ports] = grid.shape();
    let swap = geo.should_swap_master_and_slave(operand);
    for core in 0..cores {
        let act_core = if swap { cores - 1 - core } else { core };
        let mut port_idx = 0;
        for cd in 0..cd_ports {
            for batch in 0..batch_ports {
                for fcd in 0..fcd_ports {
                    for sp in 0..sp_ports {
                        assert!(port_idx < sbs.len(), "more logical ports than SBs");
                        let offsets = to_roi_base_offset(grid.get(core, cd, batch, fcd, sp));
                        let target = if operand == C {
                            desc.agu_out_mut(sbs[port_idx], act_core)
                        } else {
                            desc.agu_in_mut(sbs[port_idx], act_core)
                        };
                        target.roi_base_offset = offsets;
                        port_idx += 1;
                    }
                }
            }
        }
    }
}

/// Interleaving order of transposed A ports inside the EU
fn shuffle_a_mode(geo: &GeoAttr) -> u8 {
    const SHUFFLE_NONE: u8 = 0;
    const SHUFFLE_2_PORTS: u8 = 1;
    const SHUFFLE_4_PORTS: u8 = 2;
    if !geo.is_transposed(A) {
        return SHUFFLE_NONE;
    }
    match geo.core_spatial_ports(A) {
        // a port shared between cores shows up as two ports in each core
        1 if geo.is_port_shared_between_cores(A) => SHUFFLE_2_PORTS,
        1 => SHUFFLE_NONE,
        2 => SHUFFLE_2_PORTS,
        4 => SHUFFLE_4_PORTS,
        n => panic!("unexpected number of A ports {}", n),
    }
}

/// Which operand, if any, shares its SBs between the two cores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedOperand {
    None,
    A,
    B,
}

/// Port layouts the EU wiring supports: input operands never share an SB
/// and only single port A or one/two port B can be shared between cores.
pub fn is_routable(a_ports: u32, b_ports: u32, shared: SharedOperand) -> bool {
    let valid = |ports| matches!(ports, 1 | 2 | 4);
    if !valid(a_ports) || !valid(b_ports) {
        return false;
    }
    let share_ok = match shared {
        SharedOperand::None => true,
        SharedOperand::A => a_ports == 1,
        SharedOperand::B => b_ports <= 2,
    };
    let a_sbs = sb_indices(A, a_ports);
    share_ok && !sb_indices(B, b_ports).iter().any(|sb| a_sbs.contains(sb))
}

/// EU routing of both cores. SBs 0 and 1 share an EU input, so at most one
/// of them is used or they are routed to the last EU input.
pub fn routing(a_ports: u32, b_ports: u32, shared: SharedOperand) -> [EuRouting; CORES_NR] {
    let mut sb_used = [false; 5];
    for &sb in sb_indices(A, a_ports).iter().chain(sb_indices(B, b_ports)) {
        sb_used[sb] = true;
    }

    let mut eus = [EuRouting::default(); CORES_NR];
    for (core, eu) in eus.iter_mut().enumerate() {
        let master = core == MASTER_CORE;
        eu.sb_en = sb_used;

        let shared_ports = match shared {
            SharedOperand::None => 0,
            SharedOperand::A => a_ports,
            SharedOperand::B => b_ports,
        };
        match shared_ports {
            0 => {
                eu.in_en = [false, false];
                eu.sb0_out_en = false;
                eu.sb2_out_en = false;
                eu.sb3_out_en = false;
            }
            1 => {
                eu.in_en = [true, false];
                eu.sb0_out_en = true;
                eu.sb2_out_en = false;
                eu.sb3_out_en = false;
            }
            2 => {
                eu.in_en = [true, true];
                eu.sb0_out_en = false;
                eu.sb2_out_en = true;
                eu.sb3_out_en = true;
            }
            n => panic!("expected sharing at most 2 ports, got {}", n),
        }

        match a_ports {
            4 => {
                eu.sb_sel[1] = sel_a(3);
                eu.sb_sel[2] = sel_a(0);
                eu.sb_sel[3] = sel_a(2);
                eu.sb_sel[4] = sel_a(1);
            }
            2 => {
                eu.sb_sel[0] = sel_a(0);
                eu.sb_sel[4] = sel_a(1);
            }
            1 if shared == SharedOperand::A => {
                eu.sb_sel[0] = if master { sel_a(0) } else { sel_a(1) };
                eu.in_sel[0] = if master { sel_a(1) } else { sel_a(0) };
            }
            1 => eu.sb_sel[0] = sel_a(0),
            n => panic!("invalid number of A ports {}", n),
        }

        match b_ports {
            4 => {
                eu.sb_sel[1] = sel_b(3);
                eu.sb_sel[2] = sel_b(0);
                eu.sb_sel[3] = sel_b(1);
                eu.sb_sel[4] = sel_b(2);
            }
            2 if shared == SharedOperand::B => {
                eu.sb_sel[2] = if master { sel_b(0) } else { sel_b(2) };
                eu.sb_sel[3] = if master { sel_b(1) } else { sel_b(3) };
                eu.in_sel[0] = if master { sel_b(2) } else { sel_b(0) };
                eu.in_sel[1] = if master { sel_b(3) } else { sel_b(1) };
            }
            2 => {
                eu.sb_sel[2] = sel_b(0);
                eu.sb_sel[3] = sel_b(1);
            }
            1 if shared == SharedOperand::B => {
                eu.sb_sel[0] = if master { sel_b(0) } else { sel_b(1) };
                eu.in_sel[0] = if master { sel_b(1) } else { sel_b(0) };
            }
            1 => eu.sb_sel[0] = sel_b(0),
            n => panic!("invalid number of B ports {}", n),
        }
    }
    eus
}

fn configure_routing(desc: &mut Gaudi2Desc, geo: &GeoAttr) {
    let a_shared = geo.is_port_shared_between_cores(A);
    let b_shared = geo.is_port_shared_between_cores(B);
    assert!(!(a_shared && b_shared), "cant share both input ports");
    let shared = if a_shared {
        SharedOperand::A
    } else if b_shared {
        SharedOperand::B
    } else {
        SharedOperand::None
    };
    let (a_ports, b_ports) = (geo.core_ports_nr(A), geo.core_ports_nr(B));
    assert!(
        is_routable(a_ports, b_ports, shared),
        "unsupported port layout a={} b={} shared={:?}",
        a_ports,
        b_ports,
        shared
    );
    desc.eus = routing(a_ports, b_ports, shared);
}

fn apply_workarounds(desc: &mut Gaudi2Desc, agu: &CommonAgu) {
    let geo = agu.geo();
    if geo.hx2_bit() && geo.mme_ports_nr(A) == 4 {
        let recipe = agu.recipe();
        let a_spatial = if agu.params().is_dedw() {
            recipe.cur_non_spatial().sizes[1]
        } else {
            recipe.cur_sp().view_size
        };
        set_fake_spatial_loop(desc, div_round_up(a_spatial, geo.geometry_height()));
    }
    if geo.is_mme_concurrency_routing_work_around() {
        add_virtual_dim(desc, agu);
    }
}

/// With 2xH and four A ports only the lower half of the EU holds valid
/// rows. Every step is marked as the last spatial step and the last step
/// reads half the EU height. The spatial loop is unused in dedw and bgemm,
/// so it takes the partial height role.
pub fn set_fake_spatial_loop(desc: &mut Gaudi2Desc, spatial_steps: u32) {
    if spatial_steps > 1 {
        debug!("fake spatial loop over {} spatial steps", spatial_steps);
        desc.header.partial_height_loop_a = LoopMask::Tetris.bits();
        desc.spatial_size_minus1_cout = HALF_EU_SPATIAL_SIZE_MINUS1;
    }
}

/// Interleaved valid and junk EU rows. A transposed A adds a virtual dim of
/// size 2 with one valid element; otherwise the output is written in blocks.
fn add_virtual_dim(desc: &mut Gaudi2Desc, agu: &CommonAgu) {
    let geo = agu.geo();
    let tensor = agu.tensor(C);
    let last = MAX_TENSOR_DIMS - 1;

    if geo.is_transposed(A) {
        // push every dim above the fcd one dim up
        let t = &mut desc.tensor_c;
        for dim in (GEMM_DIM_H + 1..=last).rev() {
            if dim < last {
                t.roi_size[dim] = t.roi_size[dim - 1];
            }
            t.valid_elements[dim] = t.valid_elements[dim - 1];
            t.loop_stride[dim] = t.loop_stride[dim - 1];
            t.spatial_strides[dim - 1] = t.spatial_strides[dim - 2];
            t.start_offset[dim - 1] = t.start_offset[dim - 2];
            for wb in desc.agu_out.iter_mut() {
                for core in wb.iter_mut() {
                    core.roi_base_offset[dim] = core.roi_base_offset[dim - 1];
                }
            }
        }

        t.roi_size[GEMM_DIM_H] = 2;
        t.spatial_strides[GEMM_DIM_H - 1] = 1;
        t.start_offset[GEMM_DIM_H - 1] = 0;
        t.valid_elements[GEMM_DIM_H] = 1;
        t.loop_stride[GEMM_DIM_H] = 0;
        // the slave's first row is junk, so it starts one row before the ROI
        for wb in desc.agu_out.iter_mut() {
            wb[1].roi_base_offset[GEMM_DIM_H] = -1;
        }
        // twice the rows per output port
        desc.spatial_size_minus1_cout = (desc.spatial_size_minus1_cout + 1) * 2 - 1;
    } else {
        let eu_height = geo.eu_height();
        desc.tensor_c.roi_size[GEMM_DIM_H] = eu_height * tensor.roi_size[GEMM_DIM_W] as u32;
        desc.spatial_size_minus1_cout = eu_height - 1;
        let row = desc.tensor_c.roi_size[GEMM_DIM_W] as i64;
        let te_height = geo.te_height() as i64;
        for wb in desc.agu_out.iter_mut() {
            for (core, agu_core) in wb.iter_mut().enumerate() {
                agu_core.roi_base_offset[GEMM_DIM_H] = (-te_height * core as i64 * row) as i32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::gaudi2::SB_NR;

    fn used_sels(eu: &EuRouting) -> Vec<u8> {
        let mut sels: Vec<u8> =
            (0..SB_NR).filter(|&sb| eu.sb_en[sb]).map(|sb| eu.sb_sel[sb]).collect();
        for i in 0..2 {
            if eu.in_en[i] {
                sels.push(eu.in_sel[i]);
            }
        }
        sels
    }

    #[test]
    fn test_sb_indices() {
        assert_eq!(sb_indices(C, 1), &[0, 1]);
        assert_eq!(sb_indices(A, 1), &[0]);
        assert_eq!(sb_indices(A, 2), &[0, 4]);
        assert_eq!(sb_indices(B, 2), &[2, 3]);
        assert_eq!(sb_indices(A, 4), &[2, 4, 3, 1]);
        assert_eq!(sb_indices(B, 4), &[2, 3, 4, 1]);
    }

    #[test]
    #[should_panic(expected = "invalid number of ports")]
    fn test_sb_indices_invalid() {
        sb_indices(A, 3);
    }

    #[test]
    fn test_routing_wide_a() {
        let eus = routing(4, 1, SharedOperand::None);
        let eu = &eus[0];
        assert_eq!(eu.sb_en, [true, true, true, true, true]);
        assert_eq!(eu.sb_sel[2], sel_a(0));
        assert_eq!(eu.sb_sel[4], sel_a(1));
        assert_eq!(eu.sb_sel[3], sel_a(2));
        assert_eq!(eu.sb_sel[1], sel_a(3));
        // B reads from SB0
        assert_eq!(eu.sb_sel[0], sel_b(0));
    }

    #[test]
    fn test_routing_shared_a_single_port() {
        let eus = routing(1, 2, SharedOperand::A);
        for (core, eu) in eus.iter().enumerate() {
            assert_eq!(eu.in_en, [true, false]);
            assert!(eu.sb0_out_en);
            let (own, other) = if core == MASTER_CORE { (0, 1) } else { (1, 0) };
            assert_eq!(eu.sb_sel[0], sel_a(own));
            assert_eq!(eu.in_sel[0], sel_a(other));
        }
    }

    #[test]
    fn test_routing_shared_b_two_ports() {
        let eus = routing(2, 2, SharedOperand::B);
        assert_eq!(eus[0].in_en, [true, true]);
        assert!(eus[0].sb2_out_en && eus[0].sb3_out_en && !eus[0].sb0_out_en);
        assert_eq!([eus[0].sb_sel[2], eus[0].sb_sel[3]], [sel_b(0), sel_b(1)]);
        assert_eq!([eus[0].in_sel[0], eus[0].in_sel[1]], [sel_b(2), sel_b(3)]);
        assert_eq!([eus[1].sb_sel[2], eus[1].sb_sel[3]], [sel_b(2), sel_b(3)]);
        assert_eq!([eus[1].in_sel[0], eus[1].in_sel[1]], [sel_b(0), sel_b(1)]);
    }

    #[test]
    fn test_routing_table_complete() {
        let mut routable = 0;
        for a in [1, 2, 4] {
            for b in [1, 2, 4] {
                for shared in [SharedOperand::None, SharedOperand::A, SharedOperand::B] {
                    if !is_routable(a, b, shared) {
                        continue;
                    }
                    routable += 1;
                    let a_sbs = sb_indices(A, a);
                    let b_sbs = sb_indices(B, b);
                    for eu in routing(a, b, shared).iter() {
                        // every enabled SB is fed from the operand that owns it
                        for sb in (0..SB_NR).filter(|&sb| eu.sb_en[sb]) {
                            let is_a = eu.sb_sel[sb] < sel_b(0);
                            let ctx = format!("sb{} for a={} b={} {:?}", sb, a, b, shared);
                            assert_eq!(is_a, a_sbs.contains(&sb), "{}", ctx);
                            assert_eq!(!is_a, b_sbs.contains(&sb), "{}", ctx);
                        }
                        // each EU input is driven exactly once
                        let sels = used_sels(eu);
                        let mut unique = sels.clone();
                        unique.sort_unstable();
                        unique.dedup();
                        assert_eq!(
                            unique.len(),
                            sels.len(),
                            "duplicate EU input for a={} b={} {:?}",
                            a,
                            b,
                            shared
                        );

                        // a port shared between cores feeds both cores' inputs
                        let expect = |ports: u32, op: SharedOperand| {
                            (if shared == op { ports * 2 } else { ports }) as usize
                        };
                        let a_inputs = sels.iter().filter(|&&s| s < sel_b(0)).count();
                        let b_inputs = sels.len() - a_inputs;
                        let ctx = format!("a={} b={} {:?}", a, b, shared);
                        assert_eq!(a_inputs, expect(a, SharedOperand::A), "{}", ctx);
                        assert_eq!(b_inputs, expect(b, SharedOperand::B), "{}", ctx);
                    }
                }
            }
        }
        // sym, 2xw, 4xw and 2xh layouts with their sharing variants
        assert_eq!(routable, 9);
    }

    #[test]
    fn test_routing_rejects_conflicting_sbs() {
        assert!(!is_routable(1, 1, SharedOperand::None));
        assert!(!is_routable(4, 4, SharedOperand::None));
        assert!(!is_routable(2, 4, SharedOperand::A));
        assert!(is_routable(1, 4, SharedOperand::A));
        assert!(is_routable(2, 2, SharedOperand::B));
    }

    #[test]
    fn test_fake_spatial_loop() {
        let mut desc = Gaudi2Desc::default();
        desc.spatial_size_minus1_cout = 127;
        set_fake_spatial_loop(&mut desc, 1);
        assert_eq!(desc.spatial_size_minus1_cout, 127);
        assert_eq!(desc.header.partial_height_loop_a, 0);

        set_fake_spatial_loop(&mut desc, 3);
        assert_eq!(desc.spatial_size_minus1_cout, 63);
        assert_eq!(desc.header.partial_height_loop_a, 31);
    }
}
