//! Gaudi3 AGU back end. Each core has two SBs per input operand and a
//! single output port, so there is no routing table and no EU workaround.

use super::{
    config_tensor, config_tensor_params, sb_mask, to_roi_base_offset, AguConfigurator, CommonAgu,
};
use crate::descriptor::Descriptor;
use crate::geo_attr::GeoAttr;
use crate::hardware::Chip;
use crate::params::InternalOperand;
use crate::recipe::Recipe;
use crate::sub_problems::OffsetArray;

use InternalOperand::{A, B, C};

pub struct Gaudi3Agu;

impl AguConfigurator for Gaudi3Agu {
    fn chip(&self) -> Chip {
        Chip::Gaudi3
    }

    fn config(
        &self,
        desc: &mut Descriptor,
        recipe: &Recipe,
        geo: &GeoAttr,
        mme_idx: u32,
        address_offset: &OffsetArray,
    ) {
        assert_eq!(
            desc.chip(),
            Chip::Gaudi3,
            "gaudi3 AGU configuration on a {} descriptor",
            desc.chip()
        );
        let mut agu = CommonAgu::new(geo, recipe, mme_idx, *address_offset);
        agu.run(desc);

        for &operand in geo.operands() {
            config_tensor(desc, &agu, operand);
            config_ports(desc, &agu, operand);
            config_tensor_params(desc, &agu, operand);
        }

        let header = desc.header_mut();
        header.shuffle_a = shuffle_a_mode(geo);
        header.op_a_non_shared = geo.non_share_a_bit();
        header.sb_trans_a = geo.is_transposed(A);
        header.sb_trans_b = geo.operands().contains(&B) && geo.is_transposed(B);
    }
}

/// SBs an operand is served from, in logical port order
pub fn sb_indices(operand: InternalOperand, ports_nr: u32) -> &'static [usize] {
    const A_SBS: [usize; 2] = [0, 1];
    const B_SBS: [usize; 2] = [2, 3];
    let ports = ports_nr as usize;
    assert!((1..=2).contains(&ports), "invalid number of ports {}", ports_nr);
    match operand {
        A => &A_SBS[..ports],
        B => &B_SBS[..ports],
        C => {
            assert_eq!(ports, 1, "gaudi3 has a single output port per core");
            &[0]
        }
    }
}

fn config_ports(desc: &mut Descriptor, agu: &CommonAgu, operand: InternalOperand) {
    let geo = agu.geo();
    let sbs = sb_indices(operand, geo.core_ports_nr(operand));
    match operand {
        A => desc.header_mut().agu_reads_a = sb_mask(sbs),
        B => desc.header_mut().agu_reads_b = sb_mask(sbs),
        C => {}
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
                            desc.agu_out_mut(0, act_core)
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

/// Gaudi3 interleaves a transposed A only when the core reads it through
/// two spatial ports
fn shuffle_a_mode(geo: &GeoAttr) -> u8 {
    u8::from(geo.is_transposed(A) && geo.core_spatial_ports(A) == 2)
}
