//! Output signaling
//!
//! The engine increments a sync object when it finishes a unit of work.
//! The signaling mode decides what a unit is: nothing, the whole operation,
//! every descriptor, every storing descriptor, or every output write.

use crate::descriptor::{Descriptor, SyncObjectVal};
use crate::params::{LoopMask, SignalingMode};

/// Sync object values are 15 bits wide
const MAX_SIGNAL_AMOUNT: u32 = (1 << 15) - 1;

/// Stateless helper that writes and reads the signaling fields
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalingInfo;

impl SignalingInfo {
    /// Write the signal enables and masks of `desc`. Must run after the
    /// store enable and the output AGU loop mask are final.
    pub fn add_signal_info(
        &self,
        desc: &mut Descriptor,
        mode: SignalingMode,
        slave_signaling: bool,
        is_last: bool,
        squash_rois: bool,
        signal_amount: u32,
    ) {
        let store_en = desc.is_store_en();
        let out_mask = desc.agu_out_loop_mask();
        let outer = LoopMask::Outer.bits();
        let (signal_en, signal_mask) = match mode {
            SignalingMode::None => (false, 0),
            SignalingMode::Once => (is_last, outer),
            SignalingMode::Desc => (true, outer),
            SignalingMode::DescWithStore => (store_en, outer),
            SignalingMode::Chunk | SignalingMode::Output => {
                (store_en, if squash_rois { outer } else { out_mask })
            }
            SignalingMode::Partial => panic!("signal partial is not yet supported"),
        };
        assert!(
            signal_amount <= MAX_SIGNAL_AMOUNT,
            "signal amount {} does not fit the sync object",
            signal_amount
        );

        let so = desc.sync_object_mut();
        so.signal_en0 = signal_en;
        so.signal_mask0 = if signal_en { signal_mask } else { 0 };
        so.signal_en1 = so.signal_en0;
        so.signal_mask1 = so.signal_mask0;
        let value = SyncObjectVal {
            value: signal_amount as u16,
            perf_en: false,
            op: SyncObjectVal::OP_ADD,
        };
        so.so0_val = value;
        so.so1_val = value;

        if signal_en && slave_signaling {
            so.slave_signal_en = true;
            so.slave0_use_slave_so_addr = true;
            so.slave1_use_slave_so_addr = true;
            so.master_wait_for_slave_fence = false;
            so.slave_send_fence2master = false;
        } else {
            so.slave_signal_en = false;
            so.slave0_use_slave_so_addr = false;
            so.slave1_use_slave_so_addr = false;
            so.master_wait_for_slave_fence = signal_en;
            so.slave_send_fence2master = signal_en;
        }
    }

    /// Number of times `desc` increments its sync object
    pub fn count_signals(&self, desc: &Descriptor) -> u32 {
        let so = desc.sync_object();
        if !so.signal_en0 {
            return 0;
        }
        desc.loop_iterations_outside(so.signal_mask0)
    }

    /// Set the sync object addresses once they are known. Addresses of
    /// disabled signals are left untouched.
    pub fn patch_sync_object(
        &self,
        desc: &mut Descriptor,
        addr0: u32,
        addr1: u32,
        slave_addr0: u32,
        slave_addr1: u32,
    ) {
        let so = desc.sync_object_mut();
        if so.signal_en0 {
            so.so0_addr = addr0;
        }
        if so.signal_en1 {
            so.so1_addr = addr1;
        }
        if so.slave0_use_slave_so_addr {
            so.slave_so0_addr = slave_addr0;
        }
        if so.slave1_use_slave_so_addr {
            so.slave_so1_addr = slave_addr1;
        }
    }

    /// Outputs written to SRAM and to HBM signal on different color sets
    /// unless the layer asked for a single set
    pub fn patch_signal_coloring(
        &self,
        desc: &mut Descriptor,
        addr0_is_sram: bool,
        addr1_is_sram: bool,
        use_same_color_set: bool,
    ) {
        let header = desc.header_mut();
        if use_same_color_set {
            header.store_color_set0 = false;
            header.store_color_set1 = false;
        } else {
            header.store_color_set0 = !addr0_is_sram;
            header.store_color_set1 = !addr1_is_sram;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Chip;

    fn storing_desc(chip: Chip) -> Descriptor {
        let mut desc = Descriptor::new_for(chip);
        desc.header_mut().store_en0 = true;
        desc.brains_mut().agu_out[0].loop_mask = LoopMask::Conv2.bits();
        desc.conv_mut().kernel_size_minus1 = [1, 2, 1, 3];
        desc.set_num_iterations_minus1(4);
        desc.outer_loop_mut().size_minus1 = 1;
        desc
    }

    #[test]
    fn test_none_disables_signaling() {
        let mut desc = storing_desc(Chip::Gaudi2);
        SignalingInfo.add_signal_info(&mut desc, SignalingMode::None, false, true, false, 1);
        assert!(!desc.sync_object().signal_en0);
        assert_eq!(SignalingInfo.count_signals(&desc), 0);
    }

    #[test]
    fn test_once_signals_only_on_last() {
        let mut desc = storing_desc(Chip::Gaudi2);
        SignalingInfo.add_signal_info(&mut desc, SignalingMode::Once, false, false, false, 1);
        assert_eq!(SignalingInfo.count_signals(&desc), 0);
        SignalingInfo.add_signal_info(&mut desc, SignalingMode::Once, false, true, false, 1);
        assert_eq!(desc.sync_object().signal_mask0, LoopMask::Outer.bits());
        assert_eq!(SignalingInfo.count_signals(&desc), 1);
    }

    #[test]
    fn test_desc_with_store_follows_store() {
        let mut desc = storing_desc(Chip::Gaudi3);
        desc.header_mut().store_en0 = false;
        SignalingInfo.add_signal_info(
            &mut desc,
            SignalingMode::DescWithStore,
            false,
            false,
            false,
            1,
        );
        assert_eq!(SignalingInfo.count_signals(&desc), 0);
        SignalingInfo.add_signal_info(&mut desc, SignalingMode::Desc, false, false, false, 1);
        assert_eq!(SignalingInfo.count_signals(&desc), 1);
    }

    #[test]
    fn test_output_signals_per_write() {
        let mut desc = storing_desc(Chip::Gaudi2);
        SignalingInfo.add_signal_info(&mut desc, SignalingMode::Output, false, false, false, 2);
        let so = desc.sync_object();
        assert_eq!(so.signal_mask0, LoopMask::Conv2.bits());
        assert_eq!(so.signal_mask1, so.signal_mask0);
        assert_eq!(so.so0_val.value, 2);
        assert!(so.so0_val.op);
        assert!(so.master_wait_for_slave_fence);
        // conv3, tetris and outer loops are outside the mask
        assert_eq!(SignalingInfo.count_signals(&desc), 4 * 5 * 2);

        SignalingInfo.add_signal_info(&mut desc, SignalingMode::Output, false, false, true, 2);
        assert_eq!(SignalingInfo.count_signals(&desc), 1);
    }

    #[test]
    fn test_slave_signaling() {
        let mut desc = storing_desc(Chip::Gaudi2);
        SignalingInfo.add_signal_info(&mut desc, SignalingMode::Desc, true, false, false, 1);
        let so = desc.sync_object();
        assert!(so.slave_signal_en && so.slave0_use_slave_so_addr && so.slave1_use_slave_so_addr);
        assert!(!so.master_wait_for_slave_fence);

        SignalingInfo.patch_sync_object(&mut desc, 0x10, 0x14, 0x20, 0x24);
        let so = desc.sync_object();
        assert_eq!((so.so0_addr, so.so1_addr), (0x10, 0x14));
        assert_eq!((so.slave_so0_addr, so.slave_so1_addr), (0x20, 0x24));
    }

    #[test]
    fn test_patch_skips_disabled_signals() {
        let mut desc = storing_desc(Chip::Gaudi3);
        SignalingInfo.add_signal_info(&mut desc, SignalingMode::None, false, false, false, 1);
        SignalingInfo.patch_sync_object(&mut desc, 0x10, 0x14, 0x20, 0x24);
        assert_eq!(desc.sync_object().so0_addr, 0);
        assert_eq!(desc.sync_object().slave_so0_addr, 0);
    }

    #[test]
    #[should_panic(expected = "signal partial is not yet supported")]
    fn test_partial_is_fatal() {
        let mut desc = storing_desc(Chip::Gaudi2);
        SignalingInfo.add_signal_info(&mut desc, SignalingMode::Partial, false, false, false, 1);
    }

    #[test]
    fn test_signal_coloring() {
        let mut desc = Descriptor::new_for(Chip::Gaudi2);
        SignalingInfo.patch_signal_coloring(&mut desc, true, false, false);
        assert!(!desc.header().store_color_set0);
        assert!(desc.header().store_color_set1);
        SignalingInfo.patch_signal_coloring(&mut desc, true, false, true);
        assert!(!desc.header().store_color_set1);
    }
}
