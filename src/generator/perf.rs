//! Perf events
//!
//! Trace events let the profiler stamp when an activation starts reading
//! and when it finishes writing. The event value is the context id, so it
//! can be patched after generation.

use crate::descriptor::{Activation, Descriptor, PerfEvt};
use crate::params::{LoopMask, TraceMode};

const START_MASK: u8 = 0b01;
const END_MASK: u8 = 0b10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceEngine {
    Input,
    Output,
    Eu,
}

/// Write the perf events of every descriptor. Activations without signals
/// are parts of a larger unit, so per descriptor tracing falls back to
/// layer tracing for them.
pub fn configure_perf_events(activations: &mut [Activation], trace_mode: TraceMode, ctx_id: u16) {
    if trace_mode == TraceMode::None {
        return;
    }
    let last_idx = activations.len().saturating_sub(1);
    for (idx, activation) in activations.iter_mut().enumerate() {
        let partial = activation.num_signals == 0;
        for desc in activation.descriptors.iter_mut() {
            set_desc_perf_event(desc, trace_mode, ctx_id, idx == 0, idx == last_idx, partial);
        }
    }
}

fn set_desc_perf_event(
    desc: &mut Descriptor,
    mut trace_mode: TraceMode,
    ctx_id: u16,
    first: bool,
    last: bool,
    partial: bool,
) {
    *desc.perf_evt_in_mut() = PerfEvt::default();
    *desc.perf_evt_out_mut() = PerfEvt::default();
    if partial && trace_mode == TraceMode::Desc {
        trace_mode = TraceMode::LayerAct;
    }

    match trace_mode {
        TraceMode::None => {}
        TraceMode::LayerAct => {
            if first {
                set_single_perf_event(desc, TraceEngine::Input, START_MASK, ctx_id);
            }
            if last {
                set_single_perf_event(desc, TraceEngine::Output, END_MASK, ctx_id);
            }
        }
        TraceMode::Desc => {
            set_single_perf_event(desc, TraceEngine::Input, START_MASK, ctx_id);
            set_single_perf_event(desc, TraceEngine::Output, END_MASK, ctx_id);
        }
        TraceMode::Advanced => {
            set_single_perf_event(desc, TraceEngine::Input, START_MASK | END_MASK, ctx_id);
            if matches!(desc, Descriptor::Gaudi3(_)) {
                set_single_perf_event(desc, TraceEngine::Eu, START_MASK | END_MASK, ctx_id);
            }
            set_single_perf_event(desc, TraceEngine::Output, START_MASK | END_MASK, ctx_id);
        }
    }
}

fn set_single_perf_event(
    desc: &mut Descriptor,
    engine: TraceEngine,
    start_end_mask: u8,
    ctx_id: u16,
) {
    // gaudi2 reports the output end once both ports are done
    let operand = match (engine, &*desc) {
        (TraceEngine::Output, Descriptor::Gaudi2(_)) => 0b11,
        _ => 0b01,
    };
    let event = PerfEvt {
        value: ctx_id,
        rst: true,
        inc_en: false,
        start_end_mask,
        loop_mask: LoopMask::Outer.bits(),
        operand,
        slave_sends_perf_event: true,
    };
    match engine {
        TraceEngine::Input => *desc.perf_evt_in_mut() = event,
        TraceEngine::Output => *desc.perf_evt_out_mut() = event,
        TraceEngine::Eu => match desc {
            Descriptor::Gaudi3(d) => d.perf_evt_eu = event,
            Descriptor::Gaudi2(_) => panic!("tracing for engine not supported"),
        },
    }
}

/// Overwrite the event value of every descriptor
pub fn patch_context_id(activations: &mut [Activation], ctx_id: u16) {
    for desc in activations.iter_mut().flat_map(|a| a.descriptors.iter_mut()) {
        desc.perf_evt_in_mut().value = ctx_id;
        desc.perf_evt_out_mut().value = ctx_id;
        if let Descriptor::Gaudi3(d) = desc {
            d.perf_evt_eu.value = ctx_id;
        }
    }
}

/// Stamp every descriptor with a workload id for debug dumps
pub fn patch_debug_wkld_id(activations: &mut [Activation], wkld_id: u32) {
    for desc in activations.iter_mut().flat_map(|a| a.descriptors.iter_mut()) {
        desc.set_wkld_id(wkld_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Chip;

    fn activations(chip: Chip, signals: &[u32]) -> Vec<Activation> {
        signals
            .iter()
            .map(|&num_signals| {
                let mut act =
                    Activation::new(vec![Descriptor::new_for(chip), Descriptor::new_for(chip)]);
                act.num_signals = num_signals;
                act
            })
            .collect()
    }

    #[test]
    fn test_none_leaves_events_untouched() {
        let mut acts = activations(Chip::Gaudi2, &[1, 1]);
        acts[0].desc_mut(0).perf_evt_in_mut().value = 9;
        configure_perf_events(&mut acts, TraceMode::None, 3);
        assert_eq!(acts[0].desc(0).perf_evt_in().value, 9);
    }

    #[test]
    fn test_layer_act_marks_first_and_last() {
        let mut acts = activations(Chip::Gaudi2, &[1, 1, 1]);
        configure_perf_events(&mut acts, TraceMode::LayerAct, 7);
        let first = acts[0].desc(1);
        assert_eq!(first.perf_evt_in().start_end_mask, START_MASK);
        assert_eq!(first.perf_evt_in().value, 7);
        assert_eq!(first.perf_evt_out().start_end_mask, 0);
        let middle = acts[1].desc(0);
        assert_eq!(*middle.perf_evt_in(), PerfEvt::default());
        let last = acts[2].desc(0);
        assert_eq!(last.perf_evt_out().start_end_mask, END_MASK);
        assert_eq!(last.perf_evt_out().operand, 0b11);
        assert_eq!(last.perf_evt_out().loop_mask, LoopMask::Outer.bits());
    }

    #[test]
    fn test_desc_mode_falls_back_for_partial_activations() {
        let mut acts = activations(Chip::Gaudi3, &[0, 2, 0]);
        configure_perf_events(&mut acts, TraceMode::Desc, 1);
        assert_eq!(acts[0].desc(0).perf_evt_in().start_end_mask, START_MASK);
        assert_eq!(acts[0].desc(0).perf_evt_out().start_end_mask, 0);
        assert_eq!(acts[1].desc(0).perf_evt_in().start_end_mask, START_MASK);
        assert_eq!(acts[1].desc(0).perf_evt_out().start_end_mask, END_MASK);
        assert_eq!(acts[1].desc(0).perf_evt_out().operand, 0b01);
        assert_eq!(acts[2].desc(1).perf_evt_in().start_end_mask, 0);
        assert_eq!(acts[2].desc(1).perf_evt_out().start_end_mask, END_MASK);
    }

    #[test]
    fn test_advanced_traces_eu_on_gaudi3_only() {
        let mut acts = activations(Chip::Gaudi3, &[1]);
        configure_perf_events(&mut acts, TraceMode::Advanced, 5);
        match acts[0].desc(0) {
            Descriptor::Gaudi3(d) => {
                assert_eq!(d.perf_evt_eu.start_end_mask, START_MASK | END_MASK)
            }
            Descriptor::Gaudi2(_) => unreachable!(),
        }

        let mut acts = activations(Chip::Gaudi2, &[1]);
        configure_perf_events(&mut acts, TraceMode::Advanced, 5);
        assert_eq!(acts[0].desc(0).perf_evt_in().start_end_mask, START_MASK | END_MASK);
        assert!(acts[0].desc(0).perf_evt_in().rst);
        assert!(acts[0].desc(0).perf_evt_in().slave_sends_perf_event);
    }

    #[test]
    fn test_patch_context_and_wkld_id() {
        let mut acts = activations(Chip::Gaudi3, &[1, 1]);
        configure_perf_events(&mut acts, TraceMode::Desc, 1);
        patch_context_id(&mut acts, 42);
        patch_debug_wkld_id(&mut acts, 0xabcd);
        for act in &acts {
            for desc in &act.descriptors {
                assert_eq!(desc.perf_evt_in().value, 42);
                assert_eq!(desc.perf_evt_out().value, 42);
                assert_eq!(desc.wkld_id(), 0xabcd);
            }
        }
    }
}
