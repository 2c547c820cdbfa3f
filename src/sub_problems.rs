//! Convolution sub-problems
//!
//! A strided dedx is not a single convolution: every dX pixel is reached by
//! a different subset of filter taps depending on its position modulo the
//! stride. The operation is therefore split into one sub-problem per
//! residue class. Each sub-problem is a stride-1 dedx over a strided dX
//! sub-view and a strided W sub-view. Residue classes that no filter tap
//! reaches are memset (or dropped).

use log::debug;

use crate::params::{InternalOperand, LayerParams, OpType, MAX_CONV_DIMS};

/// Element offsets added to the base address of each operand, indexed by
/// `InternalOperand`
pub type OffsetArray = [u64; 3];

#[derive(Debug, Clone)]
pub struct ConvSubProblem {
    pub params: LayerParams,
    pub address_offset: OffsetArray,
    /// Residue class per spatial dim
    pub key: [u32; MAX_CONV_DIMS - 1],
}

impl ConvSubProblem {
    fn whole(params: &LayerParams) -> Self {
        Self {
            params: params.clone(),
            address_offset: [0; 3],
            key: [0; MAX_CONV_DIMS - 1],
        }
    }

    /// A dedx sub-problem with a zero sized filter only writes zeros
    pub fn is_memset(params: &LayerParams) -> bool {
        params.op_type == OpType::Dedx && params.w.sizes[2..].iter().any(|&s| s == 0)
    }
}

/// Filter taps reaching one residue class of one spatial dim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Taps {
    first: u32,
    count: u32,
    step: u32,
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Taps `s` with `(residue + padding - s * dilation) % stride == 0`
fn taps_for_residue(residue: u32, filter: u32, stride: u32, dilation: u32, padding: i32) -> Taps {
    let step = stride / gcd(stride, dilation);
    let first = (0..filter.min(step)).find(|&s| {
        let reach = residue as i64 + padding as i64 - (s as i64) * (dilation as i64);
        reach.rem_euclid(stride as i64) == 0
    });
    match first {
        Some(first) => Taps {
            first,
            count: (filter - first).div_ceil(step),
            step,
        },
        None => Taps {
            first: 0,
            count: 0,
            step,
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvSubProblems {
    sub_problems: Vec<ConvSubProblem>,
}

impl ConvSubProblems {
    pub fn new(params: &LayerParams) -> Self {
        let mut container = Self::default();
        container.reset(params);
        container
    }

    pub fn reset(&mut self, params: &LayerParams) {
        self.sub_problems = if Self::needs_split(params) {
            Self::split_dedx(params)
        } else {
            vec![ConvSubProblem::whole(params)]
        };
        debug!("{} conv sub-problems", self.sub_problems.len());
    }

    /// Stride in each spatial dim, after unpacking dim 0
    fn effective_strides(params: &LayerParams) -> [u32; MAX_CONV_DIMS - 1] {
        let mut strides = params.conv.stride;
        strides[0] /= params.strategy.packing_factor.max(1);
        strides.map(|s| s.max(1))
    }

    fn needs_split(params: &LayerParams) -> bool {
        params.op_type == OpType::Dedx && Self::effective_strides(params).iter().any(|&s| s > 1)
    }

    fn split_dedx(params: &LayerParams) -> Vec<ConvSubProblem> {
        let strides = Self::effective_strides(params);
        let conv = &params.conv;
        let dx = params.operand(InternalOperand::C);
        let classes: u32 = strides.iter().product();

        let mut sub_problems = Vec::new();
        for class in 0..classes {
            let mut key = [0; MAX_CONV_DIMS - 1];
            let mut rem = class;
            for (dim, stride) in strides.iter().enumerate() {
                key[dim] = rem % stride;
                rem /= stride;
            }
            // residues past the end of dX hold no pixels
            if (0..MAX_CONV_DIMS - 1).any(|d| key[d] >= dx.sizes[d + 1]) {
                continue;
            }

            let mut sub = params.clone();
            let mut address_offset = [0u64; 3];
            let mut memset = false;
            for d in 0..MAX_CONV_DIMS - 1 {
                let (stride, residue) = (strides[d], key[d]);
                let x_dim = d + 1;
                let w_dim = d + 2;

                let x = &mut sub.x;
                address_offset[InternalOperand::C as usize] +=
                    residue as u64 * x.strides[x_dim] as u64;
                x.sizes[x_dim] = (x.sizes[x_dim] - residue).div_ceil(stride);
                x.strides[x_dim] *= stride;

                let taps = taps_for_residue(
                    residue,
                    params.w.sizes[w_dim],
                    stride,
                    conv.dilation[d],
                    conv.padding[d],
                );
                if taps.count == 0 {
                    memset = true;
                }
                let w = &mut sub.w;
                address_offset[InternalOperand::B as usize] +=
                    taps.first as u64 * w.strides[w_dim] as u64;
                w.sizes[w_dim] = taps.count;
                w.strides[w_dim] *= taps.step;

                let reach =
                    residue as i32 + conv.padding[d] - (taps.first * conv.dilation[d]) as i32;
                sub.conv.padding[d] = reach.div_euclid(stride as i32);
                sub.conv.dilation[d] = taps.step * conv.dilation[d] / stride;
                sub.conv.stride[d] = 1;
            }
            sub.strategy.packing_factor = 1;

            if memset {
                if !params.strategy.memset_dedx_void_pixels {
                    debug!("dropping void dedx residue {:?}", key);
                    continue;
                }
                sub.conv.padding = [0; 3];
                sub.conv.dilation = [1; 3];
                address_offset[InternalOperand::B as usize] = 0;
            }
            sub_problems.push(ConvSubProblem {
                params: sub,
                address_offset,
                key,
            });
        }
        assert!(!sub_problems.is_empty(), "should have at least one sub-problem");
        sub_problems
    }

    pub fn len(&self) -> usize {
        self.sub_problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_problems.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConvSubProblem> {
        self.sub_problems.iter()
    }
}

impl std::ops::Index<usize> for ConvSubProblems {
    type Output = ConvSubProblem;

    fn index(&self, idx: usize) -> &ConvSubProblem {
        &self.sub_problems[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{DataType, TensorView};

    fn dedx(stride: u32, filter: u32) -> LayerParams {
        let mut params = LayerParams::new(OpType::Dedx);
        params.x = TensorView::dense(DataType::Bf16, [16, 8, 8, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [32, 16, filter, filter, 1]);
        params.y = TensorView::dense(DataType::Bf16, [32, 8 / stride, 8 / stride, 1, 1]);
        params.conv.stride = [stride, stride, 1];
        params
    }

    #[test]
    fn test_non_strided_has_single_sub_problem() {
        let subs = ConvSubProblems::new(&dedx(1, 3));
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].address_offset, [0, 0, 0]);

        let fwd = LayerParams::new(OpType::Fwd);
        assert_eq!(ConvSubProblems::new(&fwd).len(), 1);
    }

    #[test]
    fn test_stride_two_splits_into_residues() {
        let subs = ConvSubProblems::new(&dedx(2, 3));
        assert_eq!(subs.len(), 4);
        for sub in subs.iter() {
            assert_eq!(sub.params.conv.stride, [1, 1, 1]);
            assert_eq!(sub.params.x.sizes[1], 4);
            assert_eq!(sub.params.x.strides[1], 32);
        }
        // residue 0 gets taps 0 and 2, residue 1 gets tap 1
        assert_eq!(subs[0].params.w.sizes[2], 2);
        assert_eq!(subs[1].key, [1, 0, 0]);
        assert_eq!(subs[1].params.w.sizes[2], 1);
        assert_eq!(subs[1].address_offset[InternalOperand::C as usize], 16);
        assert_eq!(subs[1].address_offset[InternalOperand::B as usize], 512);
    }

    #[test]
    fn test_void_residues_are_memset_or_dropped() {
        let mut params = dedx(2, 1);
        let subs = ConvSubProblems::new(&params);
        assert_eq!(subs.len(), 4);
        assert!(!ConvSubProblem::is_memset(&subs[0].params));
        assert!(ConvSubProblem::is_memset(&subs[1].params));

        params.strategy.memset_dedx_void_pixels = false;
        let subs = ConvSubProblems::new(&params);
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn test_taps_for_residue() {
        assert_eq!(taps_for_residue(0, 3, 2, 1, 0), Taps { first: 0, count: 2, step: 2 });
        assert_eq!(taps_for_residue(1, 3, 2, 1, 0), Taps { first: 1, count: 1, step: 2 });
        assert_eq!(taps_for_residue(0, 3, 2, 1, 1), Taps { first: 1, count: 1, step: 2 });
        assert_eq!(taps_for_residue(1, 1, 2, 1, 0).count, 0);
    }
}
