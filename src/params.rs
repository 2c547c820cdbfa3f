//! Layer parameters: the per-operation input of the descriptor generator
//!
//! `LayerParams` describes one MME operation: operand views, convolution
//! parameters, strategy, controls, tracing and memory configuration. It is
//! also the descriptor cache key, so equality and ordering are defined over a
//! fixed-size little-endian byte image (`to_key_bytes`) rather than field by
//! field. Two params built in different ways but holding the same values are
//! the same key.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

pub const MAX_TENSOR_DIMS: usize = 5;
pub const MAX_CONV_DIMS: usize = 4;
pub const BATCH_DIMS_NR: usize = 3;

pub type SizeArray = [u32; MAX_TENSOR_DIMS];

// Activation dims
pub const DIM_C: usize = 0;
pub const DIM_W: usize = 1;
pub const DIM_H: usize = 2;
pub const DIM_D: usize = 3;
pub const DIM_B: usize = 4;
// Weight dims
pub const WEIGHT_DIM_K: usize = 0;
pub const WEIGHT_DIM_C: usize = 1;
pub const DIM_S: usize = 2;
pub const DIM_R: usize = 3;
pub const DIM_Q: usize = 4;
// Gemm dims
pub const GEMM_DIM_W: usize = 0;
pub const GEMM_DIM_H: usize = 1;
pub const GEMM_DIM_B1: usize = 2;
pub const GEMM_DIM_B2: usize = 3;
pub const GEMM_DIM_B3: usize = 4;

pub const EXPONENT_BIAS_FP8_152_15: u32 = 15;
pub const EXPONENT_BIAS_FP8_143_3: u32 = 3;
pub const EXPONENT_BIAS_FP8_143_7: u32 = 7;
pub const EXPONENT_BIAS_FP8_143_11: u32 = 11;
pub const EXPONENT_BIAS_FP8_143_15: u32 = 15;
pub const EXPONENT_BIAS_UFP16_31: u32 = 31;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Element types understood by the MME
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int4,
    Uint4,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    #[serde(rename = "int32_26")]
    Int32_26,
    #[serde(rename = "int32_16")]
    Int32_16,
    #[serde(rename = "fp8_143")]
    Fp8_143,
    #[serde(rename = "fp8_152")]
    Fp8_152,
    Fp16,
    Bf16,
    Fp32,
    Fp32Ieee,
    Tf32,
    Ufp16,
}

impl DataType {
    pub fn is_fp8(self) -> bool {
        matches!(self, DataType::Fp8_143 | DataType::Fp8_152)
    }

    pub fn is_fp16(self) -> bool {
        matches!(self, DataType::Fp16 | DataType::Ufp16)
    }

    pub fn is_integer(self) -> bool {
        (self as u8) < (DataType::Fp8_143 as u8)
    }

    /// log2 of the element size in bytes
    pub fn log_element_size(self) -> u32 {
        match self {
            DataType::Fp8_143 | DataType::Fp8_152 => 0,
            DataType::Ufp16 | DataType::Fp16 | DataType::Bf16 => 1,
            DataType::Fp32 | DataType::Tf32 | DataType::Fp32Ieee => 2,
            other => panic!("invalid data type {:?}", other),
        }
    }

    pub fn element_size(self) -> u32 {
        1 << self.log_element_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Fwd,
    Dedx,
    Dedw,
    DeterministicDedw,
    TransposedDedx,
    Ab,
    Abt,
    Atb,
    Atbt,
    GemmTranspose,
    Memcpy,
    Trans,
    ReductionAdd,
}

/// External (user facing) operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    X,
    W,
    Y,
    O,
}

/// Operand as seen by the engine: A and B are inputs, C is the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InternalOperand {
    A = 0,
    B = 1,
    C = 2,
}

impl InternalOperand {
    pub const ALL: [InternalOperand; 3] =
        [InternalOperand::A, InternalOperand::B, InternalOperand::C];
    pub const INPUTS: [InternalOperand; 2] = [InternalOperand::A, InternalOperand::B];

    pub fn is_input(self) -> bool {
        self != InternalOperand::C
    }
}

/// Hardware rounding modes. Values are the register encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    RoundToNearest = 0,
    RoundToZero = 1,
    RoundUp = 2,
    RoundDown = 3,
    StochasticRounding = 4,
    RoundAwayFromZero = 6,
    StochasticRoundingAndNearest = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingMode {
    None,
    Once,
    Desc,
    DescWithStore,
    /// Signal when the slowest loop increments
    Chunk,
    Output,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfNanMode {
    FullInfNan = 0,
    NoInfNan = 1,
    MinimalInfNan = 2,
}

/// Output walking patterns. The letters list the loops from fastest to
/// slowest: k is the output FCD, c/s the output spatial dim and f the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    SpReductionKfc,
    SpReductionFkc,
    SpReductionFck,
    SpReductionCfk,
    SpReductionKcf,
    SpReductionCkf,
    ZReductionKsf,
    ZReductionSkf,
}

impl Pattern {
    /// Raster walks consume FCD views one GEMM at a time
    pub fn is_raster(self) -> bool {
        match self {
            Pattern::ZReductionSkf | Pattern::SpReductionFck | Pattern::SpReductionCfk => true,
            Pattern::SpReductionCkf
            | Pattern::SpReductionKfc
            | Pattern::SpReductionFkc
            | Pattern::SpReductionKcf
            | Pattern::ZReductionKsf => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopDim {
    K,
    C,
    S,
    F,
}

impl LoopDim {
    /// Batch loops are walked in the filter slot
    pub const B: LoopDim = LoopDim::F;
}

/// Loop masks: a mask with n low bits set covers the n fastest loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoopMask {
    Gemm = 0,
    Conv0 = 1,
    Conv1 = 3,
    Conv2 = 7,
    Conv3 = 15,
    Tetris = 31,
    Outer = 63,
}

impl LoopMask {
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// One-hot selector of the loop a mask stops at
    pub fn loop_bit(self) -> u8 {
        (self.bits() + 1) >> 1
    }

    pub fn from_loop(loop_idx: u8) -> LoopMask {
        match loop_idx {
            0 => LoopMask::Gemm,
            1 => LoopMask::Conv0,
            2 => LoopMask::Conv1,
            3 => LoopMask::Conv2,
            4 => LoopMask::Conv3,
            5 => LoopMask::Tetris,
            6 => LoopMask::Outer,
            _ => panic!("loop overflow: {}", loop_idx),
        }
    }

    pub fn from_bits(bits: u8) -> LoopMask {
        match bits {
            0 => LoopMask::Gemm,
            1 => LoopMask::Conv0,
            3 => LoopMask::Conv1,
            7 => LoopMask::Conv2,
            15 => LoopMask::Conv3,
            31 => LoopMask::Tetris,
            63 => LoopMask::Outer,
            _ => panic!("invalid loop mask {:#x}", bits),
        }
    }

    /// The mask covering one more loop
    pub fn next(self) -> LoopMask {
        LoopMask::from_bits((self.bits() << 1) | 1)
    }
}

/// Loop level a given logical dimension is walked on for a pattern
pub fn pattern_to_loop_mask(pattern: Pattern, dim: LoopDim) -> LoopMask {
    use Pattern::*;
    match dim {
        LoopDim::K => match pattern {
            SpReductionCfk | SpReductionFck => LoopMask::Conv0,
            SpReductionFkc => LoopMask::Conv1,
            SpReductionCkf | ZReductionSkf => LoopMask::Conv3,
            SpReductionKfc | SpReductionKcf | ZReductionKsf => LoopMask::Outer,
        },
        LoopDim::C => match pattern {
            SpReductionKfc | SpReductionFkc => LoopMask::Conv0,
            SpReductionFck => LoopMask::Conv1,
            SpReductionKcf => LoopMask::Conv3,
            SpReductionCkf | SpReductionCfk => LoopMask::Outer,
            ZReductionKsf | ZReductionSkf => {
                panic!("invalid reduction type {:?} for dim c", pattern)
            }
        },
        LoopDim::S => LoopMask::Tetris,
        LoopDim::F => match pattern {
            SpReductionKcf | SpReductionCkf | ZReductionKsf | ZReductionSkf => LoopMask::Conv0,
            SpReductionKfc | SpReductionCfk => LoopMask::Conv1,
            SpReductionFkc | SpReductionFck => LoopMask::Conv2,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Geometry {
    #[serde(rename = "4xw")]
    Geo4xw,
    #[serde(rename = "2xw")]
    Geo2xw,
    #[serde(rename = "2xh")]
    Geo2xh,
    #[serde(rename = "4xh")]
    Geo4xh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolWithUndef {
    TurnedOff,
    TurnedOn,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    None,
    /// Start event on the first descriptor, end event on the last
    LayerAct,
    /// Start and end events on every descriptor
    Desc,
    /// Start and end events on every engine
    Advanced,
}

/// Which inputs stay resident in the SBs across steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReuseType {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "1d_a")]
    A,
    #[serde(rename = "1d_b")]
    B,
    /// A and B, A on the outer loop
    #[serde(rename = "2d_ab")]
    AB,
    #[serde(rename = "2d_ba")]
    BA,
}

impl ReuseType {
    pub fn reuses_a(self) -> bool {
        matches!(self, ReuseType::A | ReuseType::AB | ReuseType::BA)
    }

    pub fn reuses_b(self) -> bool {
        matches!(self, ReuseType::B | ReuseType::AB | ReuseType::BA)
    }

    pub fn is_2d(self) -> bool {
        matches!(self, ReuseType::AB | ReuseType::BA)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionOp {
    Add = 0,
    Sub = 1,
    Min = 2,
    Max = 3,
    Max0 = 4,
    None = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionRm {
    RoundHalfToNearestEven = 0,
    RoundToZero = 1,
    RoundUp = 2,
    RoundDown = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDirective {
    SkipCache,
    NoAllocate,
    HomeAllocate,
    DcoreAllocate,
    SharedAllocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
    Low = 0,
    Normal = 1,
    High = 2,
    Reserved = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheQos {
    Bucket0 = 0,
    Bucket1 = 1,
    Bucket2 = 2,
    Bucket3 = 3,
    BucketBp = 0xf,
}

/// Which tensor of the layer an activation operand is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorRole {
    InputTensorA,
    InputTensorB,
    OutputTensorC,
    OutputTensorO,
    AuxMaskedBgemmA,
    AuxMaskedBgemmB,
    AuxCdScratchpad,
}

/// Whether an operand's hardware port reads it transposed
pub fn is_transposed(op_type: OpType, operand: InternalOperand) -> bool {
    match op_type {
        OpType::Trans
        | OpType::Fwd
        | OpType::Ab
        | OpType::ReductionAdd
        | OpType::TransposedDedx => {
            operand == InternalOperand::A
        }
        OpType::Dedx | OpType::Abt => true,
        OpType::GemmTranspose
        | OpType::Memcpy
        | OpType::Dedw
        | OpType::DeterministicDedw
        | OpType::Atb => false,
        OpType::Atbt => operand == InternalOperand::B,
    }
}

// ---------------------------------------------------------------------------
// Sub-structs
// ---------------------------------------------------------------------------

/// A strided view over a tensor, in elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorView {
    pub element_type: DataType,
    /// View base coordinate inside the tensor
    pub bases: SizeArray,
    /// Per-dcore offset
    pub dcore_bases: SizeArray,
    pub sizes: SizeArray,
    /// Strides in elements, `strides[0]` is always 1
    pub strides: SizeArray,
}

impl Default for TensorView {
    fn default() -> Self {
        Self {
            element_type: DataType::Fp32,
            bases: [0; MAX_TENSOR_DIMS],
            dcore_bases: [0; MAX_TENSOR_DIMS],
            sizes: [1; MAX_TENSOR_DIMS],
            strides: [1; MAX_TENSOR_DIMS],
        }
    }
}

impl TensorView {
    /// A dense view of the given sizes
    pub fn dense(element_type: DataType, sizes: SizeArray) -> Self {
        let mut strides = [1; MAX_TENSOR_DIMS];
        for dim in 1..MAX_TENSOR_DIMS {
            strides[dim] = strides[dim - 1] * sizes[dim - 1];
        }
        Self {
            element_type,
            sizes,
            strides,
            ..Default::default()
        }
    }

    /// True if this view is a sub-view of a larger tensor
    pub fn is_strided(&self) -> bool {
        let mut cur = 1u32;
        for dim in 0..MAX_TENSOR_DIMS {
            if cur != self.strides[dim] {
                return true;
            }
            cur = cur.wrapping_mul(self.sizes[dim]);
        }
        false
    }

    pub fn are_strides_fully_aligned(&self, align: u32) -> bool {
        self.strides[1..].iter().all(|s| s % align == 0)
    }

    const KEY_SIZE: usize = 1 + 4 * MAX_TENSOR_DIMS * 4;

    fn write_key(&self, key: &mut KeyWriter) {
        let start = key.len();
        key.u8(self.element_type as u8);
        key.u32s(&self.bases);
        key.u32s(&self.dcore_bases);
        key.u32s(&self.sizes);
        key.u32s(&self.strides);
        assert_eq!(key.len() - start, Self::KEY_SIZE, "tensor view key size mismatch");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvParams {
    pub stride: [u32; MAX_CONV_DIMS - 1],
    pub dilation: [u32; MAX_CONV_DIMS - 1],
    pub padding: [i32; MAX_CONV_DIMS - 1],
    pub padding_value: f32,
    /// 1D/2D/3D convolution
    pub spatial_dims_nr: u32,
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            stride: [1; 3],
            dilation: [1; 3],
            padding: [0; 3],
            padding_value: 0.0,
            spatial_dims_nr: 3,
        }
    }
}

impl ConvParams {
    const KEY_SIZE: usize = 3 * 4 * 3 + 4 + 4;

    fn write_key(&self, key: &mut KeyWriter) {
        let start = key.len();
        key.u32s(&self.stride);
        key.u32s(&self.dilation);
        for p in self.padding {
            key.i32(p);
        }
        key.f32(self.padding_value);
        key.u32(self.spatial_dims_nr);
        assert_eq!(key.len() - start, Self::KEY_SIZE, "conv key size mismatch");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Controls {
    /// EU rounding mode
    pub rounding_mode: RoundingMode,
    /// Output conversion rounding mode
    pub conversion_rounding_mode: RoundingMode,
    /// Accumulator rounding mode
    pub acc_rounding_mode: RoundingMode,
    pub signaling_mode: SignalingMode,
    pub signal_amount: u32,
    /// Slave core signals independently
    pub slave_signaling: bool,
    pub use_same_color_set: bool,
    /// Accumulate the output in memory
    pub atomic_add: bool,
    /// Squash all IO ROIs to the first activation
    pub squash_io_rois: bool,
    pub relu_en: bool,
    pub flush_denormals: bool,
    pub stochastic_flush: bool,
    pub sb_cache_en: bool,
    pub fp8_bias_in: u32,
    pub fp8_bias_in2: u32,
    pub fp8_bias_out: u32,
    pub inf_nan_mode_a: InfNanMode,
    pub inf_nan_mode_b: InfNanMode,
    pub inf_nan_mode_out: InfNanMode,
    /// Zero disables PMU rate limiting
    pub pmu_saturation_val: u32,
    /// Debug limit on the SB size, zero means the hardware size
    pub sb_size_in_cls: i32,
    pub clipping_en: bool,
    pub clip_inf_in: bool,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            rounding_mode: RoundingMode::RoundToNearest,
            conversion_rounding_mode: RoundingMode::RoundToNearest,
            acc_rounding_mode: RoundingMode::RoundToNearest,
            signaling_mode: SignalingMode::Output,
            signal_amount: 1,
            slave_signaling: false,
            use_same_color_set: true,
            atomic_add: false,
            squash_io_rois: false,
            relu_en: false,
            flush_denormals: false,
            stochastic_flush: false,
            sb_cache_en: true,
            fp8_bias_in: EXPONENT_BIAS_FP8_152_15,
            fp8_bias_in2: EXPONENT_BIAS_FP8_152_15,
            fp8_bias_out: EXPONENT_BIAS_FP8_143_7,
            inf_nan_mode_a: InfNanMode::FullInfNan,
            inf_nan_mode_b: InfNanMode::FullInfNan,
            inf_nan_mode_out: InfNanMode::FullInfNan,
            pmu_saturation_val: 0,
            sb_size_in_cls: 0,
            clipping_en: false,
            clip_inf_in: false,
        }
    }
}

impl Controls {
    const KEY_SIZE: usize = 4 + 4 + 8 + 3 * 4 + 3 + 4 + 4 + 2;

    fn write_key(&self, key: &mut KeyWriter) {
        let start = key.len();
        key.u8(self.rounding_mode as u8);
        key.u8(self.conversion_rounding_mode as u8);
        key.u8(self.acc_rounding_mode as u8);
        key.u8(self.signaling_mode as u8);
        key.u32(self.signal_amount);
        key.bool(self.slave_signaling);
        key.bool(self.use_same_color_set);
        key.bool(self.atomic_add);
        key.bool(self.squash_io_rois);
        key.bool(self.relu_en);
        key.bool(self.flush_denormals);
        key.bool(self.stochastic_flush);
        key.bool(self.sb_cache_en);
        key.u32(self.fp8_bias_in);
        key.u32(self.fp8_bias_in2);
        key.u32(self.fp8_bias_out);
        key.u8(self.inf_nan_mode_a as u8);
        key.u8(self.inf_nan_mode_b as u8);
        key.u8(self.inf_nan_mode_out as u8);
        key.u32(self.pmu_saturation_val);
        key.i32(self.sb_size_in_cls);
        key.bool(self.clipping_en);
        key.bool(self.clip_inf_in);
        assert_eq!(key.len() - start, Self::KEY_SIZE, "controls key size mismatch");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    pub geometry: Geometry,
    /// Number of MMEs to generate descriptors for
    pub mme_limit: u32,
    pub pattern: Pattern,
    /// Minimal number of requested descriptors
    pub pipeline_level: u32,
    pub packing_factor: u32,
    /// Number of slices for reduction add
    pub reduction_level: u32,
    pub lowering_en: bool,
    pub te_acceleration_en: bool,
    pub sb_reuse: bool,
    pub partials_to_memory_en: bool,
    pub aligned_addresses: bool,
    pub unroll_en: bool,
    pub dedw_as_bgemm_en: bool,
    pub recurring_misalignment_opt_en: bool,
    pub batch_concurrency_en: BoolWithUndef,
    pub cd_concurrency_en: BoolWithUndef,
    pub is_deterministic: bool,
    pub flatten_en: bool,
    pub dual_gemm: bool,
    pub partial: bool,
    pub signal_partial: bool,
    /// Memset dX pixels that no filter tap touches
    pub memset_dedx_void_pixels: bool,
    pub dedx_dynamic_padding: bool,
    pub masked_bgemm: bool,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            geometry: Geometry::Geo2xh,
            mme_limit: 2,
            pattern: Pattern::ZReductionSkf,
            pipeline_level: 1,
            packing_factor: 1,
            reduction_level: 1,
            lowering_en: true,
            te_acceleration_en: false,
            sb_reuse: false,
            partials_to_memory_en: false,
            aligned_addresses: false,
            unroll_en: false,
            dedw_as_bgemm_en: false,
            recurring_misalignment_opt_en: false,
            batch_concurrency_en: BoolWithUndef::TurnedOff,
            cd_concurrency_en: BoolWithUndef::TurnedOff,
            is_deterministic: false,
            flatten_en: true,
            dual_gemm: false,
            partial: false,
            signal_partial: false,
            memset_dedx_void_pixels: true,
            dedx_dynamic_padding: false,
            masked_bgemm: false,
        }
    }
}

impl Strategy {
    const KEY_SIZE: usize = 1 + 4 + 1 + 4 * 3 + 8 + 2 + 8;

    fn write_key(&self, key: &mut KeyWriter) {
        let start = key.len();
        key.u8(self.geometry as u8);
        key.u32(self.mme_limit);
        key.u8(self.pattern as u8);
        key.u32(self.pipeline_level);
        key.u32(self.packing_factor);
        key.u32(self.reduction_level);
        key.bool(self.lowering_en);
        key.bool(self.te_acceleration_en);
        key.bool(self.sb_reuse);
        key.bool(self.partials_to_memory_en);
        key.bool(self.aligned_addresses);
        key.bool(self.unroll_en);
        key.bool(self.dedw_as_bgemm_en);
        key.bool(self.recurring_misalignment_opt_en);
        key.u8(self.batch_concurrency_en as u8);
        key.u8(self.cd_concurrency_en as u8);
        key.bool(self.is_deterministic);
        key.bool(self.flatten_en);
        key.bool(self.dual_gemm);
        key.bool(self.partial);
        key.bool(self.signal_partial);
        key.bool(self.memset_dedx_void_pixels);
        key.bool(self.dedx_dynamic_padding);
        key.bool(self.masked_bgemm);
        assert_eq!(key.len() - start, Self::KEY_SIZE, "strategy key size mismatch");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tracing {
    pub trace_mode: TraceMode,
    pub trace_mode_x: TraceMode,
    pub trace_mode_y: TraceMode,
    pub trace_mode_w: TraceMode,
    pub ctx_id: u16,
}

impl Default for Tracing {
    fn default() -> Self {
        Self {
            trace_mode: TraceMode::None,
            trace_mode_x: TraceMode::LayerAct,
            trace_mode_y: TraceMode::LayerAct,
            trace_mode_w: TraceMode::LayerAct,
            ctx_id: 0,
        }
    }
}

impl Tracing {
    const KEY_SIZE: usize = 4 + 2;

    fn write_key(&self, key: &mut KeyWriter) {
        let start = key.len();
        key.u8(self.trace_mode as u8);
        key.u8(self.trace_mode_x as u8);
        key.u8(self.trace_mode_y as u8);
        key.u8(self.trace_mode_w as u8);
        key.u16(self.ctx_id);
        assert_eq!(key.len() - start, Self::KEY_SIZE, "tracing key size mismatch");
    }
}

/// Output reduction and cache configuration. Arrays are indexed by
/// `InternalOperand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub reduction_op: ReductionOp,
    pub reduction_rm: ReductionRm,
    pub cache_directive: [CacheDirective; 3],
    pub class: [CacheClass; 3],
    pub mc_id: [u16; 3],
    pub qos: [CacheQos; 3],
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            reduction_op: ReductionOp::None,
            reduction_rm: ReductionRm::RoundDown,
            cache_directive: [CacheDirective::DcoreAllocate; 3],
            class: [CacheClass::Normal; 3],
            mc_id: [0; 3],
            qos: [CacheQos::Bucket1; 3],
        }
    }
}

impl MemoryConfig {
    const KEY_SIZE: usize = 2 + 3 + 3 + 6 + 3;

    pub fn reduction_en(&self) -> bool {
        self.reduction_op != ReductionOp::None
    }

    fn write_key(&self, key: &mut KeyWriter) {
        let start = key.len();
        key.u8(self.reduction_op as u8);
        key.u8(self.reduction_rm as u8);
        for d in self.cache_directive {
            key.u8(d as u8);
        }
        for c in self.class {
            key.u8(c as u8);
        }
        for id in self.mc_id {
            key.u16(id);
        }
        for q in self.qos {
            key.u8(q as u8);
        }
        assert_eq!(key.len() - start, Self::KEY_SIZE, "memory config key size mismatch");
    }
}

// ---------------------------------------------------------------------------
// LayerParams
// ---------------------------------------------------------------------------

/// Size of the byte image produced by `LayerParams::to_key_bytes`
pub const LAYER_PARAMS_KEY_SIZE: usize = 1
    + 6 * TensorView::KEY_SIZE
    + 4
    + 4
    + ConvParams::KEY_SIZE
    + Controls::KEY_SIZE
    + Strategy::KEY_SIZE
    + Tracing::KEY_SIZE
    + MemoryConfig::KEY_SIZE
    + 1
    + MAX_TENSOR_DIMS;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerParams {
    pub op_type: OpType,
    pub x: TensorView,
    pub y: TensorView,
    pub w: TensorView,
    /// Auxiliary tensors of a masked bgemm
    pub x_aux: TensorView,
    pub y_aux: TensorView,
    pub w_aux: TensorView,
    pub sp_base: u32,
    pub sp_size: u32,
    pub conv: ConvParams,
    pub controls: Controls,
    pub strategy: Strategy,
    pub tracing: Tracing,
    pub memory: MemoryConfig,
    pub use_desc_cache: bool,
    pub permutation: [u8; MAX_TENSOR_DIMS],
}

impl Default for LayerParams {
    fn default() -> Self {
        Self::new(OpType::Fwd)
    }
}

impl LayerParams {
    pub fn new(op_type: OpType) -> Self {
        Self {
            op_type,
            x: TensorView::default(),
            y: TensorView::default(),
            w: TensorView::default(),
            x_aux: TensorView::default(),
            y_aux: TensorView::default(),
            w_aux: TensorView::default(),
            sp_base: 0,
            sp_size: 0,
            conv: ConvParams::default(),
            controls: Controls::default(),
            strategy: Strategy::default(),
            tracing: Tracing::default(),
            memory: MemoryConfig::default(),
            use_desc_cache: true,
            permutation: [0, 1, 2, 3, 4],
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Fixed-size little-endian image of every field. Equality, ordering and
    /// hashing are all defined on it.
    pub fn to_key_bytes(&self) -> Vec<u8> {
        let mut key = KeyWriter::with_capacity(LAYER_PARAMS_KEY_SIZE);
        key.u8(self.op_type as u8);
        for view in [&self.x, &self.y, &self.w, &self.x_aux, &self.y_aux, &self.w_aux] {
            view.write_key(&mut key);
        }
        key.u32(self.sp_base);
        key.u32(self.sp_size);
        self.conv.write_key(&mut key);
        self.controls.write_key(&mut key);
        self.strategy.write_key(&mut key);
        self.tracing.write_key(&mut key);
        self.memory.write_key(&mut key);
        key.bool(self.use_desc_cache);
        for p in self.permutation {
            key.u8(p);
        }
        let bytes = key.finish();
        assert_eq!(bytes.len(), LAYER_PARAMS_KEY_SIZE, "layer params key size mismatch");
        bytes
    }

    // --- classification ---

    pub fn is_conv(&self) -> bool {
        self.is_fwd_or_dedx() || self.is_dedw()
    }

    pub fn is_gemm(&self) -> bool {
        matches!(
            self.op_type,
            OpType::Ab
                | OpType::Atb
                | OpType::Abt
                | OpType::Atbt
                | OpType::ReductionAdd
                | OpType::GemmTranspose
        )
    }

    pub fn is_dedx(&self) -> bool {
        matches!(self.op_type, OpType::Dedx | OpType::TransposedDedx)
    }

    pub fn is_fwd_or_dedx(&self) -> bool {
        self.op_type == OpType::Fwd || self.is_dedx()
    }

    pub fn is_dedw(&self) -> bool {
        matches!(self.op_type, OpType::Dedw | OpType::DeterministicDedw)
    }

    pub fn is_dedw_or_gemm(&self) -> bool {
        self.is_dedw() || self.is_gemm()
    }

    pub fn is_dedw_cd_concurrency(&self) -> bool {
        self.is_dedw() && self.strategy.cd_concurrency_en == BoolWithUndef::TurnedOn
    }

    pub fn is_dma(&self) -> bool {
        self.is_native_dma() || self.is_gemm_dma()
    }

    pub fn is_native_dma(&self) -> bool {
        matches!(self.op_type, OpType::Memcpy | OpType::Trans)
    }

    pub fn is_gemm_dma(&self) -> bool {
        self.op_type == OpType::GemmTranspose
    }

    pub fn is_reduction_add(&self) -> bool {
        self.op_type == OpType::ReductionAdd
    }

    pub fn is_sb_reuse(&self) -> bool {
        self.strategy.sb_reuse && !self.is_dma()
    }

    pub fn is_pattern_raster(&self) -> bool {
        self.strategy.pattern.is_raster()
    }

    pub fn is_deterministic_cd_concurrency(&self) -> bool {
        self.op_type == OpType::DeterministicDedw
            || (self.op_type == OpType::Dedw
                && self.strategy.is_deterministic
                && self.strategy.cd_concurrency_en == BoolWithUndef::TurnedOn)
    }

    // --- operands ---

    /// Map an engine operand to the user operand it reads or writes
    pub fn external_operand(&self, operand: InternalOperand) -> Operand {
        use InternalOperand::*;
        match self.op_type {
            OpType::Dedx | OpType::TransposedDedx => match operand {
                A => Operand::Y,
                B => Operand::W,
                C => Operand::X,
            },
            OpType::Dedw | OpType::DeterministicDedw => match operand {
                A => Operand::X,
                B => Operand::Y,
                C => Operand::W,
            },
            _ => match operand {
                A => Operand::X,
                B => Operand::W,
                C => Operand::Y,
            },
        }
    }

    pub fn operand(&self, operand: InternalOperand) -> &TensorView {
        self.external_view(self.external_operand(operand), true)
    }

    pub fn operand_mut(&mut self, operand: InternalOperand) -> &mut TensorView {
        match self.external_operand(operand) {
            Operand::X => &mut self.x,
            Operand::W => &mut self.w,
            Operand::Y | Operand::O => &mut self.y,
        }
    }

    /// Primary or auxiliary view of an engine operand
    pub fn operand_view(&self, operand: InternalOperand, primary: bool) -> &TensorView {
        self.external_view(self.external_operand(operand), primary)
    }

    pub fn external_view(&self, operand: Operand, primary: bool) -> &TensorView {
        match operand {
            Operand::X => {
                if primary {
                    &self.x
                } else {
                    &self.x_aux
                }
            }
            Operand::W => {
                if primary {
                    &self.w
                } else {
                    &self.w_aux
                }
            }
            Operand::Y | Operand::O => &self.y,
        }
    }

    pub fn is_transposed(&self, operand: InternalOperand) -> bool {
        is_transposed(self.op_type, operand)
    }

    // --- lowering and flattening ---

    pub fn can_lower(&self) -> bool {
        if !self.strategy.lowering_en
            || !(self.is_dedw()
                || self.op_type == OpType::Fwd
                || self.op_type == OpType::TransposedDedx)
        {
            return false;
        }
        let a_view = self.operand(InternalOperand::A);
        self.conv.dilation[0] == 1
            && a_view.strides[1] == self.w.sizes[1]
            && self.w.strides[2] == self.w.strides[1] * self.w.sizes[1]
    }

    pub fn can_flatten(&self) -> bool {
        if !self.strategy.flatten_en
            || self.strategy.dual_gemm
            || self.strategy.masked_bgemm
            || !matches!(self.op_type, OpType::Ab | OpType::Abt)
        {
            return false;
        }
        if self.w.sizes[2] != 1 || self.y.sizes[2] == 1 || self.y.sizes[2] != self.x.sizes[2] {
            return false;
        }
        if self.x.strides[2] != self.x.strides[1] * self.x.sizes[1] {
            return false;
        }
        self.y.strides[2] == self.y.strides[1] * self.y.sizes[1]
    }

    // --- sizes ---

    pub fn fcd_size(&self) -> u32 {
        self.operand(InternalOperand::C).sizes[0]
    }

    pub fn spatial_size(&self) -> u32 {
        let c = self.operand(InternalOperand::C);
        if self.is_gemm() {
            if self.is_gemm_dma() {
                self.operand(InternalOperand::A).sizes[0]
            } else if self.can_flatten() {
                c.sizes[1] * c.sizes[2]
            } else {
                c.sizes[1]
            }
        } else if self.is_dedw() {
            if self.can_lower() {
                c.sizes[1] * c.sizes[2]
            } else {
                c.sizes[1]
            }
        } else {
            c.sizes[1..].iter().product()
        }
    }

    pub fn batch_size(&self, concurrency: u32) -> u32 {
        if self.is_fwd_or_dedx() || self.is_reduction_add() {
            return 1;
        }
        let c = self.operand(InternalOperand::C);
        if self.can_flatten() {
            c.sizes[3] * c.sizes[4]
        } else if self.can_lower() {
            div_round_up(c.sizes[3], concurrency) * c.sizes[4]
        } else {
            div_round_up(c.sizes[2], concurrency) * c.sizes[3] * c.sizes[4]
        }
    }

    /// CD of a single GEMM loop
    pub fn single_gemm_cd(&self) -> u32 {
        match self.op_type {
            OpType::Fwd => {
                if self.can_lower() {
                    self.x.sizes[0] * self.w.sizes[2].min(self.x.sizes[1])
                } else {
                    self.x.sizes[0]
                }
            }
            OpType::TransposedDedx => {
                if self.can_lower() {
                    self.y.sizes[0] * self.w.sizes[2].min(self.y.sizes[1])
                } else {
                    self.y.sizes[0]
                }
            }
            OpType::Dedx => self.y.sizes[0],
            _ => self.cd_size(),
        }
    }

    /// CD of all accumulated loops together
    pub fn cd_size(&self) -> u32 {
        match self.op_type {
            OpType::Fwd => self.x.sizes[0] * self.w.sizes[2] * self.w.sizes[3] * self.w.sizes[4],
            OpType::Dedx | OpType::TransposedDedx => {
                self.y.sizes[0] * self.w.sizes[2] * self.w.sizes[3] * self.w.sizes[4]
            }
            OpType::Dedw | OpType::DeterministicDedw => {
                self.y.sizes[1] * self.y.sizes[2] * self.y.sizes[3] * self.y.sizes[4]
            }
            OpType::Ab | OpType::Abt | OpType::ReductionAdd | OpType::GemmTranspose => {
                self.x.sizes[0]
            }
            OpType::Atb | OpType::Atbt => self.x.sizes[1],
            OpType::Memcpy | OpType::Trans => 0,
        }
    }

    /// Pick the default walking pattern for the op
    pub fn set_pattern(&mut self, down_first: bool) {
        self.strategy.pattern = if self.is_gemm() {
            if down_first {
                Pattern::SpReductionFkc
            } else {
                Pattern::SpReductionFck
            }
        } else if self.is_dedw() {
            if down_first {
                Pattern::SpReductionKfc
            } else {
                Pattern::SpReductionFck
            }
        } else if self.is_fwd_or_dedx() {
            if down_first {
                Pattern::ZReductionKsf
            } else {
                Pattern::ZReductionSkf
            }
        } else {
            panic!("invalid operation {:?} for pattern selection", self.op_type)
        };
    }
}

impl PartialEq for LayerParams {
    fn eq(&self, other: &Self) -> bool {
        self.to_key_bytes() == other.to_key_bytes()
    }
}

impl Eq for LayerParams {}

impl Hash for LayerParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_key_bytes().hash(state);
    }
}

impl PartialOrd for LayerParams {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LayerParams {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_key_bytes().cmp(&other.to_key_bytes())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn div_round_up(a: u32, b: u32) -> u32 {
    assert!(b != 0, "division by zero");
    a.div_ceil(b)
}

pub fn round_to_multiple(a: u32, b: u32) -> u32 {
    div_round_up(a, b) * b
}

/// Byte sink for the params key
struct KeyWriter {
    buf: Vec<u8>,
}

impl KeyWriter {
    fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn u32s(&mut self, vs: &[u32]) {
        for v in vs {
            self.u32(*v);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gemm_params() -> LayerParams {
        let mut params = LayerParams::new(OpType::Ab);
        params.x = TensorView::dense(DataType::Bf16, [64, 32, 1, 1, 1]);
        params.w = TensorView::dense(DataType::Bf16, [48, 64, 1, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [48, 32, 1, 1, 1]);
        params
    }

    #[test]
    fn test_key_size_is_fixed() {
        let a = LayerParams::new(OpType::Fwd);
        let b = gemm_params();
        assert_eq!(a.to_key_bytes().len(), LAYER_PARAMS_KEY_SIZE);
        assert_eq!(b.to_key_bytes().len(), LAYER_PARAMS_KEY_SIZE);
    }

    #[test]
    fn test_equal_params_from_different_construction() {
        let a = gemm_params();
        let mut b = LayerParams::new(OpType::Fwd);
        b.op_type = OpType::Ab;
        b.x.element_type = DataType::Bf16;
        b.x.sizes = [64, 32, 1, 1, 1];
        b.x.strides = [1, 64, 2048, 2048, 2048];
        b.w = TensorView::dense(DataType::Bf16, [48, 64, 1, 1, 1]);
        b.y = TensorView::dense(DataType::Bf16, [48, 32, 1, 1, 1]);
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_padding_value_changes_key() {
        let a = gemm_params();
        let mut b = gemm_params();
        b.conv.padding_value = 1.5;
        assert_ne!(a, b);
        assert_ne!(a.to_key_bytes(), b.to_key_bytes());
    }

    #[test]
    fn test_json_roundtrip_keeps_key() {
        let mut params = gemm_params();
        params.tracing.ctx_id = 7;
        let json = params.to_json().unwrap();
        let back = LayerParams::from_json(&json).unwrap();
        assert_eq!(params, back);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let params = LayerParams::from_json(r#"{"op_type": "dedw"}"#).unwrap();
        assert_eq!(params.op_type, OpType::Dedw);
        assert_eq!(params.controls.signaling_mode, SignalingMode::Output);
        assert_eq!(params.strategy.geometry, Geometry::Geo2xh);
    }

    #[test]
    fn test_pattern_to_loop_mask() {
        assert_eq!(pattern_to_loop_mask(Pattern::ZReductionSkf, LoopDim::K), LoopMask::Conv3);
        assert_eq!(pattern_to_loop_mask(Pattern::ZReductionKsf, LoopDim::K), LoopMask::Outer);
        assert_eq!(pattern_to_loop_mask(Pattern::SpReductionFck, LoopDim::C), LoopMask::Conv1);
        assert_eq!(pattern_to_loop_mask(Pattern::SpReductionKfc, LoopDim::S), LoopMask::Tetris);
        assert_eq!(pattern_to_loop_mask(Pattern::SpReductionFkc, LoopDim::B), LoopMask::Conv2);
    }

    #[test]
    fn test_loop_mask_arithmetic() {
        assert_eq!(LoopMask::Conv3.loop_bit(), 8);
        assert_eq!(LoopMask::Tetris.loop_bit(), 16);
        assert_eq!(LoopMask::Conv0.next(), LoopMask::Conv1);
        assert_eq!(LoopMask::from_loop(3), LoopMask::Conv2);
    }

    #[test]
    fn test_operand_mapping() {
        let mut params = LayerParams::new(OpType::Dedx);
        params.y.sizes = [16, 1, 1, 1, 1];
        assert_eq!(params.external_operand(InternalOperand::A), Operand::Y);
        assert_eq!(params.operand(InternalOperand::A).sizes[0], 16);
        assert!(params.is_transposed(InternalOperand::B));
        params.op_type = OpType::Dedw;
        assert_eq!(params.external_operand(InternalOperand::C), Operand::W);
        assert!(!params.is_transposed(InternalOperand::A));
    }

    #[test]
    fn test_strided_view() {
        let view = TensorView::dense(DataType::Fp32, [4, 4, 2, 1, 1]);
        assert!(!view.is_strided());
        let mut sub = view;
        sub.sizes[0] = 2;
        assert!(sub.is_strided());
    }

    #[test]
    fn test_sizes() {
        let params = gemm_params();
        assert_eq!(params.fcd_size(), 48);
        assert_eq!(params.spatial_size(), 32);
        assert_eq!(params.cd_size(), 64);
        assert_eq!(params.batch_size(1), 1);
    }
}
