//! Layer params validation
//!
//! The only user facing failure of the generator. Rules run in a fixed
//! order and the first violated rule is reported.

use log::warn;

use crate::error::{DescGenError, DescGenResult};
use crate::hardware::Chip;
use crate::params::{
    is_transposed, BoolWithUndef, DataType, Geometry, InternalOperand, LayerParams, OpType,
    ReductionOp, ReductionRm, RoundingMode, SignalingMode, TensorView, EXPONENT_BIAS_FP8_143_11,
    EXPONENT_BIAS_FP8_143_15, EXPONENT_BIAS_FP8_143_3, EXPONENT_BIAS_FP8_143_7,
    EXPONENT_BIAS_FP8_152_15, EXPONENT_BIAS_UFP16_31, MAX_TENSOR_DIMS,
};

const FP8_143_BIASES: [u32; 4] = [
    EXPONENT_BIAS_FP8_143_3,
    EXPONENT_BIAS_FP8_143_7,
    EXPONENT_BIAS_FP8_143_11,
    EXPONENT_BIAS_FP8_143_15,
];
const FP8_152_OUTPUT_BIAS_MIN: u32 = 1;
const FP8_152_OUTPUT_BIAS_MAX: u32 = 30;

fn ensure(cond: bool, message: &str) -> DescGenResult<()> {
    if cond {
        Ok(())
    } else {
        Err(DescGenError::invalid_params(message))
    }
}

/// Validate `params` for `chip`
pub fn validate_params(chip: Chip, params: &LayerParams) -> DescGenResult<()> {
    let result = match chip {
        Chip::Gaudi2 => validate_gaudi2(params),
        Chip::Gaudi3 => validate_gaudi3(params),
    };
    if let Err(err) = &result {
        warn!("{} rejected layer params: {}", chip, err);
    }
    result
}

/// Boolean and message form of `validate_params`. The message is empty
/// when the params are valid.
pub fn check_params(chip: Chip, params: &LayerParams) -> (bool, String) {
    match validate_params(chip, params) {
        Ok(()) => (true, String::new()),
        Err(err) => {
            let message =
                err.validation_message().map(str::to_owned).unwrap_or_else(|| err.to_string());
            (false, message)
        }
    }
}

/// Atomic add and non deterministic cd concurrency write their output with
/// reduction add. Applied to the generator's own copy of the params.
pub fn force_output_reduction(chip: Chip, params: &mut LayerParams) {
    let deterministic_dedw = chip == Chip::Gaudi2
        && params.strategy.is_deterministic
        && params.op_type == OpType::DeterministicDedw;
    if deterministic_dedw {
        return;
    }
    if params.controls.atomic_add || params.strategy.cd_concurrency_en == BoolWithUndef::TurnedOn {
        params.memory.reduction_op = ReductionOp::Add;
        params.memory.reduction_rm = ReductionRm::RoundDown;
    }
}

fn validate_gaudi2(params: &LayerParams) -> DescGenResult<()> {
    let output = params.operand(InternalOperand::C);
    let a = params.operand(InternalOperand::A);
    let b = params.operand(InternalOperand::B);
    let controls = &params.controls;

    ensure(
        matches!(params.strategy.mme_limit, 1 | 2),
        "mmes can be limited to either 1 or 2",
    )?;
    ensure(a.element_type == b.element_type, "input element types should match")?;
    if params.strategy.masked_bgemm {
        validate_masked_bgemm(params)?;
    }
    validate_deterministic_cd_concurrency(params)?;
    validate_fp8_output(params, output.element_type)?;
    ensure(
        controls.rounding_mode == RoundingMode::RoundToNearest
            && controls.acc_rounding_mode == RoundingMode::RoundToNearest,
        "gaudi2 only supports round nearest in EU",
    )?;

    for (input, bias) in [(a, controls.fp8_bias_in), (b, controls.fp8_bias_in2)] {
        if input.element_type == DataType::Fp8_143 {
            ensure(
                FP8_143_BIASES.contains(&bias),
                "user defined bias of input should be of values 3/7/11/15 only",
            )?;
        }
    }
    for (input, bias) in [(a, controls.fp8_bias_in), (b, controls.fp8_bias_in2)] {
        if input.element_type == DataType::Fp8_152 {
            ensure(bias == EXPONENT_BIAS_FP8_152_15, "user defined bias of input should be 15")?;
        }
    }
    match output.element_type {
        DataType::Fp8_143 => ensure(
            FP8_143_BIASES.contains(&controls.fp8_bias_out),
            "user defined bias of output should be of values 3/7/11/15 only",
        )?,
        DataType::Fp8_152 => ensure(
            (FP8_152_OUTPUT_BIAS_MIN..=FP8_152_OUTPUT_BIAS_MAX).contains(&controls.fp8_bias_out),
            "user defined bias of output should be of values 1-30 only",
        )?,
        _ => {}
    }

    if params.strategy.is_deterministic && params.op_type == OpType::DeterministicDedw {
        ensure(
            params.strategy.cd_concurrency_en == BoolWithUndef::TurnedOn
                && params.strategy.reduction_level > 1,
            "Deterministic dedw is set only when cd concurrency is active",
        )?;
    }
    validate_signaling(params)?;
    ensure(
        !(params.strategy.unroll_en
            && params.strategy.batch_concurrency_en == BoolWithUndef::TurnedOn),
        "these are competing optimizations, only one can be selected",
    )?;
    validate_common_ops(params)
}

fn validate_gaudi3(params: &LayerParams) -> DescGenResult<()> {
    let output = params.operand(InternalOperand::C);
    let a = params.operand(InternalOperand::A);
    let b = params.operand(InternalOperand::B);
    let controls = &params.controls;

    ensure(
        params.strategy.mme_limit.is_power_of_two() && params.strategy.mme_limit <= 8,
        "mmes can be limited to either 1, 2, 4 or 8",
    )?;
    ensure(!params.strategy.masked_bgemm, "maskedBgemm is not yet supported")?;

    if params.is_native_dma() {
        ensure(
            a.element_type == output.element_type,
            "dma operations dont support type conversion",
        )?;
        let sizes_valid = if params.op_type == OpType::Memcpy {
            ensure(
                matches!(params.strategy.geometry, Geometry::Geo4xw | Geometry::Geo2xw),
                "4xw/2xw geometries are not yet supported in memcpy operation",
            )?;
            a.sizes == output.sizes
        } else {
            is_valid_transpose(a, output)
        };
        return ensure(sizes_valid, "invalid input/output sizes");
    }

    if a.element_type != b.element_type {
        let both_fp8 = a.element_type.is_fp8() && b.element_type.is_fp8();
        let both_fp16 = a.element_type.is_fp16() && b.element_type.is_fp16();
        ensure(both_fp8 || both_fp16, "input element types should match")?;
    }
    validate_deterministic_cd_concurrency(params)?;
    validate_fp8_output(params, output.element_type)?;
    let a_bias_valid =
        a.element_type != DataType::Ufp16 || controls.fp8_bias_in == EXPONENT_BIAS_UFP16_31;
    let b_bias_valid =
        b.element_type != DataType::Ufp16 || controls.fp8_bias_in2 == EXPONENT_BIAS_UFP16_31;
    let ufp16_bias_valid = a_bias_valid && b_bias_valid;
    ensure(ufp16_bias_valid, "ufp16 supports only a single bias")?;

    validate_signaling(params)?;
    validate_common_ops(params)
}

fn validate_masked_bgemm(params: &LayerParams) -> DescGenResult<()> {
    ensure(
        params.x.element_type == params.x_aux.element_type,
        "input element types should match",
    )?;
    ensure(
        params.w.element_type == params.w_aux.element_type,
        "input element types should match",
    )?;
    let non_common_a = usize::from(is_transposed(params.op_type, InternalOperand::A));
    let non_common_b = usize::from(is_transposed(params.op_type, InternalOperand::B));
    ensure(
        params.x.sizes[non_common_a] == params.x_aux.sizes[non_common_a],
        "masked SP size doesnt match gemm SP size",
    )?;
    ensure(
        params.w.sizes[non_common_b] == params.w_aux.sizes[non_common_b],
        "masked FCD size doesnt match gemm FCD size",
    )?;
    ensure(
        params.y.sizes == params.y_aux.sizes,
        "masked output size doesnt match gemm output size",
    )
}

/// The output must be dense and the packing factor a product of its
/// outermost dims
fn validate_deterministic_cd_concurrency(params: &LayerParams) -> DescGenResult<()> {
    if !params.is_deterministic_cd_concurrency() {
        return Ok(());
    }
    let output = params.operand(InternalOperand::C);
    ensure(
        !output.is_strided(),
        "Deterministic cd concurrency requires non-strided output tensor",
    )?;
    let packing_factor = params.strategy.packing_factor;
    let mut suffix_product = 1u64;
    let mut valid = false;
    for dim in (0..MAX_TENSOR_DIMS).rev() {
        if packing_factor as u64 == suffix_product {
            valid = true;
            break;
        }
        suffix_product *= output.sizes[dim] as u64;
    }
    ensure(valid, "Packing factor for the deterministic cd concurrency is invalid")
}

fn validate_fp8_output(params: &LayerParams, output_type: DataType) -> DescGenResult<()> {
    let controls = &params.controls;
    if output_type.is_fp8() {
        ensure(
            params.memory.reduction_op == ReductionOp::None && !controls.atomic_add,
            "reduction is not supported for fp8 output data type",
        )?;
    }
    ensure(
        output_type.is_fp8()
            || controls.conversion_rounding_mode != RoundingMode::StochasticRoundingAndNearest,
        "RSN rounding can only be used with fp8",
    )
}

fn validate_signaling(params: &LayerParams) -> DescGenResult<()> {
    let controls = &params.controls;
    ensure(
        controls.signaling_mode != SignalingMode::Once || controls.squash_io_rois,
        "when signaling only once, ROIs have to be squashed",
    )?;
    ensure(
        controls.signaling_mode != SignalingMode::Partial,
        "signal partial is not yet supported",
    )
}

/// Gemm batch, reduction add and transposed dedx rules shared by both chips
fn validate_common_ops(params: &LayerParams) -> DescGenResult<()> {
    validate_gemm(params)?;
    validate_reduction_add(params)?;
    if params.op_type == OpType::TransposedDedx {
        let stride = params.conv.stride;
        let packed_stride = stride[0].checked_div(params.strategy.packing_factor);
        ensure(
            packed_stride == Some(1) && stride[1] == 1 && stride[2] == 1,
            "transposed_dedx doesn't support subProblems",
        )?;
    }
    Ok(())
}

fn validate_gemm(params: &LayerParams) -> DescGenResult<()> {
    let a = params.operand(InternalOperand::A);
    let b = params.operand(InternalOperand::B);
    let c = params.operand(InternalOperand::C);
    if params.is_gemm() && !params.is_gemm_dma() {
        // batches of A and B are either broadcast or equal to the output's
        for dim in 2..MAX_TENSOR_DIMS {
            let a_ok = a.sizes[dim] == 1 || a.sizes[dim] == c.sizes[dim];
            let b_ok = b.sizes[dim] == 1 || b.sizes[dim] == c.sizes[dim];
            ensure(a_ok && b_ok, "batch sizes are invalid")?;
        }
    }
    if params.is_gemm_dma() {
        let last = MAX_TENSOR_DIMS - 1;
        ensure(
            a.sizes[last] == 1 && c.sizes[last] == 1,
            "gemm transpose doesnt have enough loops to support 5 dim tensors",
        )?;
    }
    Ok(())
}

fn validate_reduction_add(params: &LayerParams) -> DescGenResult<()> {
    if !params.is_reduction_add() {
        return Ok(());
    }
    let packing_factor = params.strategy.packing_factor;
    let reduction_level = params.strategy.reduction_level;
    ensure(
        !params.x.is_strided() && !params.y.is_strided(),
        "In reductionAdd, tensors cannot be strided",
    )?;
    ensure(
        params.x.sizes[1] == packing_factor,
        "In reductionAdd, packing factor is inconsistent with x tensor sizes",
    )?;
    ensure(
        params.x.sizes[0] == packing_factor * reduction_level,
        "In reductionAdd, packing factor and reduction level are inconsistent with x tensor sizes",
    )?;
    let batch_dims_are_unit = (2..MAX_TENSOR_DIMS)
        .all(|dim| [&params.x, &params.w, &params.y].iter().all(|t| t.sizes[dim] == 1));
    ensure(batch_dims_are_unit, "In reduction add, all batch dims are expected to be 1")
}

/// Output is the input with the two inner dims swapped
fn is_valid_transpose(input: &TensorView, output: &TensorView) -> bool {
    input.sizes[0] == output.sizes[1]
        && input.sizes[1] == output.sizes[0]
        && input.sizes[2..] == output.sizes[2..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgemm(dt: DataType) -> LayerParams {
        let mut params = LayerParams::new(OpType::Ab);
        params.x = TensorView::dense(dt, [64, 32, 2, 1, 1]);
        params.w = TensorView::dense(dt, [128, 64, 2, 1, 1]);
        params.y = TensorView::dense(dt, [128, 32, 2, 1, 1]);
        params
    }

    fn message(chip: Chip, params: &LayerParams) -> String {
        let (ok, message) = check_params(chip, params);
        assert!(!ok);
        message
    }

    #[test]
    fn test_valid_bgemm() {
        for chip in [Chip::Gaudi2, Chip::Gaudi3] {
            assert_eq!(check_params(chip, &bgemm(DataType::Bf16)), (true, String::new()));
        }
    }

    #[test]
    fn test_mme_limit() {
        let mut params = bgemm(DataType::Bf16);
        params.strategy.mme_limit = 4;
        assert_eq!(message(Chip::Gaudi2, &params), "mmes can be limited to either 1 or 2");
        assert!(validate_params(Chip::Gaudi3, &params).is_ok());
        params.strategy.mme_limit = 3;
        assert_eq!(message(Chip::Gaudi3, &params), "mmes can be limited to either 1, 2, 4 or 8");
    }

    #[test]
    fn test_fp8_output_rejects_reduction() {
        let mut params = bgemm(DataType::Bf16);
        params.y.element_type = DataType::Fp8_152;
        params.memory.reduction_op = ReductionOp::Add;
        for chip in [Chip::Gaudi2, Chip::Gaudi3] {
            assert_eq!(
                message(chip, &params),
                "reduction is not supported for fp8 output data type"
            );
        }
        params.memory.reduction_op = ReductionOp::None;
        params.controls.atomic_add = true;
        assert_eq!(
            message(Chip::Gaudi2, &params),
            "reduction is not supported for fp8 output data type"
        );
    }

    #[test]
    fn test_mixed_inputs() {
        let mut params = bgemm(DataType::Fp8_152);
        params.w.element_type = DataType::Fp8_143;
        params.controls.fp8_bias_in2 = EXPONENT_BIAS_FP8_143_7;
        assert_eq!(message(Chip::Gaudi2, &params), "input element types should match");
        assert!(validate_params(Chip::Gaudi3, &params).is_ok());
        params.w.element_type = DataType::Bf16;
        assert_eq!(message(Chip::Gaudi3, &params), "input element types should match");
    }

    #[test]
    fn test_fp8_biases() {
        let mut params = bgemm(DataType::Fp8_143);
        params.controls.fp8_bias_in = 5;
        assert_eq!(
            message(Chip::Gaudi2, &params),
            "user defined bias of input should be of values 3/7/11/15 only"
        );

        let mut params = bgemm(DataType::Fp8_152);
        params.controls.fp8_bias_in2 = 7;
        assert_eq!(message(Chip::Gaudi2, &params), "user defined bias of input should be 15");

        let mut params = bgemm(DataType::Bf16);
        params.y.element_type = DataType::Fp8_152;
        params.controls.fp8_bias_out = 31;
        assert_eq!(
            message(Chip::Gaudi2, &params),
            "user defined bias of output should be of values 1-30 only"
        );
        params.controls.fp8_bias_out = 30;
        assert!(validate_params(Chip::Gaudi2, &params).is_ok());
    }

    #[test]
    fn test_rounding() {
        let mut params = bgemm(DataType::Bf16);
        params.controls.conversion_rounding_mode = RoundingMode::StochasticRoundingAndNearest;
        assert_eq!(message(Chip::Gaudi3, &params), "RSN rounding can only be used with fp8");

        let mut params = bgemm(DataType::Bf16);
        params.controls.rounding_mode = RoundingMode::RoundToZero;
        assert_eq!(message(Chip::Gaudi2, &params), "gaudi2 only supports round nearest in EU");
        assert!(validate_params(Chip::Gaudi3, &params).is_ok());
    }

    #[test]
    fn test_ufp16_bias() {
        let mut params = bgemm(DataType::Ufp16);
        params.controls.fp8_bias_in = EXPONENT_BIAS_UFP16_31;
        params.controls.fp8_bias_in2 = EXPONENT_BIAS_UFP16_31;
        assert!(validate_params(Chip::Gaudi3, &params).is_ok());
        params.controls.fp8_bias_in2 = 15;
        assert_eq!(message(Chip::Gaudi3, &params), "ufp16 supports only a single bias");
    }

    #[test]
    fn test_signaling_rules() {
        let mut params = bgemm(DataType::Bf16);
        params.controls.signaling_mode = SignalingMode::Once;
        assert_eq!(
            message(Chip::Gaudi2, &params),
            "when signaling only once, ROIs have to be squashed"
        );
        params.controls.squash_io_rois = true;
        assert!(validate_params(Chip::Gaudi2, &params).is_ok());
        params.controls.signaling_mode = SignalingMode::Partial;
        assert_eq!(message(Chip::Gaudi3, &params), "signal partial is not yet supported");
    }

    #[test]
    fn test_competing_optimizations() {
        let mut params = bgemm(DataType::Bf16);
        params.strategy.unroll_en = true;
        params.strategy.batch_concurrency_en = BoolWithUndef::TurnedOn;
        assert_eq!(
            message(Chip::Gaudi2, &params),
            "these are competing optimizations, only one can be selected"
        );
    }

    #[test]
    fn test_batch_sizes() {
        let mut params = bgemm(DataType::Bf16);
        params.x.sizes[2] = 3;
        assert_eq!(message(Chip::Gaudi2, &params), "batch sizes are invalid");
        params.x.sizes[2] = 1;
        assert!(validate_params(Chip::Gaudi2, &params).is_ok());
    }

    #[test]
    fn test_masked_bgemm() {
        let mut params = bgemm(DataType::Bf16);
        params.strategy.masked_bgemm = true;
        params.x_aux = TensorView::dense(DataType::Bf16, [16, 32, 2, 1, 1]);
        params.w_aux = TensorView::dense(DataType::Bf16, [128, 16, 2, 1, 1]);
        params.y_aux = params.y;
        assert!(validate_params(Chip::Gaudi2, &params).is_ok());
        assert_eq!(message(Chip::Gaudi3, &params), "maskedBgemm is not yet supported");

        params.y_aux.sizes[1] = 16;
        assert_eq!(
            message(Chip::Gaudi2, &params),
            "masked output size doesnt match gemm output size"
        );
        params.x_aux.sizes[1] = 16;
        assert_eq!(message(Chip::Gaudi2, &params), "masked SP size doesnt match gemm SP size");
    }

    #[test]
    fn test_deterministic_packing_factor() {
        let mut params = LayerParams::new(OpType::Dedw);
        params.x = TensorView::dense(DataType::Bf16, [16, 8, 8, 1, 2]);
        params.y = TensorView::dense(DataType::Bf16, [32, 8, 8, 1, 2]);
        params.w = TensorView::dense(DataType::Bf16, [32, 16, 3, 3, 1]);
        params.strategy.is_deterministic = true;
        params.strategy.cd_concurrency_en = BoolWithUndef::TurnedOn;
        // suffix products of [32, 16, 3, 3, 1] are 1, 1, 3, 9, 144
        params.strategy.packing_factor = 9;
        assert!(validate_params(Chip::Gaudi2, &params).is_ok());
        params.strategy.packing_factor = 4;
        assert_eq!(
            message(Chip::Gaudi2, &params),
            "Packing factor for the deterministic cd concurrency is invalid"
        );
    }

    #[test]
    fn test_reduction_add() {
        let mut params = LayerParams::new(OpType::ReductionAdd);
        params.x = TensorView::dense(DataType::Fp32, [8, 4, 1, 1, 1]);
        params.w = TensorView::dense(DataType::Fp32, [64, 8, 1, 1, 1]);
        params.y = TensorView::dense(DataType::Fp32, [64, 4, 1, 1, 1]);
        params.strategy.packing_factor = 4;
        params.strategy.reduction_level = 2;
        assert!(validate_params(Chip::Gaudi2, &params).is_ok());
        params.strategy.reduction_level = 3;
        assert_eq!(
            message(Chip::Gaudi2, &params),
            concat!(
                "In reductionAdd, packing factor and reduction level are inconsistent ",
                "with x tensor sizes"
            )
        );
    }

    #[test]
    fn test_transposed_dedx_sub_problems() {
        let mut params = LayerParams::new(OpType::TransposedDedx);
        params.conv.stride = [2, 1, 1];
        assert_eq!(message(Chip::Gaudi3, &params), "transposed_dedx doesn't support subProblems");
        params.strategy.packing_factor = 2;
        assert!(validate_params(Chip::Gaudi3, &params).is_ok());
    }

    #[test]
    fn test_gaudi3_dma_sizes() {
        let mut params = LayerParams::new(OpType::Memcpy);
        params.x = TensorView::dense(DataType::Bf16, [64, 32, 1, 1, 1]);
        params.y = TensorView::dense(DataType::Bf16, [64, 32, 1, 1, 1]);
        assert_eq!(
            message(Chip::Gaudi3, &params),
            "4xw/2xw geometries are not yet supported in memcpy operation"
        );
        params.strategy.geometry = Geometry::Geo4xw;
        assert!(validate_params(Chip::Gaudi3, &params).is_ok());

        params.op_type = OpType::Trans;
        assert_eq!(message(Chip::Gaudi3, &params), "invalid input/output sizes");
        params.y = TensorView::dense(DataType::Bf16, [32, 64, 1, 1, 1]);
        assert!(validate_params(Chip::Gaudi3, &params).is_ok());
        params.y.element_type = DataType::Fp32;
        assert_eq!(message(Chip::Gaudi3, &params), "dma operations dont support type conversion");
    }

    #[test]
    fn test_force_output_reduction_on_copy() {
        let mut params = bgemm(DataType::Bf16);
        params.controls.atomic_add = true;
        let original = params.to_key_bytes();
        let mut working = params.clone();
        force_output_reduction(Chip::Gaudi2, &mut working);
        assert_eq!(working.memory.reduction_op, ReductionOp::Add);
        assert_eq!(working.memory.reduction_rm, ReductionRm::RoundDown);
        assert_eq!(params.to_key_bytes(), original);
    }
}
