//! Per-op data format, tile shape and accumulation constraints

use super::{Findings, Rule, Violation};
use crate::arch::Arch;
use crate::format::{
    DataFormat, Dim, MathFidelity, ReluMode, SfpuExecutionThread, StochRndMode, TileDim, VectorMode,
};
use crate::ir::Netlist;
use crate::op::{BinaryOp, OpInfo, OpKind, OpType, ReduceDim, ReduceFunc};

pub struct FormatRule;

const RULE: &str = "format";

impl Rule for FormatRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn check(&self, netlist: &Netlist) -> Vec<Violation> {
        let arch = netlist.arch();
        let mut findings = Findings::new(RULE);
        for op in netlist.ops() {
            check_input_tile_dims(op, &mut findings);
            check_tile_alignment(op, &mut findings);
            check_tiny_tile_ints(op, &mut findings);
            check_tile_shapes(op, &mut findings);
            check_dest_fit(arch, op, &mut findings);
            check_untilize_format(arch, op, &mut findings);
            check_arch_formats(arch, op, &mut findings);
            check_accumulation(arch, op, &mut findings);
            check_int_formats(op, &mut findings);
            check_quantisation(op, &mut findings);
        }
        findings.into_violations()
    }
}

fn input_format(op: &OpInfo, index: usize) -> Option<DataFormat> {
    op.input_formats.get(index).copied()
}

fn input_tile(op: &OpInfo, index: usize) -> TileDim {
    op.input_tile_dims.get(index).copied().unwrap_or_default()
}

/// Ops whose kernels unpack any tile shape: datacopy, binary, sfpu and tilizer
fn handles_any_tile(op_type: OpType) -> bool {
    op_type.is_unary() || op_type.is_binary() || op_type.is_sfpu() || op_type == OpType::Tilizer
}

fn check_input_tile_dims(op: &OpInfo, findings: &mut Findings) {
    let op_type = op.op_type();
    let dense_matmul = op_type.is_matmul() && !op.kind.identity();
    let identity_matmul = op_type.is_matmul() && op.kind.identity();
    for (index, tile) in op.input_tile_dims.iter().enumerate() {
        match tile {
            TileDim::R32C32 => {}
            TileDim::R1C32 => {
                findings.require(
                    dense_matmul || (identity_matmul && index == 1) || handles_any_tile(op_type),
                    || {
                        format!(
                            "TileDim 1x32 is supported on dense matmul inputs, on identity matmul input1 or on datacopy, sfpu, or binary ops. Tried to use it on op: name {} type {} input index {}.",
                            op.name, op_type, index
                        )
                    },
                );
            }
            _ => {
                findings.require(
                    (dense_matmul && index != 2) || (identity_matmul && index == 1) || handles_any_tile(op_type),
                    || {
                        format!(
                            "TileDims 2x32, 4x32, 8x32, 16x32 and 32x16 are supported on dense matmul on input0 or input1, on identity matmul input1 or on datacopy, sfpu or binary ops. Tried to use it on op: name {} type {} input index {}.",
                            op.name, op_type, index
                        )
                    },
                );
            }
        }
    }
}

fn check_tile_alignment(op: &OpInfo, findings: &mut Findings) {
    findings.require(op.tile_dim.is_aligned_for(op.output_format), || {
        format!(
            "Op: {} output data format {} and tile dim {} combination is not supported because it is not 32B aligned. Tile size in this case is {}B.",
            op.name,
            op.output_format,
            op.tile_dim,
            op.tile_dim.size_in_bytes(op.output_format)
        )
    });
    for (index, (tile, df)) in op.input_tile_dims.iter().zip(&op.input_formats).enumerate() {
        findings.require(tile.is_aligned_for(*df), || {
            format!(
                "Op: {} input {} data format {} and tile dim {} combination is not supported because it is not 32B aligned. Tile size in this case is {}B.",
                op.name,
                index,
                df,
                tile,
                tile.size_in_bytes(*df)
            )
        });
    }
}

fn check_tiny_tile_ints(op: &OpInfo, findings: &mut Findings) {
    let has_tiny_tile = op.tile_dim.is_tiny() || op.input_tile_dims.iter().any(TileDim::is_tiny);
    if !has_tiny_tile {
        return;
    }
    let is_int8_or_32 = |df: &DataFormat| matches!(df, DataFormat::Int8 | DataFormat::Int32);
    findings.require(!op.input_formats.iter().any(is_int8_or_32), || {
        format!(
            "Tiny tiles with Int8 and Int32 input formats are not supported. Op name: {}",
            op.name
        )
    });
    findings.require(!is_int8_or_32(&op.output_format), || {
        format!(
            "Tiny tiles with Int8 and Int32 output formats are not supported. Op name: {}",
            op.name
        )
    });
}

fn check_tile_shapes(op: &OpInfo, findings: &mut Findings) {
    let op_type = op.op_type();
    let input0 = input_tile(op, 0);

    if op_type.is_sfpu() {
        let vector_mode = op.attributes.vector_mode.unwrap_or(VectorMode::Rc);
        if !matches!(input0, TileDim::R32C32 | TileDim::R32C16) {
            findings.require(vector_mode == VectorMode::R, || {
                format!(
                    "If sfpu op has 1x32, 2x32, 4x32, 8x32 or 16x32 input tile dims, then vector mode attribute must be set to R. Op {} Vector mode: {}",
                    op.name, vector_mode
                )
            });
        }
        if input0 == TileDim::R32C16 {
            findings.require(vector_mode == VectorMode::C, || {
                format!(
                    "If sfpu op has 32x16 input tile dims, then vector mode attribute must be set to C. Op {} Vector mode: {}",
                    op.name, vector_mode
                )
            });
        }
    }

    if op_type.is_binary() {
        findings.require(input_tile(op, 0) == input_tile(op, 1), || {
            format!(
                "All inputs on binary ops must have the same tile dims! Op {} does not have the same tile sizes on all inputs.",
                op.name
            )
        });
    }

    if handles_any_tile(op_type) {
        if input0 == TileDim::R32C16 || op.tile_dim == TileDim::R32C16 {
            findings.require(input0 == op.tile_dim, || {
                format!(
                    "If sfpu, binary or datacopy op has 32x16 input or output tile dims, both must be 32x16. Op: {} Input tile dims: {} Output tile dims: {}",
                    op.name, input0, op.tile_dim
                )
            });
        }
    }

    if op_type.is_datacopy() && op.gradient_op {
        findings.require(input0 == op.tile_dim, || {
            format!(
                "On datacopy op, with gradient_op == true, input tile dims must be equal to output tile dims. Op {} Input tile dims: {} Output tile dims: {}",
                op.name, input0, op.tile_dim
            )
        });
    }

    if let Some(matmul) = op.kind.matmul() {
        if !matmul.identity {
            let tiny = op.tile_dim.is_tiny() || input_tile(op, 0).is_tiny() || input_tile(op, 1).is_tiny();
            if matmul.sfpu_op.is_some() {
                findings.require(!tiny, || {
                    format!(
                        "Fusing matmul with sfpu ops is not supported when using tiny tiles feature. Op name: {}",
                        op.name
                    )
                });
            }
            if op.gradient_op {
                findings.require(!tiny, || {
                    format!(
                        "Matmul with gradient accumulation is not supported when using tiny tiles feature. Op name: {}",
                        op.name
                    )
                });
            }
        }
        let input1 = input_tile(op, 1);
        if input1 == TileDim::R32C16 || op.tile_dim == TileDim::R32C16 {
            findings.require(input1 == op.tile_dim, || {
                format!(
                    "If matmul input1 or output has 32x16 tile dims, both must be 32x16. Op name: {} Input 1 tile dims: {} Output tile dims: {}",
                    op.name, input1, op.tile_dim
                )
            });
        }
    }

    if let Some(reduce) = op.kind.reduce() {
        if reduce.func == ReduceFunc::Max {
            match reduce.dim {
                ReduceDim::R => {
                    findings.require(op.tile_dim != TileDim::R32C16, || {
                        format!(
                            "Output tile dim 32x16 is invalid for reduce row, valid tile dims are Nx32. Op name: {}",
                            op.name
                        )
                    });
                }
                ReduceDim::C => {
                    findings.require(matches!(op.tile_dim, TileDim::R32C32 | TileDim::R32C16), || {
                        format!(
                            "Output tile dims 32x32 and 32x16 are allowed for reduce column. Op name: {} output tile dims: {}",
                            op.name, op.tile_dim
                        )
                    });
                }
                ReduceDim::Z => {}
            }
        }
    }
}

fn ublock_fits(arch: Arch, name: &str, dim: &Dim, acc_df: DataFormat, findings: &mut Findings) {
    let max = arch.max_dest_tiles(acc_df);
    findings.require(dim.ublock_tiles() <= max, || {
        format!(
            "Op={} ublock dim rt={},ct={} can't fit into dest! Max ublock_dim(rt*ct)={}",
            name, dim.ublock_rt, dim.ublock_ct, max
        )
    });
}

fn check_dest_fit(arch: Arch, op: &OpInfo, findings: &mut Findings) {
    ublock_fits(arch, &op.name, &op.output_dim, op.acc_format, findings);
    if let Some(template) = &op.fused {
        for sub in template.scheduled_ops() {
            ublock_fits(arch, &sub.name, &sub.output_dim, op.acc_format, findings);
        }
    }
}

fn check_untilize_format(arch: Arch, op: &OpInfo, findings: &mut Findings) {
    if !op.untilize_output {
        return;
    }
    let float_ok = matches!(
        op.output_format,
        DataFormat::Float16 | DataFormat::Float16_b | DataFormat::Float32
    );
    let int_ok = matches!(op.output_format, DataFormat::Int8 | DataFormat::Int32) && !arch.is_grayskull();
    findings.require(float_ok || int_ok, || {
        format!(
            "Op {} untilizes its output in {}; untilized outputs must be Float16, Float16_b or Float32 (Int8 or Int32 on non-grayskull)",
            op.name, op.output_format
        )
    });
}

fn same_exponent_width(output: DataFormat, intermed: DataFormat) -> bool {
    (output.is_exp_a() && intermed.is_exp_a())
        || (output.is_exp_b() && intermed.is_exp_b())
        || (output == DataFormat::Float32 && intermed.is_exp_b())
}

fn check_arch_formats(arch: Arch, op: &OpInfo, findings: &mut Findings) {
    if !arch.is_grayskull() {
        return;
    }
    findings.require(op.acc_format != DataFormat::Float32, || {
        format!("Grayskull does not support dest in fp32 mode. Op {}", op.name)
    });
    findings.require(op.acc_format != DataFormat::Int32, || {
        format!("Grayskull does not support dest in int32 mode. Op {}", op.name)
    });
    if op.output_format != op.intermed_format && (op.gradient_op || op.kind.m_k() > 1) {
        findings.require(same_exponent_width(op.output_format, op.intermed_format), || {
            format!(
                "grayskull constraint: output_df and intermediate_df must have same exponent width for reconfiguring data format. Op {}",
                op.name
            )
        });
    }
    findings.require(
        op.attributes.sfpu_execution_thread == SfpuExecutionThread::Math,
        || {
            format!(
                "Grayskull does not support SFPU execution on non-math threads. Op {}",
                op.name
            )
        },
    );
}

fn check_accumulation(arch: Arch, op: &OpInfo, findings: &mut Findings) {
    let op_type = op.op_type();
    let matmul = op.kind.matmul();

    let accumulates = op.gradient_op
        || matmul.map_or(false, |attrs| attrs.m_k > 1 || attrs.bias);
    if accumulates {
        findings.require(!op.intermed_format.is_bfp2_or_bfp4(), || {
            format!(
                "Intermediates cannot be bfp4/2 for accumulations due to -inf saturation. Op {}",
                op.name
            )
        });
    }

    if matches!(op.acc_format, DataFormat::Float32 | DataFormat::Int32) {
        if let Some(attrs) = matmul {
            let accumulate_en = if arch.is_wormhole_b0() {
                attrs.l1_acc
            } else {
                attrs.m_k > 1
            };
            if accumulate_en {
                findings.require(op.intermed_format == op.acc_format, || {
                    format!(
                        "For matmul accumulations and accumulate data format {}, intermediate data format must be {}. Op {}",
                        op.acc_format, op.acc_format, op.name
                    )
                });
            }
        }
    }
    if op.acc_format == DataFormat::Float32 {
        findings.require(
            !matches!(op.attributes.stoch_rnd_mode, StochRndMode::Fpu | StochRndMode::All),
            || {
                format!(
                    "HW constraint: stochastic fpu rounding cannot be enabled with float32 dest. Op {}",
                    op.name
                )
            },
        );
    }
    if op.acc_format == DataFormat::Int32 {
        findings.require(!op.gradient_op, || {
            format!("gradient accumulation for int32 dest is not supported. Op {}", op.name)
        });
    }

    if op.gradient_op {
        findings.require(op.intermed_format == op.output_format, || {
            format!(
                "intermediate and output data format must be the same for gradient op {}",
                op.name
            )
        });
        findings.require(!op.transpose || op_type.is_matmul() || op_type.is_datacopy(), || {
            format!(
                "gradient ops does not support input transpose except for matmul and datacopy. Op {}",
                op.name
            )
        });
        findings.require(op_type.binary_op() != Some(BinaryOp::Maximum), || {
            format!("gradient ops does not support maximum op. Op {}", op.name)
        });
        if let Some(attrs) = matmul {
            findings.require(!attrs.identity, || {
                format!(
                    "gradient accumulation for identity matmul is not supported. Op {}",
                    op.name
                )
            });
        }
    }

    if op.untilize_output {
        if let Some(attrs) = matmul {
            findings.require(attrs.m_k == 1, || {
                format!(
                    "untilizing output buffer shared with interm operand is not supported. Op {}",
                    op.name
                )
            });
        }
        if let Some(reduce) = op.kind.reduce() {
            findings.require(!(reduce.func == ReduceFunc::Max && reduce.dim == ReduceDim::Z), || {
                format!(
                    "untilizing output of reduce max z dim op is not supported as interm operand is used. Op {}",
                    op.name
                )
            });
        }
    }

    if let Some(reduce) = op.kind.reduce() {
        if op.acc_format == DataFormat::Float32 {
            findings.require(!input_format(op, 0).map_or(false, |df| df.is_exp_a()), || {
                format!(
                    "Reduce op {} cannot have input of a-type and dest in F32 format",
                    op.name
                )
            });
        }
        if reduce.dim == ReduceDim::Z {
            let input0 = input_format(op, 0);
            findings.require(input0 == Some(op.intermed_format), || {
                format!(
                    "Reduce Z dim does not support data format conversions, input df = {}, intermed df = {}, must set both to the same format",
                    input0.map_or_else(|| "none".to_string(), |df| df.to_string()),
                    op.intermed_format
                )
            });
            findings.require(op.output_format == op.intermed_format, || {
                format!(
                    "Reduce Z dim does not support data format conversions, output df = {}, intermed df = {}, must set both to the same format",
                    op.output_format, op.intermed_format
                )
            });
        }
    }

    if let OpKind::Splice(_) = op.kind {
        for (index, pair) in op.input_formats.windows(2).enumerate() {
            findings.require(pair[0] == pair[1], || {
                format!(
                    "Splice op does not support data format conversions, input {} df = {}, input {} df = {}, must set both to the same format",
                    index,
                    pair[0],
                    index + 1,
                    pair[1]
                )
            });
        }
    }

    if op.kind.l1_acc() {
        findings.require(arch.supports_l1_acc(), || {
            format!(
                "L1 accumulation is only a feature of wormhole b0 matmul, not supported on {}. Op {}",
                arch, op.name
            )
        });
        findings.require(
            matches!(
                op.intermed_format,
                DataFormat::Float32 | DataFormat::Int32 | DataFormat::Float16_b
            ),
            || {
                format!(
                    "matmul l1 accumulation can only support accumulation in fp32, int32 and float16_b. Op {} intermed df {}",
                    op.name, op.intermed_format
                )
            },
        );
    }
}

fn check_int_formats(op: &OpInfo, findings: &mut Findings) {
    let op_type = op.op_type();
    let binary = op_type.binary_op();
    let is_quantisation = op_type.is_quantisation();
    let is_dequant = binary == Some(BinaryOp::Dequantization);
    let is_fused = op_type.is_fused();
    let (requant, dequant) = op
        .kind
        .matmul()
        .map_or((false, false), |attrs| (attrs.requant, attrs.dequant));

    if is_quantisation || op_type.is_reduce() {
        findings.require(
            !op.input_formats.contains(&DataFormat::UInt8) && op.output_format != DataFormat::UInt8,
            || {
                format!(
                    "Quantization, (de/re)quantization and reduce ops cannot use UInt8 format. Op {}",
                    op.name
                )
            },
        );
    }

    if !op.is_input_int() || op_type == OpType::Topk {
        findings.require(op.acc_format != DataFormat::Int32 || is_quantisation || is_fused, || {
            format!(
                "Dest accumulation format (acc_df) can be Int32 only if input format is Int8 or Int32 or op is quantization or fused_op. Op {}",
                op.name
            )
        });
        findings.require(!(requant || dequant), || {
            format!(
                "Requant or dequant can be enabled only when input format is Int8 or Int32. Op {}",
                op.name
            )
        });
        return;
    }

    findings.require(op.output_format.is_integer() || dequant || is_dequant || is_fused, || {
        format!(
            "If Int8, UInt8 or Int32 format is used, out data format must be Int8, UInt8 or Int32 if dequant is not enabled, output format = {} is not Int8/UInt8/Int32. Op {}",
            op.output_format, op.name
        )
    });
    if dequant {
        findings.require(!op.output_format.is_integer(), || {
            format!(
                "If dequant is enabled, output format cannot be integer, output format = {} is integer. Op {}",
                op.output_format, op.name
            )
        });
    }
    findings.require(
        matches!(op.intermed_format, DataFormat::Int8 | DataFormat::UInt8 | DataFormat::Int32),
        || {
            format!(
                "If Int8, UInt8 or Int32 format is used, interm data formats in op must be Int8, UInt8 or Int32, intermed_data_format = {} is not Int8/UInt8/Int32. Op {}",
                op.intermed_format, op.name
            )
        },
    );

    match binary {
        Some(BinaryOp::Add | BinaryOp::Maximum) => {
            for df in &op.input_formats {
                findings.require(
                    matches!(df, DataFormat::Int8 | DataFormat::UInt8 | DataFormat::Int32),
                    || {
                        format!(
                            "Add and Max can have only Int8/Uint8 or Int32 inputs for integer version of this op input = {} is not Int8/Uint8/Int32. Op {}",
                            df, op.name
                        )
                    },
                );
            }
        }
        Some(other) if !other.is_quantisation() => {
            for df in &op.input_formats {
                findings.require(matches!(df, DataFormat::Int8 | DataFormat::UInt8), || {
                    format!(
                        "Sub/Mul can have only Int8/UInt8 inputs for integer version of these ops input = {} is not Int8/UInt8. Op {}",
                        df, op.name
                    )
                });
            }
        }
        _ => {
            let exempt = is_fused || is_quantisation || requant || dequant;
            for df in &op.input_formats {
                findings.require(
                    df.is_integer() || *df == DataFormat::RawUInt32 || exempt,
                    || {
                        format!(
                            "If Int8, UInt8 or Int32 format is used, all input data formats in op must be Int8, UInt8 or Int32, input = {} is not Int8/UInt8/Int32. Op {}",
                            df, op.name
                        )
                    },
                );
            }
        }
    }

    findings.require(!(requant && dequant), || {
        format!("Requant and dequant can not be enabled for the same op {}", op.name)
    });
    findings.require(op.math_fidelity == MathFidelity::HiFi4, || {
        format!(
            "If Int8, UInt8 or Int32 is used, fidelity must be Hifi4. Op {} uses {}",
            op.name, op.math_fidelity
        )
    });
    findings.require(op.acc_format == DataFormat::Int32, || {
        format!(
            "If Int8, Uint8 or Int32 is used, dest accumulation format (acc_df) must be Int32. Op {}",
            op.name
        )
    });

    if let Some(attrs) = op.kind.matmul() {
        let int8_or_uint8 = |df: Option<DataFormat>| matches!(df, Some(DataFormat::Int8 | DataFormat::UInt8));
        findings.require(int8_or_uint8(input_format(op, 0)), || {
            format!(
                "Matmul with int inputs must have input 0 in Int8 or UInt8 format. Op {}",
                op.name
            )
        });
        findings.require(int8_or_uint8(input_format(op, 1)), || {
            format!(
                "Matmul with int inputs must have input 1 in Int8 or UInt8 format. Op {}",
                op.name
            )
        });
        findings.require(!attrs.l1_acc, || {
            format!("Matmul with int inputs can't use l1 accumulation. Op {}", op.name)
        });
        if attrs.bias {
            findings.require(input_format(op, 2) == Some(DataFormat::Int32), || {
                format!(
                    "Matmul with int inputs can't have bias input in non-Int32 format. Op {}",
                    op.name
                )
            });
        }
        if attrs.requant || attrs.dequant {
            let scalars = if attrs.bias { 3 } else { 2 };
            findings.require(input_format(op, scalars) == Some(DataFormat::Float32), || {
                format!(
                    "Matmul with int inputs must have scalars input in Float32 format. Op {}",
                    op.name
                )
            });
        }
        if attrs.identity {
            findings.require(op.inputs.len() == 3, || {
                format!(
                    "Matmul identity with int inputs can't have bias input. Op {}",
                    op.name
                )
            });
            findings.require(!(attrs.requant || attrs.dequant), || {
                format!(
                    "Requant or dequant can be enabled only on non-identity matmul with int inputs. Op {}",
                    op.name
                )
            });
        }
        findings.require(attrs.min_buffer_input != Some(1), || {
            format!(
                "Matmul with int inputs can't use min_buffer_input: 1. Op {}",
                op.name
            )
        });
    }

    let relu = &op.attributes.relu;
    if relu.enabled {
        match op.output_format {
            DataFormat::Int8 => {
                findings.require(relu.threshold.abs() < 127.0, || {
                    format!("Relu threshold must be < 127. Op {}", op.name)
                });
            }
            DataFormat::Int32 => {
                findings.require(relu.threshold == 0.0 && relu.mode == ReluMode::Min, || {
                    format!(
                        "Relu threshold must be 0 and relu mode Min for Int32 output. Op {}",
                        op.name
                    )
                });
            }
            _ => {}
        }
    }
}

fn check_quantisation(op: &OpInfo, findings: &mut Findings) {
    let Some(binary) = op.op_type().binary_op() else {
        return;
    };
    match binary {
        BinaryOp::Requantization | BinaryOp::Dequantization => {
            findings.require(
                matches!(input_format(op, 0), Some(DataFormat::Int32 | DataFormat::Int8)),
                || format!("(de/re)quantization op {} must have input[0] data format Int32", op.name),
            );
            findings.require(input_format(op, 1) == Some(DataFormat::Float32), || {
                format!("(de/re)quantization op {} must have input[1] data format Float32", op.name)
            });
            findings.require(op.acc_format == DataFormat::Int32, || {
                format!(
                    "(de/re)quantization op {} must have dest accumulation data format Int32",
                    op.name
                )
            });
            if binary == BinaryOp::Dequantization {
                findings.require(op.output_format == DataFormat::Float32, || {
                    format!("dequantization op {} must have output data format Float32", op.name)
                });
            } else {
                findings.require(op.output_format == DataFormat::Int8, || {
                    format!("requantization op {} must have output data format Int8", op.name)
                });
            }
        }
        BinaryOp::Quantization => {
            findings.require(
                input_format(op, 0) == Some(DataFormat::Float32)
                    && input_format(op, 1) == Some(DataFormat::Float32),
                || format!("quantization op {} must have all inputs data format Float32", op.name),
            );
            findings.require(op.output_format == DataFormat::Int8, || {
                format!("quantization op {} must have output data format Int8", op.name)
            });
            findings.require(op.acc_format == DataFormat::Int32, || {
                format!(
                    "quantization op {} must have dest accumulation data format Int32",
                    op.name
                )
            });
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::testutil;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn format_error(source: Value) -> String {
        match testutil::compile(source).unwrap_err() {
            CompileError::LegalityError { rule, message } => {
                assert_eq!(rule, RULE);
                message
            }
            other => panic!("expected a format legality error, got {}", other),
        }
    }

    fn with_copy(arch: &str, edit: impl FnOnce(&mut Value)) -> Value {
        let mut source = testutil::simple_pipeline(arch);
        edit(&mut source["graphs"]["fwd"]["copy"]);
        source
    }

    #[test]
    fn test_only_narrow_bfp_tiles_are_misaligned() {
        let mut misaligned = Vec::new();
        for df in DataFormat::ALL {
            for tile in TileDim::ALL {
                if !tile.is_aligned_for(df) {
                    misaligned.push(format!("{} {}", df, tile));
                }
            }
        }
        assert_eq!(
            misaligned,
            vec![
                "Bfp2 2x32", "Bfp2 1x32", "Bfp2_b 2x32", "Bfp2_b 1x32", "Bfp4 1x32", "Bfp4_b 1x32",
            ]
        );
    }

    #[test]
    fn test_misaligned_output_tile() {
        let source = with_copy("wormhole_b0", |copy| {
            copy["tile_dim"] = json!("1x32");
            copy["out_df"] = json!("Bfp2_b");
        });
        let mut source = source;
        source["queues"]["q1"]["tile_dim"] = json!("1x32");
        let msg = format_error(source);
        assert!(msg.starts_with("Op: copy output data format Bfp2_b and tile dim 1x32"), "{}", msg);
    }

    #[test]
    fn test_ublock_must_fit_in_dest() {
        let source = with_copy("wormhole_b0", |copy| copy["ublock"] = json!([4, 4]));
        assert_eq!(
            format_error(source),
            "Op=copy ublock dim rt=4,ct=4 can't fit into dest! Max ublock_dim(rt*ct)=8"
        );
    }

    #[test]
    fn test_fp32_dest_halves_capacity() {
        let source = with_copy("wormhole_b0", |copy| {
            copy["ublock"] = json!([2, 4]);
            copy["acc_df"] = json!("Float32");
        });
        assert!(format_error(source).ends_with("Max ublock_dim(rt*ct)=4"));
    }

    #[test]
    fn test_grayskull_rejects_fp32_dest() {
        let source = with_copy("grayskull", |copy| copy["acc_df"] = json!("Float32"));
        assert_eq!(
            format_error(source),
            "Grayskull does not support dest in fp32 mode. Op copy"
        );
    }

    #[test]
    fn test_grayskull_sfpu_thread() {
        let source = with_copy("grayskull", |copy| {
            copy["type"] = json!("exp");
            copy["attributes"] = json!({ "sfpu_execution_thread": "pack" });
        });
        assert!(format_error(source).starts_with("Grayskull does not support SFPU execution on non-math threads"));
    }

    #[test]
    fn test_sfpu_tiny_tile_needs_row_vector_mode() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["queues"]["q0"]["tile_dim"] = json!("16x32");
        source["graphs"]["fwd"]["copy"]["type"] = json!("exp");
        source["graphs"]["fwd"]["copy"]["tile_dim"] = json!("16x32");
        source["queues"]["q1"]["tile_dim"] = json!("16x32");
        source["graphs"]["fwd"]["copy"]["attributes"] = json!({ "vector": "rc" });
        let msg = format_error(source);
        assert!(msg.contains("vector mode attribute must be set to R"), "{}", msg);
    }

    #[test]
    fn test_derived_vector_mode_is_legal() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["queues"]["q0"]["tile_dim"] = json!("16x32");
        source["graphs"]["fwd"]["copy"]["type"] = json!("exp");
        source["graphs"]["fwd"]["copy"]["tile_dim"] = json!("16x32");
        source["queues"]["q1"]["tile_dim"] = json!("16x32");
        assert!(testutil::compile(source).is_ok());
    }

    #[test]
    fn test_int_inputs_need_hifi4_and_int32_dest() {
        let source = with_copy("wormhole_b0", |copy| {
            copy["in_df"] = json!(["Int8"]);
            copy["out_df"] = json!("Int8");
            copy["intermed_df"] = json!("Int8");
        });
        let netlist_err = format_error(source);
        assert!(netlist_err.starts_with("If Int8, UInt8 or Int32 is used, fidelity must be Hifi4"), "{}", netlist_err);
    }

    #[test]
    fn test_int_datacopy_with_hifi4_compiles() {
        let mut source = with_copy("wormhole_b0", |copy| {
            copy["in_df"] = json!(["Int8"]);
            copy["out_df"] = json!("Int8");
            copy["intermed_df"] = json!("Int8");
            copy["acc_df"] = json!("Int32");
            copy["math_fidelity"] = json!("HiFi4");
        });
        source["queues"]["q0"]["df"] = json!("Int8");
        source["queues"]["q1"]["df"] = json!("Int8");
        assert!(testutil::compile(source).is_ok());
    }

    #[test]
    fn test_int32_dest_needs_int_inputs() {
        let source = with_copy("wormhole_b0", |copy| copy["acc_df"] = json!("Int32"));
        assert!(format_error(source).starts_with("Dest accumulation format (acc_df) can be Int32 only"));
    }

    #[test]
    fn test_gradient_op_needs_matching_intermed() {
        let source = with_copy("wormhole_b0", |copy| {
            copy["gradient_op"] = json!(true);
            copy["intermed_df"] = json!("Float32");
        });
        assert_eq!(
            format_error(source),
            "intermediate and output data format must be the same for gradient op copy"
        );
    }

    #[test]
    fn test_l1_acc_requires_wormhole_b0() {
        let mut source = testutil::simple_pipeline("wormhole");
        source["queues"]["w"] = testutil::constant_ram(0, 0x1200_0000);
        let mut mm = testutil::datacopy_op(&["q0", "w"], [0, 0]);
        mm["type"] = json!("matmul");
        mm["attributes"] = json!({ "m_k": 1, "u_kt": 2, "l1_acc": true });
        source["graphs"]["fwd"]["copy"] = mm;
        let msg = format_error(source);
        assert!(msg.contains("not supported on wormhole"), "{}", msg);
    }

    #[test]
    fn test_reduce_z_keeps_formats() {
        let source = with_copy("wormhole_b0", |copy| {
            copy["type"] = json!("reduce");
            copy["attributes"] = json!({ "dim": "z", "type": "max", "z": 2 });
            copy["intermed_df"] = json!("Float16");
        });
        assert!(format_error(source).starts_with("Reduce Z dim does not support data format conversions, input df = Float16_b"));
    }
}
