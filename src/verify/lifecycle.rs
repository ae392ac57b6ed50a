//! Fused-op schedules: intermediate buffer lifetimes, sub-op placement
//! within a schedule, dest usage and sub-op dimensions

use std::collections::BTreeMap;

use super::{Findings, Rule, Violation};
use crate::arch::Arch;
use crate::format::{DataFormat, Dim};
use crate::fused::{FusedOpTemplate, RelName, ScheduledOp, MAX_INTERMEDIATE_BUFFERS};
use crate::ir::Netlist;
use crate::op::{BinaryOp, BroadcastDim, OpInfo, OpType, ReduceDim, Tm};

pub struct BufferLifecycleRule;

const RULE: &str = "buffer_lifecycle";

impl Rule for BufferLifecycleRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn check(&self, netlist: &Netlist) -> Vec<Violation> {
        let mut findings = Findings::new(RULE);
        for op in netlist.ops() {
            let Some(template) = &op.fused else { continue };
            check_template(netlist.arch(), op, template, &mut findings);
            check_intermediate_buffers(op, template, &mut findings);
            check_dest_chaining(op, template, &mut findings);
            check_sub_op_dims(op, template, &mut findings);
        }
        findings.into_violations()
    }
}

fn check_template(arch: Arch, op: &OpInfo, template: &FusedOpTemplate, findings: &mut Findings) {
    findings.require(template.num_intermediates <= MAX_INTERMEDIATE_BUFFERS, || {
        format!(
            "num_intermediates={} used is more than MAX_NUM_INTERMEDIATE_BUFFERS={} in fused_op_id={}",
            template.num_intermediates, MAX_INTERMEDIATE_BUFFERS, template.id
        )
    });
    findings.require(!template.schedules.is_empty(), || {
        format!("fused_op_id={} used by op={} must have schedules", template.id, op.name)
    });

    let is_int = template.is_int();
    findings.require(!is_int || !arch.is_grayskull(), || {
        format!("Int fused op is not supported on grayskull {}", op.name)
    });
    if is_int {
        let ends_in_dequant = template
            .schedules
            .last()
            .and_then(|schedule| schedule.last_op())
            .map_or(false, |last| last.op_type == OpType::Binary(BinaryOp::Dequantization));
        if ends_in_dequant {
            findings.require(op.output_format == DataFormat::Float32, || {
                format!(
                    "If last sub op is dequantization, output must be FP32. Op {}",
                    op.name
                )
            });
        } else {
            findings.require(matches!(op.output_format, DataFormat::Int32 | DataFormat::Int8), || {
                format!(
                    "If last sub op is not dequantization, output must be Int32 or Int8. Op {}",
                    op.name
                )
            });
        }
    }

    for schedule in &template.schedules {
        findings.require(!schedule.ops.is_empty(), || {
            format!("fused_op_id={} has an empty schedule", template.id)
        });
        let last = schedule.ops.len().saturating_sub(1);
        for (index, sub) in schedule.ops.iter().enumerate() {
            check_scheduled_op(arch, op, template, sub, index == last, findings);
        }
    }
}

fn check_scheduled_op(
    arch: Arch,
    op: &OpInfo,
    template: &FusedOpTemplate,
    sub: &ScheduledOp,
    last_in_schedule: bool,
    findings: &mut Findings,
) {
    let op_type = sub.op_type;
    findings.require(!op_type.is_fused(), || {
        format!(
            "Multiple levels of fused op nesting is not allowed. fused_op_id={}",
            sub.name
        )
    });
    findings.require(last_in_schedule || !op_type.is_matmul_or_reduce(), || {
        format!("Matmul/reduce op {} must be the last one in schedule.", sub.name)
    });
    if !findings.require(!sub.inputs.is_empty(), || {
        format!("Scheduled op {} in fused_op_id={} must have inputs", sub.name, template.id)
    }) {
        return;
    }

    if op_type.is_matmul() {
        let input1 = sub.inputs.get(1);
        findings.require(input1.map_or(false, RelName::is_input) || sub.m_k == 1, || {
            format!(
                "matmul op {} cannot have {} as input 1, only fused op input buffer can be on the input 1 if mblock has more than 1 ublocks",
                sub.name,
                input1.map_or_else(|| "nothing".to_string(), |name| name.to_string())
            )
        });
    }
    if op_type.is_reduce() && op.acc_format == DataFormat::Float32 {
        findings.require(!op.input_formats.iter().any(DataFormat::is_exp_a), || {
            format!(
                "Fused op {} with reduce and dest accumulation in F32 cannot have inputs of a-type",
                op.name
            )
        });
    }

    for name in sub.inputs_to_pop.iter().chain(&sub.inputs_to_pop_last) {
        findings.require(sub.uses(*name), || {
            format!(
                "input_to_pop={} cannot be found in the input list for op={}",
                name, sub.name
            )
        });
    }
    for name in sub.inputs_to_pop.intersection(&sub.inputs_to_pop_last) {
        findings.push(format!(
            "input_to_pop={} duplicated in the list for inputs_to_pop_last of op={}",
            name, sub.name
        ));
    }

    let binary = op_type.binary_op();
    let is_requant_dequant = binary.map_or(false, |b| b.is_requant_or_dequant());
    let is_quant = binary == Some(BinaryOp::Quantization);
    let is_int = template.is_int();
    if is_int {
        check_int_sub_op(template, sub, findings);
    }
    if is_quant || is_requant_dequant {
        findings.require(is_int, || {
            format!(
                "Quantization ops are only supported in int fused ops. Scheduled op {}",
                sub.name
            )
        });
    }

    for (index, input) in sub.inputs.iter().enumerate() {
        if !input.is_dest() {
            continue;
        }
        findings.require(index != 1 || !arch.is_grayskull(), || {
            format!("On grayskull dest can't be used as input 1. Scheduled op {}", sub.name)
        });
        findings.require(!op_type.is_matmul_or_reduce() && binary != Some(BinaryOp::Maximum), || {
            format!("Dest is forbidden as input for {} scheduled op {}", op_type, sub.name)
        });
        findings.require(!is_int || is_requant_dequant, || {
            format!(
                "In int fused ops only requant and dequant ops can have dest as input! Scheduled op {}",
                sub.name
            )
        });
    }
    if sub.output.is_dest() {
        findings.require(!template.is_binary_sfpu(sub), || {
            format!(
                "Binary sfpu ops (quantization, requantization, dequantization, maximum and add with Int32 inputs) can't have dest as output. Scheduled op {}",
                sub.name
            )
        });
    }

    if op_type.is_matmul_or_reduce() && sub.m_k > 1 {
        findings.require(sub.output.is_intermed(), || {
            format!(
                "matmul/reduce op {} cannot output to {} when m_k>1, it can only output to an intermediate buffer",
                sub.name, sub.output
            )
        });
    }
    if sub.output == RelName::Output {
        let same_shape = sub.output_dim.ublock_rt == op.output_dim.ublock_rt
            && sub.output_dim.ublock_ct == op.output_dim.ublock_ct
            && sub.output_dim.mblock_m == op.output_dim.mblock_m
            && sub.output_dim.mblock_n == op.output_dim.mblock_n;
        findings.require(same_shape, || {
            format!(
                "Scheduled op {} writes the output of op {} and must have its ublock [{},{}] and mblock [{},{}], found ublock [{},{}] and mblock [{},{}]",
                sub.name,
                op.name,
                op.output_dim.ublock_rt,
                op.output_dim.ublock_ct,
                op.output_dim.mblock_m,
                op.output_dim.mblock_n,
                sub.output_dim.ublock_rt,
                sub.output_dim.ublock_ct,
                sub.output_dim.mblock_m,
                sub.output_dim.mblock_n
            )
        });
    }
}

fn check_int_sub_op(template: &FusedOpTemplate, sub: &ScheduledOp, findings: &mut Findings) {
    let op_type = sub.op_type;
    findings.require(op_type.is_binary() || op_type.is_datacopy(), || {
        format!(
            "Only binary ops and datacopy are supported in int fused ops. Scheduled op {}",
            sub.name
        )
    });
    let format_of = |index: usize| sub.inputs.get(index).and_then(|name| template.format_of(*name));
    match op_type.binary_op() {
        Some(BinaryOp::Quantization) => {
            findings.require(sub.inputs.iter().take(2).all(RelName::is_input), || {
                format!(
                    "For quantization ops both operands have to be op inputs. Scheduled op {}",
                    sub.name
                )
            });
            findings.require(
                format_of(0) == Some(DataFormat::Float32) && format_of(1) == Some(DataFormat::Float32),
                || format!("Both inputs to quantization have to Float32. Scheduled op {}", sub.name),
            );
        }
        Some(binary) if binary.is_requant_or_dequant() => {
            let input0 = sub.inputs.first().copied();
            findings.require(input0 != Some(RelName::Dest), || {
                format!(
                    "requantization/dequantization op {} can't have dest as input0",
                    sub.name
                )
            });
            if sub.inputs.get(1) == Some(&RelName::Dest) {
                findings.require(sub.output_dim.ublock_tiles() <= 2, || {
                    format!(
                        "requantization/dequantization op {} can support up to 2 tiles in micro block dimension if dest is used as input1",
                        sub.name
                    )
                });
                findings.require(
                    input0.map_or(false, |name| name.is_input()) && format_of(0) == Some(DataFormat::Float32),
                    || {
                        format!(
                            "requantization/dequantization op {} requires input0 to be an input in Float32 if dest is used as input1",
                            sub.name
                        )
                    },
                );
            } else {
                findings.require(matches!(format_of(0), Some(DataFormat::Int8 | DataFormat::Int32)), || {
                    format!(
                        "requantization/dequantization op {} require input0 to be Int8 or Int32",
                        sub.name
                    )
                });
                findings.require(format_of(1) == Some(DataFormat::Float32), || {
                    format!(
                        "requantization/dequantization op {} require input1 to be Float32",
                        sub.name
                    )
                });
            }
        }
        binary => {
            let wide = op_type.is_datacopy() || matches!(binary, Some(BinaryOp::Add | BinaryOp::Maximum));
            for (index, input) in sub.inputs.iter().enumerate() {
                if !input.is_input() {
                    continue;
                }
                let df = format_of(index);
                if wide {
                    findings.require(matches!(df, Some(DataFormat::Int8 | DataFormat::Int32)), || {
                        format!(
                            "In int fused ops, add, maximum and datacopy sub op inputs have to be Int8 or Int32. Scheduled op {}",
                            sub.name
                        )
                    });
                } else {
                    findings.require(df == Some(DataFormat::Int8), || {
                        format!(
                            "In int fused ops, subtract and multiply sub op inputs have to be Int8. Scheduled op {}",
                            sub.name
                        )
                    });
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BufferState {
    active: bool,
    producing_schedule: usize,
    produced_by_matmul_or_reduce: bool,
    single_mblock: bool,
}

/// Intermediates follow produce -> read* -> pop. Reading one produced in an
/// earlier schedule is only allowed when that schedule ends in an
/// elementwise op, or the buffer holds a single macro block or the output
/// of a matmul/reduce.
fn check_intermediate_buffers(op: &OpInfo, template: &FusedOpTemplate, findings: &mut Findings) {
    let mut buffers: BTreeMap<usize, BufferState> = BTreeMap::new();
    for (schedule_index, schedule) in template.schedules.iter().enumerate() {
        for sub in &schedule.ops {
            for input in &sub.inputs {
                let RelName::Intermed(index) = input else { continue };
                let state = buffers.get(index).copied().unwrap_or_default();
                if !findings.require(state.active, || {
                    format!(
                        "Invalid usage of buffer {} at scheduled op {} at {} op. Buffer has to be active before being used!",
                        input, sub.name, op.name
                    )
                }) {
                    continue;
                }
                let same_schedule = state.producing_schedule == schedule_index
                    || !template.schedules[state.producing_schedule].ends_in_matmul_or_reduce();
                findings.require(
                    same_schedule || state.single_mblock || state.produced_by_matmul_or_reduce,
                    || {
                        format!(
                            "Invalid usage of buffer {} at scheduled op {} at {} op. Intermed buffers which are not produced within the schedule can only be used if they are produced by the matmul or reduce op or if they contain single macro block!",
                            input, sub.name, op.name
                        )
                    },
                );
            }

            for popped in sub.inputs_to_pop.iter().chain(&sub.inputs_to_pop_last) {
                let RelName::Intermed(index) = popped else { continue };
                let state = buffers.entry(*index).or_default();
                findings.require(state.active, || {
                    format!(
                        "Invalid usage of buffer {} at scheduled op {} at {} op. Buffer has to be produced before it's being popped!",
                        popped, sub.name, op.name
                    )
                });
                state.active = false;
            }

            if let RelName::Intermed(index) = sub.output {
                let state = buffers.entry(index).or_default();
                findings.require(!state.active, || {
                    format!(
                        "Invalid usage of buffer {} at scheduled op {} at {} op. Buffer has to be popped before being produced again!",
                        sub.output, sub.name, op.name
                    )
                });
                *state = BufferState {
                    active: true,
                    producing_schedule: schedule_index,
                    produced_by_matmul_or_reduce: sub.op_type.is_matmul_or_reduce(),
                    single_mblock: sub.output_dim.mblock_m == 1 && sub.output_dim.mblock_n == 1,
                };
            }
        }
    }

    for (index, state) in &buffers {
        findings.require(!state.active, || {
            format!(
                "Intermed{} buffer produced at schedule index: {}, wasn't popped by the end of the {} op",
                index, state.producing_schedule, op.name
            )
        });
    }
}

/// Dest does not survive a schedule boundary: it is read only after an
/// earlier sub-op of the same schedule wrote it
fn check_dest_chaining(op: &OpInfo, template: &FusedOpTemplate, findings: &mut Findings) {
    for schedule in &template.schedules {
        let mut dest_written = false;
        for sub in &schedule.ops {
            if sub.uses(RelName::Dest) {
                findings.require(dest_written, || {
                    format!(
                        "Scheduled op {} in op {} reads dest before any op of its schedule wrote it",
                        sub.name, op.name
                    )
                });
            }
            dest_written = sub.output.is_dest();
        }
    }
}

fn bcast_factor(sub: &ScheduledOp, input: usize, axis: BroadcastDim) -> u32 {
    Tm::broadcast_factor(sub.tms(input), axis)
}

/// Shapes of buffers written inside the fused op are known, so sub-ops
/// reading them must agree. External inputs are not checked.
fn check_sub_op_dims(op: &OpInfo, template: &FusedOpTemplate, findings: &mut Findings) {
    let mut known: BTreeMap<RelName, Dim> = BTreeMap::new();
    for sub in template.scheduled_ops() {
        let out = &sub.output_dim;
        let input_dim = |index: usize| sub.inputs.get(index).and_then(|name| known.get(name)).copied();
        let mismatch = || format!("Dimension mismatch in op {} of fused op {}", sub.name, op.name);
        let op_type = sub.op_type;

        if op_type.is_sfpu() || op_type.is_datacopy() || op_type.is_binary() {
            let arity = if op_type.is_binary() { 2 } else { 1 };
            for index in 0..arity {
                let Some(input) = input_dim(index) else { continue };
                let r = bcast_factor(sub, index, BroadcastDim::R);
                let c = bcast_factor(sub, index, BroadcastDim::C);
                findings.require(
                    input.mblock_m * input.ublock_rt * r == out.mblock_m * out.ublock_rt
                        && out.mblock_m >= input.mblock_m
                        && out.ublock_rt >= input.ublock_rt
                        && input.mblock_n * input.ublock_ct * c == out.mblock_n * out.ublock_ct
                        && out.mblock_n >= input.mblock_n
                        && out.ublock_ct >= input.ublock_ct,
                    mismatch,
                );
            }
        } else if op_type.is_reduce() {
            match sub.reduce.map(|(dim, _)| dim) {
                Some(ReduceDim::R) => {
                    if let Some(input) = input_dim(0) {
                        findings.require(
                            input.mblock_n == out.mblock_n
                                && input.ublock_ct == out.ublock_ct
                                && input.mblock_m == sub.m_k
                                && input.ublock_rt == sub.u_kt,
                            mismatch,
                        );
                    }
                    findings.require(out.mblock_m == 1 && out.ublock_rt == 1, mismatch);
                }
                Some(ReduceDim::C) => {
                    if let Some(input) = input_dim(0) {
                        findings.require(
                            input.mblock_m == out.mblock_m
                                && input.ublock_rt == out.ublock_rt
                                && input.mblock_n == sub.m_k
                                && input.ublock_ct == sub.u_kt,
                            mismatch,
                        );
                    }
                    findings.require(out.mblock_n == 1 && out.ublock_ct == 1, mismatch);
                }
                other => {
                    findings.push(format!(
                        "Op {} has invalid reduce dim {:?} inside fused op {}",
                        sub.name, other, op.name
                    ));
                }
            }
        } else if op_type.is_matmul() {
            if let Some(input0) = input_dim(0) {
                let c = bcast_factor(sub, 0, BroadcastDim::C);
                if c == 1 {
                    findings.require(input0.mblock_n == sub.m_k && input0.ublock_ct == sub.u_kt, || {
                        format!(
                            "If there is no broadcast input0 on matmul op {}, m_k needs to be input0.mblock_n and u_kt needs to be input0.ublock_ct. input0.mblock_n is {}, m_k is {}, input0.ublock_ct is {}, u_kt is {}",
                            sub.name, input0.mblock_n, sub.m_k, input0.ublock_ct, sub.u_kt
                        )
                    });
                } else {
                    findings.require(input0.mblock_n * input0.ublock_ct * c == sub.m_k * sub.u_kt, mismatch);
                }
                findings.require(
                    input0.mblock_m == out.mblock_m && input0.ublock_rt == out.ublock_rt,
                    mismatch,
                );
            }
            if let Some(input1) = input_dim(1) {
                findings.require(
                    input1.mblock_m == sub.m_k
                        && input1.ublock_rt == sub.u_kt
                        && input1.mblock_n == out.mblock_n
                        && input1.ublock_ct == out.ublock_ct,
                    mismatch,
                );
            }
        } else {
            findings.push(format!(
                "Op {} is of an invalid type {} inside fused op {}",
                sub.name, op_type, op.name
            ));
        }
        known.insert(sub.output, sub.output_dim);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::testutil;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn lifecycle_error(source: Value) -> String {
        match testutil::compile(source).unwrap_err() {
            CompileError::LegalityError { rule, message } => {
                assert_eq!(rule, RULE);
                message
            }
            other => panic!("expected a buffer lifecycle error, got {}", other),
        }
    }

    fn schedules(source: &mut Value) -> &mut Value {
        &mut source["fused_ops"]["0"]["schedules"]
    }

    #[test]
    fn test_fused_pipeline_is_legal() {
        let netlist = testutil::compile(testutil::fused_pipeline()).unwrap();
        assert!(BufferLifecycleRule.check(&netlist).is_empty());
    }

    #[test]
    fn test_intermediate_never_popped() {
        let mut source = testutil::fused_pipeline();
        schedules(&mut source)[1][0]["add"]["pop"] = json!([]);
        assert_eq!(
            lifecycle_error(source),
            "Intermed0 buffer produced at schedule index: 0, wasn't popped by the end of the copy op"
        );
    }

    #[test]
    fn test_read_before_produced() {
        let mut source = testutil::fused_pipeline();
        schedules(&mut source)[1][0]["add"]["inputs"] = json!(["intermed0", "input0"]);
        schedules(&mut source)[0][0]["mm"]["output"] = json!("intermed1");
        source["fused_ops"]["0"]["intermediates"] = json!(2);
        let msg = lifecycle_error(source);
        assert_eq!(
            msg,
            "Invalid usage of buffer intermed0 at scheduled op add at copy op. Buffer has to be active before being used!"
        );
    }

    #[test]
    fn test_produced_twice_without_pop() {
        let mut source = testutil::fused_pipeline();
        schedules(&mut source)[1] = json!([
            { "exp": {
                "type": "exp", "inputs": ["input0"], "output": "intermed0",
                "mblock": [1, 1], "ublock": [2, 2]
            } },
            { "add": {
                "type": "add", "inputs": ["intermed0", "input0"], "output": "output",
                "pop": ["intermed0"], "mblock": [1, 1], "ublock": [2, 2]
            } }
        ]);
        let msg = lifecycle_error(source);
        assert!(msg.contains("Buffer has to be popped before being produced again!"), "{}", msg);
        assert!(msg.contains("scheduled op exp"));
    }

    #[test]
    fn test_matmul_must_end_schedule() {
        let mut source = testutil::fused_pipeline();
        let add = schedules(&mut source)[1][0].clone();
        schedules(&mut source)[0].as_array_mut().unwrap().push(add);
        schedules(&mut source).as_array_mut().unwrap().pop();
        let msg = lifecycle_error(source);
        assert_eq!(msg, "Matmul/reduce op mm must be the last one in schedule.");
    }

    #[test]
    fn test_too_many_intermediates() {
        let mut source = testutil::fused_pipeline();
        source["fused_ops"]["0"]["intermediates"] = json!(9);
        assert!(lifecycle_error(source).starts_with("num_intermediates=9 used is more than"));
    }

    #[test]
    fn test_accumulating_matmul_needs_intermediate_output() {
        let mut source = testutil::fused_pipeline();
        schedules(&mut source)[0][0]["mm"]["output"] = json!("output");
        schedules(&mut source)[1][0]["add"]["output"] = json!("intermed0");
        let msg = lifecycle_error(source);
        assert!(msg.starts_with("matmul/reduce op mm cannot output to output when m_k>1"), "{}", msg);
    }

    #[test]
    fn test_dest_read_without_writer() {
        let mut source = testutil::fused_pipeline();
        schedules(&mut source)[1][0]["add"]["inputs"] = json!(["intermed0", "dest"]);
        let msg = lifecycle_error(source);
        assert_eq!(msg, "Scheduled op add in op copy reads dest before any op of its schedule wrote it");
    }

    #[test]
    fn test_output_sub_op_shape_matches_op() {
        let mut source = testutil::fused_pipeline();
        schedules(&mut source)[1][0]["add"]["ublock"] = json!([1, 2]);
        let msg = lifecycle_error(source);
        assert!(msg.starts_with("Scheduled op add writes the output of op copy"), "{}", msg);
    }
}
