//! Broadcast and TM legality, at op level and inside fused-op schedules

use std::collections::BTreeMap;

use super::{Findings, Rule, Violation};
use crate::format::Dim;
use crate::fused::{FusedOpTemplate, RelName, ScheduledOp};
use crate::ir::Netlist;
use crate::op::{BroadcastDim, OpInfo, Tm};

pub struct BroadcastRule;

const RULE: &str = "broadcast";

impl Rule for BroadcastRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn check(&self, netlist: &Netlist) -> Vec<Violation> {
        let mut findings = Findings::new(RULE);
        for op in netlist.ops() {
            check_kernel_broadcast(op, &mut findings);
            check_identity_encoding(op, &mut findings);
            if let Some(template) = &op.fused {
                check_fused_tms(template, &mut findings);
            }
        }
        findings.into_violations()
    }
}

fn check_kernel_broadcast(op: &OpInfo, findings: &mut Findings) {
    for (index, slot) in op.attributes.kernel_broadcast.iter().enumerate() {
        if slot.map_or(true, |kb| kb.tiles == 0) {
            continue;
        }
        findings.require(op.tms(index).iter().any(Tm::is_broadcast), || {
            format!(
                "op={} has kernel_broadcast attribute set for input index={} but no valid broadcast tm for that input",
                op.name, index
            )
        });
    }
}

fn check_identity_encoding(op: &OpInfo, findings: &mut Findings) {
    if !op.op_type().is_matmul() || !op.kind.identity() {
        return;
    }
    if let Some(first) = op.tms(2).first() {
        findings.require(first.is_broadcast(), || {
            format!(
                "Matmul identity encoding input 2 supports only broadcast tm with kernel broadcast attribute! Op {}",
                op.name
            )
        });
    }
}

/// Broadcasts inside a fused op read intermediates whose shape is known
/// from the sub-op that last wrote them
fn check_fused_tms(template: &FusedOpTemplate, findings: &mut Findings) {
    let mut produced: BTreeMap<RelName, Dim> = BTreeMap::new();
    for sub in template.scheduled_ops() {
        for (&index, tms) in &sub.input_tms {
            let Some(&input) = sub.inputs.get(index) else { continue };
            check_sub_op_tms(template, sub, index, input, tms, &produced, findings);
        }
        produced.insert(sub.output, sub.output_dim);
    }
}

fn check_sub_op_tms(
    template: &FusedOpTemplate,
    sub: &ScheduledOp,
    index: usize,
    input: RelName,
    tms: &[Tm],
    produced: &BTreeMap<RelName, Dim>,
    findings: &mut Findings,
) {
    let binary_sfpu = template.is_binary_sfpu(sub);
    let mut has_r = false;
    let mut has_c = false;
    for tm in tms {
        match tm {
            Tm::Broadcast { dim: BroadcastDim::R, .. } => has_r = true,
            Tm::Broadcast { dim: BroadcastDim::C, .. } => has_c = true,
            Tm::Broadcast { dim: BroadcastDim::Z, .. } => {
                findings.push(format!(
                    "Fused op does not support internal z broadcast. Scheduled op {}",
                    sub.name
                ));
            }
            Tm::TileBroadcast(_) => {
                findings.require(index == 1 && sub.op_type.is_binary() && !binary_sfpu, || {
                    format!(
                        "TileBroadcast is only supported on input1 for fpu binary ops. Sub, mul and add with non Int32 inputs. Scheduled op {}",
                        sub.name
                    )
                });
            }
            _ => {}
        }
    }
    if !has_r && !has_c {
        return;
    }

    if !findings.require(input.is_intermed(), || {
        format!(
            "Broadcast inside the fused op is only supported on the intermediate buffers. {} has bad input {}.",
            sub.name, input
        )
    }) {
        return;
    }
    let Some(input_dim) = produced.get(&input) else {
        findings.push(format!("Input {} not found", input));
        return;
    };
    findings.require(!binary_sfpu, || {
        format!(
            "Broadcast inside the fused op is not supported on binary sfpu ops (quantization, requantization, dequantization, maximum and add with Int32 inputs). Scheduled op {}",
            sub.name
        )
    });

    let is_matmul = sub.op_type.is_matmul();
    if has_r {
        findings.require(input_dim.mblock_m == 1 && input_dim.ublock_rt == 1, || {
            format!(
                "Fused op supports r broadcast only when mblock_m and ublock_rt are both 1: [1, n] [1, c] -> [m, n] [r, c]. {} has bad input {}",
                sub.name, input
            )
        });
        if sub.output_dim.mblock_m != 1 {
            findings.require(input_dim.mblock_n == 1, || {
                format!(
                    "Fused op r broadcast requires mblock_n == 1 if the broadcast is increasing mblock_m dimension. {} has bad input {}",
                    sub.name, input
                )
            });
        }
        findings.require(!is_matmul, || {
            format!(
                "Fused op supports only c broadcast on input0 for matmul. {} is invalid.",
                sub.name
            )
        });
    }
    if has_c {
        if is_matmul {
            findings.require(
                (input_dim.mblock_n == 1 || input_dim.mblock_n == sub.m_k) && index == 0,
                || {
                    format!(
                        "Matmul in fused op supports only following scenarios and only on input0: [m, 1] [r, c] -> [m, n] [r, k] and [m, n] [r, c] -> [m, n] [r, k]. {} has bad input {}",
                        sub.name, input
                    )
                },
            );
        } else {
            findings.require(input_dim.mblock_n == 1 && input_dim.ublock_ct == 1, || {
                format!(
                    "Fused op supports c broadcast only when mblock_n and ublock_ct are both 1: [m, 1] [r, 1] -> [m, n] [r, c]. {} has bad input {}",
                    sub.name, input
                )
            });
        }
    }
    findings.require(!(has_r && has_c), || {
        format!(
            "Fused op internal rc broadcast is not supported. Scheduled op {}",
            sub.name
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::testutil;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn broadcast_error(source: Value) -> String {
        match testutil::compile(source).unwrap_err() {
            CompileError::LegalityError { rule, message } => {
                assert_eq!(rule, RULE);
                message
            }
            other => panic!("expected a broadcast error, got {}", other),
        }
    }

    /// `fused_pipeline` with `mm` writing a single-tile-row intermediate
    fn narrow_intermediate(ublock: [u32; 2]) -> Value {
        let mut source = testutil::fused_pipeline();
        source["fused_ops"]["0"]["schedules"][0][0]["mm"]["ublock"] = json!(ublock);
        source
    }

    fn add_op(source: &mut Value) -> &mut Value {
        &mut source["fused_ops"]["0"]["schedules"][1][0]["add"]
    }

    #[test]
    fn test_row_broadcast_of_single_row_intermediate() {
        let mut source = narrow_intermediate([1, 2]);
        add_op(&mut source)["input_0_tms"] = json!([{ "broadcast": { "r": 2 } }]);
        let netlist = testutil::compile(source).unwrap();
        assert!(BroadcastRule.check(&netlist).is_empty());
    }

    #[test]
    fn test_rc_broadcast_rejected() {
        let mut source = narrow_intermediate([1, 1]);
        add_op(&mut source)["input_0_tms"] =
            json!([{ "broadcast": { "r": 2 } }, { "broadcast": { "c": 2 } }]);
        assert_eq!(
            broadcast_error(source),
            "Fused op internal rc broadcast is not supported. Scheduled op add"
        );
    }

    #[test]
    fn test_broadcast_of_fused_input_rejected() {
        let mut source = testutil::fused_pipeline();
        add_op(&mut source)["input_1_tms"] = json!([{ "broadcast": { "z": 2 } }]);
        assert_eq!(
            broadcast_error(source),
            "Fused op does not support internal z broadcast. Scheduled op add"
        );
    }

    #[test]
    fn test_tile_broadcast_only_on_input1() {
        let mut source = testutil::fused_pipeline();
        add_op(&mut source)["input_0_tms"] = json!([{ "tile_broadcast": "r" }]);
        let msg = broadcast_error(source);
        assert!(msg.starts_with("TileBroadcast is only supported on input1"), "{}", msg);

        let mut source = testutil::fused_pipeline();
        add_op(&mut source)["input_1_tms"] = json!([{ "tile_broadcast": "r" }]);
        let netlist = testutil::compile(source).unwrap();
        assert!(BroadcastRule.check(&netlist).is_empty());
    }

    #[test]
    fn test_kernel_broadcast_needs_broadcast_tm() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["graphs"]["fwd"]["copy"]["attributes"] = json!({ "kernel_broadcast": { "input_0": 4 } });
        assert_eq!(
            broadcast_error(source),
            "op=copy has kernel_broadcast attribute set for input index=0 but no valid broadcast tm for that input"
        );
    }
}
