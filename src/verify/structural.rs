//! Entity well-formedness, producer/consumer cardinality, core placement,
//! untilized outputs, aliases and per-kind input shapes

use log::{debug, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use super::{Findings, Rule, Violation};
use crate::format::Dim;
use crate::ir::{GraphId, Netlist};
use crate::op::{BinaryOp, InputSource, OpInfo, OpKind};
use crate::program::Instruction;
use crate::queue::{QueueInfo, QueueLocation, QueueType};

pub struct StructuralRule;

const RULE: &str = "structural";

impl Rule for StructuralRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn check(&self, netlist: &Netlist) -> Vec<Violation> {
        let mut findings = Findings::new(RULE);
        check_queues(netlist, &mut findings);
        check_graphs(netlist, &mut findings);
        findings.extend(check_producers(netlist));
        check_consumer_input_counts(netlist, &mut findings);
        check_unique_op_names(netlist, &mut findings);
        check_core_overlap(netlist, &mut findings);
        check_untilized_outputs(netlist, &mut findings);
        check_aliases(netlist, &mut findings);
        check_forked_dram_inputs(netlist, &mut findings);
        check_kind_inputs(netlist, &mut findings);
        warn_buffered_queues(netlist);
        findings.into_violations()
    }
}

fn dim_is_valid(findings: &mut Findings, owner: &str, dim: &Dim) {
    findings.require(dim.is_valid(), || {
        format!(
            "{} has invalid dims t={} ublock=[{},{}] mblock=[{},{}]; every dim must be > 0",
            owner, dim.t, dim.ublock_rt, dim.ublock_ct, dim.mblock_m, dim.mblock_n
        )
    });
}

fn check_queues(netlist: &Netlist, findings: &mut Findings) {
    for queue in netlist.queues() {
        dim_is_valid(findings, &format!("queue={}", queue.name), &queue.dim);
        let grid_ok = findings.require(queue.grid_size.r > 0 && queue.grid_size.c > 0, || {
            format!(
                "queue={} has invalid grid_size=[{},{}]",
                queue.name, queue.grid_size.r, queue.grid_size.c
            )
        });
        if grid_ok && queue.loc == QueueLocation::Dram {
            findings.require(queue.alloc_info.len() == queue.grid_size.cores() as usize, || {
                format!(
                    "queue={}: number of allocations ({}) must match number of cores ({}) in dram mode",
                    queue.name,
                    queue.alloc_info.len(),
                    queue.grid_size.cores()
                )
            });
        }
    }
}

fn check_graphs(netlist: &Netlist, findings: &mut Findings) {
    for graph in netlist.graphs() {
        findings.require(graph.input_count >= 1, || {
            format!("graph={} has invalid input_count={}", graph.name, graph.input_count)
        });
    }
    for op in netlist.ops() {
        check_op(netlist, op, findings);
    }
}

fn check_op(netlist: &Netlist, op: &OpInfo, findings: &mut Findings) {
    let op_type = op.op_type();
    dim_is_valid(findings, &format!("op={}", op.name), &op.output_dim);
    if op_type.is_matmul() {
        findings.require(op.ublock_order_is_r(), || {
            format!("op={}: ublock_order must be r for matmul op", op.name)
        });
    }
    if op.gradient_op {
        let allowed = op_type.is_matmul()
            || op_type.is_datacopy()
            || op_type.binary_op() == Some(BinaryOp::Multiply)
            || netlist.arch().supports_any_gradient_op();
        findings.require(allowed, || {
            format!("Unsupported gradient_op set for op {}, type {}", op.name, op_type)
        });
    }
    if op_type.is_tensix() {
        findings.require(op.grid_loc.len() == 2, || {
            format!("op={} has invalid grid_loc {:?}; expected [y, x]", op.name, op.grid_loc)
        });
    }
    findings.require(op.grid_size_x() > 0 && op.grid_size_y() > 0, || {
        format!(
            "op={} has invalid grid_size=[{},{}]",
            op.name,
            op.grid_size_y(),
            op.grid_size_x()
        )
    });
    findings.require(op.inputs.len() == op.input_formats.len(), || {
        format!(
            "op={}: number of in_df formats ({}) must match number of inputs ({})",
            op.name,
            op.input_formats.len(),
            op.inputs.len()
        )
    });
    findings.require(op.forked_dram_inputs.len() <= op.inputs.len(), || {
        format!(
            "op={}: forked_dram_inputs ({}) cannot outnumber inputs ({})",
            op.name,
            op.forked_dram_inputs.len(),
            op.inputs.len()
        )
    });
    if op.untilize_output {
        findings.require(op.ublock_order_is_r(), || {
            format!("op={}: untilize_output must have ublock order r", op.name)
        });
    }
}

/// Each op-fed queue has exactly one producer with a matching tile dim.
/// Queues are independent, so they are checked in parallel.
fn check_producers(netlist: &Netlist) -> Vec<Violation> {
    let per_queue: Vec<Vec<Violation>> = netlist
        .queues()
        .par_iter()
        .filter_map(|queue| queue.source.producer_op().map(|producer| (queue, producer)))
        .map(|(queue, producer)| {
            let mut findings = Findings::new(RULE);
            let producers: Vec<&OpInfo> = netlist.ops().iter().filter(|op| op.name == producer).collect();
            for op in &producers {
                findings.require(op.tile_dim == queue.tile_dim, || {
                    format!(
                        "Op {} and the queue {} it's feeding must have the same tile dim ({} vs {})",
                        op.name, queue.name, op.tile_dim, queue.tile_dim
                    )
                });
            }
            if producers.is_empty() {
                findings.push(format!(
                    "Cannot find the producer op for queue = {} Producer Op = {}",
                    queue.name, producer
                ));
            } else {
                findings.require(producers.len() == 1, || {
                    format!(
                        "Producer count of queues that are outputted by device must be 1. Only 1 op can produce the output for queue = {}",
                        queue.name
                    )
                });
            }
            findings.into_violations()
        })
        .collect();
    per_queue.into_iter().flatten().collect()
}

fn check_consumer_input_counts(netlist: &Netlist, findings: &mut Findings) {
    for op in netlist.ops() {
        let graph = netlist.graph_of(op);
        for source in &op.input_sources {
            let InputSource::Queue(id) = source else {
                continue;
            };
            let queue = netlist.queue(*id);
            match queue.queue_type {
                QueueType::Queue => {
                    findings.require(queue.input_count == Some(graph.input_count), || {
                        format!(
                            "Input count derived for queue={} must match graph={} which consumes it with input_count={}",
                            queue.name, graph.name, graph.input_count
                        )
                    });
                }
                QueueType::Ram if queue.is_param_or_constant() => {
                    findings.require(queue.input_count == Some(1), || {
                        format!("Input count for param/constant ram {} must be 1", queue.name)
                    });
                }
                QueueType::Ram => {}
            }
        }
    }
}

fn check_unique_op_names(netlist: &Netlist, findings: &mut Findings) {
    let mut seen = BTreeSet::new();
    for op in netlist.ops() {
        if !seen.insert(op.name.as_str()) {
            findings.push(format!("Op {} is not globally unique", op.name));
        }
    }
}

fn check_core_overlap(netlist: &Netlist, findings: &mut Findings) {
    for graph_id in netlist.graph_ids() {
        let graph = netlist.graph(graph_id);
        let mut cores: BTreeMap<(u32, u32), &str> = BTreeMap::new();
        for op in netlist.graph_ops(graph_id).filter(|op| op.op_type().is_tensix()) {
            let mut reported = false;
            for x in op.grid_loc_x()..op.grid_loc_x() + op.grid_size_x() {
                for y in op.grid_loc_y()..op.grid_loc_y() + op.grid_size_y() {
                    if let Some(other) = cores.insert((x, y), &op.name) {
                        if !reported {
                            findings.push(format!(
                                "op={} is overlapping cores with another op={} in graph={}",
                                op.name, other, graph.name
                            ));
                            reported = true;
                        }
                    }
                }
            }
        }
    }
}

/// Untilized ops write exactly one single-core queue, and neither the op
/// nor that queue may feed another op
fn check_untilized_outputs(netlist: &Netlist, findings: &mut Findings) {
    let mut untilized_queues = BTreeSet::new();
    for op in netlist.ops().iter().filter(|op| op.untilize_output) {
        let fed: Vec<&QueueInfo> = netlist
            .queues()
            .iter()
            .filter(|queue| queue.source.producer_op() == Some(op.name.as_str()))
            .collect();
        match fed.as_slice() {
            [] => findings.push(format!("Untilized op {} must feed a queue", op.name)),
            [queue] => {
                findings.require(queue.grid_size.r == 1 && queue.grid_size.c == 1, || {
                    format!(
                        "Grid size must be [1,1] for queue={} that is fed by untilize_output op {}",
                        queue.name, op.name
                    )
                });
                untilized_queues.insert(queue.name.as_str());
            }
            [first, second, ..] => findings.push(format!(
                "Op={} with untilize output must only feed 1 queue; forking is not supported. Used to feed queues={},{}",
                op.name, first.name, second.name
            )),
        }
    }

    for op in netlist.ops() {
        for (input, source) in op.inputs.iter().zip(&op.input_sources) {
            match source {
                InputSource::Op(producer) if netlist.op(*producer).untilize_output => findings.push(format!(
                    "Input={} to op={} is an op with untilize output. Untilized output is not allowed to feed other ops",
                    input, op.name
                )),
                InputSource::Queue(_) if untilized_queues.contains(input.as_str()) => findings.push(format!(
                    "Input={} to op={} is an IO which is written to by an untilized output op. Untilized output is not allowed to feed other ops",
                    input, op.name
                )),
                _ => {}
            }
        }
    }
}

/// An alias names another RAM with identical allocations and volume
fn check_aliases(netlist: &Netlist, findings: &mut Findings) {
    for queue in netlist.queues() {
        let Some(alias) = &queue.alias else {
            continue;
        };
        if !findings.require(*alias != queue.name, || {
            format!("IO={} Cannot alias to itself with alias={}", queue.name, alias)
        }) {
            continue;
        }
        let Some(target) = netlist.queue_by_name(alias) else {
            findings.push(format!(
                "IO={} is alias of IO={} which isn't defined in queues section",
                queue.name, alias
            ));
            continue;
        };
        findings.require(target.alias.is_none(), || {
            format!(
                "IO={} cannot be an alias of IO={} which is already an alias",
                queue.name, alias
            )
        });
        findings.require(queue.is_ram(), || {
            format!("IO={} cannot be an alias since it is not a ram", queue.name)
        });
        findings.require(target.is_ram(), || {
            format!("IO={} cannot be an alias of IO={} which is not a ram", queue.name, alias)
        });
        findings.require(target.alloc_info == queue.alloc_info, || {
            format!(
                "IO={} cannot be an alias of IO={} unless its allocation information is the same",
                queue.name, alias
            )
        });
        findings.require(target.total_elements() == queue.total_elements(), || {
            format!(
                "IO={} has total_elements={} entries={} cannot be an alias of IO={} with total_elements={} entries={} unless its total number of elements is the same",
                queue.name,
                queue.total_elements(),
                queue.entries,
                alias,
                target.total_elements(),
                target.entries
            )
        });
    }
}

fn check_forked_dram_inputs(netlist: &Netlist, findings: &mut Findings) {
    for op in netlist.ops() {
        let graph = netlist.graph_of(op);
        for (queue, reader) in &op.forked_dram_inputs {
            findings.require(netlist.queue_id(queue).is_some(), || {
                format!(
                    "dram_input={} specified in op={} graph={} must be an actual dram queue",
                    queue, op.name, graph.name
                )
            });
            findings.require(op.uses_input(queue), || {
                format!(
                    "dram_input={} specified in op={} graph={} must be an actual input to the op",
                    queue, op.name, graph.name
                )
            });
            let same_graph = netlist
                .op_by_name(reader)
                .map_or(false, |reader| reader.graph == op.graph);
            findings.require(same_graph, || {
                format!(
                    "forked_dram_input={}:{} in op={} graph={} must belong in same graph as the op that is using the fork",
                    queue, reader, op.name, graph.name
                )
            });
        }
    }
}

/// Shape and encoding rules specific to embedding, tilizer, depthwise and
/// identity matmul ops
fn check_kind_inputs(netlist: &Netlist, findings: &mut Findings) {
    for op in netlist.ops() {
        let graph = &netlist.graph_of(op).name;
        match &op.kind {
            OpKind::Embedding { num_indices } => {
                findings.require(num_indices % 32 == 0, || {
                    format!(
                        "graph={}, op={} is an embedding op where num_indices={} is not aligned to multiples of 32",
                        graph, op.name, num_indices
                    )
                });
                findings.require(op.output_dim.ublock_rt == 1, || {
                    format!(
                        "graph={}, op={} is an embedding op and must have output ublock_rt={} equal 1",
                        graph, op.name, op.output_dim.ublock_rt
                    )
                });
                findings.require(num_indices / 32 == op.output_dim.mblock_m, || {
                    format!(
                        "graph={}, op={} is an embedding op and must have num_indices={}/32 == mblock_m={}",
                        graph, op.name, num_indices, op.output_dim.mblock_m
                    )
                });
            }
            OpKind::Tilizer => {
                findings.require(op.input_tms.iter().all(Vec::is_empty), || {
                    format!(
                        "graph={}, op={} is a tilizer op and should not have tm on input",
                        graph, op.name
                    )
                });
                if let Some(input) = op.input_dims.first() {
                    let out = &op.output_dim;
                    if input.ublock_rt > 1 || out.ublock_rt > 1 {
                        findings.require(
                            input.ublock_rt == out.ublock_rt && input.ublock_ct == out.ublock_ct,
                            || {
                                format!(
                                    "graph={}, op={}: tilizer input and output ublock dims must match when ublock_rt>1, input ublock=[{},{}] != output ublock=[{},{}]",
                                    graph, op.name, input.ublock_rt, input.ublock_ct, out.ublock_rt, out.ublock_ct
                                )
                            },
                        );
                    }
                }
            }
            OpKind::Depthwise(attrs) => {
                findings.require(attrs.u_kt == 1, || {
                    format!("graph={}, op={} is a depthwise op and must have u_kt == 1", graph, op.name)
                });
                findings.require(attrs.m_k > 0, || {
                    format!("graph={}, op={} is a depthwise op and must have m_k > 0", graph, op.name)
                });
            }
            OpKind::Matmul(attrs) if attrs.identity => {
                if findings.require(op.inputs.len() >= 3, || {
                    format!(
                        "graph={}, op={} is a matmul identity op where num_inputs={} is < 3",
                        graph,
                        op.name,
                        op.inputs.len()
                    )
                }) {
                    let encodings = op.input_formats.get(2).copied();
                    findings.require(encodings.map_or(false, |df| df.is_raw()), || {
                        format!(
                            "graph={}, op={} is a matmul identity op where encodings df={} is not RawUInt8/RawUInt16/RawUInt32",
                            graph,
                            op.name,
                            encodings.map_or_else(|| "missing".to_string(), |df| df.to_string())
                        )
                    });
                }
            }
            _ => {}
        }
    }
}

/// Op-fed queues read by exactly one op in the same epoch act as buffers.
/// Multi-entry buffers that are not dynamically allocated, or that advance
/// their read pointer by more than one, are tolerated with a warning.
fn warn_buffered_queues(netlist: &Netlist) {
    let mut buffered: BTreeMap<usize, BTreeSet<&str>> = BTreeMap::new();
    for queue in netlist.queues().iter().filter(|queue| queue.entries > 1) {
        let Some(producer) = queue.source.producer_op().and_then(|name| netlist.op_by_name(name)) else {
            continue;
        };
        let Some(consumers) = netlist.consumers.get(&queue.name) else {
            continue;
        };
        if consumers.len() != 1 {
            continue;
        }
        let Some(consumer) = consumers.iter().next().and_then(|name| netlist.op_by_name(name)) else {
            continue;
        };
        if consumer.inputs.iter().filter(|input| **input == queue.name).count() != 1 {
            continue;
        }
        let epoch_of = |graph: GraphId| netlist.temporal.epoch_of(&netlist.graph(graph).name);
        if let (Some(producer_epoch), Some(consumer_epoch)) = (epoch_of(producer.graph), epoch_of(consumer.graph)) {
            if producer_epoch == consumer_epoch {
                buffered.entry(producer_epoch).or_default().insert(&queue.name);
            }
        }
    }
    if buffered.is_empty() {
        return;
    }

    let mut not_dynamic = BTreeSet::new();
    for program in netlist.programs() {
        let mut dynamic = BTreeSet::new();
        for instruction in &program.instructions {
            match instruction {
                Instruction::AllocateQueue(names) => dynamic.extend(names.iter().map(String::as_str)),
                Instruction::DeallocateQueue(names) => {
                    for name in names {
                        dynamic.remove(name.as_str());
                    }
                }
                Instruction::Execute(execute) => {
                    let Some(queues) = netlist
                        .temporal
                        .epoch_of(&execute.graph_name)
                        .and_then(|epoch| buffered.get(&epoch))
                    else {
                        continue;
                    };
                    for setting in &execute.queue_settings {
                        let autoinc = setting.rd_ptr_autoinc.as_deref().unwrap_or("");
                        if !autoinc.is_empty() && autoinc != "1" && queues.contains(setting.name.as_str()) {
                            warn!("Queue {} is buffered but read pointer auto inc > 1", setting.name);
                        }
                    }
                    not_dynamic.extend(queues.difference(&dynamic).copied());
                }
                _ => {}
            }
        }
    }
    if !not_dynamic.is_empty() {
        warn!(
            "Missing explicit allocate_queue for {} buffered queue(s) with more than 1 entry",
            not_dynamic.len()
        );
        for queue in not_dynamic {
            debug!("Queue {} is not dynamically allocated", queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::testutil;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn structural_error(source: Value) -> String {
        match testutil::compile(source).unwrap_err() {
            CompileError::LegalityError { rule, message } => {
                assert_eq!(rule, RULE);
                message
            }
            other => panic!("expected a structural legality error, got {}", other),
        }
    }

    #[test]
    fn test_simple_pipeline_has_one_producer() {
        let netlist = testutil::compile(testutil::simple_pipeline("wormhole_b0")).unwrap();
        assert!(check_producers(&netlist).is_empty());
        let q1 = netlist.queue_by_name("q1").unwrap();
        let producers = netlist.ops().iter().filter(|op| Some(op.name.as_str()) == q1.source.producer_op());
        assert_eq!(producers.count(), 1);
        assert!(StructuralRule.check(&netlist).is_empty());
    }

    #[test]
    fn test_missing_producer() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["queues"]["q1"]["input"] = json!("ghost");
        let message = structural_error(source);
        assert_eq!(message, "Cannot find the producer op for queue = q1 Producer Op = ghost");
    }

    #[test]
    fn test_producer_tile_dim_must_match_queue() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["queues"]["q1"]["tile_dim"] = json!("16x32");
        let message = structural_error(source);
        assert!(message.contains("must have the same tile dim"));
    }

    #[test]
    fn test_overlapping_cores() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        let mut wide = testutil::datacopy_op(&["q0"], [0, 0]);
        wide["grid_size"] = json!([1, 2]);
        source["graphs"]["fwd"]["copy"] = wide;
        source["graphs"]["fwd"]["other"] = testutil::datacopy_op(&["q0"], [0, 1]);
        let message = structural_error(source);
        assert_eq!(message, "op=other is overlapping cores with another op=copy in graph=fwd");
    }

    #[test]
    fn test_grid_transpose_changes_footprint() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        let mut tall = testutil::datacopy_op(&["q0"], [0, 0]);
        tall["grid_size"] = json!([1, 2]);
        tall["grid_transpose"] = json!(true);
        source["graphs"]["fwd"]["copy"] = tall;
        source["graphs"]["fwd"]["other"] = testutil::datacopy_op(&["q0"], [0, 1]);
        assert!(testutil::compile(source).is_ok());
    }

    #[test]
    fn test_alias_volume_mismatch() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        let mut small = testutil::constant_ram(0, 0x1200_0000);
        small["alias"] = json!("big");
        let mut big = testutil::constant_ram(0, 0x1200_0000);
        big["mblock"] = json!([2, 1]);
        source["queues"]["small"] = small;
        source["queues"]["big"] = big;
        let message = structural_error(source);
        assert!(message.contains("IO=small"));
        assert!(message.contains("unless its total number of elements is the same"));
    }

    #[test]
    fn test_alias_must_target_ram() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        let mut ram = testutil::constant_ram(0, 0x1000_0000);
        ram["alias"] = json!("q0");
        source["queues"]["shadow"] = ram;
        let message = structural_error(source);
        assert_eq!(message, "IO=shadow cannot be an alias of IO=q0 which is not a ram");
    }

    #[test]
    fn test_untilized_output_cannot_feed_ops() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["graphs"]["fwd"]["copy"]["untilize_output"] = json!(true);
        source["graphs"]["fwd"]["next"] = testutil::datacopy_op(&["copy"], [1, 0]);
        let message = structural_error(source);
        assert!(message.starts_with("Input=copy to op=next is an op with untilize output"));
    }

    #[test]
    fn test_consumer_input_count_mismatch() {
        let mut source = testutil::two_graph_pipeline("wormhole_b0", 0, 0);
        source["graphs"]["bwd"]["input_count"] = json!(2);
        source["graphs"]["other"] = json!({
            "target_device": 0, "input_count": 1,
            "side": testutil::datacopy_op(&["q_mid"], [0, 0]),
        });
        let message = structural_error(source);
        assert!(message.starts_with("Input count derived for queue=q_mid must match graph=bwd"));
    }

    #[test]
    fn test_gradient_op_restricted_off_wormhole_b0() {
        let mut source = testutil::simple_pipeline("grayskull");
        source["graphs"]["fwd"]["copy"]["type"] = json!("exp");
        source["graphs"]["fwd"]["copy"]["gradient_op"] = json!(true);
        let message = structural_error(source);
        assert_eq!(message, "Unsupported gradient_op set for op copy, type exp");
    }

    #[test]
    fn test_embedding_indices_alignment() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        let op = &mut source["graphs"]["fwd"]["copy"];
        op["type"] = json!("embedding");
        op["inputs"] = json!(["q0", "q0"]);
        op["in_df"] = json!(["Float16_b", "Float16_b"]);
        op["ublock"] = json!([1, 2]);
        op["attributes"] = json!({ "num_indices": 48 });
        let message = structural_error(source);
        assert!(message.contains("num_indices=48 is not aligned to multiples of 32"));
    }

    #[test]
    fn test_forked_dram_reader_in_other_graph() {
        let mut source = testutil::two_graph_pipeline("wormhole_b0", 0, 0);
        source["graphs"]["bwd"]["back"]["forked_dram_inputs"] = json!([{ "q_mid": "front" }]);
        let message = structural_error(source);
        assert!(message.starts_with("forked_dram_input=q_mid:front in op=back graph=bwd"));
    }
}
