//! Graph boundaries: epoch assignment, queueless inputs between graphs, and
//! which queues an execute instruction may bind settings for

use std::collections::{BTreeMap, BTreeSet};

use super::{Findings, Rule, Violation};
use crate::ir::{GraphId, Netlist};
use crate::op::InputSource;
use crate::program::ExecuteInstruction;
use crate::queue::{QueueSource, QueueType};

pub struct CrossGraphRule;

const RULE: &str = "cross_graph";

impl Rule for CrossGraphRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn check(&self, netlist: &Netlist) -> Vec<Violation> {
        let mut findings = Findings::new(RULE);
        check_epochs_assigned(netlist, &mut findings);
        check_queueless_inputs(netlist, &mut findings);

        let io_queues = graph_io_queues(netlist);
        let gradient_queues = gradient_queues(netlist);
        for program in netlist.programs() {
            for execute in program.executes() {
                let Some(graph) = netlist.graph_id(&execute.graph_name) else {
                    findings.push(format!(
                        "program={} executes graph={} which is not declared",
                        program.name, execute.graph_name
                    ));
                    continue;
                };
                check_execute_settings(
                    netlist,
                    &program.name,
                    execute,
                    &io_queues[&graph],
                    gradient_queues.get(&graph),
                    &mut findings,
                );
            }
        }
        findings.into_violations()
    }
}

fn check_epochs_assigned(netlist: &Netlist, findings: &mut Findings) {
    for graph in netlist.graphs() {
        findings.require(netlist.temporal.epoch_of(&graph.name).is_some(), || {
            format!("graph={} is not assigned to a temporal epoch", graph.name)
        });
    }
}

/// An op reading another graph's op directly requires architecture support
/// and a shared epoch
fn check_queueless_inputs(netlist: &Netlist, findings: &mut Findings) {
    let arch = netlist.arch();
    for op in netlist.ops() {
        for (input, source) in op.inputs.iter().zip(&op.input_sources) {
            let InputSource::Op(producer) = source else { continue };
            let producer = netlist.op(*producer);
            if producer.graph == op.graph {
                continue;
            }
            if !findings.require(arch.supports_queueless_multichip(), || {
                format!(
                    "input={} to op={} must be either a queue, or an op within the graph, cross graph communication must be through queues/buffers",
                    input, op.name
                )
            }) {
                continue;
            }
            let consumer_graph = &netlist.graph(op.graph).name;
            let producer_graph = &netlist.graph(producer.graph).name;
            let consumer_epoch = netlist.temporal.epoch_of(consumer_graph);
            let producer_epoch = netlist.temporal.epoch_of(producer_graph);
            findings.require(consumer_epoch == producer_epoch, || {
                format!(
                    "op={} in graph={} (epoch {:?}) reads op={} in graph={} (epoch {:?}) without a queue; both graphs must share a temporal epoch",
                    op.name, consumer_graph, consumer_epoch, producer.name, producer_graph, producer_epoch
                )
            });
        }
    }
}

/// Queues each graph writes or reads
fn graph_io_queues(netlist: &Netlist) -> BTreeMap<GraphId, BTreeSet<String>> {
    let mut io: BTreeMap<GraphId, BTreeSet<String>> =
        netlist.graph_ids().map(|id| (id, BTreeSet::new())).collect();
    for queue in netlist.queues() {
        let Some(producer) = queue.source.producer_op().and_then(|name| netlist.op_by_name(name)) else {
            continue;
        };
        if let Some(queues) = io.get_mut(&producer.graph) {
            queues.insert(queue.name.clone());
        }
    }
    for op in netlist.ops() {
        for source in &op.input_sources {
            if let InputSource::Queue(queue) = source {
                if let Some(queues) = io.get_mut(&op.graph) {
                    queues.insert(netlist.queue(*queue).name.clone());
                }
            }
        }
    }
    io
}

/// Output queues of gradient ops, per graph
fn gradient_queues(netlist: &Netlist) -> BTreeMap<GraphId, Vec<String>> {
    let mut gradient: BTreeMap<GraphId, Vec<String>> = BTreeMap::new();
    for queue in netlist.queues() {
        let Some(producer) = queue.source.producer_op().and_then(|name| netlist.op_by_name(name)) else {
            continue;
        };
        if producer.gradient_op {
            gradient.entry(producer.graph).or_default().push(queue.name.clone());
        }
    }
    gradient
}

fn check_execute_settings(
    netlist: &Netlist,
    program: &str,
    execute: &ExecuteInstruction,
    io_queues: &BTreeSet<String>,
    gradient_queues: Option<&Vec<String>>,
    findings: &mut Findings,
) {
    for queue in gradient_queues.into_iter().flatten() {
        findings.require(execute.setting(queue).is_some(), || {
            format!(
                "Gradient_op feeds output queue={} which requires an output queue_setting defined",
                queue
            )
        });
    }

    let mut unbound = io_queues.clone();
    for setting in &execute.queue_settings {
        findings.require(unbound.remove(&setting.name), || {
            format!(
                "program={} contains instruction with queue_setting for queue={} which isn't produced or consumed in the graph={}",
                program, setting.name, execute.graph_name
            )
        });
    }
    let missing: Vec<&str> = unbound
        .iter()
        .filter_map(|name| netlist.queue_by_name(name))
        .filter(|queue| queue.source == QueueSource::Host && queue.queue_type == QueueType::Queue)
        .map(|queue| queue.name.as_str())
        .collect();
    findings.require(missing.is_empty(), || {
        format!(
            "Missing queue_settings in execute instruction for graph={} program={}: {}",
            execute.graph_name,
            program,
            missing.join(", ")
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::temporal::TemporalGraphMap;
    use crate::testutil;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn cross_graph_error(source: Value) -> String {
        match testutil::compile(source).unwrap_err() {
            CompileError::LegalityError { rule, message } => {
                assert_eq!(rule, RULE);
                message
            }
            other => panic!("expected a cross graph error, got {}", other),
        }
    }

    fn queueless_pipeline() -> Value {
        let mut source = testutil::two_graph_pipeline("wormhole_b0", 0, 1);
        source["graphs"]["bwd"]["back"] = testutil::datacopy_op(&["front"], [1, 0]);
        source
    }

    #[test]
    fn test_queueless_input_in_shared_epoch() {
        let netlist = testutil::compile(queueless_pipeline()).unwrap();
        assert_eq!(netlist.temporal.epoch_of("fwd"), netlist.temporal.epoch_of("bwd"));
        assert!(CrossGraphRule.check(&netlist).is_empty());
    }

    #[test]
    fn test_queueless_input_across_epochs() {
        let mut netlist = testutil::compile(queueless_pipeline()).unwrap();
        let mut split = TemporalGraphMap::new();
        split.assign("fwd", 0).unwrap();
        split.assign("bwd", 1).unwrap();
        netlist.temporal = split;

        let violations = CrossGraphRule.check(&netlist);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.starts_with("op=back in graph=bwd (epoch Some(1)) reads op=front"));
    }

    #[test]
    fn test_unassigned_graph() {
        let mut netlist = testutil::compile(testutil::simple_pipeline("wormhole_b0")).unwrap();
        netlist.temporal = TemporalGraphMap::new();
        let violations = CrossGraphRule.check(&netlist);
        assert_eq!(violations[0].message, "graph=fwd is not assigned to a temporal epoch");
    }

    #[test]
    fn test_setting_for_queue_outside_graph() {
        let mut source = testutil::two_graph_pipeline("wormhole_b0", 0, 1);
        source["programs"][0]["main"][0]["execute"]["queue_settings"] = json!({
            "q_out": { "prologue": false, "epilogue": false, "zero": false,
                       "rd_ptr_local": "0", "rd_ptr_global": "0" }
        });
        assert_eq!(
            cross_graph_error(source),
            "program=main contains instruction with queue_setting for queue=q_out which isn't produced or consumed in the graph=fwd"
        );
    }

    #[test]
    fn test_host_queue_needs_setting() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["programs"][0]["main"][1] = json!({ "execute": { "graph_name": "fwd" } });
        assert_eq!(
            cross_graph_error(source),
            "Missing queue_settings in execute instruction for graph=fwd program=main: q0"
        );
    }

    #[test]
    fn test_gradient_output_needs_setting() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["graphs"]["fwd"]["copy"]["gradient_op"] = json!(true);
        assert_eq!(
            cross_graph_error(source),
            "Gradient_op feeds output queue=q1 which requires an output queue_setting defined"
        );
    }
}
