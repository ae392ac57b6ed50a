//! Multi-instance expansion
//!
//! A queue or graph whose `target_device` lists several devices is replaced
//! by one copy per device named `<name>.<device>`. References are rewritten
//! so every copy only talks to copies on its own device: queue producers,
//! op inputs, forked DRAM inputs, aliases, execute instructions and their
//! queue settings, and queue (de)allocation lists.

use log::debug;
use std::collections::BTreeMap;

use crate::error::CompileResult;
use crate::ir::{GraphInfo, Netlist};
use crate::op::OpInfo;
use crate::program::{Instruction, ProgramInfo};
use crate::queue::{QueueInfo, HOST_INPUT};

fn instance_name(name: &str, device: u32) -> String {
    format!("{}.{}", name, device)
}

/// Replace every pending multi-device queue and graph with per-device copies.
/// Single-device entities keep their declaration order and names.
pub fn expand_multi_instance(netlist: &mut Netlist) -> CompileResult<()> {
    if netlist.pending.is_empty() {
        return Ok(());
    }
    let pending = std::mem::take(&mut netlist.pending);
    debug!(
        "Expanding {} multi-device queues and {} multi-device graphs",
        pending.queues.len(),
        pending.graphs.len()
    );

    let queues = expand_queues(netlist.queues(), &pending.queues);
    let graphs = expand_graphs(netlist, &pending.graphs);
    let programs = netlist
        .programs()
        .iter()
        .map(|program| expand_program(program, &pending.queues, &pending.graphs))
        .collect();

    netlist.replace_entities(queues, graphs, programs)?;
    debug!(
        "After expansion: {} queues, {} graphs, {} ops",
        netlist.queues().len(),
        netlist.graphs().len(),
        netlist.ops().len()
    );
    Ok(())
}

fn expand_queues(queues: &[QueueInfo], pending: &BTreeMap<String, Vec<u32>>) -> Vec<QueueInfo> {
    let mut expanded = Vec::with_capacity(queues.len());
    for queue in queues {
        let Some(devices) = pending.get(&queue.name) else {
            expanded.push(queue.clone());
            continue;
        };
        for &device in devices {
            let mut copy = queue.clone();
            copy.name = instance_name(&queue.name, device);
            copy.target_device = device;
            if queue.input != HOST_INPUT {
                copy.set_input(instance_name(&queue.input, device));
            }
            if let Some(alias) = &queue.alias {
                if pending.contains_key(alias) {
                    copy.alias = Some(instance_name(alias, device));
                }
            }
            expanded.push(copy);
        }
    }
    expanded
}

fn expand_graphs(
    netlist: &Netlist,
    pending: &BTreeMap<String, Vec<u32>>,
) -> Vec<(GraphInfo, Vec<OpInfo>)> {
    let mut expanded = Vec::with_capacity(netlist.graphs().len());
    for graph_id in netlist.graph_ids() {
        let graph = netlist.graph(graph_id);
        let ops: Vec<OpInfo> = netlist.graph_ops(graph_id).cloned().collect();
        let Some(devices) = pending.get(&graph.name) else {
            expanded.push((graph.clone(), ops));
            continue;
        };
        for &device in devices {
            let mut copy = graph.clone();
            copy.name = instance_name(&graph.name, device);
            copy.target_device = device;
            let device_ops = ops
                .iter()
                .map(|op| {
                    let mut op = op.clone();
                    op.name = instance_name(&op.name, device);
                    for input in &mut op.inputs {
                        *input = instance_name(input, device);
                    }
                    for (queue, reader) in &mut op.forked_dram_inputs {
                        *queue = instance_name(queue, device);
                        *reader = instance_name(reader, device);
                    }
                    op
                })
                .collect();
            expanded.push((copy, device_ops));
        }
    }
    expanded
}

fn expand_program(
    program: &ProgramInfo,
    queues: &BTreeMap<String, Vec<u32>>,
    graphs: &BTreeMap<String, Vec<u32>>,
) -> ProgramInfo {
    let mut expanded = ProgramInfo::new(program.name.clone());
    for instruction in &program.instructions {
        match instruction {
            Instruction::Execute(execute) if graphs.contains_key(&execute.graph_name) => {
                for &device in &graphs[&execute.graph_name] {
                    let mut copy = execute.clone();
                    copy.graph_name = instance_name(&execute.graph_name, device);
                    for setting in &mut copy.queue_settings {
                        setting.name = instance_name(&setting.name, device);
                    }
                    expanded.instructions.push(Instruction::Execute(copy));
                }
            }
            Instruction::AllocateQueue(names) => {
                expanded
                    .instructions
                    .push(Instruction::AllocateQueue(expand_queue_list(names, queues)));
            }
            Instruction::DeallocateQueue(names) => {
                expanded
                    .instructions
                    .push(Instruction::DeallocateQueue(expand_queue_list(names, queues)));
            }
            other => expanded.instructions.push(other.clone()),
        }
    }
    expanded
}

fn expand_queue_list(names: &[String], pending: &BTreeMap<String, Vec<u32>>) -> Vec<String> {
    names
        .iter()
        .flat_map(|name| match pending.get(name) {
            Some(devices) => devices
                .iter()
                .map(|device| instance_name(name, *device))
                .collect(),
            None => vec![name.clone()],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileOptions;
    use crate::parser::Parser;
    use crate::testutil;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn multi_device_source() -> Value {
        let mut source = testutil::two_graph_pipeline("wormhole_b0", 0, 0);
        source["queues"]["q_mid"]["target_device"] = json!([0, 1]);
        source["graphs"]["fwd"]["target_device"] = json!([0, 1]);
        source["graphs"]["bwd"]["target_device"] = json!([0, 1]);
        source["queues"]["q_out"]["target_device"] = json!([0, 1]);
        source["queues"]["q_in"]["target_device"] = json!([0, 1]);
        source
    }

    fn parse_and_expand(source: Value) -> Netlist {
        let options = CompileOptions::default();
        let mut netlist = Parser::new(&source, &options).parse().unwrap();
        expand_multi_instance(&mut netlist).unwrap();
        netlist
    }

    #[test]
    fn test_queue_and_graph_copies_per_device() {
        let netlist = parse_and_expand(multi_device_source());
        let names: Vec<_> = netlist.queues().iter().map(|q| q.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["q_in.0", "q_in.1", "q_mid.0", "q_mid.1", "q_out.0", "q_out.1"]
        );
        let graphs: Vec<_> = netlist.graphs().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(graphs, vec!["fwd.0", "fwd.1", "bwd.0", "bwd.1"]);

        let q_mid = netlist.queue_by_name("q_mid.1").unwrap();
        assert_eq!(q_mid.input, "front.1");
        assert_eq!(q_mid.target_device, 1);
        assert_eq!(netlist.queue_by_name("q_in.1").unwrap().input, "HOST");

        let back = netlist.op_by_name("back.1").unwrap();
        assert_eq!(back.inputs, vec!["q_mid.1".to_string()]);
        assert_eq!(netlist.graph_of(back).name, "bwd.1");
        assert_eq!(netlist.graph_of(back).target_device, 1);
        assert!(netlist.pending.is_empty());
    }

    #[test]
    fn test_execute_replicated_in_device_order() {
        let mut source = multi_device_source();
        source["programs"] = json!([{ "main": [
            { "execute": { "graph_name": "fwd", "queue_settings": {
                "q_in": { "prologue": true, "epilogue": false, "zero": false,
                          "rd_ptr_global": 0, "wr_ptr_global": 0 }
            } } },
        ] }]);
        let netlist = parse_and_expand(source);
        let main = netlist.program_by_name("main").unwrap();
        let executes: Vec<_> = main.executes().collect();
        assert_eq!(executes.len(), 2);
        assert_eq!(executes[0].graph_name, "fwd.0");
        assert_eq!(executes[1].graph_name, "fwd.1");
        assert_eq!(executes[1].queue_settings[0].name, "q_in.1");
        assert_eq!(main.instructions.last(), Some(&Instruction::EndProgram));
    }

    #[test]
    fn test_single_device_netlist_untouched() {
        let source = testutil::two_graph_pipeline("wormhole_b0", 0, 1);
        let netlist = parse_and_expand(source);
        assert!(netlist.graph_by_name("fwd").is_some());
        assert!(netlist.queue_by_name("q_mid").is_some());
    }

    #[test]
    fn test_allocate_lists_expand() {
        let mut source = multi_device_source();
        source["programs"] = json!([{ "main": [
            { "allocate_queue": ["q_mid", "q_out"] },
            { "execute": { "graph_name": "fwd" } },
            { "deallocate_queue": ["q_mid"] },
        ] }]);
        let netlist = parse_and_expand(source);
        let main = netlist.program_by_name("main").unwrap();
        assert_eq!(
            main.instructions[0],
            Instruction::AllocateQueue(vec![
                "q_mid.0".to_string(),
                "q_mid.1".to_string(),
                "q_out.0".to_string(),
                "q_out.1".to_string(),
            ])
        );
        assert_eq!(
            main.instructions[3],
            Instruction::DeallocateQueue(vec!["q_mid.0".to_string(), "q_mid.1".to_string()])
        );
    }

    #[test]
    fn test_expanded_netlist_compiles() {
        let netlist = testutil::compile(multi_device_source()).unwrap();
        assert_eq!(netlist.graphs().len(), 4);
        assert_eq!(netlist.queue_by_name("q_mid.0").unwrap().input_count, Some(1));
    }
}
