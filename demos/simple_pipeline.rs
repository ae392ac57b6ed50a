//! Example: single-graph pipeline
//!
//! A host-fed queue is copied by one datacopy op into an output queue.
//! Shows the derived input shapes and the temporal epoch of the graph.
//!
//! Run with: cargo run --example simple_pipeline

use netlist_frontend::{compile, CompileOptions};
use serde_json::json;

fn main() {
    println!("=== Simple Pipeline Example ===\n");

    let source = json!({
        "devices": { "arch": "wormhole_b0" },
        "queues": {
            "q0": {
                "input": "HOST", "type": "queue", "entries": 2, "grid_size": [1, 1], "t": 1,
                "ublock": [2, 2], "mblock": [1, 1], "ublock_order": "r", "df": "Float16_b",
                "target_device": 0, "loc": "dram", "dram": [[0, 0x1000_0000u64]]
            },
            "q1": {
                "input": "copy", "type": "queue", "entries": 2, "grid_size": [1, 1], "t": 1,
                "ublock": [2, 2], "mblock": [1, 1], "ublock_order": "r", "df": "Float16_b",
                "target_device": 0, "loc": "dram", "dram": [[0, 0x1100_0000u64]]
            }
        },
        "graphs": {
            "fwd": {
                "target_device": 0, "input_count": 1,
                "copy": {
                    "type": "datacopy", "grid_loc": [0, 0], "grid_size": [1, 1],
                    "inputs": ["q0"], "in_df": ["Float16_b"],
                    "acc_df": "Float16_b", "out_df": "Float16_b", "intermed_df": "Float16_b",
                    "math_fidelity": "HiFi3", "untilize_output": false,
                    "t": 1, "ublock": [2, 2], "mblock": [1, 1], "ublock_order": "r"
                }
            }
        },
        "programs": [{ "main": [
            { "var": { "$lptr": 0, "$gptr": 0 } },
            { "execute": { "graph_name": "fwd", "queue_settings": {
                "q0": { "prologue": false, "epilogue": false, "zero": false,
                        "rd_ptr_local": "$lptr", "rd_ptr_global": "$gptr" }
            } } },
            { "varinst": ["$gptr", "incwrap", 1, 4] }
        ] }]
    });

    let netlist = compile(&source, &CompileOptions::default()).unwrap();

    println!("Arch: {}", netlist.arch());
    for op in netlist.ops() {
        println!("Op {} ({})", op.name, op.op_type());
        for (input, dim) in op.inputs.iter().zip(&op.input_dims) {
            println!(
                "  reads {}: ublock [{},{}] mblock [{},{}]",
                input, dim.ublock_rt, dim.ublock_ct, dim.mblock_m, dim.mblock_n
            );
        }
    }
    for graph in netlist.graphs() {
        println!("Graph {} -> epoch {:?}", graph.name, netlist.temporal.epoch_of(&graph.name));
    }
}
