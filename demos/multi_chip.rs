//! Example: multi-chip netlist
//!
//! The forward graph and its queues are declared once for devices 0 and 1
//! and expanded into one copy per device. The backward graph runs on
//! device 2. Adjacent epochs that share no device are merged, so all three
//! graphs end up in one epoch.
//!
//! Run with: cargo run --example multi_chip

use netlist_frontend::{compile, CompileOptions};
use serde_json::{json, Value};

fn queue(input: &str, device: Value, address: u64) -> Value {
    json!({
        "input": input, "type": "queue", "entries": 2, "grid_size": [1, 1], "t": 1,
        "ublock": [2, 2], "mblock": [1, 1], "ublock_order": "r", "df": "Float16_b",
        "target_device": device, "loc": "dram", "dram": [[0, address]]
    })
}

fn copy(input: &str) -> Value {
    json!({
        "type": "datacopy", "grid_loc": [0, 0], "grid_size": [1, 1],
        "inputs": [input], "in_df": ["Float16_b"],
        "acc_df": "Float16_b", "out_df": "Float16_b", "intermed_df": "Float16_b",
        "math_fidelity": "HiFi3", "untilize_output": false,
        "t": 1, "ublock": [2, 2], "mblock": [1, 1], "ublock_order": "r"
    })
}

fn main() {
    println!("=== Multi-Chip Example ===\n");

    let source = json!({
        "devices": { "arch": "wormhole_b0" },
        "queues": {
            "act": queue("HOST", json!([0, 1]), 0x1000_0000),
            "mid": queue("front", json!([0, 1]), 0x1100_0000),
            "out": queue("back", json!(2), 0x1200_0000)
        },
        "graphs": {
            "fwd": { "target_device": [0, 1], "input_count": 1, "front": copy("act") },
            "bwd": { "target_device": 2, "input_count": 1, "back": copy("mid.0") }
        },
        "programs": [{ "main": [
            { "var": { "$ptr": 0 } },
            { "execute": { "graph_name": "fwd", "queue_settings": {
                "act": { "prologue": false, "epilogue": false, "zero": false,
                         "rd_ptr_local": "$ptr", "rd_ptr_global": "$ptr" }
            } } },
            { "execute": { "graph_name": "bwd", "queue_settings": {
                "mid.0": { "prologue": false, "epilogue": false, "zero": false,
                           "rd_ptr_local": "$ptr", "rd_ptr_global": "$ptr" }
            } } }
        ] }]
    });

    let netlist = compile(&source, &CompileOptions::default()).unwrap();

    println!("Queues:");
    for queue in netlist.queues() {
        println!("  {} on device {} fed by {}", queue.name, queue.target_device, queue.input);
    }
    println!("\nTemporal epochs:");
    for epoch in 0..netlist.temporal.num_epochs() {
        let graphs: Vec<&str> = netlist.temporal.graphs_in(epoch).collect();
        println!("  epoch {}: {}", epoch, graphs.join(", "));
    }
    println!("\nExecutes after expansion:");
    for program in netlist.programs() {
        for execute in program.executes() {
            let queues: Vec<&str> = execute.queue_settings.iter().map(|s| s.name.as_str()).collect();
            println!("  {}: {} [{}]", program.name, execute.graph_name, queues.join(", "));
        }
    }
}
