//! Small netlists shared by unit tests across modules

use serde_json::{json, Value};

use crate::config::CompileOptions;
use crate::error::CompileResult;
use crate::ir::Netlist;

/// Run the whole pipeline with default options
pub fn compile(source: Value) -> CompileResult<Netlist> {
    crate::compile(&source, &CompileOptions::default())
}

/// A one-core DRAM queue with a 2x2 ublock
pub fn queue(input: &str, device: u32, address: u64) -> Value {
    json!({
        "input": input, "type": "queue", "entries": 2, "grid_size": [1, 1], "t": 1,
        "ublock": [2, 2], "mblock": [1, 1], "ublock_order": "r", "df": "Float16_b",
        "target_device": device, "loc": "dram", "dram": [[0, address]]
    })
}

/// A single-entry RAM holding constants
pub fn constant_ram(device: u32, address: u64) -> Value {
    let mut ram = queue("HOST", device, address);
    ram["type"] = json!("ram");
    ram["entries"] = json!(1);
    ram
}

/// A one-core datacopy op with a 2x2 ublock
pub fn datacopy_op(inputs: &[&str], grid_loc: [u32; 2]) -> Value {
    json!({
        "type": "datacopy", "grid_loc": grid_loc, "grid_size": [1, 1],
        "inputs": inputs, "in_df": vec!["Float16_b"; inputs.len()],
        "acc_df": "Float16_b", "out_df": "Float16_b", "intermed_df": "Float16_b",
        "math_fidelity": "HiFi3", "untilize_output": false,
        "t": 1, "ublock": [2, 2], "mblock": [1, 1], "ublock_order": "r"
    })
}

/// `q0` (HOST) -> `copy` -> `q1`, executed once by program `main`
pub fn simple_pipeline(arch: &str) -> Value {
    json!({
        "devices": { "arch": arch },
        "queues": {
            "q0": queue("HOST", 0, 0x1000_0000),
            "q1": queue("copy", 0, 0x1100_0000),
        },
        "graphs": {
            "fwd": {
                "target_device": 0, "input_count": 1,
                "copy": datacopy_op(&["q0"], [0, 0]),
            }
        },
        "programs": [{ "main": [
            { "var": { "$lptr": 0, "$gptr": 0 } },
            { "execute": { "graph_name": "fwd", "queue_settings": {
                "q0": { "prologue": false, "epilogue": false, "zero": false,
                        "rd_ptr_local": "$lptr", "rd_ptr_global": "$gptr" }
            } } },
            { "varinst": ["$gptr", "incwrap", 1, 4] },
        ] }]
    })
}

/// `q_in` (constant RAM) -> `front` in graph `fwd` -> `q_mid` -> `back` in
/// graph `bwd` -> `q_out`; program `main` executes fwd then bwd
pub fn two_graph_pipeline(arch: &str, dev_fwd: u32, dev_bwd: u32) -> Value {
    json!({
        "devices": { "arch": arch },
        "queues": {
            "q_in": constant_ram(dev_fwd, 0x1000_0000),
            "q_mid": queue("front", dev_fwd, 0x1100_0000),
            "q_out": queue("back", dev_bwd, 0x1200_0000),
        },
        "graphs": {
            "fwd": {
                "target_device": dev_fwd, "input_count": 1,
                "front": datacopy_op(&["q_in"], [0, 0]),
            },
            "bwd": {
                "target_device": dev_bwd, "input_count": 1,
                "back": datacopy_op(&["q_mid"], [1, 0]),
            }
        },
        "programs": [{ "main": [
            { "execute": { "graph_name": "fwd" } },
            { "execute": { "graph_name": "bwd" } },
        ] }]
    })
}

/// `simple_pipeline` with `copy` replaced by a fused op reading `q0` and the
/// constant RAM `w`: a matmul with `m_k = 4` into `intermed0`, then an add
/// of `intermed0` and `input0` into the output
pub fn fused_pipeline() -> Value {
    let mut source = simple_pipeline("wormhole_b0");
    source["queues"]["w"] = constant_ram(0, 0x1200_0000);
    let mut op = datacopy_op(&["q0", "w"], [0, 0]);
    op["type"] = json!("fused_op");
    op["attributes"] = json!({ "fused_op_id": "0" });
    source["graphs"]["fwd"]["copy"] = op;
    source["fused_ops"] = json!({
        "0": {
            "inputs": 2,
            "intermediates": 1,
            "schedules": [
                [{ "mm": {
                    "type": "matmul", "inputs": ["input0", "input1"], "output": "intermed0",
                    "mblock": [1, 1], "ublock": [2, 2], "attributes": { "m_k": 4, "u_kt": 1 }
                } }],
                [{ "add": {
                    "type": "add", "inputs": ["intermed0", "input0"], "output": "output",
                    "pop": ["intermed0"], "mblock": [1, 1], "ublock": [2, 2]
                } }]
            ]
        }
    });
    source
}
