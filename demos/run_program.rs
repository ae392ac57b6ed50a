//! Example: running a program
//!
//! Compiles a netlist whose program loops over a graph, then drives the
//! program through the execution engine with hooks that print the resolved
//! read pointers at every execute.
//!
//! Run with: cargo run --example run_program

use std::collections::BTreeMap;

use netlist_frontend::program::ExecuteInstruction;
use netlist_frontend::{
    compile, CompileOptions, CompileResult, ExecutionHooks, ProgramExecutor, VarScope,
};
use serde_json::json;

struct Printer {
    executes: usize,
}

impl ExecutionHooks for Printer {
    fn execute(&mut self, executor: &ProgramExecutor<'_>, instruction: &ExecuteInstruction) -> CompileResult<()> {
        self.executes += 1;
        let setting = &instruction.queue_settings[0];
        let local = executor.resolve_setting(setting.rd_ptr_local.as_deref().unwrap_or("0"))?;
        let global = executor.resolve_setting(setting.rd_ptr_global.as_deref().unwrap_or("0"))?;
        println!(
            "iteration {} of {}: execute {} with {} rd_ptr_local={} rd_ptr_global={}",
            executor.current_loop_iteration(),
            executor.last_loop_iteration(),
            instruction.graph_name,
            setting.name,
            local,
            global
        );
        Ok(())
    }
}

fn main() {
    println!("=== Program Execution Example ===\n");

    let source = json!({
        "devices": { "arch": "wormhole_b0" },
        "queues": {
            "q0": {
                "input": "HOST", "type": "queue", "entries": 4, "grid_size": [1, 1], "t": 1,
                "ublock": [2, 2], "mblock": [1, 1], "ublock_order": "r", "df": "Float16_b",
                "target_device": 0, "loc": "dram", "dram": [[0, 0x1000_0000u64]]
            },
            "q1": {
                "input": "copy", "type": "queue", "entries": 4, "grid_size": [1, 1], "t": 1,
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
            { "param": ["$iterations"] },
            { "staticvar": { "$runs": 0 } },
            { "var": { "$lptr": 0, "$gptr": 0 } },
            { "loop": "$iterations" },
            { "execute": { "graph_name": "fwd", "queue_settings": {
                "q0": { "prologue": false, "epilogue": false, "zero": false,
                        "rd_ptr_local": "$lptr", "rd_ptr_global": "$gptr" }
            } } },
            { "varinst": ["$lptr", "incwrap", 1, 8] },
            { "varinst": ["$gptr", "incwrap", 1, 8] },
            "endloop",
            { "varinst": ["$runs", "inc", 1] }
        ] }]
    });

    let netlist = compile(&source, &CompileOptions::default()).unwrap();
    let program = netlist.program_by_name("main").unwrap();

    let params = BTreeMap::from([("$iterations".to_string(), "3".to_string())]);
    let mut executor = ProgramExecutor::new(program).with_parameters(params);
    let mut hooks = Printer { executes: 0 };

    for run in 0..2 {
        println!("Run {}:", run);
        executor.run(&mut hooks).unwrap();
        println!("  static variables: {:?}", executor.variables_in(VarScope::Static));
        executor.reset();
    }
    println!("\n{} executes in total", hooks.executes);
}
