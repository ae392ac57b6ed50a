//! Netlist front end for a dataflow accelerator compiler
//!
//! Turns a netlist (queues, operator graphs, programs and fused-op
//! templates) into a fully derived and verified [`Netlist`] ready for
//! placement and code generation.
//!
//! # Example
//!
//! ```rust,no_run
//! use netlist_frontend::{compile_file, CompileOptions};
//!
//! let options = CompileOptions::from_env().unwrap();
//! let netlist = compile_file("netlist.json", &options).unwrap();
//! for graph in netlist.graphs() {
//!     println!("{} runs in epoch {:?}", graph.name, netlist.temporal.epoch_of(&graph.name));
//! }
//! ```

pub mod arch;
pub mod attributes;
pub mod config;
pub mod derive;
pub mod engine;
pub mod error;
pub mod expand;
pub mod fields;
pub mod format;
pub mod fused;
pub mod ir;
pub mod lexer;
pub mod op;
pub mod parser;
pub mod program;
pub mod queue;
pub mod resolve;
pub mod temporal;
pub mod verify;

#[cfg(test)]
mod testutil;

use std::path::Path;

use log::info;
use serde_json::Value;

pub use arch::Arch;
pub use config::CompileOptions;
pub use engine::{ExecutionHooks, ProgramExecutor, StepOutcome, VarScope};
pub use error::{CompileError, CompileResult};
pub use ir::Netlist;
pub use parser::Parser;
pub use verify::{Rule, Verifier, Violation};

/// Parse, expand, resolve, derive and verify a netlist
pub fn compile(source: &Value, options: &CompileOptions) -> CompileResult<Netlist> {
    let mut netlist = Parser::new(source, options).parse()?;
    info!(
        "Parsed {} queues, {} graphs, {} programs",
        netlist.queues().len(),
        netlist.graphs().len(),
        netlist.programs().len()
    );

    expand::expand_multi_instance(&mut netlist)?;
    resolve::resolve_inputs(&mut netlist)?;
    derive::derive_complex_settings(&mut netlist)?;
    info!(
        "Derived {} temporal epochs for {} graphs on {}",
        netlist.temporal.num_epochs(),
        netlist.graphs().len(),
        netlist.arch()
    );

    Verifier::new().verify(&netlist)?;
    Ok(netlist)
}

/// Compile JSON netlist text
pub fn compile_str(source: &str, options: &CompileOptions) -> CompileResult<Netlist> {
    let value = fields::parse_source(source)?;
    compile(&value, options)
}

pub fn compile_file(path: impl AsRef<Path>, options: &CompileOptions) -> CompileResult<Netlist> {
    let path = path.as_ref();
    info!("Reading netlist {}", path.display());
    let text = std::fs::read_to_string(path)?;
    compile_str(&text, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_simple_pipeline() {
        let netlist = testutil::compile(testutil::simple_pipeline("wormhole_b0")).unwrap();
        assert!(netlist.queue_by_name("q0").is_some());
        assert_eq!(netlist.temporal.epoch_of("fwd"), Some(0));

        let producers: Vec<_> = netlist
            .ops()
            .iter()
            .filter(|op| op.name == netlist.queue_by_name("q1").unwrap().input)
            .map(|op| op.name.as_str())
            .collect();
        assert_eq!(producers, vec!["copy"]);
    }

    #[test]
    fn test_duplicate_op_name_across_graphs() {
        let mut source = testutil::two_graph_pipeline("wormhole_b0", 0, 1);
        source["graphs"]["fwd"]["conv1"] = testutil::datacopy_op(&["q_in"], [2, 0]);
        source["graphs"]["bwd"]["conv1"] = testutil::datacopy_op(&["q_mid"], [3, 0]);
        let err = testutil::compile(source).unwrap_err();
        assert!(err.message().contains("conv1"), "{}", err);
        assert!(err.message().contains("not globally unique"), "{}", err);
    }

    #[test]
    fn test_compile_str_reports_bad_json() {
        let err = compile_str("{ not json", &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::Json(_)));
    }

    #[test]
    fn test_compile_str_rejects_repeated_queue() {
        let text = testutil::simple_pipeline("wormhole_b0").to_string();
        let q0 = testutil::queue("HOST", 0, 0x1300_0000).to_string();
        let text = text.replacen("\"queues\":{", &format!("\"queues\":{{\"q0\":{},", q0), 1);
        let err = compile_str(&text, &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::ParseError { .. }), "{}", err);
        assert!(err.message().starts_with("Name q0 is declared more than once"), "{}", err);
    }

    #[test]
    fn test_compile_str_rejects_repeated_op_in_graph() {
        let text = testutil::simple_pipeline("wormhole_b0").to_string();
        let copy = testutil::datacopy_op(&["q0"], [1, 0]).to_string();
        let text = text.replacen("\"fwd\":{", &format!("\"fwd\":{{\"copy\":{},", copy), 1);
        let err = compile_str(&text, &CompileOptions::default()).unwrap_err();
        assert!(err.message().starts_with("Name copy is declared more than once"), "{}", err);
    }

    #[test]
    fn test_compile_str_accepts_pipeline_text() {
        let text = testutil::simple_pipeline("wormhole_b0").to_string();
        let netlist = compile_str(&text, &CompileOptions::default()).unwrap();
        assert_eq!(netlist.temporal.epoch_of("fwd"), Some(0));
    }

    #[test]
    fn test_arch_override_selects_among_supported() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["devices"]["arch"] = json!(["grayskull", "wormhole_b0"]);
        let options = CompileOptions::new().with_arch(Arch::WormholeB0);
        let netlist = compile(&source, &options).unwrap();
        assert_eq!(netlist.arch(), Arch::WormholeB0);
    }
}
