//! Name resolution: binds every op input to the queue or op producing it

use log::trace;

use crate::error::{CompileError, CompileResult};
use crate::ir::Netlist;
use crate::op::InputSource;

/// Fill `input_sources` on every op. Queues shadow ops of the same name.
pub fn resolve_inputs(netlist: &mut Netlist) -> CompileResult<()> {
    let mut resolved = Vec::with_capacity(netlist.ops().len());
    for op in netlist.ops() {
        let sources = op
            .inputs
            .iter()
            .map(|input| {
                resolve_name(netlist, input).ok_or_else(|| {
                    CompileError::derivation(format!(
                        "Trying to derive input_dims for op={} but cannot find producer for input={}",
                        op.name, input
                    ))
                })
            })
            .collect::<CompileResult<Vec<_>>>()?;
        resolved.push(sources);
    }
    for (id, sources) in netlist.op_ids().zip(resolved) {
        trace!("{} reads {:?}", netlist.op(id).name, sources);
        netlist.op_mut(id).input_sources = sources;
    }
    Ok(())
}

pub fn resolve_name(netlist: &Netlist, name: &str) -> Option<InputSource> {
    netlist
        .queue_id(name)
        .map(InputSource::Queue)
        .or_else(|| netlist.op_id(name).map(InputSource::Op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileOptions;
    use crate::parser::Parser;
    use crate::testutil;
    use serde_json::json;

    fn parse(source: serde_json::Value) -> Netlist {
        Parser::new(&source, &CompileOptions::default()).parse().unwrap()
    }

    #[test]
    fn test_queue_and_op_inputs() {
        let mut source = testutil::two_graph_pipeline("wormhole_b0", 0, 0);
        source["graphs"]["bwd"]["back"] = testutil::datacopy_op(&["q_mid", "front"], [1, 0]);
        let mut netlist = parse(source);
        resolve_inputs(&mut netlist).unwrap();

        let back = netlist.op_by_name("back").unwrap();
        let q_mid = netlist.queue_id("q_mid").unwrap();
        let front = netlist.op_id("front").unwrap();
        assert_eq!(back.input_sources, vec![InputSource::Queue(q_mid), InputSource::Op(front)]);
    }

    #[test]
    fn test_unknown_input_is_a_derivation_error() {
        let mut source = testutil::two_graph_pipeline("wormhole_b0", 0, 0);
        source["graphs"]["fwd"]["front"]["inputs"] = json!(["nowhere"]);
        let mut netlist = parse(source);
        let err = resolve_inputs(&mut netlist).unwrap_err();
        assert!(matches!(err, CompileError::DerivationError { .. }));
        assert!(err.message().contains("input=nowhere"));
    }
}
