//! Temporal epochs: ordered execution windows grouping graphs that must run
//! together.
//!
//! Partitioning runs in three steps:
//! 1. graphs connected by queueless cross-graph inputs join one epoch
//! 2. epochs executed back to back by the programs are merged when they
//!    target disjoint devices
//! 3. epoch ids are compacted to a dense `0..K` range

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CompileError, CompileResult};
use crate::ir::Netlist;
use crate::op::InputSource;

/// Graph to epoch assignment plus the reverse index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalGraphMap {
    graph_to_epoch: BTreeMap<String, usize>,
    epochs: Vec<BTreeSet<String>>,
}

impl TemporalGraphMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch_of(&self, graph: &str) -> Option<usize> {
        self.graph_to_epoch.get(graph).copied()
    }

    /// Graphs in `epoch`; empty for unknown ids
    pub fn graphs_in(&self, epoch: usize) -> impl Iterator<Item = &str> {
        self.epochs
            .get(epoch)
            .into_iter()
            .flat_map(|graphs| graphs.iter().map(String::as_str))
    }

    pub fn epoch_size(&self, epoch: usize) -> usize {
        self.epochs.get(epoch).map_or(0, BTreeSet::len)
    }

    /// Number of epoch slots, including ones emptied by merges
    pub fn num_epochs(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph_to_epoch.is_empty()
    }

    /// Place an unassigned graph into `epoch`, growing the slot list as needed
    pub fn assign(&mut self, graph: &str, epoch: usize) -> CompileResult<()> {
        if let Some(existing) = self.epoch_of(graph) {
            return Err(CompileError::derivation(format!(
                "Graph {} is already assigned to temporal epoch {}",
                graph, existing
            )));
        }
        if self.epochs.len() <= epoch {
            self.epochs.resize_with(epoch + 1, BTreeSet::new);
        }
        self.epochs[epoch].insert(graph.to_string());
        self.graph_to_epoch.insert(graph.to_string(), epoch);
        Ok(())
    }

    /// Move every graph of `from` into `into`, leaving `from` empty
    pub fn merge_into(&mut self, from: usize, into: usize) {
        if from == into || from >= self.epochs.len() || into >= self.epochs.len() {
            return;
        }
        let moved = std::mem::take(&mut self.epochs[from]);
        for graph in &moved {
            self.graph_to_epoch.insert(graph.clone(), into);
        }
        self.epochs[into].extend(moved);
    }

    /// Union two epochs, keeping whichever is larger; ties keep `keep_on_tie`.
    /// Returns the surviving epoch id.
    fn union(&mut self, a: usize, b: usize, keep_on_tie: usize) -> usize {
        let (size_a, size_b) = (self.epoch_size(a), self.epoch_size(b));
        let survivor = if size_a == size_b {
            keep_on_tie
        } else if size_a > size_b {
            a
        } else {
            b
        };
        let absorbed = if survivor == a { b } else { a };
        self.merge_into(absorbed, survivor);
        survivor
    }

    /// Shift non-empty epochs down to fill gaps and drop trailing empties.
    /// Relative order is preserved and a second call changes nothing.
    pub fn compact(&mut self) -> CompileResult<()> {
        let mut target = 0;
        for source in 0..self.epochs.len() {
            if self.epochs[source].is_empty() {
                continue;
            }
            if source != target {
                if !self.epochs[target].is_empty() {
                    return Err(CompileError::derivation(format!(
                        "temporal epoch compaction failed: tried to move epoch {} to {}, but {} is still occupied",
                        source, target, target
                    )));
                }
                debug!("Moving graphs from temporal epoch {} to {}", source, target);
                self.merge_into(source, target);
                if !self.epochs[source].is_empty() {
                    return Err(CompileError::derivation(format!(
                        "temporal epoch compaction failed: epoch {} was not emptied into {}",
                        source, target
                    )));
                }
            }
            target += 1;
        }
        self.epochs.truncate(target);
        Ok(())
    }

    /// Both indices agree and no epoch slot is empty
    pub fn is_consistent(&self) -> bool {
        let listed: usize = self.epochs.iter().map(BTreeSet::len).sum();
        listed == self.graph_to_epoch.len()
            && self.graph_to_epoch.iter().all(|(graph, epoch)| {
                self.epochs
                    .get(*epoch)
                    .map_or(false, |graphs| graphs.contains(graph))
            })
    }

    fn check_consistent(&self) -> CompileResult<()> {
        if self.is_consistent() {
            Ok(())
        } else {
            Err(CompileError::derivation(
                "temporal epoch map is inconsistent: graph and epoch indices disagree",
            ))
        }
    }

    /// Target devices used by the graphs of `epoch`
    fn devices_of(&self, netlist: &Netlist, epoch: usize) -> BTreeSet<u32> {
        self.graphs_in(epoch)
            .filter_map(|graph| netlist.graph_by_name(graph))
            .map(|graph| graph.target_device)
            .collect()
    }
}

/// Partition every graph of a resolved netlist into temporal epochs
pub fn derive_temporal_graphs(netlist: &Netlist) -> CompileResult<TemporalGraphMap> {
    let mut map = TemporalGraphMap::new();
    group_connected_graphs(netlist, &mut map)?;
    if netlist.arch().is_grayskull() {
        debug!("Skipping adjacent temporal epoch merge on grayskull");
    } else {
        merge_non_overlapping_adjacent_epochs(netlist, &mut map)?;
    }
    map.compact()?;
    map.check_consistent()?;
    for epoch in 0..map.num_epochs() {
        debug!(
            "Temporal epoch {}: {}",
            epoch,
            map.graphs_in(epoch).collect::<Vec<_>>().join(", ")
        );
    }
    Ok(map)
}

fn group_connected_graphs(netlist: &Netlist, map: &mut TemporalGraphMap) -> CompileResult<()> {
    let mut next_epoch = 0;
    for graph_id in netlist.graph_ids() {
        let graph = netlist.graph(graph_id);
        let mut mine = match map.epoch_of(&graph.name) {
            Some(epoch) => epoch,
            None => {
                map.assign(&graph.name, next_epoch)?;
                next_epoch += 1;
                next_epoch - 1
            }
        };

        let mut producers = BTreeSet::new();
        for op in netlist.graph_ops(graph_id) {
            for (input, source) in op.inputs.iter().zip(&op.input_sources) {
                if let InputSource::Op(producer) = source {
                    let producer = netlist.op(*producer);
                    if producer.graph != graph_id {
                        if !netlist.arch().supports_queueless_multichip() {
                            return Err(CompileError::derivation(format!(
                                "input={} to op={} must be either a queue, or an op within the graph, cross graph communication must be through queues/buffers",
                                input, op.name
                            )));
                        }
                        producers.insert(producer.graph);
                    }
                }
            }
        }

        for producer in producers {
            let producer_name = &netlist.graph(producer).name;
            match map.epoch_of(producer_name) {
                Some(theirs) if theirs != mine => {
                    mine = map.union(mine, theirs, mine);
                    map.check_consistent()?;
                }
                Some(_) => {}
                None => map.assign(producer_name, mine)?,
            }
        }
    }
    Ok(())
}

/// Walk executes in program order, folding each epoch into the previous
/// one when their device sets do not intersect. Overlapping device sets
/// stay separate.
fn merge_non_overlapping_adjacent_epochs(
    netlist: &Netlist,
    map: &mut TemporalGraphMap,
) -> CompileResult<()> {
    let mut last: Option<usize> = None;
    for program in netlist.programs() {
        for execute in program.executes() {
            let mut this = map.epoch_of(&execute.graph_name).ok_or_else(|| {
                CompileError::derivation(format!(
                    "Execute in program={} references undeclared graph={}",
                    program.name, execute.graph_name
                ))
            })?;
            if let Some(prev) = last {
                if prev != this && map.devices_of(netlist, prev).is_disjoint(&map.devices_of(netlist, this)) {
                    debug!(
                        "Merging temporal epoch {} into {} (program {}, graph {})",
                        this, prev, program.name, execute.graph_name
                    );
                    map.merge_into(this, prev);
                    this = prev;
                }
            }
            last = Some(this);
        }
    }
    Ok(())
}
