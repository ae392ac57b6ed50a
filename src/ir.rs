//! The IR store: arenas of queues, graphs, ops, programs and fused-op
//! templates, with name indices rebuilt after every structural rewrite.
//!
//! Entities refer to each other by name in the source text. Ids are dense
//! arena indices; they stay valid until the next [`Netlist::reindex`], which
//! only the multi-instance expander triggers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::arch::{Arch, DeviceInfo};
use crate::error::{CompileError, CompileResult};
use crate::fused::FusedOpTemplate;
use crate::op::OpInfo;
use crate::program::ProgramInfo;
use crate::queue::QueueInfo;
use crate::temporal::TemporalGraphMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub usize);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphInfo {
    pub name: String,
    pub target_device: u32,
    pub input_count: u32,
    /// Declaration order
    pub ops: Vec<OpId>,
}

impl GraphInfo {
    pub fn new(name: impl Into<String>, target_device: u32, input_count: u32) -> Self {
        Self {
            name: name.into(),
            target_device,
            input_count,
            ops: Vec::new(),
        }
    }
}

/// Queues and graphs declared on several devices, awaiting expansion
#[derive(Debug, Clone, Default)]
pub struct PendingInstances {
    pub queues: BTreeMap<String, Vec<u32>>,
    pub graphs: BTreeMap<String, Vec<u32>>,
}

impl PendingInstances {
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.graphs.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Netlist {
    pub device: DeviceInfo,
    pub(crate) queues: Vec<QueueInfo>,
    pub(crate) graphs: Vec<GraphInfo>,
    pub(crate) ops: Vec<OpInfo>,
    pub(crate) programs: Vec<ProgramInfo>,
    pub(crate) fused_ops: BTreeMap<String, FusedOpTemplate>,
    pub temporal: TemporalGraphMap,
    /// Producer name (queue or op) to the ops reading it
    pub consumers: BTreeMap<String, BTreeSet<String>>,

    #[serde(skip)]
    queue_index: HashMap<String, QueueId>,
    #[serde(skip)]
    graph_index: HashMap<String, GraphId>,
    #[serde(skip)]
    op_index: HashMap<String, OpId>,
    #[serde(skip)]
    program_index: HashMap<String, usize>,
    #[serde(skip)]
    pub(crate) pending: PendingInstances,
}

impl Netlist {
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }

    pub fn arch(&self) -> Arch {
        self.device.arch
    }

    // Queues

    pub fn add_queue(&mut self, queue: QueueInfo) -> CompileResult<QueueId> {
        if self.queue_index.contains_key(&queue.name) {
            return Err(CompileError::parse_error(format!(
                "Queue {} is declared more than once",
                queue.name
            )));
        }
        let id = QueueId(self.queues.len());
        self.queue_index.insert(queue.name.clone(), id);
        self.queues.push(queue);
        Ok(id)
    }

    pub fn queues(&self) -> &[QueueInfo] {
        &self.queues
    }

    pub fn queue(&self, id: QueueId) -> &QueueInfo {
        &self.queues[id.0]
    }

    pub fn queue_mut(&mut self, id: QueueId) -> &mut QueueInfo {
        &mut self.queues[id.0]
    }

    pub fn queue_id(&self, name: &str) -> Option<QueueId> {
        self.queue_index.get(name).copied()
    }

    pub fn queue_by_name(&self, name: &str) -> Option<&QueueInfo> {
        self.queue_id(name).map(|id| self.queue(id))
    }

    pub fn queue_ids(&self) -> impl Iterator<Item = QueueId> {
        (0..self.queues.len()).map(QueueId)
    }

    // Graphs

    pub fn add_graph(&mut self, graph: GraphInfo) -> CompileResult<GraphId> {
        if self.graph_index.contains_key(&graph.name) {
            return Err(CompileError::parse_error(format!(
                "Graph {} is declared more than once",
                graph.name
            )));
        }
        let id = GraphId(self.graphs.len());
        self.graph_index.insert(graph.name.clone(), id);
        self.graphs.push(graph);
        Ok(id)
    }

    /// Graphs in declaration order
    pub fn graphs(&self) -> &[GraphInfo] {
        &self.graphs
    }

    pub fn graph(&self, id: GraphId) -> &GraphInfo {
        &self.graphs[id.0]
    }

    pub fn graph_mut(&mut self, id: GraphId) -> &mut GraphInfo {
        &mut self.graphs[id.0]
    }

    pub fn graph_id(&self, name: &str) -> Option<GraphId> {
        self.graph_index.get(name).copied()
    }

    pub fn graph_by_name(&self, name: &str) -> Option<&GraphInfo> {
        self.graph_id(name).map(|id| self.graph(id))
    }

    pub fn graph_ids(&self) -> impl Iterator<Item = GraphId> {
        (0..self.graphs.len()).map(GraphId)
    }

    // Ops

    /// Insert an op into the graph named by `op.graph`. Op names are unique
    /// across every graph.
    pub fn add_op(&mut self, op: OpInfo) -> CompileResult<OpId> {
        if let Some(existing) = self.op_index.get(&op.name) {
            let other_graph = &self.graphs[self.ops[existing.0].graph.0].name;
            return Err(CompileError::parse_error(format!(
                "Op {} is not globally unique: declared in graph {} and graph {}",
                op.name, other_graph, self.graphs[op.graph.0].name
            )));
        }
        let id = OpId(self.ops.len());
        self.op_index.insert(op.name.clone(), id);
        self.graphs[op.graph.0].ops.push(id);
        self.ops.push(op);
        Ok(id)
    }

    pub fn ops(&self) -> &[OpInfo] {
        &self.ops
    }

    pub fn op(&self, id: OpId) -> &OpInfo {
        &self.ops[id.0]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut OpInfo {
        &mut self.ops[id.0]
    }

    pub fn op_id(&self, name: &str) -> Option<OpId> {
        self.op_index.get(name).copied()
    }

    pub fn op_by_name(&self, name: &str) -> Option<&OpInfo> {
        self.op_id(name).map(|id| self.op(id))
    }

    pub fn op_ids(&self) -> impl Iterator<Item = OpId> {
        (0..self.ops.len()).map(OpId)
    }

    pub fn graph_of(&self, op: &OpInfo) -> &GraphInfo {
        self.graph(op.graph)
    }

    /// Ops of one graph in declaration order
    pub fn graph_ops(&self, graph: GraphId) -> impl Iterator<Item = &OpInfo> {
        self.graphs[graph.0].ops.iter().map(move |id| self.op(*id))
    }

    // Programs

    pub fn add_program(&mut self, program: ProgramInfo) -> CompileResult<usize> {
        if self.program_index.contains_key(&program.name) {
            return Err(CompileError::parse_error(format!(
                "Program {} is declared more than once",
                program.name
            )));
        }
        let index = self.programs.len();
        self.program_index.insert(program.name.clone(), index);
        self.programs.push(program);
        Ok(index)
    }

    /// Programs in declaration order
    pub fn programs(&self) -> &[ProgramInfo] {
        &self.programs
    }

    pub fn program_by_name(&self, name: &str) -> Option<&ProgramInfo> {
        self.program_index.get(name).map(|index| &self.programs[*index])
    }

    // Fused ops

    pub fn add_fused_op(&mut self, template: FusedOpTemplate) -> CompileResult<()> {
        if self.fused_ops.contains_key(&template.id) {
            return Err(CompileError::parse_error(format!(
                "fused_op_id={} is declared more than once",
                template.id
            )));
        }
        self.fused_ops.insert(template.id.clone(), template);
        Ok(())
    }

    pub fn fused_ops(&self) -> &BTreeMap<String, FusedOpTemplate> {
        &self.fused_ops
    }

    pub fn fused_op(&self, id: &str) -> Option<&FusedOpTemplate> {
        self.fused_ops.get(id)
    }

    /// Replace every arena at once and rebuild the indices. Used by the
    /// expander; ids handed out before this call are invalidated.
    pub(crate) fn replace_entities(
        &mut self,
        queues: Vec<QueueInfo>,
        graphs: Vec<(GraphInfo, Vec<OpInfo>)>,
        programs: Vec<ProgramInfo>,
    ) -> CompileResult<()> {
        self.queues.clear();
        self.graphs.clear();
        self.ops.clear();
        self.programs.clear();
        self.reindex();
        for queue in queues {
            self.add_queue(queue)?;
        }
        for (mut graph, ops) in graphs {
            graph.ops.clear();
            let graph_id = self.add_graph(graph)?;
            for mut op in ops {
                op.graph = graph_id;
                self.add_op(op)?;
            }
        }
        for program in programs {
            self.add_program(program)?;
        }
        self.reindex();
        Ok(())
    }

    /// Rebuild every name index and the producer-to-consumer map
    pub fn reindex(&mut self) {
        self.queue_index = self
            .queues
            .iter()
            .enumerate()
            .map(|(i, q)| (q.name.clone(), QueueId(i)))
            .collect();
        self.graph_index = self
            .graphs
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), GraphId(i)))
            .collect();
        self.op_index = self
            .ops
            .iter()
            .enumerate()
            .map(|(i, op)| (op.name.clone(), OpId(i)))
            .collect();
        self.program_index = self
            .programs
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        self.consumers.clear();
        for op in &self.ops {
            for input in &op.inputs {
                self.consumers
                    .entry(input.clone())
                    .or_default()
                    .insert(op.name.clone());
            }
        }
    }

    /// Pretty JSON dump of the derived IR
    pub fn to_json(&self) -> CompileResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OpKind;

    fn store_with_graph() -> (Netlist, GraphId) {
        let mut netlist = Netlist::new(DeviceInfo::new(Arch::Grayskull));
        let graph = netlist.add_graph(GraphInfo::new("g0", 0, 1)).unwrap();
        (netlist, graph)
    }

    #[test]
    fn test_duplicate_queue_rejected() {
        let (mut netlist, _) = store_with_graph();
        netlist.add_queue(QueueInfo::new("q0", "HOST")).unwrap();
        let err = netlist.add_queue(QueueInfo::new("q0", "HOST")).unwrap_err();
        assert!(err.message().contains("q0"));
    }

    #[test]
    fn test_duplicate_op_across_graphs_rejected() {
        let (mut netlist, g0) = store_with_graph();
        let g1 = netlist.add_graph(GraphInfo::new("g1", 0, 1)).unwrap();
        netlist.add_op(OpInfo::new("conv1", g0, OpKind::Datacopy)).unwrap();
        let err = netlist.add_op(OpInfo::new("conv1", g1, OpKind::Datacopy)).unwrap_err();
        assert!(err.message().contains("conv1"));
        assert!(err.message().contains("not globally unique"));
    }

    #[test]
    fn test_reindex_builds_consumers() {
        let (mut netlist, g0) = store_with_graph();
        let mut op = OpInfo::new("copy", g0, OpKind::Datacopy);
        op.inputs = vec!["q0".to_string()];
        netlist.add_op(op).unwrap();
        netlist.reindex();
        assert!(netlist.consumers["q0"].contains("copy"));
        assert_eq!(netlist.graph_ops(g0).count(), 1);
    }
}
