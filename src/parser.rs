//! Netlist parser
//!
//! Walks the field tree section by section (`devices`, `queues`, `graphs`,
//! `programs`, `fused_ops`) and fills a fresh [`Netlist`]. Entities declared
//! on several devices are recorded as pending; the expander turns them into
//! per-device copies afterwards.

use log::{debug, warn};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::arch::{Arch, DeviceInfo};
use crate::attributes::{
    int32_on_input0, parse_op_attributes, parse_padding, parse_scheduled_op_attributes, parse_tms,
    AttrTarget, TmConsumer, TmTarget,
};
use crate::config::CompileOptions;
use crate::error::{ensure_parse, CompileError, CompileResult};
use crate::fields::{parse_source, unsupported_field, Node};
use crate::format::{DataFormat, GridShape, TileDim, UblockOrder};
use crate::fused::{FusedOpTemplate, RelName, Schedule, ScheduledOp};
use crate::ir::{GraphId, GraphInfo, Netlist};
use crate::lexer::{single_token, Token};
use crate::op::{OpInfo, OpKind, OpType, Padding};
use crate::program::{
    ExecuteInstruction, Instruction, Operand, ProgramInfo, QueueSetting, VarOpcode,
};
use crate::queue::{AllocInfo, QueueInfo, QueueLayout, QueueLocation, QueueType};

/// Top-level sections, in the order they are parsed
const SECTIONS: [&str; 5] = ["devices", "queues", "graphs", "programs", "fused_ops"];

/// Highest DRAM port a queue buffer may be pinned to
const MAX_DRAM_PORT: u32 = 2;

/// Parser for netlist field trees
pub struct Parser<'a> {
    root: Node<'a>,
    options: &'a CompileOptions,
}

impl<'a> Parser<'a> {
    pub fn new(value: &'a Value, options: &'a CompileOptions) -> Self {
        Self {
            root: Node::root(value),
            options,
        }
    }

    /// Parse every section into a new netlist
    pub fn parse(&self) -> CompileResult<Netlist> {
        for (key, _) in self.root.entries()? {
            if !SECTIONS.contains(&key) {
                return Err(unsupported_field(key, "netlist"));
            }
        }
        let devices = self
            .root
            .get("devices")
            .ok_or_else(|| CompileError::parse_error("netlist is missing the devices section"))?;
        let mut netlist = Netlist::new(self.parse_devices(&devices)?);

        if let Some(queues) = self.root.get("queues") {
            for (name, fields) in queues.entries()? {
                self.parse_queue(&mut netlist, name, &fields)?;
            }
        }
        if let Some(graphs) = self.root.get("graphs") {
            for (name, fields) in graphs.entries()? {
                self.parse_graph(&mut netlist, name, &fields)?;
            }
        }
        if let Some(programs) = self.root.get("programs") {
            for entry in programs.items()? {
                let (name, trace) = entry.single_entry().map_err(|_| {
                    CompileError::parse_error("Each entry in programs list must have only 1 map specified")
                })?;
                let program = self.parse_program(&netlist, name, &trace)?;
                netlist.add_program(program)?;
            }
        }
        if let Some(fused_ops) = self.root.get("fused_ops") {
            for (id, fields) in fused_ops.entries()? {
                let template = self.parse_fused_op(netlist.arch(), id, &fields)?;
                netlist.add_fused_op(template)?;
            }
        }

        netlist.reindex();
        debug!(
            "Parsed {} queues, {} graphs, {} ops, {} programs, {} fused ops",
            netlist.queues().len(),
            netlist.graphs().len(),
            netlist.ops().len(),
            netlist.programs().len(),
            netlist.fused_ops().len()
        );
        Ok(netlist)
    }

    fn parse_devices(&self, devices: &Node) -> CompileResult<DeviceInfo> {
        let mut supported = Vec::new();
        for (key, value) in devices.entries()? {
            match key {
                "arch" if value.is_seq() => {
                    for item in value.items()? {
                        supported.push(item.as_str()?.parse::<Arch>()?);
                    }
                }
                "arch" => supported.push(value.as_str()?.parse::<Arch>()?),
                _ => return Err(unsupported_field(key, "devices")),
            }
        }
        DeviceInfo::select(supported, self.options.arch_override)
    }

    // Queues

    fn parse_queue(&self, netlist: &mut Netlist, name: &str, fields: &Node) -> CompileResult<()> {
        let arch = netlist.arch();
        let input = fields
            .get("input")
            .ok_or_else(|| CompileError::parse_error(format!("Queue {} is missing field input", name)))?
            .as_string()?;
        let mut queue = QueueInfo::new(name, input);

        for (key, value) in fields.entries()? {
            match key {
                "input" => {}
                "input_tms" => {
                    let target = TmTarget {
                        name,
                        consumer: TmConsumer::Queue,
                        input: 0,
                        fused: false,
                        int32_on_input0: false,
                        arch,
                    };
                    queue.input_tms = parse_tms(&value, &target)?.tms;
                }
                "entries" => queue.entries = value.as_u32()?,
                "grid_size" => {
                    let (r, c) = value.as_pair()?;
                    queue.grid_size = GridShape::new(r, c);
                }
                "t" => queue.dim.t = value.as_u32()?,
                "ublock" => (queue.dim.ublock_rt, queue.dim.ublock_ct) = value.as_pair()?,
                "mblock" => (queue.dim.mblock_m, queue.dim.mblock_n) = value.as_pair()?,
                "ublock_order" => queue.dim.ublock_order = UblockOrder::parse(value.as_str()?)?,
                "target_device" if value.is_seq() => {
                    let devices = value.as_u32_list()?;
                    queue.target_device = devices.first().copied().unwrap_or(0);
                    netlist.pending.queues.insert(name.to_string(), devices);
                }
                "target_device" => queue.target_device = value.as_u32()?,
                "loc" => {
                    queue.loc = match value.as_str()? {
                        "dram" => QueueLocation::Dram,
                        "host" => QueueLocation::Host,
                        other => {
                            return Err(CompileError::parse_error(format!(
                                "Invalid loc {} for queue {}",
                                other, name
                            )))
                        }
                    };
                    queue.alloc_info = parse_allocation(name, queue.loc, fields, arch)?;
                }
                // Read together with `loc`
                "dram" | "host" | "read_ports" | "write_ports" => {}
                "type" => {
                    queue.queue_type = match value.as_str()? {
                        "queue" => QueueType::Queue,
                        "ram" => QueueType::Ram,
                        other => {
                            return Err(CompileError::parse_error(format!(
                                "Invalid type {} for queue {}",
                                other, name
                            )))
                        }
                    }
                }
                "layout" => {
                    queue.layout = match value.as_str()? {
                        "tilized" => QueueLayout::Tilized,
                        "flat" => QueueLayout::Flat,
                        other => {
                            return Err(CompileError::parse_error(format!(
                                "Invalid layout {} for queue {}",
                                other, name
                            )))
                        }
                    }
                }
                "alias" => queue.alias = Some(value.as_string()?),
                "df" => queue.data_format = value.parse::<DataFormat>()?,
                "tile_dim" => queue.tile_dim = parse_tile_dim(&value, arch, name)?,
                _ => return Err(unsupported_field(key, &format!("queue {}", name))),
            }
        }
        netlist.add_queue(queue)?;
        Ok(())
    }

    // Graphs and ops

    fn parse_graph(&self, netlist: &mut Netlist, name: &str, fields: &Node) -> CompileResult<()> {
        let graph_id = netlist.add_graph(GraphInfo::new(name, 0, 1))?;
        for (key, value) in fields.entries()? {
            match key {
                "target_device" if value.is_seq() => {
                    let devices = value.as_u32_list()?;
                    netlist.graph_mut(graph_id).target_device = devices.first().copied().unwrap_or(0);
                    netlist.pending.graphs.insert(name.to_string(), devices);
                }
                "target_device" => netlist.graph_mut(graph_id).target_device = value.as_u32()?,
                "input_count" => netlist.graph_mut(graph_id).input_count = value.as_u32()?,
                op_name => {
                    let op = self.parse_op(netlist.arch(), graph_id, op_name, &value)?;
                    netlist.add_op(op)?;
                }
            }
        }
        Ok(())
    }

    fn parse_op(&self, arch: Arch, graph: GraphId, name: &str, fields: &Node) -> CompileResult<OpInfo> {
        let op_type: OpType = fields
            .get("type")
            .ok_or_else(|| CompileError::parse_error(format!("Op {} is missing field type", name)))?
            .parse()?;
        let mut op = OpInfo::new(name, graph, OpKind::Datacopy);
        let mut attributes = None;
        let mut per_input = Vec::new();

        // Plain fields first: attributes and TMs depend on inputs, formats and grid
        for (key, value) in fields.entries()? {
            match key {
                "type" => {}
                "t" => op.output_dim.t = value.as_u32()?,
                "ublock" => (op.output_dim.ublock_rt, op.output_dim.ublock_ct) = value.as_pair()?,
                "mblock" => {
                    (op.output_dim.mblock_m, op.output_dim.mblock_n) = value.as_pair()?;
                    ensure_parse(op_type != OpType::Buffer || op.output_dim.mblock_m <= 1, || {
                        format!("Output mblock_m must be set to 1 per core for buffer op {}", name)
                    })?;
                }
                "ublock_order" => op.output_dim.ublock_order = UblockOrder::parse(value.as_str()?)?,
                "tile_dim" => op.tile_dim = parse_tile_dim(&value, arch, name)?,
                "attributes" => attributes = Some(value),
                "in_df" => {
                    op.input_formats = value
                        .items()?
                        .iter()
                        .map(Node::parse::<DataFormat>)
                        .collect::<CompileResult<_>>()?
                }
                "out_df" => op.output_format = value.parse()?,
                "acc_df" => op.acc_format = value.parse()?,
                "intermed_df" => op.intermed_format = value.parse()?,
                "math_fidelity" => op.math_fidelity = value.parse()?,
                "untilize_output" => op.untilize_output = value.as_bool()?,
                "grid_transpose" => op.grid_transpose = value.as_bool()?,
                "gradient_op" => op.gradient_op = value.as_bool()?,
                "grid_loc" => op.grid_loc = value.as_u32_list()?,
                "grid_size" => {
                    let (r, c) = value.as_pair()?;
                    op.grid_size = GridShape::new(r, c);
                }
                "buf_size_mb" => op.buf_size_mb = value.as_u32()?,
                "overlay_size" => op.overlay_size = value.as_u32()?,
                "input_buf_min_size_tiles" => op.input_buf_min_size_tiles = value.as_u32_list()?,
                "input_dram_io_buf_size_tiles" => {
                    op.input_dram_io_buf_size_tiles = value.as_u32_list()?
                }
                "inputs" => op.inputs = value.as_string_list()?,
                "forked_dram_inputs" => {
                    ensure_parse(value.is_seq(), || {
                        "Forked dram inputs must be a list of queue_name: op_name maps".to_string()
                    })?;
                    for item in value.items()? {
                        for (queue, reader) in item.entries()? {
                            op.forked_dram_inputs.push((queue.to_string(), reader.as_string()?));
                        }
                    }
                }
                _ => match single_token(key) {
                    Some(token @ (Token::InputTms(_) | Token::InputPad(_) | Token::InputUnpad(_))) => {
                        per_input.push((token, value))
                    }
                    _ => return Err(unsupported_field(key, &format!("op {}", name))),
                },
            }
        }

        let num_inputs = op.inputs.len();
        if op.input_buf_min_size_tiles.is_empty() {
            op.input_buf_min_size_tiles = vec![0; num_inputs];
        }
        if op.input_dram_io_buf_size_tiles.is_empty() {
            op.input_dram_io_buf_size_tiles = vec![0; num_inputs];
        }
        op.input_tms = vec![Vec::new(); num_inputs];
        op.input_padding = vec![None; num_inputs];
        op.input_unpadding = vec![None; num_inputs];

        let target = AttrTarget {
            op_name: name,
            op_type,
            num_inputs,
            num_cores: op.grid_size_x() * op.grid_size_y(),
            arch,
        };
        (op.kind, op.attributes) = parse_op_attributes(attributes.as_ref(), &target)?;

        for (token, value) in per_input {
            let (Token::InputTms(index) | Token::InputPad(index) | Token::InputUnpad(index)) = token
            else {
                continue;
            };
            ensure_parse(index < num_inputs, || {
                format!(
                    "Invalid input {} in TM op syntax! Found on op {}, type {} which has {} valid inputs",
                    index, name, op_type, num_inputs
                )
            })?;
            match token {
                Token::InputTms(_) => {
                    let target = TmTarget {
                        name,
                        consumer: TmConsumer::Op(op_type),
                        input: index,
                        fused: false,
                        int32_on_input0: int32_on_input0(&op.input_formats),
                        arch,
                    };
                    let parsed = parse_tms(&value, &target)?;
                    op.transpose ^= parsed.transpose;
                    op.input_tms[index] = parsed.tms;
                    if let Some(padding) = parsed.padding {
                        set_padding_once(&mut op, index, padding)?;
                    }
                }
                Token::InputPad(_) => {
                    let padding = parse_padding(&value, true)?;
                    set_padding_once(&mut op, index, padding)?;
                }
                _ => op.input_unpadding[index] = Some(parse_padding(&value, false)?),
            }
        }
        Ok(op)
    }

    // Programs

    fn parse_program(&self, netlist: &Netlist, name: &str, trace: &Node) -> CompileResult<ProgramInfo> {
        let mut program = ProgramInfo::new(name);
        for node in trace.items()? {
            let instruction = if let Ok(text) = node.as_str() {
                if text != "endloop" {
                    return Err(CompileError::parse_error(format!(
                        "Invalid OP Code={} parsed in program instructions as a scalar",
                        text
                    )));
                }
                Instruction::EndLoop
            } else {
                let (opcode, body) = node.single_entry().map_err(|_| {
                    CompileError::parse_error(
                        "Each Instruction must be a map with only 1 entry and opcode as key",
                    )
                })?;
                self.parse_instruction(netlist, opcode, &body)?
            };
            program.instructions.push(instruction);
        }
        program.instructions.push(Instruction::EndProgram);
        Ok(program)
    }

    fn parse_instruction(&self, netlist: &Netlist, opcode: &str, body: &Node) -> CompileResult<Instruction> {
        Ok(match opcode {
            "var" => Instruction::Var(parse_var_declarations(body)?),
            "staticvar" => Instruction::StaticVar(parse_var_declarations(body)?),
            "param" => {
                ensure_parse(body.is_seq(), || {
                    format!("Declaration of params must be formatted as a list: {}", body.value())
                })?;
                let names = body.as_string_list()?;
                if names.is_empty() {
                    warn!("Empty param declaration at {}", body.path());
                }
                Instruction::Param(names)
            }
            "varinst" => {
                let items = body.items()?;
                ensure_parse(items.len() >= 2, || {
                    "VarInst must have at least 2 fields, varinst: [$out, <op_code>, <args>]".to_string()
                })?;
                let dest = items[0].as_string()?;
                let opcode = VarOpcode::parse(items[1].as_str()?)?;
                let sources = items[2..]
                    .iter()
                    .map(|item| Operand::parse(&item.as_scalar_text()?))
                    .collect::<CompileResult<Vec<_>>>()?;
                ensure_parse(sources.len() == opcode.arity(), || {
                    format!(
                        "varinst {:?} on {} takes {} operands, found {}",
                        opcode,
                        dest,
                        opcode.arity(),
                        sources.len()
                    )
                })?;
                Instruction::VarInst { opcode, dest, sources }
            }
            "allocate_queue" | "deallocate_queue" => {
                ensure_parse(body.is_seq(), || {
                    format!("Alloc/dealloc of queues must be formatted as a list: {}", body.value())
                })?;
                let queues = body.as_string_list()?;
                for queue in &queues {
                    ensure_parse(netlist.queue_id(queue).is_some(), || {
                        format!(
                            "Queue={} being allocated/deallocated does not exist in the netlist!",
                            queue
                        )
                    })?;
                }
                if opcode == "allocate_queue" {
                    Instruction::AllocateQueue(queues)
                } else {
                    Instruction::DeallocateQueue(queues)
                }
            }
            "execute" => Instruction::Execute(parse_execute(body)?),
            "loop" => Instruction::Loop(Operand::parse(&body.as_scalar_text()?)?),
            "endloop" => Instruction::EndLoop,
            _ => {
                return Err(CompileError::parse_error(format!(
                    "Invalid OP Code={} parsed in program instructions as a map",
                    opcode
                )))
            }
        })
    }

    // Fused ops

    fn parse_fused_op(&self, arch: Arch, id: &str, fields: &Node) -> CompileResult<FusedOpTemplate> {
        let mut num_inputs = 0;
        let mut num_intermediates = 0;
        let mut custom_kernel_path = None;
        let mut schedules = Vec::new();
        for (key, value) in fields.entries()? {
            match key {
                "inputs" => num_inputs = value.as_usize()?,
                "intermediates" => num_intermediates = value.as_usize()?,
                "custom_kernel_path" => custom_kernel_path = Some(value.as_string()?),
                "schedules" => {
                    for schedule in value.items()? {
                        let mut ops = Vec::new();
                        for entry in schedule.items()? {
                            let (op_name, op_fields) = entry.single_entry().map_err(|_| {
                                CompileError::parse_error(
                                    "Each op in the schedule list must be a map between the op name and fields",
                                )
                            })?;
                            let op = parse_scheduled_op(arch, op_name, &op_fields).map_err(|err| {
                                CompileError::parse_error(format!(
                                    "Error parsing fused_op_id={}, scheduled_op={}: {}",
                                    id,
                                    op_name,
                                    err.message()
                                ))
                            })?;
                            ops.push(op);
                        }
                        schedules.push(Schedule { ops });
                    }
                }
                _ => return Err(unsupported_field(key, &format!("fused op {}", id))),
            }
        }
        let mut template = FusedOpTemplate::new(id, num_inputs, num_intermediates);
        template.custom_kernel_path = custom_kernel_path;
        template.schedules = schedules;
        Ok(template)
    }
}

fn set_padding_once(op: &mut OpInfo, index: usize, padding: Padding) -> CompileResult<()> {
    ensure_parse(op.input_padding[index].is_none(), || {
        format!(
            "Padding must be specified only once. Op: {}, type {}, input {}",
            op.name,
            op.op_type(),
            index
        )
    })?;
    op.input_padding[index] = Some(padding);
    Ok(())
}

/// `tile_dim: 16x32` or `tile_dim: [16, 32]`
fn parse_tile_dim(node: &Node, arch: Arch, owner: &str) -> CompileResult<TileDim> {
    let tile_dim = if node.is_seq() {
        let (h, w) = node.as_pair()?;
        TileDim::from_hw(h, w).ok_or_else(|| {
            CompileError::parse_error(format!("Invalid tile dim [{}, {}] for {}", h, w, owner))
        })?
    } else {
        node.parse::<TileDim>()?
    };
    ensure_parse(arch.supports_tiny_tiles() || !tile_dim.is_tiny(), || {
        format!("Grayskull only supports 32x32 (default) tile sizes, found {} on {}", tile_dim, owner)
    })?;
    Ok(tile_dim)
}

/// Allocation list of a queue: `dram: [[ch, addr], ..]` or `host: [[ch, addr] | addr, ..]`
fn parse_allocation(name: &str, loc: QueueLocation, fields: &Node, arch: Arch) -> CompileResult<Vec<AllocInfo>> {
    let mut allocs = Vec::new();
    match loc {
        QueueLocation::Dram => {
            let dram = fields.get("dram").filter(|dram| !dram.is_empty()).ok_or_else(|| {
                CompileError::parse_error(format!(
                    "queue {}: dram allocation information needs to be supplied if location is dram",
                    name
                ))
            })?;
            for item in dram.items()? {
                let entry = item.items()?;
                ensure_parse(entry.len() == 2, || {
                    format!("queue {}: dram allocation must be [channel, address]", name)
                })?;
                allocs.push(AllocInfo::new(entry[0].as_u32()?, entry[1].as_u64()?));
            }
            for (key, is_read) in [("read_ports", true), ("write_ports", false)] {
                let Some(ports) = fields.get(key) else {
                    continue;
                };
                ensure_parse(arch.supports_dram_ports(), || {
                    format!("{} setting for DRAM buffers is only available for wormhole_b0", key)
                })?;
                let ports = ports.as_u32_list()?;
                ensure_parse(ports.len() == allocs.len(), || {
                    format!("queue {}: {} setting must have one element per queue buffer", name, key)
                })?;
                for (alloc, port) in allocs.iter_mut().zip(ports) {
                    ensure_parse(port <= MAX_DRAM_PORT, || {
                        format!("queue {}: {} setting must be in the range 0-2", name, key)
                    })?;
                    if is_read {
                        alloc.read_port = Some(port);
                    } else {
                        alloc.write_port = Some(port);
                    }
                }
            }
        }
        QueueLocation::Host => {
            let host = fields.get("host").filter(|host| !host.is_empty()).ok_or_else(|| {
                CompileError::parse_error(format!(
                    "queue {}: host allocation information needs to be supplied if location is host",
                    name
                ))
            })?;
            for item in host.items()? {
                if item.is_seq() {
                    let (channel, address) = item.as_pair()?;
                    allocs.push(AllocInfo::new(channel, u64::from(address)));
                } else {
                    allocs.push(AllocInfo::new(0, item.as_u64()?));
                }
            }
        }
    }
    Ok(allocs)
}

/// `var: {$a: 0, $b: 4}` or `var: [$a, $b]` (each starting at 0)
fn parse_var_declarations(body: &Node) -> CompileResult<Vec<(String, i64)>> {
    let vars = if body.is_map() {
        body.entries()?
            .into_iter()
            .map(|(name, value)| Ok((name.to_string(), value.as_i64()?)))
            .collect::<CompileResult<Vec<_>>>()?
    } else if body.is_seq() {
        body.as_string_list()?.into_iter().map(|name| (name, 0)).collect()
    } else {
        return Err(CompileError::parse_error(format!(
            "Declaration of variables must be formatted as a list or map: {}",
            body.value()
        )));
    };
    if vars.is_empty() {
        warn!("Empty variables declaration at {}", body.path());
    }
    Ok(vars)
}

fn parse_execute(body: &Node) -> CompileResult<ExecuteInstruction> {
    let mut graph_name = None;
    let mut queue_settings = Vec::new();
    for (key, value) in body.entries()? {
        match key {
            "graph_name" => graph_name = Some(value.as_string()?),
            "queue_settings" => {
                for (queue, fields) in value.entries()? {
                    let mut setting = QueueSetting::new(queue);
                    for (field, text) in fields.entries()? {
                        setting.set_field(field, text.as_scalar_text()?)?;
                    }
                    queue_settings.push(setting);
                }
            }
            _ => return Err(unsupported_field(key, "execute instruction")),
        }
    }
    let graph_name = graph_name
        .ok_or_else(|| CompileError::parse_error("execute instruction is missing graph_name"))?;
    Ok(ExecuteInstruction {
        graph_name,
        queue_settings,
    })
}

fn parse_rel_names(node: &Node) -> CompileResult<Vec<RelName>> {
    node.items()?.iter().map(Node::parse::<RelName>).collect()
}

fn parse_scheduled_op(arch: Arch, name: &str, fields: &Node) -> CompileResult<ScheduledOp> {
    let op_type: OpType = fields
        .get("type")
        .ok_or_else(|| CompileError::parse_error(format!("scheduled op {} is missing field type", name)))?
        .parse()?;
    let output: RelName = fields
        .get("output")
        .ok_or_else(|| CompileError::parse_error(format!("scheduled op {} is missing field output", name)))?
        .parse()?;
    let mut op = ScheduledOp::new(name, op_type, output);
    let mut tms = Vec::new();

    for (key, value) in fields.entries()? {
        match key {
            "type" | "output" => {}
            "inputs" => op.inputs = parse_rel_names(&value)?,
            "mblock" => (op.output_dim.mblock_m, op.output_dim.mblock_n) = value.as_pair()?,
            "ublock" => (op.output_dim.ublock_rt, op.output_dim.ublock_ct) = value.as_pair()?,
            "pop" => op.inputs_to_pop = parse_unique_rel_names(&value, "input_to_pop")?,
            "pop_last" => {
                op.inputs_to_pop_last = parse_unique_rel_names(&value, "input_to_pop_last")?;
                if let Some(bad) = op.inputs_to_pop_last.iter().find(|rel| !rel.is_intermed()) {
                    return Err(CompileError::parse_error(format!(
                        "input_to_pop_last={} must be an intermediate buffer in format intermedX",
                        bad
                    )));
                }
            }
            "zero_point" => op.zero_point = value.as_f32()?,
            "attributes" => parse_scheduled_op_attributes(&value, &mut op)?,
            _ => match single_token(key) {
                Some(Token::InputTms(index)) => tms.push((index, value)),
                _ => return Err(unsupported_field(key, &format!("scheduled op {}", name))),
            },
        }
    }

    let mut transpose = false;
    for (index, value) in tms {
        ensure_parse(index < op.inputs.len(), || {
            format!(
                "Invalid input {} in TM op syntax! Found on op {}, type {} which has {} valid inputs",
                index,
                name,
                op_type,
                op.inputs.len()
            )
        })?;
        let target = TmTarget {
            name,
            consumer: TmConsumer::Op(op_type),
            input: index,
            fused: true,
            int32_on_input0: false,
            arch,
        };
        let parsed = parse_tms(&value, &target)?;
        transpose ^= parsed.transpose;
        op.input_tms.insert(index, parsed.tms);
    }
    ensure_parse(!transpose, || {
        format!(
            "List of tm's used in op={} will cause a transpose at the tile level which is not supported in fused ops",
            name
        )
    })?;
    Ok(op)
}

fn parse_unique_rel_names(node: &Node, what: &str) -> CompileResult<BTreeSet<RelName>> {
    let mut set = BTreeSet::new();
    for rel in parse_rel_names(node)? {
        if !set.insert(rel) {
            return Err(CompileError::parse_error(format!(
                "{}={} is duplicated in the list to pop",
                what, rel
            )));
        }
    }
    Ok(set)
}

/// Parse JSON text into a netlist without expanding or deriving anything
pub fn parse_str(source: &str, options: &CompileOptions) -> CompileResult<Netlist> {
    let value = parse_source(source)?;
    Parser::new(&value, options).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{BroadcastDim, Tm};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(value: Value) -> CompileResult<Netlist> {
        let options = CompileOptions::default();
        Parser::new(&value, &options).parse()
    }

    fn base() -> Value {
        json!({
            "devices": { "arch": "wormhole_b0" },
            "queues": {
                "q0": {
                    "input": "HOST", "entries": 2, "grid_size": [1, 1], "t": 1,
                    "ublock": [2, 2], "mblock": [1, 1], "df": "Float16_b",
                    "target_device": 0, "loc": "dram", "dram": [[0, 0x1000]]
                },
                "q1": {
                    "input": "copy", "entries": 2, "grid_size": [1, 1], "t": 1,
                    "ublock": [2, 2], "mblock": [1, 1], "df": "Float16_b",
                    "target_device": 0, "loc": "host", "host": [0x2000]
                }
            },
            "graphs": {
                "fwd": {
                    "target_device": 0, "input_count": 2,
                    "copy": {
                        "type": "datacopy", "grid_loc": [0, 0], "grid_size": [1, 1],
                        "inputs": ["q0"], "in_df": ["Float16_b"], "out_df": "Float16_b",
                        "acc_df": "Float16_b", "intermed_df": "Float16_b", "math_fidelity": "HiFi3",
                        "untilize_output": false, "t": 1, "ublock": [2, 2], "mblock": [1, 1],
                        "input_0_tms": [{ "broadcast": { "r": 2 } }]
                    }
                }
            },
            "programs": [
                { "main": [
                    { "var": { "$c_loop": 0 } },
                    { "staticvar": ["$gptr"] },
                    { "loop": "$n" },
                    { "execute": { "graph_name": "fwd", "queue_settings": {
                        "q0": { "prologue": false, "epilogue": false, "zero": false,
                                "rd_ptr_global": "$gptr", "wr_ptr_global": "$gptr" }
                    } } },
                    { "varinst": ["$gptr", "incwrap", 2, 4] },
                    "endloop"
                ] }
            ]
        })
    }

    #[test]
    fn test_parse_sections() {
        let netlist = parse(base()).unwrap();
        assert_eq!(netlist.arch(), Arch::WormholeB0);
        assert_eq!(netlist.queues().len(), 2);
        let q1 = netlist.queue_by_name("q1").unwrap();
        assert_eq!(q1.loc, QueueLocation::Host);
        assert_eq!(q1.alloc_info, vec![AllocInfo::new(0, 0x2000)]);

        let graph = netlist.graph_by_name("fwd").unwrap();
        assert_eq!(graph.input_count, 2);
        let copy = netlist.op_by_name("copy").unwrap();
        assert_eq!(copy.op_type(), OpType::Datacopy);
        assert_eq!(copy.input_buf_min_size_tiles, vec![0]);
        assert_eq!(
            copy.tms(0),
            &[Tm::Broadcast {
                dim: BroadcastDim::R,
                factor: 2
            }]
        );
        assert!(netlist.consumers["q0"].contains("copy"));
    }

    #[test]
    fn test_program_trace_ends_with_endprogram() {
        let netlist = parse(base()).unwrap();
        let main = netlist.program_by_name("main").unwrap();
        assert_eq!(main.instructions.len(), 7);
        assert_eq!(main.instructions.last(), Some(&Instruction::EndProgram));
        assert_eq!(main.instructions[1], Instruction::StaticVar(vec![("$gptr".to_string(), 0)]));
        assert_eq!(
            main.instructions[4],
            Instruction::VarInst {
                opcode: VarOpcode::IncWrap,
                dest: "$gptr".to_string(),
                sources: vec![Operand::Imm(2), Operand::Imm(4)],
            }
        );
        let execute = main.executes().next().unwrap();
        let setting = execute.setting("q0").unwrap();
        assert_eq!(setting.prologue.as_deref(), Some("false"));
        assert_eq!(setting.rd_ptr_global.as_deref(), Some("$gptr"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let mut source = base();
        source["queues"]["q0"]["depth"] = json!(3);
        let err = parse(source).unwrap_err();
        assert_eq!(err.message(), "Field depth is not supported for queue q0");

        let mut source = base();
        source["layouts"] = json!({});
        assert!(parse(source).is_err());
    }

    #[test]
    fn test_missing_devices_is_an_error() {
        let mut source = base();
        source.as_object_mut().unwrap().remove("devices");
        assert!(parse(source).unwrap_err().message().contains("devices"));
    }

    #[test]
    fn test_dram_queue_needs_allocation() {
        let mut source = base();
        source["queues"]["q0"]["dram"] = json!([]);
        let err = parse(source).unwrap_err();
        assert!(err.message().contains("dram allocation information"));
    }

    #[test]
    fn test_read_ports_only_on_wormhole_b0() {
        let mut source = base();
        source["queues"]["q0"]["read_ports"] = json!([1]);
        let netlist = parse(source.clone()).unwrap();
        assert_eq!(netlist.queue_by_name("q0").unwrap().alloc_info[0].read_port, Some(1));

        source["devices"]["arch"] = json!("grayskull");
        assert!(parse(source.clone()).is_err());

        source["devices"]["arch"] = json!("wormhole_b0");
        source["queues"]["q0"]["read_ports"] = json!([3]);
        assert!(parse(source).unwrap_err().message().contains("range 0-2"));
    }

    #[test]
    fn test_tm_index_out_of_range() {
        let mut source = base();
        source["graphs"]["fwd"]["copy"]["input_1_tms"] = json!(["transpose"]);
        let err = parse(source).unwrap_err();
        assert!(err.message().contains("Invalid input 1 in TM op syntax"));
    }

    #[test]
    fn test_grayskull_rejects_tiny_tiles() {
        let mut source = base();
        source["devices"]["arch"] = json!("grayskull");
        source["queues"]["q0"]["tile_dim"] = json!([16, 32]);
        assert!(parse(source.clone()).unwrap_err().message().contains("32x32"));

        source["devices"]["arch"] = json!("wormhole_b0");
        let netlist = parse(source).unwrap();
        assert_eq!(netlist.queue_by_name("q0").unwrap().tile_dim, TileDim::R16C32);
    }

    #[test]
    fn test_allocate_unknown_queue() {
        let mut source = base();
        source["programs"] = json!([{ "main": [{ "allocate_queue": ["missing"] }] }]);
        let err = parse(source).unwrap_err();
        assert!(err.message().contains("Queue=missing"));
    }

    #[test]
    fn test_multi_device_entities_are_pending() {
        let mut source = base();
        source["graphs"]["fwd"]["target_device"] = json!([0, 1]);
        let netlist = parse(source).unwrap();
        assert_eq!(netlist.pending.graphs.get("fwd"), Some(&vec![0, 1]));
        assert!(netlist.pending.queues.is_empty());
    }

    #[test]
    fn test_fused_op_schedules() {
        let mut source = base();
        source["fused_ops"] = json!({
            "0": {
                "inputs": 2, "intermediates": 1,
                "schedules": [
                    [ { "mm": { "type": "matmul", "inputs": ["input0", "input1"], "output": "intermed0",
                                "mblock": [1, 1], "ublock": [2, 2], "attributes": { "m_k": 4, "u_kt": 1 } } } ],
                    [ { "add": { "type": "add", "inputs": ["intermed0", "input0"], "output": "output",
                                 "pop_last": ["intermed0"], "mblock": [1, 1], "ublock": [2, 2] } } ]
                ]
            }
        });
        let netlist = parse(source).unwrap();
        let template = netlist.fused_op("0").unwrap();
        assert_eq!(template.schedules.len(), 2);
        assert_eq!(template.schedules[0].ops[0].m_k, 4);
        assert!(template.schedules[1].ops[0].inputs_to_pop_last.contains(&RelName::Intermed(0)));
    }

    #[test]
    fn test_fused_pop_last_must_be_intermed() {
        let mut source = base();
        source["fused_ops"] = json!({
            "0": { "inputs": 1, "intermediates": 0, "schedules": [[
                { "e": { "type": "exp", "inputs": ["input0"], "output": "output", "pop_last": ["input0"] } }
            ]] }
        });
        let err = parse(source).unwrap_err();
        assert!(err.message().contains("scheduled_op=e"));
        assert!(err.message().contains("intermedX"));
    }
}
