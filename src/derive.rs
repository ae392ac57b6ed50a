//! Derivation engine
//!
//! Fills in everything the netlist leaves implicit once names are resolved:
//! default pointer auto-increments on queue settings, queue input counts and
//! source devices, temporal epochs, per-input dims, grids and tile dims,
//! vector modes, instantiated fused-op templates and splice parameters.
//! Steps run in that order; later steps read what earlier ones produced.

use log::{debug, trace};
use std::collections::BTreeMap;

use crate::error::{ensure_derived, CompileError, CompileResult};
use crate::format::{DataFormat, Dim, GridShape, TileDim, VectorMode};
use crate::fused::{FusedFormats, FusedOpTemplate, RelName};
use crate::ir::{Netlist, OpId};
use crate::op::{InputSource, OpInfo, OpKind, Tm};
use crate::program::QueueSetting;
use crate::queue::{QueueLocation, QueueSource, QueueType};
use crate::temporal::derive_temporal_graphs;

/// Run every derivation step over a resolved netlist
pub fn derive_complex_settings(netlist: &mut Netlist) -> CompileResult<()> {
    derive_autoinc_defaults(netlist)?;
    derive_queue_input_counts(netlist);
    netlist.temporal = derive_temporal_graphs(netlist)?;
    derive_input_dims(netlist);
    derive_input_tile_dims(netlist)?;
    derive_vector_modes(netlist);
    instantiate_fused_ops(netlist)?;
    validate_splice_ops(netlist)?;
    Ok(())
}

/// Streaming queues advance their local read pointer and global write
/// pointer by default; RAMs advance nothing
fn derive_autoinc_defaults(netlist: &mut Netlist) -> CompileResult<()> {
    let queue_types: BTreeMap<String, QueueType> = netlist
        .queues()
        .iter()
        .map(|queue| (queue.name.clone(), queue.queue_type))
        .collect();

    for program in netlist.programs.iter_mut() {
        let program_name = program.name.clone();
        for execute in program.executes_mut() {
            for setting in &mut execute.queue_settings {
                let queue_type = queue_types.get(&setting.name).ok_or_else(|| {
                    CompileError::derivation(format!(
                        "Cannot find queue_setting for IO={} in Program={}",
                        setting.name, program_name
                    ))
                })?;
                let (local, global_wr, global_rd) = match queue_type {
                    QueueType::Queue => ("1", "1", "0"),
                    QueueType::Ram => ("0", "0", "0"),
                };
                fill_default(&mut setting.rd_ptr_autoinc, local);
                fill_default(&mut setting.global_wrptr_autoinc, global_wr);
                fill_default(&mut setting.global_rdptr_autoinc, global_rd);
            }
        }
    }
    Ok(())
}

fn fill_default(field: &mut Option<String>, value: &str) {
    if !QueueSetting::is_set(field) {
        *field = Some(value.to_string());
    }
}

/// Consumers decide a queue's input count; single-entry RAMs always hold one
/// input; output queues fall back to their producer graph's count
fn derive_queue_input_counts(netlist: &mut Netlist) {
    let mut consumed = Vec::new();
    for op in netlist.ops() {
        let input_count = netlist.graph_of(op).input_count;
        for source in &op.input_sources {
            if let InputSource::Queue(queue) = source {
                consumed.push((*queue, input_count));
            }
        }
    }
    for (queue, input_count) in consumed {
        netlist.queue_mut(queue).input_count = Some(input_count);
    }

    for id in netlist.queue_ids().collect::<Vec<_>>() {
        let queue = netlist.queue(id);
        if queue.is_param_or_constant() {
            netlist.queue_mut(id).input_count = Some(1);
            continue;
        }
        let (src_device, input_count) = match &queue.source {
            QueueSource::Host => (Some(queue.target_device), queue.input_count),
            QueueSource::Op(producer) => match netlist.op_by_name(producer) {
                Some(producer) => {
                    let graph = netlist.graph_of(producer);
                    let src_device = match queue.loc {
                        QueueLocation::Host => Some(graph.target_device),
                        QueueLocation::Dram => queue.src_device,
                    };
                    (src_device, queue.input_count.or(Some(graph.input_count)))
                }
                None => (queue.src_device, queue.input_count),
            },
            QueueSource::Relay(_) => (queue.src_device, queue.input_count),
        };
        let queue = netlist.queue_mut(id);
        queue.src_device = src_device;
        queue.input_count = input_count;
        trace!(
            "Queue {} input_count={:?} src_device={:?}",
            queue.name,
            queue.input_count,
            queue.src_device
        );
    }
}

fn producer_shape(netlist: &Netlist, source: InputSource) -> (Dim, GridShape, TileDim) {
    match source {
        InputSource::Queue(id) => {
            let queue = netlist.queue(id);
            (queue.dim, queue.grid_size, queue.tile_dim)
        }
        InputSource::Op(id) => {
            let op = netlist.op(id);
            (op.output_dim, op.grid_size, op.tile_dim)
        }
    }
}

/// Every op output shape is known from parsing, so one pass suffices
fn derive_input_dims(netlist: &mut Netlist) {
    for id in netlist.op_ids().collect::<Vec<_>>() {
        let (dims, grids): (Vec<Dim>, Vec<GridShape>) = netlist
            .op(id)
            .input_sources
            .iter()
            .map(|source| {
                let (dim, grid, _) = producer_shape(netlist, *source);
                (dim, grid)
            })
            .unzip();
        let op = netlist.op_mut(id);
        op.input_dims = dims;
        op.input_grids = grids;
    }
}

/// Producer tile dims, swapped once per transpose TM on the input
fn derive_input_tile_dims(netlist: &mut Netlist) -> CompileResult<()> {
    for id in netlist.op_ids().collect::<Vec<_>>() {
        let op = netlist.op(id);
        let mut tile_dims = Vec::with_capacity(op.input_sources.len());
        for (index, source) in op.input_sources.iter().enumerate() {
            let (_, _, mut tile_dim) = producer_shape(netlist, *source);
            for tm in op.tms(index) {
                if *tm != Tm::Transpose {
                    continue;
                }
                if op.op_type().is_matmul() {
                    ensure_derived(
                        matches!(tile_dim, TileDim::R32C32 | TileDim::R16C32),
                        || {
                            format!(
                                "Transpose TM is supported on matmul input only if it's tile dims are 32x32 or 16x32. Op name: {}, input tile dim: {}",
                                op.name, tile_dim
                            )
                        },
                    )?;
                }
                tile_dim = tile_dim.transpose();
            }
            tile_dims.push(tile_dim);
        }
        netlist.op_mut(id).input_tile_dims = tile_dims;
    }
    Ok(())
}

/// SFPU ops on tiny tiles only process the faces the tile actually has
fn derive_vector_modes(netlist: &mut Netlist) {
    for id in netlist.op_ids().collect::<Vec<_>>() {
        let op = netlist.op_mut(id);
        if op.attributes.vector_mode.is_some() {
            continue;
        }
        let mode = if op.op_type().is_sfpu() {
            match op.input_tile_dims.first().copied().unwrap_or_default() {
                TileDim::R32C32 => VectorMode::Rc,
                TileDim::R32C16 => VectorMode::C,
                _ => VectorMode::R,
            }
        } else {
            VectorMode::Rc
        };
        debug!("Derived vector mode {} for op {}", mode, op.name);
        op.attributes.vector_mode = Some(mode);
    }
}

fn instantiate_fused_ops(netlist: &mut Netlist) -> CompileResult<()> {
    let fused: Vec<OpId> = netlist
        .op_ids()
        .filter(|id| netlist.op(*id).op_type().is_fused())
        .collect();
    for id in fused {
        let template = instantiate_fused_op(netlist, netlist.op(id))?;
        netlist.op_mut(id).fused = Some(template);
    }
    Ok(())
}

/// Copy the template named by `op` and specialise it to the op's formats,
/// inputs, relu settings and output shape
pub fn instantiate_fused_op(netlist: &Netlist, op: &OpInfo) -> CompileResult<FusedOpTemplate> {
    let OpKind::Fused(attrs) = &op.kind else {
        return Err(CompileError::derivation(format!("op={} is not a fused op", op.name)));
    };
    let graph = &netlist.graph_of(op).name;
    let mut template = netlist
        .fused_op(&attrs.fused_op_id)
        .cloned()
        .ok_or_else(|| {
            CompileError::derivation(format!(
                "fused_op_id={} used by op={} in graph={} is not declared",
                attrs.fused_op_id, op.name, graph
            ))
        })?;
    ensure_derived(template.num_inputs == op.inputs.len(), || {
        format!(
            "fused_op_id={} has inputs={} must be same as specified in number of inputs={} in op={}, graph={}",
            attrs.fused_op_id,
            template.num_inputs,
            op.inputs.len(),
            op.name,
            graph
        )
    })?;

    template.formats = Some(FusedFormats {
        inputs: op.input_formats.clone(),
        accumulation: op.acc_format,
        intermed: op.intermed_format,
        output: op.output_format,
    });
    template.input_names_to_rel_names = op
        .inputs
        .iter()
        .enumerate()
        .map(|(index, name)| (name.clone(), RelName::Input(index)))
        .collect();
    template.forked_input_names = template.compute_forked_inputs();

    let intermed_used = template
        .scheduled_ops()
        .any(|sub| sub.output.is_intermed() || sub.op_type.is_matmul_or_reduce());
    template.output_and_intermed_format_match =
        !intermed_used || op.output_format == op.intermed_format;
    let reference = if intermed_used {
        Some(op.intermed_format)
    } else {
        op.input_formats.first().copied()
    };
    template.inputs_and_intermed_formats_match = op
        .input_formats
        .iter()
        .all(|df| Some(*df) == reference);

    let any_exp_a = op.input_formats.iter().any(DataFormat::is_exp_a) || op.intermed_format.is_exp_a();
    let acc_fp32 = op.acc_format == DataFormat::Float32;
    let relu = op.attributes.relu;
    for schedule in &mut template.schedules {
        for sub in &mut schedule.ops {
            sub.output_format = Some(op.output_format);
            if sub.output == RelName::Output {
                if relu.enabled && sub.relu.enabled {
                    ensure_derived(
                        relu.threshold == sub.relu.threshold && relu.mode == sub.relu.mode,
                        || {
                            format!(
                                "base op_info={} and scheduled_op={} both have relu_en set, but mismatching relu_threshold/relu_mode",
                                op.name, sub.name
                            )
                        },
                    )?;
                }
                if relu.enabled {
                    sub.relu = relu;
                }
            }
            sub.cast_dest_fp32_to_fp16_a =
                sub.inputs.len() == 2 && acc_fp32 && sub.uses(RelName::Dest) && any_exp_a;
            sub.output_dim.t = op.output_dim.t;
            sub.output_dim.ublock_order = op.output_dim.ublock_order;
        }
    }
    template.kernel_broadcast = op.attributes.kernel_broadcast.clone();
    template.intermed_buff_size_in_tiles = template.compute_intermed_buffer_sizes();
    debug!(
        "Instantiated fused_op_id={} for op {}: forked inputs {:?}",
        template.id, op.name, template.forked_input_names
    );
    Ok(template)
}

fn validate_splice_ops(netlist: &Netlist) -> CompileResult<()> {
    for op in netlist.ops() {
        let OpKind::Splice(splice) = &op.kind else {
            continue;
        };
        ensure_derived(splice.inputs.len() == op.input_dims.len(), || {
            format!(
                "splice op {} must have input_dims.size()={} equal to splice_infos.size()={}",
                op.name,
                op.input_dims.len(),
                splice.inputs.len()
            )
        })?;
        for (index, input) in splice.inputs.iter().enumerate() {
            let input = input.ok_or_else(|| {
                CompileError::derivation(format!(
                    "splice op {} is missing the [index, length, stride] attribute for input {}",
                    op.name, index
                ))
            })?;
            ensure_derived(input.length > 0, || {
                format!(
                    "Invalid length {} for input {} for splice op {}. Must be > 0",
                    input.length, index, op.name
                )
            })?;
            ensure_derived(input.stride > 0, || {
                format!(
                    "Invalid stride {} for input {} for splice op {}. Must be > 0",
                    input.stride, index, op.name
                )
            })?;
            ensure_derived(input.index >= 0, || {
                format!(
                    "Invalid start index {} for input {} of splice op {}. Must be >= 0 and <= # of input T or ublock",
                    input.index, index, op.name
                )
            })?;
        }
    }
    Ok(())
}
