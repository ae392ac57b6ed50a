//! Op attributes, input TMs and input padding
//!
//! Attributes are collected before any of them is interpreted, so their order
//! in the source does not matter (`z` depends on `accumulate` and `dim`,
//! `num_nz_strips` on the grid size). Each op kind accepts only the
//! attributes it understands.

use std::collections::BTreeMap;

use crate::arch::Arch;
use crate::error::{CompileError, CompileResult};
use crate::fields::Node;
use crate::format::{DataFormat, ReluMode, SfpuExecutionThread, StochRndMode};
use crate::fused::ScheduledOp;
use crate::lexer::{single_token, Token};
use crate::op::{
    BroadcastDim, BufferAttrs, DepthwiseAttrs, EthernetAttrs, FusedAttrs, KernelBroadcast,
    MatmulAttrs, OpAttributes, OpKind, OpType, Padding, ReduceAttrs, ReduceDim, ReduceFunc,
    ReluConfig, SfpuOp, SfpuParams, SparseAttrs, SpliceAttrs, SpliceInput, SpliceMode, Tm,
    TopkSort,
};

/// Splice ops read at most this many inputs
pub const MAX_SPLICE_INPUTS: usize = 8;

const COMMON_ATTRIBUTES: &[&str] = &[
    "kernel_broadcast",
    "kernel_broadcast_per_t",
    "single_tile",
    "vector",
    "approximate_mode",
    "relu_en",
    "relu_threshold",
    "relu_mode",
    "srnd_fpu_en",
    "stoch_rnd_mode",
    "zero_point",
    "sfpu_execution_thread",
];

const SPARSE_ATTRIBUTES: &[&str] = &[
    "num_index_tiles",
    "num_sparse_tiles",
    "num_columns",
    "sparse_tile_ptr_bits",
    "sparse_ublock_idx_bits",
    "indices_len",
    "fracture_factor",
    "starting_row",
    "act_t",
    "num_nz_strips",
];

const BUFFER_SPARSE_ATTRIBUTES: &[&str] = &[
    "num_index_tiles",
    "sparse_tile_ptr_bits",
    "sparse_ublock_idx_bits",
    "num_nz_strips",
];

fn accepts(op_type: OpType, key: &str) -> bool {
    if COMMON_ATTRIBUTES.contains(&key) {
        return true;
    }
    match op_type {
        OpType::Matmul => {
            SPARSE_ATTRIBUTES.contains(&key)
                || matches!(
                    key,
                    "m_k" | "u_kt" | "accumulate" | "bias" | "sfpu_op" | "identity"
                        | "min_buffer_input" | "l1_acc" | "z" | "requant" | "dequant"
                )
        }
        OpType::Depthwise => matches!(key, "m_k" | "u_kt" | "l1_acc" | "min_buffer_input"),
        OpType::Reduce => matches!(key, "dim" | "type" | "z" | "m_k" | "u_kt"),
        OpType::Buffer => BUFFER_SPARSE_ATTRIBUTES.contains(&key) || key == "min_buffer_input",
        OpType::Fused => {
            SPARSE_ATTRIBUTES.contains(&key)
                || matches!(
                    key,
                    "m_k" | "u_kt" | "identity" | "min_buffer_input" | "dim" | "type" | "z"
                        | "p" | "seed" | "slope" | "exp" | "fused_op_id"
                )
        }
        OpType::Sfpu(SfpuOp::Dropout) => matches!(key, "p" | "seed"),
        OpType::Sfpu(SfpuOp::Lrelu) => key == "slope",
        OpType::Sfpu(SfpuOp::Power) => key == "exp",
        OpType::Splice => {
            key == "granularity" || matches!(single_token(key), Some(Token::Input(_)))
        }
        OpType::Embedding => key == "num_indices",
        OpType::Topk => matches!(key, "k" | "sort"),
        OpType::EthernetDatacopy => {
            matches!(key, "ingress_channels" | "egress_channels" | "dest_device")
        }
        _ => false,
    }
}

/// The op an attribute block belongs to
#[derive(Debug, Clone, Copy)]
pub struct AttrTarget<'a> {
    pub op_name: &'a str,
    pub op_type: OpType,
    pub num_inputs: usize,
    pub num_cores: u32,
    pub arch: Arch,
}

struct Collected<'a, 't> {
    target: &'t AttrTarget<'t>,
    fields: BTreeMap<&'a str, Node<'a>>,
}

impl<'a, 't> Collected<'a, 't> {
    fn collect(node: Option<&Node<'a>>, target: &'t AttrTarget<'t>) -> CompileResult<Self> {
        let mut fields = BTreeMap::new();
        if let Some(node) = node {
            if node.is_empty() {
                return Err(CompileError::parse_error(format!(
                    "attributes of op {} must contain at least 1 value",
                    target.op_name
                )));
            }
            for (key, value) in node.entries()? {
                if key == "sfpu_execution_thread"
                    && !(target.op_type.is_matmul() || target.op_type.is_sfpu())
                {
                    return Err(CompileError::parse_error(format!(
                        "SFPU execution thread attribute set for unsupported op {}",
                        target.op_type
                    )));
                }
                if !accepts(target.op_type, key) {
                    return Err(CompileError::parse_error(format!(
                        "Attribute {} is invalid or unsupported for op {}, type {}",
                        key, target.op_name, target.op_type
                    )));
                }
                fields.insert(key, value);
            }
        }
        Ok(Self { target, fields })
    }

    fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<&Node<'a>> {
        self.fields.get(key)
    }

    fn u32_or(&self, key: &str, default: u32) -> CompileResult<u32> {
        self.get(key).map_or(Ok(default), Node::as_u32)
    }

    fn i32_or(&self, key: &str, default: i32) -> CompileResult<i32> {
        self.get(key).map_or(Ok(default), Node::as_i32)
    }

    fn bool_or(&self, key: &str, default: bool) -> CompileResult<bool> {
        self.get(key).map_or(Ok(default), Node::as_bool)
    }

    fn f32_or(&self, key: &str, default: f32) -> CompileResult<f32> {
        self.get(key).map_or(Ok(default), Node::as_f32)
    }

    fn error(&self, msg: impl std::fmt::Display) -> CompileError {
        CompileError::parse_error(format!("op {}: {}", self.target.op_name, msg))
    }

    fn sparse(&self) -> CompileResult<SparseAttrs> {
        let num_nz_strips = match self.get("num_nz_strips") {
            Some(node) => {
                let strips = node.as_u32_list()?;
                if strips.len() != self.target.num_cores as usize {
                    return Err(CompileError::parse_error(format!(
                        "num_nz_strips attribute for {} op must be set for all cores!",
                        self.target.op_name
                    )));
                }
                strips
            }
            None => Vec::new(),
        };
        Ok(SparseAttrs {
            num_index_tiles: self.u32_or("num_index_tiles", 0)?,
            num_sparse_tiles: self.u32_or("num_sparse_tiles", 0)?,
            num_columns: self.u32_or("num_columns", 0)?,
            sparse_tile_ptr_bits: self.u32_or("sparse_tile_ptr_bits", 0)?,
            sparse_ublock_idx_bits: self.u32_or("sparse_ublock_idx_bits", 0)?,
            indices_len: self.u32_or("indices_len", 0)?,
            fracture_factor: self.u32_or("fracture_factor", 1)?,
            starting_row: self.u32_or("starting_row", 0)?,
            act_t: self.u32_or("act_t", 0)?,
            num_nz_strips,
        })
    }

    /// `min_buffer_input` names input 0 or 1; buffer and depthwise ops only input 0
    fn min_buffer_input(&self) -> CompileResult<Option<usize>> {
        let Some(node) = self.get("min_buffer_input") else {
            return Ok(None);
        };
        let index = node.as_usize()?;
        let max = match self.target.op_type {
            OpType::Buffer | OpType::Depthwise => 0,
            _ => 1,
        };
        if index > max {
            return Err(CompileError::parse_error(format!(
                "min_buffer_input attribute for {} op must be {}",
                self.target.op_name,
                if max == 0 { "0" } else { "0 or 1" }
            )));
        }
        Ok(Some(index))
    }

    fn sfpu_params(&self) -> CompileResult<SfpuParams> {
        let mut params = SfpuParams {
            seed: self.u32_or("seed", 0)?,
            slope: self.f32_or("slope", 0.0)?,
            exponent: self.i32_or("exp", 0)?,
            ..SfpuParams::default()
        };
        if let Some(node) = self.get("p") {
            params.set_probability(parse_probability(node, self.target.op_name)?);
        }
        Ok(params)
    }

    fn reduce_dim(&self) -> CompileResult<Option<ReduceDim>> {
        self.get("dim").map(parse_reduce_dim).transpose()
    }

    fn reduce_func(&self) -> CompileResult<Option<ReduceFunc>> {
        self.get("type").map(parse_reduce_func).transpose()
    }

    fn kind(&self) -> CompileResult<OpKind> {
        let kind = match self.target.op_type {
            OpType::Datacopy => OpKind::Datacopy,
            OpType::Nop => OpKind::Nop,
            OpType::Tilizer => OpKind::Tilizer,
            OpType::Binary(op) => OpKind::Binary(op),
            OpType::Sfpu(op) => OpKind::Sfpu {
                op,
                params: self.sfpu_params()?,
            },
            OpType::Buffer => OpKind::Buffer(BufferAttrs {
                sparse: self.sparse()?,
                min_buffer_input: self.min_buffer_input()?,
            }),
            OpType::Matmul => {
                let accumulate = self.bool_or("accumulate", false)?;
                if self.has("z") && !accumulate {
                    return Err(self.error("z attribute for matmul op is only valid for matmul accumulate"));
                }
                OpKind::Matmul(MatmulAttrs {
                    m_k: self.u32_or("m_k", 1)?,
                    u_kt: self.u32_or("u_kt", 1)?,
                    accumulate,
                    z: self.u32_or("z", 0)?,
                    bias: self.bool_or("bias", false)?,
                    identity: self.bool_or("identity", false)?,
                    sparse: self.sparse()?,
                    l1_acc: self.bool_or("l1_acc", false)?,
                    min_buffer_input: self.min_buffer_input()?,
                    requant: self.bool_or("requant", false)?,
                    dequant: self.bool_or("dequant", false)?,
                    sfpu_op: self.get("sfpu_op").map(parse_sfpu_op).transpose()?,
                })
            }
            OpType::Depthwise => OpKind::Depthwise(DepthwiseAttrs {
                m_k: self.u32_or("m_k", 1)?,
                u_kt: self.u32_or("u_kt", 1)?,
                l1_acc: self.bool_or("l1_acc", false)?,
                min_buffer_input: self.min_buffer_input()?,
            }),
            OpType::Reduce => {
                let dim = self
                    .reduce_dim()?
                    .ok_or_else(|| self.error("reduce op requires attribute dim"))?;
                let func = self.reduce_func()?.unwrap_or(ReduceFunc::Max);
                if self.has("z") && dim != ReduceDim::Z {
                    return Err(self.error("z attribute for reduce op is only valid for reduce max dim: z"));
                }
                OpKind::Reduce(ReduceAttrs {
                    dim,
                    func,
                    z: self.u32_or("z", 0)?,
                    m_k: self.u32_or("m_k", 1)?,
                    u_kt: self.u32_or("u_kt", 1)?,
                })
            }
            OpType::Splice => OpKind::Splice(self.splice()?),
            OpType::Embedding => OpKind::Embedding {
                num_indices: self.u32_or("num_indices", 0)?,
            },
            OpType::Topk => OpKind::Topk {
                k: self.u32_or("k", 0)?,
                sort: match self.get("sort") {
                    Some(node) => {
                        let text = node.as_str()?;
                        TopkSort::from_name(&text.to_ascii_lowercase())
                            .ok_or_else(|| self.error(format!("invalid topk sort {}", text)))?
                    }
                    None => TopkSort::Max,
                },
            },
            OpType::Fused => OpKind::Fused(FusedAttrs {
                fused_op_id: self
                    .get("fused_op_id")
                    .ok_or_else(|| self.error("fused_op requires attribute fused_op_id"))?
                    .as_scalar_text()?,
                m_k: self.u32_or("m_k", 1)?,
                u_kt: self.u32_or("u_kt", 1)?,
                identity: self.bool_or("identity", false)?,
                sparse: self.sparse()?,
                min_buffer_input: self.min_buffer_input()?,
                reduce_dim: self.reduce_dim()?,
                reduce_func: self.reduce_func()?,
                z: self.u32_or("z", 0)?,
                sfpu: self.sfpu_params()?,
            }),
            OpType::EthernetDatacopy => OpKind::EthernetDatacopy(self.ethernet()?),
        };
        Ok(kind)
    }

    fn splice(&self) -> CompileResult<SpliceAttrs> {
        let mode = match self.get("granularity") {
            Some(node) => {
                let text = node.as_str()?;
                SpliceMode::from_name(&text.to_ascii_lowercase())
                    .ok_or_else(|| self.error(format!("invalid splice granularity {}", text)))?
            }
            None => SpliceMode::T,
        };
        let mut inputs = vec![None; self.target.num_inputs];
        for (key, node) in &self.fields {
            let Some(Token::Input(index)) = single_token(key) else {
                continue;
            };
            if index >= MAX_SPLICE_INPUTS {
                return Err(CompileError::parse_error(format!(
                    "Max number of supported input attributes for splice op {} is {}!",
                    self.target.op_name, MAX_SPLICE_INPUTS
                )));
            }
            let values = node.items()?;
            if values.len() != 3 || index >= inputs.len() {
                return Err(CompileError::parse_error(format!(
                    "inputN={} attribute for op {} is used for splicing and must have 3 values [index, length, stride]",
                    key, self.target.op_name
                )));
            }
            inputs[index] = Some(SpliceInput {
                index: values[0].as_i32()?,
                length: values[1].as_i32()?,
                stride: values[2].as_i32()?,
            });
        }
        Ok(SpliceAttrs { mode, inputs })
    }

    fn ethernet(&self) -> CompileResult<EthernetAttrs> {
        let channels = |key: &str| -> CompileResult<Vec<u32>> {
            match self.get(key) {
                Some(node) => {
                    let list = node.as_u32_list()?;
                    if list.is_empty() {
                        return Err(CompileError::parse_error(format!(
                            "{} must be a non-empty list of integers",
                            key
                        )));
                    }
                    Ok(list)
                }
                None => Ok(Vec::new()),
            }
        };
        Ok(EthernetAttrs {
            ingress_channels: channels("ingress_channels")?,
            egress_channels: channels("egress_channels")?,
            dest_device: self.get("dest_device").map(Node::as_u32).transpose()?,
        })
    }

    fn common(&self) -> CompileResult<OpAttributes> {
        let stoch_rnd_mode = match (self.get("stoch_rnd_mode"), self.get("srnd_fpu_en")) {
            (Some(node), _) => node.parse::<StochRndMode>()?,
            (None, Some(node)) if node.as_bool()? => StochRndMode::Fpu,
            _ => StochRndMode::None,
        };
        if stoch_rnd_mode != StochRndMode::None && !self.target.arch.supports_stochastic_rounding() {
            return Err(CompileError::parse_error(
                "Stochastic rounding is only available for wormhole_b0",
            ));
        }
        Ok(OpAttributes {
            kernel_broadcast: self.kernel_broadcast()?,
            vector_mode: self
                .get("vector")
                .map(|node| -> CompileResult<_> { node.as_str()?.to_ascii_lowercase().parse() })
                .transpose()?,
            approximate_mode: self.bool_or("approximate_mode", false)?,
            relu: parse_relu(&self.fields, self.target.op_name)?,
            stoch_rnd_mode,
            sfpu_execution_thread: self
                .get("sfpu_execution_thread")
                .map(Node::parse::<SfpuExecutionThread>)
                .transpose()?
                .unwrap_or_default(),
            zero_point: self.f32_or("zero_point", 0.0)?,
        })
    }

    /// `kernel_broadcast{_per_t}: {input_N: tiles}` or `single_tile: [N, ..]`
    fn kernel_broadcast(&self) -> CompileResult<Vec<Option<KernelBroadcast>>> {
        let mut slots: Vec<Option<KernelBroadcast>> = Vec::new();
        let num_inputs = self.target.num_inputs;
        let set = |slots: &mut Vec<Option<KernelBroadcast>>, index: usize, value| {
            if index >= num_inputs {
                return Err(CompileError::parse_error(format!(
                    "Op={} has kernel_broadcast attribute which must refer to input index within range of inputs [0:{}]",
                    self.target.op_name,
                    num_inputs.saturating_sub(1)
                )));
            }
            if slots.is_empty() {
                slots.resize(num_inputs, None);
            }
            if slots[index].is_some() {
                return Err(CompileError::parse_error(format!(
                    "Duplicate kernel broadcast attribute for input {} on op {}!",
                    index, self.target.op_name
                )));
            }
            slots[index] = Some(value);
            Ok(())
        };
        for (key, per_t) in [("kernel_broadcast", false), ("kernel_broadcast_per_t", true)] {
            let Some(node) = self.get(key) else { continue };
            for (input_key, tiles) in node.entries()? {
                let index = input_key
                    .strip_prefix("input_")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| {
                        CompileError::parse_error(format!(
                            "Invalid kernel broadcast syntax {}! Found on op {}, type {}.",
                            input_key, self.target.op_name, self.target.op_type
                        ))
                    })?;
                let tiles = tiles.as_u32()?;
                set(&mut slots, index, KernelBroadcast { tiles, per_t })?;
            }
        }
        if let Some(node) = self.get("single_tile") {
            for index in node.as_u32_list()? {
                set(&mut slots, index as usize, KernelBroadcast { tiles: 1, per_t: false })?;
            }
        }
        Ok(slots)
    }
}

/// Parse an op's `attributes` block into its kind payload and the common attributes
pub fn parse_op_attributes(
    node: Option<&Node>,
    target: &AttrTarget,
) -> CompileResult<(OpKind, OpAttributes)> {
    let collected = Collected::collect(node, target)?;
    Ok((collected.kind()?, collected.common()?))
}

fn parse_probability(node: &Node, owner: &str) -> CompileResult<f32> {
    let p = node.as_f32()?;
    if !(0.0..=1.0).contains(&p) {
        return Err(CompileError::parse_error(format!(
            "Probability attribute for {} op must be in [0.0:1.0] range",
            owner
        )));
    }
    Ok(p)
}

fn parse_reduce_dim(node: &Node) -> CompileResult<ReduceDim> {
    let text = node.as_str()?;
    ReduceDim::from_name(&text.to_ascii_lowercase()).ok_or_else(|| {
        CompileError::parse_error(format!("{}: invalid reduce dim {}", node.path(), text))
    })
}

fn parse_reduce_func(node: &Node) -> CompileResult<ReduceFunc> {
    let text = node.as_str()?;
    ReduceFunc::from_name(&text.to_ascii_lowercase()).ok_or_else(|| {
        CompileError::parse_error(format!("{}: invalid reduce type {}", node.path(), text))
    })
}

fn parse_sfpu_op(node: &Node) -> CompileResult<SfpuOp> {
    let text = node.as_str()?;
    SfpuOp::from_name(text).ok_or_else(|| {
        CompileError::parse_error(format!("{}: invalid sfpu op {}", node.path(), text))
    })
}

fn parse_relu(fields: &BTreeMap<&str, Node>, owner: &str) -> CompileResult<ReluConfig> {
    let mut relu = ReluConfig::default();
    if let Some(node) = fields.get("relu_en") {
        relu.enabled = node.as_bool()?;
    }
    if let Some(node) = fields.get("relu_threshold") {
        relu.threshold = node.as_f32()?;
        if relu.threshold < 0.0 {
            return Err(CompileError::parse_error(format!(
                "Relu threshold for {} op must be >= 0.0",
                owner
            )));
        }
    }
    if let Some(node) = fields.get("relu_mode") {
        relu.mode = node.parse::<ReluMode>()?;
    }
    Ok(relu)
}

/// Attributes understood by a sub-op inside a fused schedule
pub fn parse_scheduled_op_attributes(node: &Node, op: &mut ScheduledOp) -> CompileResult<()> {
    let mut fields = BTreeMap::new();
    for (key, value) in node.entries()? {
        let accepted = match key {
            "m_k" | "u_kt" | "vector" | "relu_en" | "relu_threshold" | "relu_mode" => true,
            "type" | "dim" => op.op_type.is_reduce(),
            "p" | "seed" => op.op_type == OpType::Sfpu(SfpuOp::Dropout),
            "slope" => op.op_type == OpType::Sfpu(SfpuOp::Lrelu),
            "exp" => op.op_type == OpType::Sfpu(SfpuOp::Power),
            _ => false,
        };
        if !accepted {
            return Err(CompileError::parse_error(format!(
                "Field {} is not supported for attributes of scheduled op {}",
                key, op.name
            )));
        }
        fields.insert(key, value);
    }

    if let Some(node) = fields.get("m_k") {
        op.m_k = node.as_u32()?;
    }
    if let Some(node) = fields.get("u_kt") {
        op.u_kt = node.as_u32()?;
    }
    if let Some(node) = fields.get("vector") {
        op.vector_mode = Some(node.as_str()?.to_ascii_lowercase().parse()?);
    }
    if op.op_type.is_reduce() {
        let dim = fields.get("dim").map(parse_reduce_dim).transpose()?;
        let func = fields.get("type").map(parse_reduce_func).transpose()?;
        op.reduce = dim.map(|dim| (dim, func.unwrap_or(ReduceFunc::Max)));
    }
    op.relu = parse_relu(&fields, &op.name)?;
    if let Some(node) = fields.get("p") {
        op.sfpu.set_probability(parse_probability(node, &op.name)?);
    }
    if let Some(node) = fields.get("seed") {
        op.sfpu.seed = node.as_u32()?;
    }
    if let Some(node) = fields.get("slope") {
        op.sfpu.slope = node.as_f32()?;
    }
    if let Some(node) = fields.get("exp") {
        op.sfpu.exponent = node.as_i32()?;
    }
    Ok(())
}

/// What reads the input a TM list applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmConsumer {
    Queue,
    Op(OpType),
}

#[derive(Debug, Clone, Copy)]
pub struct TmTarget<'a> {
    pub name: &'a str,
    pub consumer: TmConsumer,
    pub input: usize,
    /// Inside a fused-op schedule
    pub fused: bool,
    pub int32_on_input0: bool,
    pub arch: Arch,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTms {
    pub tms: Vec<Tm>,
    /// Odd number of transposes in the list
    pub transpose: bool,
    pub padding: Option<Padding>,
}

fn parse_broadcast_dim(text: &str) -> Option<BroadcastDim> {
    match text.to_ascii_lowercase().as_str() {
        "r" => Some(BroadcastDim::R),
        "c" => Some(BroadcastDim::C),
        "z" => Some(BroadcastDim::Z),
        _ => None,
    }
}

impl<'a> TmTarget<'a> {
    fn describe(&self) -> String {
        let kind = match self.consumer {
            TmConsumer::Queue => "queue".to_string(),
            TmConsumer::Op(op_type) => op_type.to_string(),
        };
        format!("{}, type {}, input {}", self.name, kind, self.input)
    }

    fn check_transpose(&self) -> CompileResult<()> {
        let TmConsumer::Op(op_type) = self.consumer else {
            return Err(CompileError::parse_error(format!(
                "Transpose TM op can be done only on matmul input 1, unary input or binary (non int32) input 0 (post GRAYSKULL arch)! Found on {}",
                self.describe()
            )));
        };
        let int32_unsupported = || {
            CompileError::parse_error(format!(
                "Transpose for Int32 input is not supported for {} operation.",
                op_type
            ))
        };
        if op_type.is_matmul() {
            if self.input != 1 {
                return Err(CompileError::parse_error(format!(
                    "Transpose TM op is only supported on matmul input 1! Found on {}",
                    self.describe()
                )));
            }
        } else if matches!(op_type, OpType::Nop | OpType::Datacopy) || op_type.is_sfpu() {
            if self.int32_on_input0 {
                return Err(int32_unsupported());
            }
        } else if self.input == 0 && op_type.is_binary() {
            if self.int32_on_input0 {
                return Err(int32_unsupported());
            }
            if self.arch.is_grayskull() {
                return Err(CompileError::parse_error(format!(
                    "Transpose TM op on binary input 0 is not supported on GRAYSKULL arch! Found on op {}",
                    self.describe()
                )));
            }
        } else {
            return Err(CompileError::parse_error(format!(
                "Transpose TM op can be done only on matmul input 1, unary input or binary (non int32) input 0 (post GRAYSKULL arch)! Found on {}",
                self.describe()
            )));
        }
        Ok(())
    }
}

/// Parse one input's TM list, e.g. `[transpose, {broadcast: {r: 2}}, {hslice: 4}]`
pub fn parse_tms(node: &Node, target: &TmTarget) -> CompileResult<ParsedTms> {
    let mut parsed = ParsedTms::default();
    for item in node.items()? {
        if let Ok(name) = item.as_str() {
            if name != "transpose" {
                return Err(CompileError::parse_error(format!(
                    "Only Transpose TM op can be listed as a scalar value in tms! Found on {}",
                    target.describe()
                )));
            }
            target.check_transpose()?;
            parsed.transpose ^= true;
            parsed.tms.push(Tm::Transpose);
            continue;
        }
        for (name, args) in item.entries()? {
            match name {
                "broadcast" => {
                    for (dim, factor) in args.entries()? {
                        let dim = parse_broadcast_dim(dim).ok_or_else(|| {
                            CompileError::parse_error(format!(
                                "Broadcast TM op only supports dims r/c/z! Found on {}",
                                target.describe()
                            ))
                        })?;
                        parsed.tms.push(Tm::Broadcast {
                            dim,
                            factor: factor.as_u32()?,
                        });
                    }
                }
                "tile_broadcast" => {
                    if !target.fused {
                        return Err(CompileError::parse_error(format!(
                            "tile_broadcast is only allowed in fused ops. Found on {}",
                            target.describe()
                        )));
                    }
                    let text = args.as_str()?;
                    let dim = parse_broadcast_dim(text).ok_or_else(|| {
                        CompileError::parse_error(format!(
                            "Invalid tile_broadcast dim {} on {}",
                            text,
                            target.describe()
                        ))
                    })?;
                    parsed.tms.push(Tm::TileBroadcast(dim));
                }
                "pad" => {
                    if target.fused {
                        return Err(CompileError::parse_error("pad not allowed in fused ops"));
                    }
                    if target.consumer == TmConsumer::Queue {
                        return Err(CompileError::parse_error(format!(
                            "Padding can't be done on queue inputs: {}",
                            target.name
                        )));
                    }
                    if parsed.padding.is_some() {
                        return Err(CompileError::parse_error(format!(
                            "Padding must be specified once: {}",
                            target.describe()
                        )));
                    }
                    let values = args.items()?;
                    if values.len() != 3 {
                        return Err(CompileError::parse_error(format!(
                            "Padding TM must have 3 args: {}",
                            target.describe()
                        )));
                    }
                    let (rt, ct, value) =
                        (values[0].as_u32()?, values[1].as_u32()?, values[2].as_f32()?);
                    parsed.padding = Some(Padding { rt, ct, pad_value: value });
                    parsed.tms.push(Tm::Pad { rt, ct, value });
                }
                "hslice" | "hstack" | "vslice" | "vstack" => {
                    let factor = args.as_u32()?;
                    parsed.tms.push(match name {
                        "hslice" => Tm::Hslice(factor),
                        "hstack" => Tm::Hstack(factor),
                        "vslice" => Tm::Vslice(factor),
                        _ => Tm::Vstack(factor),
                    });
                }
                _ => {
                    return Err(CompileError::parse_error(format!(
                        "Unsupported TM op {}! Found on {}",
                        name,
                        target.describe()
                    )))
                }
            }
        }
    }
    Ok(parsed)
}

/// `input_N_pad: {rt, ct, pad_value}` or `input_N_unpad: {rt, ct}`
pub fn parse_padding(node: &Node, allow_value: bool) -> CompileResult<Padding> {
    let mut padding = Padding {
        rt: 0,
        ct: 0,
        pad_value: 0.0,
    };
    for (key, value) in node.entries()? {
        match key {
            "rt" => padding.rt = value.as_u32()?,
            "ct" => padding.ct = value.as_u32()?,
            "pad_value" if allow_value => padding.pad_value = value.as_f32()?,
            _ => {
                return Err(CompileError::parse_error(format!(
                    "Field {} is not supported for padding",
                    key
                )))
            }
        }
    }
    Ok(padding)
}

/// Input 0 carries Int32 data, which rules out transposes
pub fn int32_on_input0(input_formats: &[DataFormat]) -> bool {
    input_formats.first() == Some(&DataFormat::Int32)
}
