//! Operators: the closed set of op kinds, their attributes and input TMs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CompileError, CompileResult};
use crate::format::{
    DataFormat, Dim, GridShape, MathFidelity, ReluMode, SfpuExecutionThread, StochRndMode, TileDim,
    UblockOrder, VectorMode,
};
use crate::fused::FusedOpTemplate;
use crate::ir::{GraphId, OpId, QueueId};

macro_rules! named_variants {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn from_name(s: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|v| v.name() == s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.name())
            }
        }
    };
}

named_variants!(SfpuOp {
    Exp => "exp",
    Log => "log",
    Sqrt => "sqrt",
    Gelu => "gelu",
    GeluDerivative => "gelu_derivative",
    Reciprocal => "reciprocal",
    Sigmoid => "sigmoid",
    Dropout => "dropout",
    Tanh => "tanh",
    Square => "square",
    Power => "power",
    Sine => "sine",
    Cosine => "cosine",
    Lrelu => "lrelu",
    Abs => "abs",
});

named_variants!(BinaryOp {
    Add => "add",
    Subtract => "subtract",
    Multiply => "multiply",
    Maximum => "maximum",
    Quantization => "quantization",
    Dequantization => "dequantization",
    Requantization => "requantization",
});

impl BinaryOp {
    pub fn is_quantisation(&self) -> bool {
        matches!(
            self,
            BinaryOp::Quantization | BinaryOp::Dequantization | BinaryOp::Requantization
        )
    }

    pub fn is_requant_or_dequant(&self) -> bool {
        matches!(self, BinaryOp::Dequantization | BinaryOp::Requantization)
    }
}

named_variants!(ReduceDim { R => "r", C => "c", Z => "z" });
named_variants!(ReduceFunc { Max => "max" });
named_variants!(SpliceMode { T => "t", Ublock => "ublock" });
named_variants!(TopkSort { Max => "max", ArgMax => "argmax" });

/// Tag of an op kind without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    Datacopy,
    Nop,
    Buffer,
    Tilizer,
    Sfpu(SfpuOp),
    Binary(BinaryOp),
    Matmul,
    Depthwise,
    Reduce,
    Splice,
    Embedding,
    Topk,
    Fused,
    EthernetDatacopy,
}

impl OpType {
    pub fn name(&self) -> &'static str {
        match self {
            OpType::Datacopy => "datacopy",
            OpType::Nop => "nop",
            OpType::Buffer => "buffer",
            OpType::Tilizer => "tilizer",
            OpType::Sfpu(op) => op.name(),
            OpType::Binary(op) => op.name(),
            OpType::Matmul => "matmul",
            OpType::Depthwise => "depthwise",
            OpType::Reduce => "reduce",
            OpType::Splice => "splice",
            OpType::Embedding => "embedding",
            OpType::Topk => "topk",
            OpType::Fused => "fused_op",
            OpType::EthernetDatacopy => "ethernet_datacopy",
        }
    }

    pub fn is_matmul(&self) -> bool {
        *self == OpType::Matmul
    }

    pub fn is_reduce(&self) -> bool {
        *self == OpType::Reduce
    }

    pub fn is_matmul_or_reduce(&self) -> bool {
        self.is_matmul() || self.is_reduce()
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, OpType::Binary(_))
    }

    pub fn binary_op(&self) -> Option<BinaryOp> {
        match self {
            OpType::Binary(op) => Some(*op),
            _ => None,
        }
    }

    pub fn is_sfpu(&self) -> bool {
        matches!(self, OpType::Sfpu(_))
    }

    pub fn is_datacopy(&self) -> bool {
        *self == OpType::Datacopy
    }

    pub fn is_unary(&self) -> bool {
        matches!(self, OpType::Datacopy | OpType::Nop)
    }

    pub fn is_fused(&self) -> bool {
        *self == OpType::Fused
    }

    /// Ethernet datacopy runs on the ethernet cores rather than the tensix grid
    pub fn is_tensix(&self) -> bool {
        *self != OpType::EthernetDatacopy
    }

    pub fn is_quantisation(&self) -> bool {
        self.binary_op().map_or(false, |op| op.is_quantisation())
    }
}

impl FromStr for OpType {
    type Err = CompileError;

    fn from_str(s: &str) -> CompileResult<Self> {
        if let Some(op) = SfpuOp::from_name(s) {
            return Ok(OpType::Sfpu(op));
        }
        if let Some(op) = BinaryOp::from_name(s) {
            return Ok(OpType::Binary(op));
        }
        Ok(match s {
            "datacopy" => OpType::Datacopy,
            "nop" => OpType::Nop,
            "buffer" => OpType::Buffer,
            "tilizer" => OpType::Tilizer,
            "matmul" => OpType::Matmul,
            "depthwise" => OpType::Depthwise,
            "reduce" => OpType::Reduce,
            "splice" => OpType::Splice,
            "embedding" => OpType::Embedding,
            "topk" => OpType::Topk,
            "fused_op" => OpType::Fused,
            "ethernet_datacopy" => OpType::EthernetDatacopy,
            _ => {
                return Err(CompileError::parse_error(format!(
                    "Op type {} is not supported",
                    s
                )))
            }
        })
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Axis replicated by a broadcast TM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BroadcastDim {
    R,
    C,
    Z,
}

/// Tensor manipulation applied to an op input before it is consumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tm {
    Transpose,
    Broadcast { dim: BroadcastDim, factor: u32 },
    TileBroadcast(BroadcastDim),
    Pad { rt: u32, ct: u32, value: f32 },
    Hslice(u32),
    Hstack(u32),
    Vslice(u32),
    Vstack(u32),
}

impl Tm {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Tm::Broadcast { .. })
    }

    pub fn broadcast_factor(tms: &[Tm], axis: BroadcastDim) -> u32 {
        tms.iter()
            .find_map(|tm| match tm {
                Tm::Broadcast { dim, factor } if *dim == axis => Some(*factor),
                _ => None,
            })
            .unwrap_or(1)
    }
}

/// Explicit padding or unpadding of an op input, in tiles
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Padding {
    pub rt: u32,
    pub ct: u32,
    pub pad_value: f32,
}

/// Kernel-side broadcast of an input that is already resident in L1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelBroadcast {
    pub tiles: u32,
    pub per_t: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReluConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub mode: ReluMode,
}

impl Default for ReluConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.0,
            mode: ReluMode::Min,
        }
    }
}

/// Scalar parameters of the parameterised SFPU ops
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SfpuParams {
    pub probability: f32,
    pub scale: f32,
    pub seed: u32,
    pub slope: f32,
    pub exponent: i32,
}

impl Default for SfpuParams {
    fn default() -> Self {
        Self {
            probability: 0.0,
            scale: 1.0,
            seed: 0,
            slope: 0.0,
            exponent: 0,
        }
    }
}

impl SfpuParams {
    /// Dropout keeps 1 - p of the elements and rescales them
    pub fn set_probability(&mut self, p: f32) {
        self.probability = p;
        self.scale = if p == 1.0 { 1.0 } else { 1.0 / (1.0 - p) };
    }
}

/// Encoding parameters of sparse (identity) matmuls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseAttrs {
    pub num_index_tiles: u32,
    pub num_sparse_tiles: u32,
    pub num_columns: u32,
    pub sparse_tile_ptr_bits: u32,
    pub sparse_ublock_idx_bits: u32,
    pub indices_len: u32,
    pub fracture_factor: u32,
    pub starting_row: u32,
    pub act_t: u32,
    pub num_nz_strips: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatmulAttrs {
    pub m_k: u32,
    pub u_kt: u32,
    pub accumulate: bool,
    pub z: u32,
    pub bias: bool,
    pub identity: bool,
    pub sparse: SparseAttrs,
    pub l1_acc: bool,
    pub min_buffer_input: Option<usize>,
    pub requant: bool,
    pub dequant: bool,
    pub sfpu_op: Option<SfpuOp>,
}

impl Default for MatmulAttrs {
    fn default() -> Self {
        Self {
            m_k: 1,
            u_kt: 1,
            accumulate: false,
            z: 0,
            bias: false,
            identity: false,
            sparse: SparseAttrs::default(),
            l1_acc: false,
            min_buffer_input: None,
            requant: false,
            dequant: false,
            sfpu_op: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthwiseAttrs {
    pub m_k: u32,
    pub u_kt: u32,
    pub l1_acc: bool,
    pub min_buffer_input: Option<usize>,
}

impl Default for DepthwiseAttrs {
    fn default() -> Self {
        Self {
            m_k: 1,
            u_kt: 1,
            l1_acc: false,
            min_buffer_input: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceAttrs {
    pub dim: ReduceDim,
    pub func: ReduceFunc,
    pub z: u32,
    pub m_k: u32,
    pub u_kt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAttrs {
    pub sparse: SparseAttrs,
    pub min_buffer_input: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceInput {
    pub index: i32,
    pub length: i32,
    pub stride: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceAttrs {
    pub mode: SpliceMode,
    pub inputs: Vec<Option<SpliceInput>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedAttrs {
    pub fused_op_id: String,
    pub m_k: u32,
    pub u_kt: u32,
    pub identity: bool,
    pub sparse: SparseAttrs,
    pub min_buffer_input: Option<usize>,
    pub reduce_dim: Option<ReduceDim>,
    pub reduce_func: Option<ReduceFunc>,
    pub z: u32,
    pub sfpu: SfpuParams,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetAttrs {
    pub ingress_channels: Vec<u32>,
    pub egress_channels: Vec<u32>,
    pub dest_device: Option<u32>,
}

/// Op kind with the attributes only that kind understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Datacopy,
    Nop,
    Tilizer,
    Buffer(BufferAttrs),
    Sfpu { op: SfpuOp, params: SfpuParams },
    Binary(BinaryOp),
    Matmul(MatmulAttrs),
    Depthwise(DepthwiseAttrs),
    Reduce(ReduceAttrs),
    Splice(SpliceAttrs),
    Embedding { num_indices: u32 },
    Topk { k: u32, sort: TopkSort },
    Fused(FusedAttrs),
    EthernetDatacopy(EthernetAttrs),
}

impl OpKind {
    pub fn op_type(&self) -> OpType {
        match self {
            OpKind::Datacopy => OpType::Datacopy,
            OpKind::Nop => OpType::Nop,
            OpKind::Tilizer => OpType::Tilizer,
            OpKind::Buffer(_) => OpType::Buffer,
            OpKind::Sfpu { op, .. } => OpType::Sfpu(*op),
            OpKind::Binary(op) => OpType::Binary(*op),
            OpKind::Matmul(_) => OpType::Matmul,
            OpKind::Depthwise(_) => OpType::Depthwise,
            OpKind::Reduce(_) => OpType::Reduce,
            OpKind::Splice(_) => OpType::Splice,
            OpKind::Embedding { .. } => OpType::Embedding,
            OpKind::Topk { .. } => OpType::Topk,
            OpKind::Fused(_) => OpType::Fused,
            OpKind::EthernetDatacopy(_) => OpType::EthernetDatacopy,
        }
    }

    pub fn m_k(&self) -> u32 {
        match self {
            OpKind::Matmul(attrs) => attrs.m_k,
            OpKind::Depthwise(attrs) => attrs.m_k,
            OpKind::Reduce(attrs) => attrs.m_k,
            OpKind::Fused(attrs) => attrs.m_k,
            _ => 1,
        }
    }

    pub fn identity(&self) -> bool {
        match self {
            OpKind::Matmul(attrs) => attrs.identity,
            OpKind::Fused(attrs) => attrs.identity,
            _ => false,
        }
    }

    pub fn l1_acc(&self) -> bool {
        match self {
            OpKind::Matmul(attrs) => attrs.l1_acc,
            OpKind::Depthwise(attrs) => attrs.l1_acc,
            _ => false,
        }
    }

    pub fn min_buffer_input(&self) -> Option<usize> {
        match self {
            OpKind::Matmul(attrs) => attrs.min_buffer_input,
            OpKind::Depthwise(attrs) => attrs.min_buffer_input,
            OpKind::Buffer(attrs) => attrs.min_buffer_input,
            OpKind::Fused(attrs) => attrs.min_buffer_input,
            _ => None,
        }
    }

    pub fn matmul(&self) -> Option<&MatmulAttrs> {
        match self {
            OpKind::Matmul(attrs) => Some(attrs),
            _ => None,
        }
    }

    pub fn reduce(&self) -> Option<&ReduceAttrs> {
        match self {
            OpKind::Reduce(attrs) => Some(attrs),
            _ => None,
        }
    }
}

/// Attributes accepted on every op kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpAttributes {
    /// Per input; `None` when the input is streamed normally
    pub kernel_broadcast: Vec<Option<KernelBroadcast>>,
    /// Explicit or derived; always `Some` after derivation
    pub vector_mode: Option<VectorMode>,
    pub approximate_mode: bool,
    pub relu: ReluConfig,
    pub stoch_rnd_mode: StochRndMode,
    pub sfpu_execution_thread: SfpuExecutionThread,
    pub zero_point: f32,
}

/// Where an op input comes from once names are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSource {
    Queue(QueueId),
    Op(OpId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpInfo {
    pub name: String,
    pub graph: GraphId,
    pub kind: OpKind,
    pub inputs: Vec<String>,
    pub input_formats: Vec<DataFormat>,
    pub output_format: DataFormat,
    pub intermed_format: DataFormat,
    pub acc_format: DataFormat,
    pub math_fidelity: MathFidelity,
    pub output_dim: Dim,
    pub tile_dim: TileDim,
    /// `[y, x]` of the top-left core; ethernet ops may leave it empty
    pub grid_loc: Vec<u32>,
    pub grid_size: GridShape,
    pub grid_transpose: bool,
    pub untilize_output: bool,
    pub gradient_op: bool,
    pub buf_size_mb: u32,
    pub overlay_size: u32,
    pub input_buf_min_size_tiles: Vec<u32>,
    pub input_dram_io_buf_size_tiles: Vec<u32>,
    /// `(queue, op)` pairs: the op reads the queue through a fork of this op's reader
    pub forked_dram_inputs: Vec<(String, String)>,
    pub input_tms: Vec<Vec<Tm>>,
    pub input_padding: Vec<Option<Padding>>,
    pub input_unpadding: Vec<Option<Padding>>,
    /// Net effect of transpose TMs across all inputs
    pub transpose: bool,
    pub attributes: OpAttributes,

    // Filled by resolution and derivation
    pub input_sources: Vec<InputSource>,
    pub input_dims: Vec<Dim>,
    pub input_grids: Vec<GridShape>,
    pub input_tile_dims: Vec<TileDim>,
    pub fused: Option<FusedOpTemplate>,
}

impl OpInfo {
    pub fn new(name: impl Into<String>, graph: GraphId, kind: OpKind) -> Self {
        Self {
            name: name.into(),
            graph,
            kind,
            inputs: Vec::new(),
            input_formats: Vec::new(),
            output_format: DataFormat::Float16_b,
            intermed_format: DataFormat::Float16_b,
            acc_format: DataFormat::Float16_b,
            math_fidelity: MathFidelity::HiFi3,
            output_dim: Dim::default(),
            tile_dim: TileDim::default(),
            grid_loc: vec![0, 0],
            grid_size: GridShape::new(1, 1),
            grid_transpose: false,
            untilize_output: false,
            gradient_op: false,
            buf_size_mb: 0,
            overlay_size: 0,
            input_buf_min_size_tiles: Vec::new(),
            input_dram_io_buf_size_tiles: Vec::new(),
            forked_dram_inputs: Vec::new(),
            input_tms: Vec::new(),
            input_padding: Vec::new(),
            input_unpadding: Vec::new(),
            transpose: false,
            attributes: OpAttributes::default(),
            input_sources: Vec::new(),
            input_dims: Vec::new(),
            input_grids: Vec::new(),
            input_tile_dims: Vec::new(),
            fused: None,
        }
    }

    pub fn op_type(&self) -> OpType {
        self.kind.op_type()
    }

    pub fn tms(&self, input: usize) -> &[Tm] {
        self.input_tms.get(input).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Columns of cores covered, honoring `grid_transpose`
    pub fn grid_size_x(&self) -> u32 {
        if self.grid_transpose {
            self.grid_size.r
        } else {
            self.grid_size.c
        }
    }

    /// Rows of cores covered, honoring `grid_transpose`
    pub fn grid_size_y(&self) -> u32 {
        if self.grid_transpose {
            self.grid_size.c
        } else {
            self.grid_size.r
        }
    }

    pub fn grid_loc_x(&self) -> u32 {
        self.grid_loc.get(1).copied().unwrap_or(0)
    }

    pub fn grid_loc_y(&self) -> u32 {
        self.grid_loc.first().copied().unwrap_or(0)
    }

    pub fn uses_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|input| input == name)
    }

    pub fn is_input_int(&self) -> bool {
        self.input_formats.iter().any(DataFormat::is_integer)
    }

    pub fn ublock_order_is_r(&self) -> bool {
        self.output_dim.ublock_order == UblockOrder::R
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_type_parse() {
        assert_eq!("matmul".parse::<OpType>().unwrap(), OpType::Matmul);
        assert_eq!(
            "gelu_derivative".parse::<OpType>().unwrap(),
            OpType::Sfpu(SfpuOp::GeluDerivative)
        );
        assert_eq!(
            "requantization".parse::<OpType>().unwrap(),
            OpType::Binary(BinaryOp::Requantization)
        );
        assert!("conv2d".parse::<OpType>().is_err());
    }

    #[test]
    fn test_classification() {
        assert!(OpType::Matmul.is_matmul_or_reduce());
        assert!(OpType::Binary(BinaryOp::Dequantization).is_quantisation());
        assert!(!OpType::Binary(BinaryOp::Add).is_quantisation());
        assert!(!OpType::EthernetDatacopy.is_tensix());
        assert_eq!(OpType::Fused.to_string(), "fused_op");
    }

    #[test]
    fn test_dropout_scale() {
        let mut params = SfpuParams::default();
        params.set_probability(0.5);
        assert_eq!(params.scale, 2.0);
        params.set_probability(1.0);
        assert_eq!(params.scale, 1.0);
    }

    #[test]
    fn test_broadcast_factor_lookup() {
        let tms = vec![
            Tm::Transpose,
            Tm::Broadcast {
                dim: BroadcastDim::C,
                factor: 4,
            },
        ];
        assert_eq!(Tm::broadcast_factor(&tms, BroadcastDim::C), 4);
        assert_eq!(Tm::broadcast_factor(&tms, BroadcastDim::R), 1);
    }

    #[test]
    fn test_grid_transpose_swaps_axes() {
        let mut op = OpInfo::new("mm", GraphId(0), OpKind::Matmul(MatmulAttrs::default()));
        op.grid_size = GridShape::new(2, 3);
        assert_eq!((op.grid_size_y(), op.grid_size_x()), (2, 3));
        op.grid_transpose = true;
        assert_eq!((op.grid_size_y(), op.grid_size_x()), (3, 2));
    }
}
