//! Fused-op templates: schedules of sub-ops sharing on-chip intermediates

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{CompileError, CompileResult};
use crate::format::{DataFormat, Dim, VectorMode};
use crate::lexer::{single_token, Token};
use crate::op::{KernelBroadcast, OpType, ReduceDim, ReduceFunc, ReluConfig, SfpuParams, Tm};

/// Upper bound on intermediate buffers a fused op may declare
pub const MAX_INTERMEDIATE_BUFFERS: usize = 8;

/// A buffer name relative to the enclosing fused op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelName {
    Input(usize),
    Intermed(usize),
    Dest,
    Output,
}

impl RelName {
    pub fn is_input(&self) -> bool {
        matches!(self, RelName::Input(_))
    }

    pub fn is_intermed(&self) -> bool {
        matches!(self, RelName::Intermed(_))
    }

    pub fn is_dest(&self) -> bool {
        *self == RelName::Dest
    }
}

impl FromStr for RelName {
    type Err = CompileError;

    fn from_str(s: &str) -> CompileResult<Self> {
        match single_token(s) {
            Some(Token::Input(i)) => Ok(RelName::Input(i)),
            Some(Token::Intermed(i)) => Ok(RelName::Intermed(i)),
            Some(Token::Dest) => Ok(RelName::Dest),
            Some(Token::Output) => Ok(RelName::Output),
            _ => Err(CompileError::parse_error(format!(
                "{} is not a fused op buffer name (inputN, intermedN, dest, output)",
                s
            ))),
        }
    }
}

impl fmt::Display for RelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelName::Input(i) => write!(f, "input{}", i),
            RelName::Intermed(i) => write!(f, "intermed{}", i),
            RelName::Dest => write!(f, "dest"),
            RelName::Output => write!(f, "output"),
        }
    }
}

/// One sub-op inside a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledOp {
    pub name: String,
    pub op_type: OpType,
    pub inputs: Vec<RelName>,
    pub output: RelName,
    pub output_dim: Dim,
    pub inputs_to_pop: BTreeSet<RelName>,
    pub inputs_to_pop_last: BTreeSet<RelName>,
    pub input_tms: BTreeMap<usize, Vec<Tm>>,
    pub m_k: u32,
    pub u_kt: u32,
    pub vector_mode: Option<VectorMode>,
    pub reduce: Option<(ReduceDim, ReduceFunc)>,
    pub relu: ReluConfig,
    pub sfpu: SfpuParams,
    pub zero_point: f32,

    // Filled on instantiation
    pub output_format: Option<DataFormat>,
    pub cast_dest_fp32_to_fp16_a: bool,
}

impl ScheduledOp {
    pub fn new(name: impl Into<String>, op_type: OpType, output: RelName) -> Self {
        Self {
            name: name.into(),
            op_type,
            inputs: Vec::new(),
            output,
            output_dim: Dim::default(),
            inputs_to_pop: BTreeSet::new(),
            inputs_to_pop_last: BTreeSet::new(),
            input_tms: BTreeMap::new(),
            m_k: 1,
            u_kt: 1,
            vector_mode: None,
            reduce: None,
            relu: ReluConfig::default(),
            sfpu: SfpuParams::default(),
            zero_point: 0.0,
            output_format: None,
            cast_dest_fp32_to_fp16_a: false,
        }
    }

    pub fn uses(&self, name: RelName) -> bool {
        self.inputs.contains(&name)
    }

    pub fn tms(&self, input: usize) -> &[Tm] {
        self.input_tms.get(&input).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub ops: Vec<ScheduledOp>,
}

impl Schedule {
    pub fn last_op(&self) -> Option<&ScheduledOp> {
        self.ops.last()
    }

    pub fn ends_in_matmul_or_reduce(&self) -> bool {
        self.last_op().map_or(false, |op| op.op_type.is_matmul_or_reduce())
    }
}

/// Concrete formats substituted into a template copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusedFormats {
    pub inputs: Vec<DataFormat>,
    pub accumulation: DataFormat,
    pub intermed: DataFormat,
    pub output: DataFormat,
}

impl FusedFormats {
    /// Format of a relative buffer seen from inside the fused op
    pub fn of(&self, name: RelName) -> Option<DataFormat> {
        match name {
            RelName::Input(i) => self.inputs.get(i).copied(),
            RelName::Dest => Some(self.accumulation),
            RelName::Intermed(_) => Some(self.intermed),
            RelName::Output => Some(self.output),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedOpTemplate {
    pub id: String,
    pub num_inputs: usize,
    pub num_intermediates: usize,
    pub custom_kernel_path: Option<String>,
    pub schedules: Vec<Schedule>,

    // Filled on instantiation
    pub formats: Option<FusedFormats>,
    pub input_names_to_rel_names: BTreeMap<String, RelName>,
    /// Inputs read by sub-ops in more than one place, with the buffer scaling factor
    pub forked_input_names: BTreeMap<RelName, u32>,
    pub output_and_intermed_format_match: bool,
    pub inputs_and_intermed_formats_match: bool,
    pub kernel_broadcast: Vec<Option<KernelBroadcast>>,
    pub intermed_buff_size_in_tiles: BTreeMap<usize, u32>,
}

impl FusedOpTemplate {
    pub fn new(id: impl Into<String>, num_inputs: usize, num_intermediates: usize) -> Self {
        Self {
            id: id.into(),
            num_inputs,
            num_intermediates,
            custom_kernel_path: None,
            schedules: Vec::new(),
            formats: None,
            input_names_to_rel_names: BTreeMap::new(),
            forked_input_names: BTreeMap::new(),
            output_and_intermed_format_match: true,
            inputs_and_intermed_formats_match: true,
            kernel_broadcast: Vec::new(),
            intermed_buff_size_in_tiles: BTreeMap::new(),
        }
    }

    pub fn scheduled_ops(&self) -> impl Iterator<Item = &ScheduledOp> {
        self.schedules.iter().flat_map(|schedule| schedule.ops.iter())
    }

    /// Format of a relative buffer; `None` before instantiation
    pub fn format_of(&self, name: RelName) -> Option<DataFormat> {
        self.formats.as_ref().and_then(|formats| formats.of(name))
    }

    pub fn is_int(&self) -> bool {
        self.formats
            .as_ref()
            .map_or(false, |formats| formats.accumulation == DataFormat::Int32)
    }

    /// Binary ops that run on the SFPU: quantisation, maximum, and adds of Int32 data
    pub fn is_binary_sfpu(&self, op: &ScheduledOp) -> bool {
        match op.op_type.binary_op() {
            Some(binary) if binary.is_quantisation() => true,
            Some(crate::op::BinaryOp::Maximum) => true,
            Some(crate::op::BinaryOp::Add) => op
                .inputs
                .iter()
                .any(|input| self.format_of(*input) == Some(DataFormat::Int32)),
            _ => false,
        }
    }

    /// Relative inputs referenced by more than one sub-op, mapped to the
    /// factor their buffers scale by. An input first read in a schedule that
    /// contains a matmul or reduce scales by that op's `m_k`.
    pub fn compute_forked_inputs(&self) -> BTreeMap<RelName, u32> {
        let mut forked = BTreeMap::new();
        for index in 0..self.num_inputs {
            let input = RelName::Input(index);
            let mut used = 0;
            let mut scaler = 1;
            let mut m_k = 1;
            let mut first_use = true;
            let mut found_in_schedule = false;
            for schedule in &self.schedules {
                let mut has_matmul_or_reduce = false;
                for op in &schedule.ops {
                    if op.uses(input) {
                        found_in_schedule = first_use;
                        first_use = false;
                        used += 1;
                    }
                    if op.op_type.is_matmul_or_reduce() {
                        has_matmul_or_reduce = true;
                        m_k = op.m_k;
                    }
                }
                if found_in_schedule && has_matmul_or_reduce {
                    scaler = m_k;
                }
            }
            if used > 1 {
                forked.insert(input, scaler);
            }
        }
        forked
    }

    /// Minimum tiles each intermediate buffer must hold across all schedules
    pub fn compute_intermed_buffer_sizes(&self) -> BTreeMap<usize, u32> {
        let mut sizes = BTreeMap::new();
        for schedule in &self.schedules {
            // A matmul consuming an intermediate as input 0 over several
            // column blocks keeps m_k ublocks of it alive at once
            let mut scaled: Option<(usize, u32)> = None;
            if let Some(last) = schedule.last_op() {
                if last.op_type.is_matmul() && last.output_dim.mblock_n > 1 {
                    if let Some(RelName::Intermed(index)) = last.inputs.first() {
                        scaled = Some((*index, last.m_k));
                    }
                }
            }
            for op in &schedule.ops {
                if let RelName::Intermed(index) = op.output {
                    let mut required = op.output_dim.ublock_ct * op.output_dim.ublock_rt;
                    if let Some((scaled_index, mult)) = scaled {
                        if !op.op_type.is_matmul() && scaled_index == index {
                            required *= mult;
                        }
                    }
                    let entry = sizes.entry(index).or_insert(0);
                    *entry = (*entry).max(required);
                }
            }
        }
        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::BinaryOp;
    use pretty_assertions::assert_eq;

    fn sub_op(name: &str, op_type: OpType, inputs: &[RelName], output: RelName) -> ScheduledOp {
        let mut op = ScheduledOp::new(name, op_type, output);
        op.inputs = inputs.to_vec();
        op
    }

    #[test]
    fn test_rel_name_parse() {
        assert_eq!("input2".parse::<RelName>().unwrap(), RelName::Input(2));
        assert_eq!("intermed0".parse::<RelName>().unwrap(), RelName::Intermed(0));
        assert_eq!("dest".parse::<RelName>().unwrap(), RelName::Dest);
        assert!("inter".parse::<RelName>().is_err());
    }

    #[test]
    fn test_forked_input_scaled_by_matmul_m_k() {
        let mut template = FusedOpTemplate::new("0", 2, 1);
        let mut mm = sub_op(
            "mm",
            OpType::Matmul,
            &[RelName::Input(0), RelName::Input(1)],
            RelName::Intermed(0),
        );
        mm.m_k = 4;
        template.schedules.push(Schedule { ops: vec![mm] });
        template.schedules.push(Schedule {
            ops: vec![sub_op(
                "add",
                OpType::Binary(BinaryOp::Add),
                &[RelName::Intermed(0), RelName::Input(0)],
                RelName::Output,
            )],
        });

        let forked = template.compute_forked_inputs();
        assert_eq!(forked.get(&RelName::Input(0)), Some(&4));
        assert_eq!(forked.get(&RelName::Input(1)), None);
    }

    #[test]
    fn test_forked_input_without_matmul_scales_by_one() {
        let mut template = FusedOpTemplate::new("0", 1, 0);
        template.schedules.push(Schedule {
            ops: vec![
                sub_op("a", OpType::Sfpu(crate::op::SfpuOp::Exp), &[RelName::Input(0)], RelName::Dest),
                sub_op(
                    "b",
                    OpType::Binary(BinaryOp::Multiply),
                    &[RelName::Input(0), RelName::Dest],
                    RelName::Output,
                ),
            ],
        });
        assert_eq!(template.compute_forked_inputs().get(&RelName::Input(0)), Some(&1));
    }

    #[test]
    fn test_intermed_buffer_scaled_for_matmul_column_blocks() {
        let mut template = FusedOpTemplate::new("0", 2, 1);
        let mut producer = sub_op("exp", OpType::Sfpu(crate::op::SfpuOp::Exp), &[RelName::Input(0)], RelName::Intermed(0));
        producer.output_dim.ublock_rt = 2;
        producer.output_dim.ublock_ct = 2;
        let mut mm = sub_op(
            "mm",
            OpType::Matmul,
            &[RelName::Intermed(0), RelName::Input(1)],
            RelName::Output,
        );
        mm.m_k = 3;
        mm.output_dim.mblock_n = 2;
        template.schedules.push(Schedule {
            ops: vec![producer, mm],
        });
        assert_eq!(template.compute_intermed_buffer_sizes().get(&0), Some(&12));
    }

    #[test]
    fn test_binary_sfpu_classification() {
        let mut template = FusedOpTemplate::new("0", 2, 0);
        template.formats = Some(FusedFormats {
            inputs: vec![DataFormat::Int32, DataFormat::Int8],
            accumulation: DataFormat::Int32,
            intermed: DataFormat::Int32,
            output: DataFormat::Int32,
        });
        let add = sub_op(
            "add",
            OpType::Binary(BinaryOp::Add),
            &[RelName::Input(0), RelName::Input(1)],
            RelName::Output,
        );
        assert!(template.is_binary_sfpu(&add));
        let sub = sub_op(
            "sub",
            OpType::Binary(BinaryOp::Subtract),
            &[RelName::Input(1), RelName::Input(1)],
            RelName::Output,
        );
        assert!(!template.is_binary_sfpu(&sub));
        assert!(template.is_int());
    }
}
