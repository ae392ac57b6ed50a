//! Programs: linear instruction traces that drive graph execution

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CompileError, CompileResult};
use crate::lexer::{single_token, Token};

/// An instruction argument: a `$variable` or an integer immediate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Var(String),
    Imm(i64),
}

impl Operand {
    /// Booleans are immediates 1 and 0
    pub fn parse(s: &str) -> CompileResult<Self> {
        match single_token(s) {
            Some(Token::Var(name)) => Ok(Operand::Var(name)),
            Some(Token::Int(value)) => Ok(Operand::Imm(value)),
            Some(Token::True) => Ok(Operand::Imm(1)),
            Some(Token::False) => Ok(Operand::Imm(0)),
            _ => Err(CompileError::parse_error(format!(
                "{} is neither a $variable nor an integer immediate",
                s
            ))),
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Operand::Var(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(name) => write!(f, "{}", name),
            Operand::Imm(value) => write!(f, "{}", value),
        }
    }
}

/// Arithmetic performed by a `varinst` instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarOpcode {
    Set,
    Add,
    Mul,
    Inc,
    IncWrap,
}

impl VarOpcode {
    pub fn parse(s: &str) -> CompileResult<Self> {
        match s {
            "set" => Ok(VarOpcode::Set),
            "add" => Ok(VarOpcode::Add),
            "mul" => Ok(VarOpcode::Mul),
            "inc" => Ok(VarOpcode::Inc),
            "incwrap" => Ok(VarOpcode::IncWrap),
            _ => Err(CompileError::parse_error(format!(
                "varinst opcode {} is not supported",
                s
            ))),
        }
    }

    /// Number of source operands after the destination
    pub fn arity(&self) -> usize {
        match self {
            VarOpcode::Set | VarOpcode::Inc => 1,
            VarOpcode::Add | VarOpcode::Mul | VarOpcode::IncWrap => 2,
        }
    }
}

/// Per-execute binding of a queue's pointers and flags. Values stay textual
/// (`$var`, immediate, `true`) until the runtime resolves them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSetting {
    pub name: String,
    pub prologue: Option<String>,
    pub epilogue: Option<String>,
    pub zero: Option<String>,
    pub rd_ptr_local: Option<String>,
    pub rd_ptr_global: Option<String>,
    pub wr_ptr_global: Option<String>,
    pub rd_ptr_autoinc: Option<String>,
    pub global_rdptr_autoinc: Option<String>,
    pub global_wrptr_autoinc: Option<String>,
    pub read_only: Option<String>,
}

impl QueueSetting {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set a field by its netlist key
    pub fn set_field(&mut self, key: &str, value: String) -> CompileResult<()> {
        let slot = match key {
            "prologue" => &mut self.prologue,
            "epilogue" => &mut self.epilogue,
            "zero" => &mut self.zero,
            "rd_ptr_local" => &mut self.rd_ptr_local,
            "rd_ptr_global" => &mut self.rd_ptr_global,
            "wr_ptr_global" => &mut self.wr_ptr_global,
            "rd_ptr_autoinc" => &mut self.rd_ptr_autoinc,
            "global_rdptr_autoinc" => &mut self.global_rdptr_autoinc,
            "global_wrptr_autoinc" => &mut self.global_wrptr_autoinc,
            "read_only" => &mut self.read_only,
            _ => {
                return Err(CompileError::parse_error(format!(
                    "Field {} is not supported for queue setting of queue {}",
                    key, self.name
                )))
            }
        };
        *slot = Some(value);
        Ok(())
    }

    pub fn is_true(field: &Option<String>) -> bool {
        field
            .as_deref()
            .map_or(false, |value| value.eq_ignore_ascii_case("true"))
    }

    pub fn is_set(field: &Option<String>) -> bool {
        field.as_deref().map_or(false, |value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteInstruction {
    pub graph_name: String,
    pub queue_settings: Vec<QueueSetting>,
}

impl ExecuteInstruction {
    pub fn setting(&self, queue: &str) -> Option<&QueueSetting> {
        self.queue_settings.iter().find(|setting| setting.name == queue)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Local variable declarations with initial values
    Var(Vec<(String, i64)>),
    /// Variables that survive a program reset
    StaticVar(Vec<(String, i64)>),
    /// Variables bound from runtime parameters
    Param(Vec<String>),
    VarInst {
        opcode: VarOpcode,
        dest: String,
        sources: Vec<Operand>,
    },
    AllocateQueue(Vec<String>),
    DeallocateQueue(Vec<String>),
    Execute(ExecuteInstruction),
    Loop(Operand),
    EndLoop,
    EndProgram,
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Var(_) => "var",
            Instruction::StaticVar(_) => "staticvar",
            Instruction::Param(_) => "param",
            Instruction::VarInst { .. } => "varinst",
            Instruction::AllocateQueue(_) => "allocate_queue",
            Instruction::DeallocateQueue(_) => "deallocate_queue",
            Instruction::Execute(_) => "execute",
            Instruction::Loop(_) => "loop",
            Instruction::EndLoop => "endloop",
            Instruction::EndProgram => "endprogram",
        }
    }

    pub fn as_execute(&self) -> Option<&ExecuteInstruction> {
        match self {
            Instruction::Execute(execute) => Some(execute),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Execute(execute) => write!(f, "execute {}", execute.graph_name),
            Instruction::Loop(count) => write!(f, "loop {}", count),
            Instruction::VarInst { opcode, dest, sources } => {
                write!(f, "varinst {:?} {}", opcode, dest)?;
                for source in sources {
                    write!(f, " {}", source)?;
                }
                Ok(())
            }
            other => write!(f, "{}", other.mnemonic()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub name: String,
    pub instructions: Vec<Instruction>,
}

impl ProgramInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
        }
    }

    pub fn executes(&self) -> impl Iterator<Item = &ExecuteInstruction> {
        self.instructions.iter().filter_map(Instruction::as_execute)
    }

    pub fn executes_mut(&mut self) -> impl Iterator<Item = &mut ExecuteInstruction> {
        self.instructions.iter_mut().filter_map(|instruction| match instruction {
            Instruction::Execute(execute) => Some(execute),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_parse() {
        assert_eq!(Operand::parse("$c_loop").unwrap(), Operand::Var("$c_loop".to_string()));
        assert_eq!(Operand::parse("8").unwrap(), Operand::Imm(8));
        assert_eq!(Operand::parse("True").unwrap(), Operand::Imm(1));
        assert!(Operand::parse("loop").is_err());
    }

    #[test]
    fn test_var_opcode_arity() {
        assert_eq!(VarOpcode::parse("incwrap").unwrap().arity(), 2);
        assert_eq!(VarOpcode::parse("set").unwrap().arity(), 1);
        assert!(VarOpcode::parse("div").is_err());
    }

    #[test]
    fn test_queue_setting_fields() {
        let mut setting = QueueSetting::new("q0");
        setting.set_field("epilogue", "True".to_string()).unwrap();
        setting.set_field("rd_ptr_global", "$gptr".to_string()).unwrap();
        assert!(QueueSetting::is_true(&setting.epilogue));
        assert!(QueueSetting::is_set(&setting.rd_ptr_global));
        assert!(!QueueSetting::is_set(&setting.wr_ptr_global));
        assert!(setting.set_field("wr_ptr_local", "0".to_string()).is_err());
    }
}
