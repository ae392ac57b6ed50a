//! Program execution engine
//!
//! Interprets a parsed [`ProgramInfo`] one instruction at a time. Graph
//! execution itself happens outside this crate: every `execute` instruction
//! is handed to an [`ExecutionHooks`] implementation together with the
//! current executor state, so the driver can resolve queue settings against
//! the live variable table.

use std::collections::BTreeMap;

use log::{trace, warn};

use crate::error::{CompileError, CompileResult};
use crate::program::{ExecuteInstruction, Instruction, Operand, ProgramInfo, VarOpcode};

/// Lifetime class of a program variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    /// Cleared by [`ProgramExecutor::reset`]
    Local,
    /// Survives resets
    Static,
    /// Bound from runtime parameters
    Param,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable {
    pub scope: VarScope,
    pub value: i64,
}

/// One active `loop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopFrame {
    pub current_iteration: i64,
    pub last_iteration: i64,
    pub return_pc: usize,
}

/// Callbacks into the graph-execution subsystem
///
/// Only `execute` is required; the others default to no-ops.
pub trait ExecutionHooks {
    fn execute(&mut self, executor: &ProgramExecutor<'_>, instruction: &ExecuteInstruction) -> CompileResult<()>;

    fn allocate_queues(&mut self, _executor: &ProgramExecutor<'_>, _queues: &[String]) -> CompileResult<()> {
        Ok(())
    }

    fn deallocate_queues(&mut self, _executor: &ProgramExecutor<'_>, _queues: &[String]) -> CompileResult<()> {
        Ok(())
    }

    fn pre_instruction(&mut self, _executor: &ProgramExecutor<'_>) -> CompileResult<()> {
        Ok(())
    }

    fn post_instruction(&mut self, _executor: &ProgramExecutor<'_>) -> CompileResult<()> {
        Ok(())
    }
}

/// Whether [`ProgramExecutor::step`] ran an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Ran,
    AtBreakpoint,
    Done,
}

pub struct ProgramExecutor<'a> {
    program: &'a ProgramInfo,
    pc: usize,
    variables: BTreeMap<String, Variable>,
    loop_stack: Vec<LoopFrame>,
    breakpoint: Option<usize>,
    parameters: BTreeMap<String, String>,
    ignore_runtime_parameters: bool,
}

impl<'a> ProgramExecutor<'a> {
    pub fn new(program: &'a ProgramInfo) -> Self {
        Self {
            program,
            pc: 0,
            variables: BTreeMap::new(),
            loop_stack: Vec::new(),
            breakpoint: None,
            parameters: BTreeMap::new(),
            ignore_runtime_parameters: false,
        }
    }

    /// Values for `param` declarations, as written on the command line
    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Bind every `param` to 1 instead of reading supplied values
    pub fn ignore_runtime_parameters(mut self, ignore: bool) -> Self {
        self.ignore_runtime_parameters = ignore;
        self
    }

    pub fn name(&self) -> &str {
        &self.program.name
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Rewind to the first instruction and drop any breakpoint. Static and
    /// param variables persist.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.breakpoint = None;
        self.loop_stack.clear();
        self.variables.retain(|_, var| var.scope != VarScope::Local);
    }

    pub fn set_breakpoint(&mut self, pc: usize) {
        self.breakpoint = Some(pc);
    }

    pub fn clear_breakpoint(&mut self) {
        self.breakpoint = None;
    }

    pub fn breakpoint(&self) -> Option<usize> {
        self.breakpoint
    }

    pub fn at_breakpoint(&self) -> bool {
        self.breakpoint == Some(self.pc)
    }

    pub fn current_instruction(&self) -> CompileResult<&'a Instruction> {
        self.program
            .instructions
            .get(self.pc)
            .ok_or_else(|| self.error(format!("PC={} went beyond program instructions", self.pc)))
    }

    pub fn done(&self) -> bool {
        matches!(self.program.instructions.get(self.pc), Some(Instruction::EndProgram) | None)
    }

    pub fn variable(&self, name: &str) -> Option<Variable> {
        self.variables.get(name).copied()
    }

    /// Value of a variable or immediate
    pub fn value_of(&self, operand: &Operand) -> CompileResult<i64> {
        match operand {
            Operand::Imm(value) => Ok(*value),
            Operand::Var(name) => self
                .variable(name)
                .map(|var| var.value)
                .ok_or_else(|| self.error(format!("Accessing an uninitialized variable {}", name))),
        }
    }

    /// Resolve a queue-setting field: `$var`, integer or boolean text
    pub fn resolve_setting(&self, text: &str) -> CompileResult<i64> {
        self.value_of(&Operand::parse(text)?)
    }

    /// Snapshot of the variables in `scope`
    pub fn variables_in(&self, scope: VarScope) -> BTreeMap<String, i64> {
        self.variables
            .iter()
            .filter(|(_, var)| var.scope == scope)
            .map(|(name, var)| (name.clone(), var.value))
            .collect()
    }

    pub fn loop_stack(&self) -> &[LoopFrame] {
        &self.loop_stack
    }

    /// Iteration of the innermost loop; 0 outside any loop
    pub fn current_loop_iteration(&self) -> i64 {
        self.loop_stack.last().map_or(0, |frame| frame.current_iteration)
    }

    pub fn last_loop_iteration(&self) -> i64 {
        self.loop_stack.last().map_or(0, |frame| frame.last_iteration)
    }

    pub fn is_first_iteration_of_all_loops(&self) -> bool {
        self.loop_stack.iter().all(|frame| frame.current_iteration == 0)
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::program(&self.program.name, msg)
    }

    fn declare(&mut self, name: &str, value: i64, scope: VarScope) -> CompileResult<()> {
        if let Some(existing) = self.variables.get(name) {
            return Err(self.error(format!(
                "{:?} variable={} declaration masks a previous {:?} variable declaration",
                scope, name, existing.scope
            )));
        }
        self.variables.insert(name.to_string(), Variable { scope, value });
        Ok(())
    }

    fn assign(&mut self, name: &str, value: i64) -> CompileResult<()> {
        match self.variables.get_mut(name) {
            Some(var) => {
                var.value = value;
                Ok(())
            }
            None => Err(self.error(format!("varinst destination {} is not declared", name))),
        }
    }

    fn bind_param(&mut self, name: &str) -> CompileResult<()> {
        let value = if self.ignore_runtime_parameters {
            1
        } else {
            let text = self.parameters.get(name).ok_or_else(|| {
                self.error(format!(
                    "Param Variable={} is declared as a param but is not passed in during run_program",
                    name
                ))
            })?;
            text.trim().parse::<i64>().map_err(|_| {
                self.error(format!("Param Variable={} has a non-immediate value={}", name, text))
            })?
        };
        self.declare(name, value, VarScope::Param)
    }

    fn var_inst(&mut self, opcode: VarOpcode, dest: &str, sources: &[Operand]) -> CompileResult<()> {
        let arg = |index: usize| -> CompileResult<i64> {
            let operand = sources.get(index).ok_or_else(|| {
                self.error(format!("varinst {:?} on {} is missing operand {}", opcode, dest, index))
            })?;
            self.value_of(operand)
        };
        let current = || self.value_of(&Operand::Var(dest.to_string()));
        let overflow = || self.error(format!("varinst {:?} on {} overflows", opcode, dest));
        let result = match opcode {
            VarOpcode::Set => arg(0)?,
            VarOpcode::Add => arg(0)?.checked_add(arg(1)?).ok_or_else(overflow)?,
            VarOpcode::Mul => arg(0)?.checked_mul(arg(1)?).ok_or_else(overflow)?,
            VarOpcode::Inc => current()?.checked_add(arg(0)?).ok_or_else(overflow)?,
            VarOpcode::IncWrap => {
                let increment = arg(0)?;
                let wrap = arg(1)?;
                if wrap <= 0 {
                    return Err(self.error(format!("incwrap on {} needs a positive wrap, found {}", dest, wrap)));
                }
                current()?.checked_add(increment).ok_or_else(overflow)?.rem_euclid(wrap)
            }
        };
        self.assign(dest, result)
    }

    /// Run the instruction at the program counter
    pub fn step(&mut self, hooks: &mut dyn ExecutionHooks) -> CompileResult<StepOutcome> {
        if self.done() {
            return Ok(StepOutcome::Done);
        }
        if self.at_breakpoint() {
            warn!("Program {} hit breakpoint at pc {}", self.program.name, self.pc);
            return Ok(StepOutcome::AtBreakpoint);
        }
        let instruction = self.current_instruction()?;
        trace!("Program {} pc {}: {}", self.program.name, self.pc, instruction);
        hooks.pre_instruction(self)?;

        let mut next_pc = self.pc + 1;
        match instruction {
            Instruction::Var(vars) => {
                for (name, value) in vars {
                    self.declare(name, *value, VarScope::Local)?;
                }
            }
            Instruction::StaticVar(vars) => {
                for (name, value) in vars {
                    match self.variables.get(name.as_str()) {
                        Some(existing) if existing.scope == VarScope::Static => {
                            trace!("Static variable {} keeps value {}", name, existing.value);
                        }
                        _ => self.declare(name, *value, VarScope::Static)?,
                    }
                }
            }
            Instruction::Param(names) => {
                for name in names {
                    if self.variable(name).map_or(false, |var| var.scope == VarScope::Param) {
                        continue;
                    }
                    self.bind_param(name)?;
                }
            }
            Instruction::VarInst { opcode, dest, sources } => self.var_inst(*opcode, dest, sources)?,
            Instruction::AllocateQueue(queues) => hooks.allocate_queues(self, queues)?,
            Instruction::DeallocateQueue(queues) => hooks.deallocate_queues(self, queues)?,
            Instruction::Execute(execute) => hooks.execute(self, execute)?,
            Instruction::Loop(count) => {
                let bound = self.value_of(count)?;
                if bound < 1 {
                    return Err(self.error(format!(
                        "Loop count needs to be >= 1 -- loop_count:{} = {}",
                        count, bound
                    )));
                }
                self.loop_stack.push(LoopFrame {
                    current_iteration: 0,
                    last_iteration: bound - 1,
                    return_pc: next_pc,
                });
            }
            Instruction::EndLoop => {
                let frame = self.loop_stack.last_mut().ok_or_else(|| {
                    CompileError::program(
                        &self.program.name,
                        format!("Unexpected EndLoop at pc: {}", self.pc),
                    )
                })?;
                if frame.current_iteration < frame.last_iteration {
                    frame.current_iteration += 1;
                    next_pc = frame.return_pc;
                } else {
                    self.loop_stack.pop();
                }
            }
            Instruction::EndProgram => {}
        }

        hooks.post_instruction(self)?;
        self.pc = next_pc;
        Ok(StepOutcome::Ran)
    }

    /// Step until the program ends or stalls on a breakpoint
    pub fn run(&mut self, hooks: &mut dyn ExecutionHooks) -> CompileResult<StepOutcome> {
        loop {
            match self.step(hooks)? {
                StepOutcome::Ran => {}
                stopped => return Ok(stopped),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Records executed graphs and the value of `$gptr` at each execute
    #[derive(Default)]
    struct Recorder {
        executed: Vec<(String, i64)>,
        allocated: Vec<String>,
    }

    impl ExecutionHooks for Recorder {
        fn execute(&mut self, executor: &ProgramExecutor<'_>, instruction: &ExecuteInstruction) -> CompileResult<()> {
            let gptr = executor.variable("$gptr").map_or(-1, |var| var.value);
            self.executed.push((instruction.graph_name.clone(), gptr));
            Ok(())
        }

        fn allocate_queues(&mut self, _executor: &ProgramExecutor<'_>, queues: &[String]) -> CompileResult<()> {
            self.allocated.extend(queues.iter().cloned());
            Ok(())
        }
    }

    fn program(trace: serde_json::Value) -> ProgramInfo {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["programs"][0]["main"] = trace;
        let netlist = testutil::compile(source).unwrap();
        netlist.program_by_name("main").unwrap().clone()
    }

    fn looped(count: serde_json::Value) -> ProgramInfo {
        program(json!([
            { "param": ["$count"] },
            { "var": { "$lptr": 0, "$gptr": 0 } },
            { "loop": count },
            { "execute": { "graph_name": "fwd", "queue_settings": {
                "q0": { "prologue": false, "epilogue": false, "zero": false,
                        "rd_ptr_local": "$lptr", "rd_ptr_global": "$gptr" }
            } } },
            { "varinst": ["$gptr", "incwrap", 1, 3] },
            "endloop",
        ]))
    }

    #[test]
    fn test_loop_runs_body_count_times() {
        let program = looped(json!("$count"));
        let mut executor = ProgramExecutor::new(&program)
            .with_parameters(BTreeMap::from([("$count".to_string(), "4".to_string())]));
        let mut hooks = Recorder::default();
        assert_eq!(executor.run(&mut hooks).unwrap(), StepOutcome::Done);

        let gptrs: Vec<i64> = hooks.executed.iter().map(|(_, gptr)| *gptr).collect();
        assert_eq!(gptrs, vec![0, 1, 2, 0]);
        assert!(executor.loop_stack().is_empty());
        assert_eq!(executor.variable("$gptr").unwrap().value, 1);
    }

    #[test]
    fn test_loop_bound_zero_rejected() {
        let program = looped(json!("$count"));
        let mut executor = ProgramExecutor::new(&program)
            .with_parameters(BTreeMap::from([("$count".to_string(), "0".to_string())]));
        let err = executor.run(&mut Recorder::default()).unwrap_err();
        assert_eq!(err.message(), "Loop count needs to be >= 1 -- loop_count:$count = 0");
    }

    #[test]
    fn test_ignored_params_default_to_one() {
        let program = looped(json!("$count"));
        let mut executor = ProgramExecutor::new(&program).ignore_runtime_parameters(true);
        let mut hooks = Recorder::default();
        executor.run(&mut hooks).unwrap();
        assert_eq!(hooks.executed.len(), 1);
        assert_eq!(executor.variables_in(VarScope::Param), BTreeMap::from([("$count".to_string(), 1)]));
    }

    #[test]
    fn test_missing_param_is_an_error() {
        let program = looped(json!("$count"));
        let err = ProgramExecutor::new(&program).run(&mut Recorder::default()).unwrap_err();
        assert!(err.message().starts_with("Param Variable=$count is declared as a param"));
    }

    #[test]
    fn test_reset_keeps_static_and_param() {
        let program = program(json!([
            { "param": ["$count"] },
            { "staticvar": { "$epoch": 0 } },
            { "var": { "$lptr": 0, "$gptr": 0 } },
            { "varinst": ["$epoch", "inc", 1] },
            { "allocate_queue": ["q1"] },
            { "execute": { "graph_name": "fwd", "queue_settings": {
                "q0": { "prologue": false, "epilogue": false, "zero": false,
                        "rd_ptr_local": "$lptr", "rd_ptr_global": "$gptr" }
            } } },
        ]));
        let mut executor = ProgramExecutor::new(&program).ignore_runtime_parameters(true);
        let mut hooks = Recorder::default();
        executor.run(&mut hooks).unwrap();
        executor.reset();
        assert!(executor.variable("$gptr").is_none());
        assert_eq!(executor.pc(), 0);

        executor.run(&mut hooks).unwrap();
        assert_eq!(executor.variable("$epoch").unwrap().value, 2);
        assert_eq!(hooks.executed.len(), 2);
        assert_eq!(hooks.allocated, vec!["q1", "q1"]);
    }

    #[test]
    fn test_breakpoint_stalls_until_cleared() {
        let program = looped(json!(2));
        let mut executor = ProgramExecutor::new(&program).ignore_runtime_parameters(true);
        executor.set_breakpoint(3);
        let mut hooks = Recorder::default();
        assert_eq!(executor.run(&mut hooks).unwrap(), StepOutcome::AtBreakpoint);
        assert_eq!(executor.pc(), 3);
        assert!(hooks.executed.is_empty());
        assert!(executor.is_first_iteration_of_all_loops());
        assert_eq!(executor.last_loop_iteration(), 1);

        executor.clear_breakpoint();
        assert_eq!(executor.run(&mut hooks).unwrap(), StepOutcome::Done);
        assert_eq!(hooks.executed.len(), 2);
    }

    #[test]
    fn test_varinst_overflow_is_an_error() {
        let program = program(json!([
            { "var": { "$big": 0 } },
            { "varinst": ["$big", "mul", 4611686018427387904i64, 4] },
        ]));
        let err = ProgramExecutor::new(&program).run(&mut Recorder::default()).unwrap_err();
        assert!(matches!(err, CompileError::ProgramError { .. }));
        assert_eq!(err.message(), "varinst Mul on $big overflows");

        let program = self::program(json!([
            { "var": { "$big": i64::MAX } },
            { "varinst": ["$big", "incwrap", 1, 4] },
        ]));
        let err = ProgramExecutor::new(&program).run(&mut Recorder::default()).unwrap_err();
        assert_eq!(err.message(), "varinst IncWrap on $big overflows");
    }

    #[test]
    fn test_reset_clears_breakpoint() {
        let program = looped(json!(1));
        let mut executor = ProgramExecutor::new(&program).ignore_runtime_parameters(true);
        executor.set_breakpoint(3);
        let mut hooks = Recorder::default();
        assert_eq!(executor.run(&mut hooks).unwrap(), StepOutcome::AtBreakpoint);

        executor.reset();
        assert_eq!(executor.breakpoint(), None);
        assert_eq!(executor.run(&mut hooks).unwrap(), StepOutcome::Done);
        assert_eq!(hooks.executed.len(), 1);
    }

    #[test]
    fn test_resolve_setting() {
        let program = looped(json!(1));
        let mut executor = ProgramExecutor::new(&program).ignore_runtime_parameters(true);
        executor.set_breakpoint(3);
        executor.run(&mut Recorder::default()).unwrap();
        assert_eq!(executor.resolve_setting("$gptr").unwrap(), 0);
        assert_eq!(executor.resolve_setting("true").unwrap(), 1);
        assert!(executor.resolve_setting("$nope").is_err());
    }
}
