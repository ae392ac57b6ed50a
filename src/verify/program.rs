//! Program traces: queue-setting fields per queue type, loop nesting,
//! `param` placement and variable declarations

use std::collections::BTreeSet;

use super::{Findings, Rule, Violation};
use crate::ir::Netlist;
use crate::program::{Instruction, Operand, ProgramInfo, QueueSetting};
use crate::queue::QueueType;

pub struct ProgramRule;

const RULE: &str = "program";

impl Rule for ProgramRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn check(&self, netlist: &Netlist) -> Vec<Violation> {
        let mut findings = Findings::new(RULE);
        for program in netlist.programs() {
            for execute in program.executes() {
                for setting in &execute.queue_settings {
                    check_queue_setting(netlist, &program.name, setting, &mut findings);
                }
            }
            check_param_placement(program, &mut findings);
            check_loop_nesting(program, &mut findings);
            check_variables(program, &mut findings);
        }
        findings.into_violations()
    }
}

/// Unset autoinc fields count as "0"
fn autoinc(field: &Option<String>) -> &str {
    field.as_deref().unwrap_or("0")
}

fn check_queue_setting(netlist: &Netlist, program: &str, setting: &QueueSetting, findings: &mut Findings) {
    let name = &setting.name;
    let Some(queue) = netlist.queue_by_name(name) else {
        findings.push(format!(
            "queue={} in program={} queue_settings set but not declared in queue_map section",
            name, program
        ));
        return;
    };
    match queue.queue_type {
        QueueType::Queue => {
            findings.require(!QueueSetting::is_set(&setting.wr_ptr_global), || {
                format!(
                    "queue={} in program={} queue_settings set wr_ptr_global, but wr_ptr_global should only be set for Random Access types",
                    name, program
                )
            });
            findings.require(
                QueueSetting::is_set(&setting.rd_ptr_global) && QueueSetting::is_set(&setting.rd_ptr_local),
                || {
                    format!(
                        "queue={} in program={} queue_settings must set rd_ptr_global and rd_ptr_local for Queue types",
                        name, program
                    )
                },
            );
            findings.require(!(QueueSetting::is_true(&setting.epilogue) && queue.is_fed_by_op()), || {
                format!(
                    "The queue_settings for queue={} in program={} must not set 'epilogue: true'. It is not supported for a dram queue of 'type: queue' that is output of an operation.",
                    name, program
                )
            });
        }
        QueueType::Ram => {
            findings.require(!QueueSetting::is_set(&setting.rd_ptr_local), || {
                format!(
                    "queue={} in program={} queue_settings set rd_ptr_local, but rd_ptr_local should only be set for Queue types",
                    name, program
                )
            });
            findings.require(
                QueueSetting::is_set(&setting.rd_ptr_global) && QueueSetting::is_set(&setting.wr_ptr_global),
                || {
                    format!(
                        "queue={} in program={} queue_settings must set rd_ptr_global and wr_ptr_global for Random Access types",
                        name, program
                    )
                },
            );
        }
    }

    let local = autoinc(&setting.rd_ptr_autoinc);
    let global = autoinc(&setting.global_rdptr_autoinc);
    if local != "0" && global != "0" {
        findings.require(local == global, || {
            format!(
                "queue={} in program={} queue_settings set rd_ptr_autoinc={} and global_rdptr_autoinc={}, but local and global autoinc must be the same when global_rdptr_autoinc is set",
                name, program, local, global
            )
        });
    }
}

fn check_param_placement(program: &ProgramInfo, findings: &mut Findings) {
    let misplaced = program
        .instructions
        .iter()
        .enumerate()
        .any(|(pc, instruction)| pc != 0 && matches!(instruction, Instruction::Param(_)));
    findings.require(!misplaced, || {
        format!(
            "Param Instruction must be first instruction in program={} if it exists",
            program.name
        )
    });
}

fn check_loop_nesting(program: &ProgramInfo, findings: &mut Findings) {
    let mut open: Vec<usize> = Vec::new();
    for (pc, instruction) in program.instructions.iter().enumerate() {
        match instruction {
            Instruction::Loop(_) => open.push(pc),
            Instruction::EndLoop => {
                findings.require(open.pop().is_some(), || {
                    format!("Unexpected EndLoop at program: {} pc: {}", program.name, pc)
                });
            }
            _ => {}
        }
    }
    for pc in open {
        findings.push(format!(
            "Loop at program: {} pc: {} has no matching EndLoop",
            program.name, pc
        ));
    }
}

/// Variables are declared once and before any use. Queue-setting fields
/// holding a `$name` count as uses.
fn check_variables(program: &ProgramInfo, findings: &mut Findings) {
    let mut declared: BTreeSet<&str> = BTreeSet::new();
    let require_declared = |declared: &BTreeSet<&str>, name: &str, pc: usize, findings: &mut Findings| {
        findings.require(declared.contains(name), || {
            format!(
                "Accessing an uninitialized variable {} in program={} pc: {}",
                name, program.name, pc
            )
        });
    };

    for (pc, instruction) in program.instructions.iter().enumerate() {
        let declarations: Vec<&str> = match instruction {
            Instruction::Var(vars) | Instruction::StaticVar(vars) => {
                vars.iter().map(|(name, _)| name.as_str()).collect()
            }
            Instruction::Param(names) => names.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        };
        for name in declarations {
            findings.require(declared.insert(name), || {
                format!(
                    "Variable={} declaration in program={} masks a previous declaration",
                    name, program.name
                )
            });
        }

        match instruction {
            Instruction::VarInst { dest, sources, .. } => {
                require_declared(&declared, dest, pc, findings);
                for source in sources {
                    if let Operand::Var(name) = source {
                        require_declared(&declared, name, pc, findings);
                    }
                }
            }
            Instruction::Loop(Operand::Var(name)) => require_declared(&declared, name, pc, findings),
            Instruction::Execute(execute) => {
                for setting in &execute.queue_settings {
                    for value in setting_values(setting) {
                        if value.starts_with('$') {
                            require_declared(&declared, value, pc, findings);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn setting_values(setting: &QueueSetting) -> impl Iterator<Item = &str> {
    [
        &setting.prologue,
        &setting.epilogue,
        &setting.zero,
        &setting.rd_ptr_local,
        &setting.rd_ptr_global,
        &setting.wr_ptr_global,
        &setting.rd_ptr_autoinc,
        &setting.global_rdptr_autoinc,
        &setting.global_wrptr_autoinc,
        &setting.read_only,
    ]
    .into_iter()
    .filter_map(|field| field.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::testutil;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn program_error(source: Value) -> String {
        match testutil::compile(source).unwrap_err() {
            CompileError::LegalityError { rule, message } => {
                assert_eq!(rule, RULE);
                message
            }
            other => panic!("expected a program error, got {}", other),
        }
    }

    fn q0_setting(source: &mut Value) -> &mut Value {
        &mut source["programs"][0]["main"][1]["execute"]["queue_settings"]["q0"]
    }

    fn main_trace(source: &mut Value) -> &mut Vec<Value> {
        source["programs"][0]["main"].as_array_mut().unwrap()
    }

    #[test]
    fn test_simple_pipeline_is_legal() {
        let netlist = testutil::compile(testutil::simple_pipeline("wormhole_b0")).unwrap();
        assert!(ProgramRule.check(&netlist).is_empty());
    }

    #[test]
    fn test_queue_needs_both_read_pointers() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        q0_setting(&mut source).as_object_mut().unwrap().remove("rd_ptr_global");
        assert_eq!(
            program_error(source),
            "queue=q0 in program=main queue_settings must set rd_ptr_global and rd_ptr_local for Queue types"
        );
    }

    #[test]
    fn test_ram_rejects_local_read_pointer() {
        let mut source = testutil::two_graph_pipeline("wormhole_b0", 0, 1);
        source["programs"][0]["main"][0]["execute"]["queue_settings"] = json!({
            "q_in": { "prologue": true, "epilogue": false, "zero": false,
                      "rd_ptr_local": "0", "rd_ptr_global": "0", "wr_ptr_global": "0" }
        });
        assert_eq!(
            program_error(source),
            "queue=q_in in program=main queue_settings set rd_ptr_local, but rd_ptr_local should only be set for Queue types"
        );
    }

    #[test]
    fn test_epilogue_on_op_fed_queue() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        source["programs"][0]["main"][1]["execute"]["queue_settings"]["q1"] = json!({
            "prologue": false, "epilogue": true, "zero": false,
            "rd_ptr_local": "$lptr", "rd_ptr_global": "$gptr"
        });
        assert!(program_error(source).starts_with("The queue_settings for queue=q1 in program=main must not set 'epilogue: true'"));
    }

    #[test]
    fn test_autoinc_checked_only_when_both_nonzero() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        q0_setting(&mut source)["rd_ptr_autoinc"] = json!("0");
        q0_setting(&mut source)["global_rdptr_autoinc"] = json!("2");
        assert!(testutil::compile(source.clone()).is_ok());

        q0_setting(&mut source)["rd_ptr_autoinc"] = json!("1");
        assert_eq!(
            program_error(source),
            "queue=q0 in program=main queue_settings set rd_ptr_autoinc=1 and global_rdptr_autoinc=2, but local and global autoinc must be the same when global_rdptr_autoinc is set"
        );
    }

    #[test]
    fn test_param_must_come_first() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        main_trace(&mut source).push(json!({ "param": ["$count"] }));
        assert_eq!(
            program_error(source),
            "Param Instruction must be first instruction in program=main if it exists"
        );
    }

    #[test]
    fn test_unbalanced_loops() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        main_trace(&mut source).push(json!("endloop"));
        assert_eq!(program_error(source), "Unexpected EndLoop at program: main pc: 3");

        let mut source = testutil::simple_pipeline("wormhole_b0");
        main_trace(&mut source).insert(1, json!({ "loop": 2 }));
        assert_eq!(program_error(source), "Loop at program: main pc: 1 has no matching EndLoop");
    }

    #[test]
    fn test_undeclared_variable() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        main_trace(&mut source).push(json!({ "varinst": ["$missing", "inc", 1] }));
        assert_eq!(
            program_error(source),
            "Accessing an uninitialized variable $missing in program=main pc: 3"
        );
    }

    #[test]
    fn test_redeclared_variable() {
        let mut source = testutil::simple_pipeline("wormhole_b0");
        main_trace(&mut source).push(json!({ "staticvar": { "$gptr": 0 } }));
        assert_eq!(
            program_error(source),
            "Variable=$gptr declaration in program=main masks a previous declaration"
        );
    }
}
