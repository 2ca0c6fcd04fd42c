/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Code generation. One walk over the parsed lines allocates storages and
//! records symbols, resolving forward references through the model's
//! dependency graph; the convergence loop then re-walks until every
//! variable-length direct instruction is stable.

pub mod binary_writer;
pub mod eval;
pub mod listing_writer;
pub mod model;
pub mod transputer;

use crate::assembler::eval::Evaluation;
use crate::assembler::model::{AssemblyModel, Endianness};
use crate::ast::{Expression, Processor, Statement, UnaryOp};
use crate::errors::{AssemblyError, ErrorList};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IfArm {
    Outside,
    If1,
    Else,
}

/// Run the full code generation over the model's lines: first pass, then the
/// convergence loop, then the final resolution checks.
pub fn generate(model: &mut AssemblyModel) -> Result<(), ErrorList> {
    first_pass(model)?;
    converge(model)
}

fn first_pass(model: &mut AssemblyModel) -> Result<(), ErrorList> {
    let end_line = walk(model, true);
    if end_line.is_none() {
        model.errors.push(AssemblyError::Convergence {
            reason: "program has no END statement".to_string(),
        });
    }
    if !model.errors.is_empty() {
        return Err(model.errors.clone());
    }
    debug!(
        "first pass: {} storage(s), {} direct instruction(s), $ = {:#010X}",
        model.storage_count(),
        model.direct_instruction_count(),
        model.dollar() as u32
    );
    Ok(())
}

/// Iterate until a fixed point: labels cleared and re-bound, variables
/// replayed, storages re-evaluated in place, direct instruction lengths
/// grown as needed. The iteration cap is a safety net only; length growth is
/// monotone so the loop terminates.
fn converge(model: &mut AssemblyModel) -> Result<(), ErrorList> {
    let cap = model.direct_instruction_count() * 5 + 10;
    let mut previous = model.fingerprint();
    let mut stable = false;
    for iteration in 1..=cap {
        model.begin_iteration();
        walk(model, false);
        if !model.errors.is_empty() {
            return Err(model.errors.clone());
        }
        let fingerprint = model.fingerprint();
        if !model.lengths_changed && fingerprint == previous {
            debug!("converged after {} iteration(s)", iteration);
            stable = true;
            break;
        }
        previous = fingerprint;
    }
    if !stable {
        let mut errors = ErrorList::new();
        errors.push(AssemblyError::Convergence {
            reason: format!("instruction lengths did not settle within {} iterations", cap),
        });
        return Err(errors);
    }
    let unresolved = model.unresolved_names();
    if !unresolved.is_empty() {
        let mut errors = ErrorList::new();
        errors.push(AssemblyError::Convergence {
            reason: format!(
                "symbol forward references remain unresolved: {}",
                unresolved
                    .iter()
                    .map(|n| n.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        });
        return Err(errors);
    }
    Ok(())
}

/// First code-generation walk over every line. Returns the END line when one
/// was seen.
fn walk(model: &mut AssemblyModel, first: bool) -> Option<usize> {
    let mut arm = IfArm::Outside;
    let mut end_line: Option<usize> = None;
    let count = model.lines.len();
    for i in 0..count {
        let label = model.lines[i].label.clone();
        let statement = model.lines[i].statement.clone();

        if end_line.is_some() {
            if !first {
                break;
            }
            if statement.is_some() {
                push_model_error(model, i, "statement after END".to_string());
            }
            continue;
        }

        // conditional-assembly gates are always interpreted
        match statement {
            Some(Statement::If1) => {
                bind_label(model, &label, i);
                if arm != IfArm::Outside {
                    push_model_error(model, i, "IF1 cannot nest".to_string());
                } else {
                    arm = IfArm::If1;
                }
                continue;
            }
            Some(Statement::Else) => {
                bind_label(model, &label, i);
                if arm != IfArm::If1 {
                    push_model_error(model, i, "ELSE without IF1".to_string());
                } else {
                    arm = IfArm::Else;
                }
                continue;
            }
            Some(Statement::Endif) => {
                bind_label(model, &label, i);
                if arm == IfArm::Outside {
                    push_model_error(model, i, "ENDIF without IF1".to_string());
                } else {
                    arm = IfArm::Outside;
                }
                continue;
            }
            _ => {}
        }

        let active = match arm {
            IfArm::Outside => true,
            IfArm::If1 => first,
            IfArm::Else => !first,
        };

        if !active {
            if arm == IfArm::If1 {
                // skipped on a re-walk: keep the layout without recomputing
                bind_label(model, &label, i);
                match statement {
                    Some(Statement::Org(ref expr)) => process_org(model, expr, i),
                    Some(Statement::Align(ref expr)) => process_align(model, expr, i),
                    _ => model.readdress_storage(i),
                }
            }
            continue;
        }

        bind_label(model, &label, i);

        let Some(statement) = statement else {
            continue;
        };
        match statement {
            Statement::Title(text) => model.title = text,
            Statement::Page(rows, cols) => {
                model.page_rows = rows;
                model.page_cols = cols;
            }
            Statement::Processor(processor) => {
                model.processor = Some(processor);
                match processor {
                    Processor::I386 | Processor::Transputer => {
                        model.endianness = Endianness::Little;
                    }
                }
            }
            Statement::Org(ref expr) => process_org(model, expr, i),
            Statement::Align(ref expr) => process_align(model, expr, i),
            Statement::End(ref expr) => {
                end_line = Some(i);
                if let Some(expr) = expr {
                    let bound = bind_offsets(expr, model.dollar());
                    match eval::evaluate(&bound, model, model.dollar()) {
                        Ok(Evaluation::Value(v)) => model.entry_point = Some(v),
                        Ok(Evaluation::Undefined(_)) => {
                            push_model_error(
                                model,
                                i,
                                "unresolved symbol in END expression".to_string(),
                            );
                        }
                        Err(reason) => push_model_error(model, i, reason),
                    }
                }
            }
            Statement::ConstantAssignment(ref name, ref expr) => {
                let bound = bind_offsets(expr, model.dollar());
                if let Err(e) = model.set_constant(name, &bound, i) {
                    model.errors.push(e);
                }
            }
            Statement::VariableAssignment(ref name, ref expr) => {
                let bound = bind_offsets(expr, model.dollar());
                if let Err(e) = model.set_variable(name, &bound, i) {
                    model.errors.push(e);
                }
            }
            Statement::Data(width, ref exprs) => {
                let dollar = model.dollar();
                let bound = exprs.iter().map(|e| bind_offsets(e, dollar)).collect();
                if let Err(e) = model.upsert_data(i, width, bound) {
                    model.errors.push(e);
                }
            }
            Statement::DataDup(width, ref count, ref repeated) => {
                let dollar = model.dollar();
                let count = bind_offsets(count, dollar);
                let repeated = bind_offsets(repeated, dollar);
                if let Err(e) = model.upsert_dup(i, width, &count, repeated) {
                    model.errors.push(e);
                }
            }
            Statement::DirectInstruction(ref instruction) => {
                let dollar = model.dollar();
                let bound = if instruction.is_branch() {
                    // branch operands become self-relative distances
                    Expression::unary(
                        UnaryOp::OffsetFrom(dollar),
                        bind_offsets(&instruction.expr, dollar),
                    )
                } else {
                    bind_offsets(&instruction.expr, dollar)
                };
                if let Err(e) = model.upsert_direct(
                    i,
                    instruction.mnemonic,
                    instruction.op,
                    instruction.is_branch(),
                    bound,
                ) {
                    model.errors.push(e);
                }
            }
            Statement::DirectEncodedInstruction(_, ref bytes)
            | Statement::IndirectInstruction(_, ref bytes) => {
                if let Err(e) = model.upsert_bytes(i, bytes) {
                    model.errors.push(e);
                }
            }
            Statement::Include(_)
            | Statement::MacroStart(_, _)
            | Statement::MacroBody(_)
            | Statement::MacroEnd
            | Statement::MacroInvocation(_, _)
            | Statement::Ignored => {}
            Statement::If1 | Statement::Else | Statement::Endif => unreachable!(),
        }
    }
    if first && arm != IfArm::Outside && count > 0 {
        push_model_error(model, count - 1, "IF1 without matching ENDIF".to_string());
    }
    end_line
}

fn bind_label(model: &mut AssemblyModel, label: &Option<crate::ast::CasedName>, line_index: usize) {
    if let Some(name) = label {
        let dollar = model.dollar();
        if let Err(e) = model.set_label(name, dollar, line_index) {
            model.errors.push(e);
        }
    }
}

fn process_org(model: &mut AssemblyModel, expr: &Expression, line_index: usize) {
    let bound = bind_offsets(expr, model.dollar());
    match eval::evaluate(&bound, model, model.dollar()) {
        Ok(Evaluation::Value(v)) => model.set_dollar(v),
        Ok(Evaluation::Undefined(_)) => {
            push_model_error(model, line_index, "forward reference in ORG".to_string());
        }
        Err(reason) => push_model_error(model, line_index, reason),
    }
}

fn process_align(model: &mut AssemblyModel, expr: &Expression, line_index: usize) {
    let bound = bind_offsets(expr, model.dollar());
    match eval::evaluate(&bound, model, model.dollar()) {
        Ok(Evaluation::Value(n)) if n > 0 => {
            // signed arithmetic on purpose: addresses with the top bit set
            // still align toward the next multiple
            let dollar = model.dollar();
            let aligned = dollar
                .wrapping_add(n - 1)
                .wrapping_div(n)
                .wrapping_mul(n);
            model.set_dollar(aligned);
        }
        Ok(Evaluation::Value(_)) => {
            push_model_error(
                model,
                line_index,
                "ALIGN value must be greater than zero".to_string(),
            );
        }
        Ok(Evaluation::Undefined(_)) => {
            push_model_error(model, line_index, "forward reference in ALIGN".to_string());
        }
        Err(reason) => push_model_error(model, line_index, reason),
    }
}

fn push_model_error(model: &mut AssemblyModel, line_index: usize, reason: String) {
    let location = model.lines[line_index].location.clone();
    model.errors.push(AssemblyError::Model { location, reason });
}

/// The offset transformer: rewrite every `Offset` placeholder into
/// `OffsetFrom` with the location counter at statement time, so the base
/// survives later re-evaluations.
fn bind_offsets(expr: &Expression, base: i32) -> Expression {
    match expr {
        Expression::Unary(UnaryOp::Offset, inner) => {
            Expression::unary(UnaryOp::OffsetFrom(base), bind_offsets(inner, base))
        }
        Expression::Unary(op, inner) => Expression::unary(*op, bind_offsets(inner, base)),
        Expression::Binary(op, lhs, rhs) => {
            Expression::binary(*op, bind_offsets(lhs, base), bind_offsets(rhs, base))
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        CasePolicy, CasedName, CellWidth, DirectInstruction, Line, SourceLocation,
    };

    fn line(number: u32, statement: Option<Statement>) -> Line {
        let mut line = Line::new(SourceLocation::new("test.asm", number), "");
        line.statement = statement;
        line
    }

    fn labeled(number: u32, label: &str, statement: Option<Statement>) -> Line {
        let mut l = line(number, statement);
        l.label = Some(CasedName::new(label, CasePolicy::Insensitive));
        l
    }

    fn run(lines: Vec<Line>) -> Result<AssemblyModel, ErrorList> {
        let mut model = AssemblyModel::new(CasePolicy::Insensitive);
        model.set_lines(lines);
        generate(&mut model).map(|_| model)
    }

    fn direct(mnemonic: &'static str, op: u8, expr: Expression) -> Statement {
        Statement::DirectInstruction(DirectInstruction { mnemonic, op, expr })
    }

    fn sym(name: &str) -> Expression {
        Expression::SymbolRef(CasedName::new(name, CasePolicy::Insensitive))
    }

    #[test]
    fn test_missing_end_rejected() {
        let err = run(vec![line(
            1,
            Some(Statement::Data(CellWidth::Byte, vec![Expression::Number(1)])),
        )])
        .unwrap_err();
        assert!(err.to_string().contains("no END"));
    }

    #[test]
    fn test_statement_after_end_rejected() {
        let err = run(vec![
            line(1, Some(Statement::End(None))),
            line(2, Some(Statement::Data(CellWidth::Byte, vec![Expression::Number(1)]))),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("after END"));
    }

    #[test]
    fn test_forward_branch_encodes_short() {
        // J TARGET with TARGET fifteen bytes beyond the jump's end
        let mut lines = vec![
            line(1, Some(Statement::Processor(Processor::Transputer))),
            line(2, Some(direct("j", 0x0, sym("TARGET")))),
        ];
        for n in 0..3 {
            lines.push(line(
                3 + n,
                Some(Statement::DataDup(
                    CellWidth::Byte,
                    Expression::Number(5),
                    Expression::Number(0),
                )),
            ));
        }
        lines.push(labeled(6, "TARGET", None));
        lines.push(line(7, Some(Statement::End(None))));

        let model = run(lines).unwrap();
        let storage = model.storage(model.storage_index_for_line(1).unwrap());
        assert_eq!(storage.length, 1);
        assert_eq!(storage.data, vec![0x0F]);
    }

    #[test]
    fn test_forward_branch_grows_and_shifts() {
        // sixteen bytes between the jump and its target force a two-byte
        // encoding, which shifts the target label
        let lines = vec![
            line(1, Some(Statement::Processor(Processor::Transputer))),
            line(2, Some(direct("j", 0x0, sym("TARGET")))),
            line(
                3,
                Some(Statement::DataDup(
                    CellWidth::Byte,
                    Expression::Number(16),
                    Expression::Number(0),
                )),
            ),
            labeled(4, "TARGET", Some(Statement::Data(CellWidth::Byte, vec![Expression::Number(0xAA)]))),
            line(5, Some(Statement::End(None))),
        ];

        let model = run(lines).unwrap();
        let jump = model.storage(model.storage_index_for_line(1).unwrap());
        assert_eq!(jump.length, 2);
        // the growth shifts TARGET to 18, so the final operand is 16
        assert_eq!(jump.data, vec![0x21, 0x00]);
        let target = model
            .symbol(&CasedName::new("TARGET", CasePolicy::Insensitive))
            .unwrap();
        assert_eq!(target.value, Some(18));
    }

    #[test]
    fn test_if1_else_arms() {
        let lines = vec![
            line(1, Some(Statement::If1)),
            line(2, Some(Statement::Data(CellWidth::Byte, vec![Expression::Number(1)]))),
            line(3, Some(Statement::Else)),
            line(4, Some(Statement::Data(CellWidth::Byte, vec![Expression::Number(2)]))),
            line(5, Some(Statement::Endif)),
            line(6, Some(Statement::End(None))),
        ];
        let model = run(lines).unwrap();
        let first = model.storage(model.storage_index_for_line(1).unwrap());
        let second = model.storage(model.storage_index_for_line(3).unwrap());
        assert_eq!(first.address, 0);
        assert_eq!(first.data, vec![1]);
        assert_eq!(second.address, 1);
        assert_eq!(second.data, vec![2]);
    }

    #[test]
    fn test_mismatched_endif_rejected() {
        let err = run(vec![
            line(1, Some(Statement::Endif)),
            line(2, Some(Statement::End(None))),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("ENDIF without IF1"));
    }

    #[test]
    fn test_unresolved_reference_fails() {
        let err = run(vec![
            line(1, Some(Statement::Data(CellWidth::Byte, vec![sym("NOWHERE")]))),
            line(2, Some(Statement::End(None))),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("NOWHERE"));
    }

    #[test]
    fn test_align_advances_dollar() {
        let lines = vec![
            line(1, Some(Statement::Org(Expression::Number(0x40000001)))),
            line(2, Some(Statement::Align(Expression::Number(4)))),
            labeled(3, "HERE", None),
            line(4, Some(Statement::End(None))),
        ];
        let model = run(lines).unwrap();
        let here = model
            .symbol(&CasedName::new("HERE", CasePolicy::Insensitive))
            .unwrap();
        assert_eq!(here.value, Some(0x40000004));
    }

    #[test]
    fn test_align_with_top_bit_set() {
        let lines = vec![
            line(1, Some(Statement::Org(Expression::Number(0x80000001u32 as i32)))),
            line(2, Some(Statement::Align(Expression::Number(4)))),
            labeled(3, "HERE", None),
            line(4, Some(Statement::End(None))),
        ];
        let model = run(lines).unwrap();
        let here = model
            .symbol(&CasedName::new("HERE", CasePolicy::Insensitive))
            .unwrap();
        assert_eq!(here.value.map(|v| v as u32), Some(0x80000004));
    }

    #[test]
    fn test_offset_binding_preserves_base() {
        let expr = Expression::unary(UnaryOp::Offset, sym("X"));
        let bound = bind_offsets(&expr, 0x100);
        match bound {
            Expression::Unary(UnaryOp::OffsetFrom(base), _) => assert_eq!(base, 0x100),
            other => panic!("unexpected {:?}", other),
        }
    }
}
