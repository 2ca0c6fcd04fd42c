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

use crate::ast::{BinaryOp, CasedName, Expression, UnaryOp};
use std::collections::BTreeSet;

/// Source of current symbol values during evaluation.
pub trait SymbolLookup {
    fn symbol_value(&self, name: &CasedName) -> Option<i32>;
}

/// Either a 32-bit value or the set of symbols that kept the expression from
/// resolving. All arithmetic wraps modulo 2^32; shifts and bitwise operators
/// work on the 32-bit pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Value(i32),
    Undefined(BTreeSet<CasedName>),
}

/// Evaluate an expression against current symbol values. `dollar` is the
/// value of `$` for this evaluation: the location counter at statement time,
/// or the owning storage's recorded address on re-evaluation.
pub fn evaluate(
    expr: &Expression,
    symbols: &dyn SymbolLookup,
    dollar: i32,
) -> Result<Evaluation, String> {
    match expr {
        Expression::Number(n) => Ok(Evaluation::Value(*n)),
        Expression::Characters(_) => {
            Err("character expression not allowed here".to_string())
        }
        Expression::SymbolRef(name) => {
            if name.as_str() == "$" {
                return Ok(Evaluation::Value(dollar));
            }
            match symbols.symbol_value(name) {
                Some(value) => Ok(Evaluation::Value(value)),
                None => {
                    let mut undefined = BTreeSet::new();
                    undefined.insert(name.clone());
                    Ok(Evaluation::Undefined(undefined))
                }
            }
        }
        Expression::Unary(op, inner) => {
            let inner = evaluate(inner, symbols, dollar)?;
            let value = match inner {
                Evaluation::Value(v) => v,
                undefined => return Ok(undefined),
            };
            let result = match op {
                UnaryOp::Negate => value.wrapping_neg(),
                UnaryOp::Not => !value,
                // Offset is normally rewritten to OffsetFrom before it gets
                // here; fall back to the current evaluation's dollar.
                UnaryOp::Offset => value.wrapping_sub(dollar),
                UnaryOp::OffsetFrom(base) => value.wrapping_sub(*base),
            };
            Ok(Evaluation::Value(result))
        }
        Expression::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, symbols, dollar)?;
            let rhs = evaluate(rhs, symbols, dollar)?;
            let (l, r) = match (lhs, rhs) {
                (Evaluation::Value(l), Evaluation::Value(r)) => (l, r),
                (Evaluation::Undefined(a), Evaluation::Undefined(b)) => {
                    return Ok(Evaluation::Undefined(a.union(&b).cloned().collect()));
                }
                (Evaluation::Undefined(a), _) | (_, Evaluation::Undefined(a)) => {
                    return Ok(Evaluation::Undefined(a));
                }
            };
            let result = match op {
                BinaryOp::Add => l.wrapping_add(r),
                BinaryOp::Sub => l.wrapping_sub(r),
                BinaryOp::Mult => l.wrapping_mul(r),
                BinaryOp::Div => {
                    if r == 0 {
                        return Err("division by zero".to_string());
                    }
                    l.wrapping_div(r)
                }
                BinaryOp::ShiftLeft => ((l as u32).wrapping_shl(r as u32)) as i32,
                BinaryOp::ShiftRight => ((l as u32).wrapping_shr(r as u32)) as i32,
                BinaryOp::And => l & r,
                BinaryOp::Or => l | r,
                BinaryOp::Xor => l ^ r,
            };
            Ok(Evaluation::Value(result))
        }
    }
}

/// Collect every symbol name the expression references syntactically, `$`
/// excluded. Used to wire dependency edges.
pub fn references(expr: &Expression, out: &mut BTreeSet<CasedName>) {
    match expr {
        Expression::Number(_) | Expression::Characters(_) => {}
        Expression::SymbolRef(name) => {
            if name.as_str() != "$" {
                out.insert(name.clone());
            }
        }
        Expression::Unary(_, inner) => references(inner, out),
        Expression::Binary(_, lhs, rhs) => {
            references(lhs, out);
            references(rhs, out);
        }
    }
}
