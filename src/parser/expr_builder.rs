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

use crate::ast::{BinaryOp, CasePolicy, CasedName, Expression, UnaryOp};
use crate::parser::Rule;
use pest::iterators::Pair;

/// Build an expression tree from a pest pair. Binary operator chains fold
/// left-associatively.
pub fn build_expression(pair: Pair<Rule>, policy: CasePolicy) -> Result<Expression, String> {
    match pair.as_rule() {
        Rule::expression => build_expression(first_inner(pair), policy),
        Rule::or_expr => build_binary_chain(pair, policy, |op| match op.as_rule() {
            Rule::kw_xor => BinaryOp::Xor,
            _ => BinaryOp::Or,
        }),
        Rule::and_expr => build_binary_chain(pair, policy, |_| BinaryOp::And),
        Rule::not_expr => {
            let mut inner = pair.into_inner();
            let head = inner.next().unwrap();
            if head.as_rule() == Rule::kw_not {
                let operand = build_expression(inner.next().unwrap(), policy)?;
                Ok(Expression::unary(UnaryOp::Not, operand))
            } else {
                build_expression(head, policy)
            }
        }
        Rule::add_expr => build_binary_chain(pair, policy, |op| match op.as_str() {
            "-" => BinaryOp::Sub,
            _ => BinaryOp::Add,
        }),
        Rule::mul_expr => build_binary_chain(pair, policy, |op| {
            match op.as_str().to_ascii_uppercase().as_str() {
                "*" => BinaryOp::Mult,
                "/" => BinaryOp::Div,
                "SHL" => BinaryOp::ShiftLeft,
                _ => BinaryOp::ShiftRight,
            }
        }),
        Rule::unary_expr => {
            let mut inner = pair.into_inner();
            let head = inner.next().unwrap();
            if head.as_rule() == Rule::unary_op {
                let operand = build_expression(inner.next().unwrap(), policy)?;
                match head.as_str().to_ascii_uppercase().as_str() {
                    "+" => Ok(operand),
                    "-" => Ok(Expression::unary(UnaryOp::Negate, operand)),
                    _ => Ok(Expression::unary(UnaryOp::Offset, operand)),
                }
            } else {
                build_expression(head, policy)
            }
        }
        Rule::primary => {
            let inner = first_inner(pair);
            match inner.as_rule() {
                Rule::number => build_number(inner),
                Rule::string => Ok(Expression::Characters(string_contents(inner.as_str()))),
                Rule::identifier => Ok(Expression::SymbolRef(CasedName::new(
                    inner.as_str(),
                    policy,
                ))),
                Rule::expression => build_expression(inner, policy),
                other => unreachable!("unexpected primary rule {:?}", other),
            }
        }
        other => unreachable!("unexpected expression rule {:?}", other),
    }
}

/// Integer literal: decimal, 0x-prefixed hex, or H-suffixed hex. Parsed as
/// 64-bit and masked to 32 so 0xFFFFFFFF stays representable.
pub fn build_number(pair: Pair<Rule>) -> Result<Expression, String> {
    let inner = first_inner(pair);
    let text = inner.as_str();
    let parsed = match inner.as_rule() {
        Rule::hex_number => {
            let digits = if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                rest
            } else {
                &text[..text.len() - 1]
            };
            i64::from_str_radix(digits, 16)
        }
        _ => text.parse::<i64>(),
    };
    match parsed {
        Ok(value) => Ok(Expression::Number((value & 0xFFFF_FFFF) as u32 as i32)),
        Err(_) => Err(format!("number out of range: {}", text)),
    }
}

fn build_binary_chain(
    pair: Pair<Rule>,
    policy: CasePolicy,
    to_op: impl Fn(&Pair<Rule>) -> BinaryOp,
) -> Result<Expression, String> {
    let mut inner = pair.into_inner();
    let mut acc = build_expression(inner.next().unwrap(), policy)?;
    while let Some(op_pair) = inner.next() {
        let op = to_op(&op_pair);
        let rhs = build_expression(inner.next().unwrap(), policy)?;
        acc = Expression::binary(op, acc, rhs);
    }
    Ok(acc)
}

fn first_inner(pair: Pair<Rule>) -> Pair<Rule> {
    pair.into_inner().next().unwrap()
}

fn string_contents(quoted: &str) -> String {
    quoted[1..quoted.len() - 1].to_string()
}
