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

//! Statement parser: raw source lines in, `Line` records out. Macro bodies
//! are captured and invocations expanded through the macro manager, with the
//! expanded text fed back through this parser; INCLUDE pushes onto the
//! source stream as a side channel.

mod expr_builder;

use crate::assembler::transputer;
use crate::ast::{
    CasePolicy, CasedName, CellWidth, DirectInstruction, Expression, Line, Processor,
    SourceLocation, Statement,
};
use crate::errors::{AssemblyError, ErrorList};
use crate::file_reader::FileReader;
use crate::macro_manager::MacroManager;
use crate::source_stream::SourceStream;
use log::{debug, trace};
use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

// Derive the parser from our grammar file.
#[derive(Parser)]
#[grammar = "grammar.pest"]
pub struct LineGrammar;

const MAX_EXPANSION_DEPTH: usize = 64;

// directive keywords with grammar rules; reaching the generic statement with
// one of these means its argument list was missing or malformed
const DIRECTIVE_KEYWORDS: &[&str] = &["ORG", "ALIGN", "INCLUDE", "PAGE", "DB", "DW", "DD", "TITLE"];

enum Resolved {
    Statement(Statement),
    Invocation(CasedName, Vec<String>),
}

pub struct SourceParser {
    policy: CasePolicy,
    macros: MacroManager,
    processor: Option<Processor>,
}

impl SourceParser {
    pub fn new(policy: CasePolicy) -> Self {
        SourceParser {
            policy,
            macros: MacroManager::new(policy),
            processor: None,
        }
    }

    pub fn macros(&self) -> &MacroManager {
        &self.macros
    }

    /// Drain the stream into parsed lines, accumulating every parse error so
    /// they can all be reported before code generation is attempted.
    pub fn parse_program<F: FileReader>(
        &mut self,
        stream: &mut SourceStream<'_, F>,
    ) -> (Vec<Line>, ErrorList) {
        let mut lines = Vec::new();
        let mut errors = ErrorList::new();
        let mut last_location = SourceLocation::new("", 0);
        while let Some(item) = stream.next_item() {
            last_location = item.location.clone();
            self.parse_text(&item.location, &item.text, stream, &mut lines, &mut errors, 0);
        }
        if self.macros.is_defining() {
            errors.push(AssemblyError::Macro {
                location: last_location,
                reason: "macro definition not closed with ENDM".to_string(),
            });
        }
        (lines, errors)
    }

    fn parse_text<F: FileReader>(
        &mut self,
        location: &SourceLocation,
        raw: &str,
        stream: &mut SourceStream<'_, F>,
        out: &mut Vec<Line>,
        errors: &mut ErrorList,
        depth: usize,
    ) {
        trace!("{}: {}", location, raw);
        if depth > MAX_EXPANSION_DEPTH {
            errors.push(AssemblyError::Macro {
                location: location.clone(),
                reason: "macro expansion nested too deeply".to_string(),
            });
            return;
        }

        if self.macros.is_defining() {
            self.capture_macro_body(location, raw, out, errors);
            return;
        }

        let (label, parsed) = match self.parse_line(location, raw) {
            Ok(pair) => pair,
            Err(e) => {
                errors.push(e);
                let mut line = Line::new(location.clone(), raw);
                line.statement = Some(Statement::Ignored);
                out.push(line);
                return;
            }
        };

        match parsed {
            None => {
                let mut line = Line::new(location.clone(), raw);
                line.label = label;
                out.push(line);
            }
            Some(Resolved::Statement(statement)) => {
                self.apply_side_effects(location, &statement, stream, errors);
                let mut line = Line::new(location.clone(), raw);
                line.label = label;
                line.statement = Some(statement);
                out.push(line);
            }
            Some(Resolved::Invocation(name, arguments)) => {
                self.expand_invocation(
                    location, raw, label, &name, &arguments, stream, out, errors, depth,
                );
            }
        }
    }

    /// Inside a macro body only ENDM is interpreted; a nested MACRO is
    /// rejected and everything else is recorded verbatim.
    fn capture_macro_body(
        &mut self,
        location: &SourceLocation,
        raw: &str,
        out: &mut Vec<Line>,
        errors: &mut ErrorList,
    ) {
        let tokens: Vec<&str> = strip_comment(raw).split_whitespace().collect();
        let first = tokens.first().copied().unwrap_or("");
        let second = tokens.get(1).copied().unwrap_or("");

        if first.eq_ignore_ascii_case("ENDM") {
            match self.macros.end_macro() {
                Ok(_) => {
                    let mut line = Line::new(location.clone(), raw);
                    line.statement = Some(Statement::MacroEnd);
                    out.push(line);
                }
                Err(reason) => errors.push(AssemblyError::Macro {
                    location: location.clone(),
                    reason,
                }),
            }
            return;
        }
        if first.eq_ignore_ascii_case("MACRO") || second.eq_ignore_ascii_case("MACRO") {
            errors.push(AssemblyError::Macro {
                location: location.clone(),
                reason: "macro definitions cannot nest".to_string(),
            });
            return;
        }
        if let Err(reason) = self.macros.add_macro_line(raw) {
            errors.push(AssemblyError::Macro {
                location: location.clone(),
                reason,
            });
            return;
        }
        let mut line = Line::new(location.clone(), raw);
        line.statement = Some(Statement::MacroBody(raw.to_string()));
        out.push(line);
    }

    fn expand_invocation<F: FileReader>(
        &mut self,
        location: &SourceLocation,
        raw: &str,
        label: Option<CasedName>,
        name: &CasedName,
        arguments: &[String],
        stream: &mut SourceStream<'_, F>,
        out: &mut Vec<Line>,
        errors: &mut ErrorList,
        depth: usize,
    ) {
        let expanded = match self.macros.expand(name.as_str(), arguments) {
            Ok(lines) => lines,
            Err(reason) => {
                errors.push(AssemblyError::Macro {
                    location: location.clone(),
                    reason,
                });
                return;
            }
        };
        debug!("{}: expanding macro {} ({} args)", location, name, arguments.len());

        // The invocation itself carries no label downstream; it transfers to
        // the first expanded line.
        let mut line = Line::new(location.clone(), raw);
        line.statement = Some(Statement::MacroInvocation(name.clone(), arguments.to_vec()));
        out.push(line);

        let expansion_start = out.len();
        for text in expanded {
            let cleaned = strip_trailing_double_comment(&text);
            self.parse_text(location, &cleaned, stream, out, errors, depth + 1);
        }

        if let Some(label) = label {
            match out.get_mut(expansion_start) {
                Some(first) if first.label.is_none() => first.label = Some(label),
                Some(_) => errors.push(AssemblyError::Macro {
                    location: location.clone(),
                    reason: format!(
                        "label on invocation of '{}' collides with a label in its body",
                        name
                    ),
                }),
                None => {
                    // empty expansion; keep the label on the invocation line
                    out.last_mut().unwrap().label = Some(label);
                }
            }
        }
    }

    fn apply_side_effects<F: FileReader>(
        &mut self,
        location: &SourceLocation,
        statement: &Statement,
        stream: &mut SourceStream<'_, F>,
        errors: &mut ErrorList,
    ) {
        match statement {
            Statement::Processor(p) => self.processor = Some(*p),
            Statement::MacroStart(name, params) => {
                if let Err(reason) = self.macros.start_macro(name.as_str(), params) {
                    errors.push(AssemblyError::Macro {
                        location: location.clone(),
                        reason,
                    });
                }
            }
            Statement::MacroEnd => {
                errors.push(AssemblyError::Macro {
                    location: location.clone(),
                    reason: "ENDM without a macro definition".to_string(),
                });
            }
            Statement::Include(path) => {
                if let Err(e) = stream.push_include(path) {
                    errors.push(match e {
                        AssemblyError::Io { reason } => AssemblyError::Io {
                            reason: format!("{}: {}", location, reason),
                        },
                        other => other,
                    });
                }
            }
            _ => {}
        }
    }

    /// One raw line through the grammar: optional label, optional statement.
    fn parse_line(
        &self,
        location: &SourceLocation,
        raw: &str,
    ) -> Result<(Option<CasedName>, Option<Resolved>), AssemblyError> {
        let mut pairs = LineGrammar::parse(Rule::line, raw).map_err(|e| AssemblyError::Parse {
            location: location.clone(),
            reason: pest_reason(&e),
        })?;
        let line_pair = pairs.next().expect("line rule always produces a pair");

        let mut label = None;
        let mut resolved = None;
        for pair in line_pair.into_inner() {
            match pair.as_rule() {
                Rule::label => {
                    let name = pair.into_inner().next().unwrap().as_str();
                    label = Some(CasedName::new(name, self.policy));
                }
                Rule::statement => {
                    let inner = pair.into_inner().next().unwrap();
                    resolved = Some(self.build_statement(location, inner)?);
                }
                Rule::EOI => {}
                other => unreachable!("unexpected line rule {:?}", other),
            }
        }
        Ok((label, resolved))
    }

    fn build_statement(
        &self,
        location: &SourceLocation,
        pair: Pair<'_, Rule>,
    ) -> Result<Resolved, AssemblyError> {
        let parse_error = |reason: String| AssemblyError::Parse {
            location: location.clone(),
            reason,
        };
        let statement = match pair.as_rule() {
            Rule::title_stmt => {
                let text = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::to_eol)
                    .map(|p| p.as_str().trim().to_string())
                    .unwrap_or_default();
                Statement::Title(text)
            }
            Rule::page_stmt => {
                let mut numbers = pair.into_inner().filter(|p| p.as_rule() == Rule::number);
                let rows = number_value(numbers.next().unwrap()).map_err(&parse_error)?;
                let cols = number_value(numbers.next().unwrap()).map_err(&parse_error)?;
                if rows <= 0 || cols <= 0 {
                    return Err(parse_error("PAGE dimensions must be positive".to_string()));
                }
                Statement::Page(rows as usize, cols as usize)
            }
            Rule::proc_stmt => {
                let inner = pair.into_inner().next().unwrap();
                match inner.as_rule() {
                    Rule::proc_386 => Statement::Processor(Processor::I386),
                    _ => Statement::Processor(Processor::Transputer),
                }
            }
            Rule::align_stmt => {
                let expr = self.expression_in(pair).map_err(&parse_error)?;
                Statement::Align(expr)
            }
            Rule::org_stmt => {
                let expr = self.expression_in(pair).map_err(&parse_error)?;
                Statement::Org(expr)
            }
            Rule::end_stmt => {
                let expr = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::expression)
                    .map(|p| expr_builder::build_expression(p, self.policy))
                    .transpose()
                    .map_err(&parse_error)?;
                Statement::End(expr)
            }
            Rule::if1_stmt => Statement::If1,
            Rule::else_stmt => Statement::Else,
            Rule::endif_stmt => Statement::Endif,
            Rule::endm_stmt => Statement::MacroEnd,
            Rule::include_stmt => {
                let quoted = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::string)
                    .unwrap();
                let text = quoted.as_str();
                Statement::Include(text[1..text.len() - 1].to_string())
            }
            Rule::data_stmt => self.build_data(pair).map_err(&parse_error)?,
            Rule::const_stmt => {
                let mut inner = pair.into_inner();
                let name = inner.next().unwrap().as_str();
                let expr_pair = inner.find(|p| p.as_rule() == Rule::expression).unwrap();
                let expr =
                    expr_builder::build_expression(expr_pair, self.policy).map_err(&parse_error)?;
                Statement::ConstantAssignment(CasedName::new(name, self.policy), expr)
            }
            Rule::var_stmt => {
                let mut inner = pair.into_inner();
                let name = inner.next().unwrap().as_str();
                let expr_pair = inner.find(|p| p.as_rule() == Rule::expression).unwrap();
                let expr =
                    expr_builder::build_expression(expr_pair, self.policy).map_err(&parse_error)?;
                Statement::VariableAssignment(CasedName::new(name, self.policy), expr)
            }
            Rule::macro_stmt => {
                let mut inner = pair.into_inner();
                let name = inner.next().unwrap().as_str().to_string();
                let params = inner
                    .find(|p| p.as_rule() == Rule::macro_params)
                    .map(|p| {
                        p.into_inner()
                            .map(|ident| ident.as_str().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                Statement::MacroStart(CasedName::new(&name, self.policy), params)
            }
            Rule::generic_stmt => {
                let mut inner = pair.into_inner();
                let name = inner.next().unwrap().as_str();
                let args = inner
                    .find(|p| p.as_rule() == Rule::generic_args)
                    .map(|p| p.as_str().trim().to_string());
                return self.resolve_generic(location, name, args.as_deref());
            }
            other => unreachable!("unexpected statement rule {:?}", other),
        };
        Ok(Resolved::Statement(statement))
    }

    fn build_data(&self, pair: Pair<'_, Rule>) -> Result<Statement, String> {
        let mut inner = pair.into_inner();
        let keyword = inner.next().unwrap();
        let width = match keyword.as_rule() {
            Rule::kw_db => CellWidth::Byte,
            Rule::kw_dw => CellWidth::Word,
            _ => CellWidth::DWord,
        };
        let args = inner.next().unwrap().into_inner().next().unwrap();
        match args.as_rule() {
            Rule::dup_args => {
                let mut parts = args.into_inner().filter(|p| p.as_rule() == Rule::expression);
                let count = expr_builder::build_expression(parts.next().unwrap(), self.policy)?;
                let repeated = expr_builder::build_expression(parts.next().unwrap(), self.policy)?;
                Ok(Statement::DataDup(width, count, repeated))
            }
            _ => {
                let exprs = args
                    .into_inner()
                    .map(|p| expr_builder::build_expression(p, self.policy))
                    .collect::<Result<Vec<Expression>, String>>()?;
                Ok(Statement::Data(width, exprs))
            }
        }
    }

    /// An identifier-led statement is a macro invocation, a Transputer
    /// mnemonic (once .TRANSPUTER has been selected), or an error.
    fn resolve_generic(
        &self,
        location: &SourceLocation,
        name: &str,
        args: Option<&str>,
    ) -> Result<Resolved, AssemblyError> {
        let parse_error = |reason: String| AssemblyError::Parse {
            location: location.clone(),
            reason,
        };

        if self.macros.exists(name) {
            let arguments = args.map(split_macro_arguments).unwrap_or_default();
            return Ok(Resolved::Invocation(
                CasedName::new(name, self.policy),
                arguments,
            ));
        }

        if self.processor == Some(Processor::Transputer) {
            if let Some((mnemonic, op)) = transputer::lookup_direct(name) {
                let operand = args.filter(|a| !a.is_empty()).ok_or_else(|| {
                    parse_error(format!("'{}' requires an operand", mnemonic))
                })?;
                let expr = self.parse_operand(operand).map_err(&parse_error)?;
                return Ok(Resolved::Statement(Statement::DirectInstruction(
                    DirectInstruction { mnemonic, op, expr },
                )));
            }
            if let Some((mnemonic, code)) = transputer::lookup_indirect(name) {
                if args.is_some_and(|a| !a.is_empty()) {
                    return Err(parse_error(format!("'{}' takes no operand", mnemonic)));
                }
                return Ok(Resolved::Statement(Statement::IndirectInstruction(
                    mnemonic,
                    transputer::encode_indirect(code),
                )));
            }
            if let Some((mnemonic, entry)) = transputer::lookup_fpentry(name) {
                if args.is_some_and(|a| !a.is_empty()) {
                    return Err(parse_error(format!("'{}' takes no operand", mnemonic)));
                }
                return Ok(Resolved::Statement(Statement::DirectEncodedInstruction(
                    mnemonic,
                    transputer::encode_fpentry(entry),
                )));
            }
        }

        let upper = name.to_ascii_uppercase();
        if DIRECTIVE_KEYWORDS.contains(&upper.as_str()) {
            return Err(parse_error(format!(
                "missing or malformed argument to {}",
                upper
            )));
        }
        Err(parse_error(format!("unknown statement '{}'", name)))
    }

    fn parse_operand(&self, text: &str) -> Result<Expression, String> {
        let mut pairs = LineGrammar::parse(Rule::expr_line, text)
            .map_err(|e| format!("invalid operand: {}", pest_reason(&e)))?;
        let expr = pairs
            .next()
            .unwrap()
            .into_inner()
            .find(|p| p.as_rule() == Rule::expression)
            .unwrap();
        expr_builder::build_expression(expr, self.policy)
    }

    fn expression_in(&self, pair: Pair<'_, Rule>) -> Result<Expression, String> {
        let expr = pair
            .into_inner()
            .find(|p| p.as_rule() == Rule::expression)
            .unwrap();
        expr_builder::build_expression(expr, self.policy)
    }
}

fn number_value(pair: Pair<'_, Rule>) -> Result<i64, String> {
    match expr_builder::build_number(pair)? {
        Expression::Number(n) => Ok(n as i64),
        _ => unreachable!(),
    }
}

fn pest_reason(error: &pest::error::Error<Rule>) -> String {
    error.variant.message().to_string()
}

/// Split macro invocation arguments on top-level commas; quoted text is kept
/// intact, quotes included, because substitution is textual.
fn split_macro_arguments(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in trimmed.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ',' => {
                    arguments.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    arguments.push(current.trim().to_string());
    arguments
}

/// Strip a trailing `;;` comment from a macro-expanded line; plain `;`
/// comments are preserved.
fn strip_trailing_double_comment(text: &str) -> String {
    let mut quote: Option<char> = None;
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match quote {
            Some(q) => {
                if chars[i] == q {
                    quote = None;
                }
            }
            None => match chars[i] {
                '\'' | '"' => quote = Some(chars[i]),
                ';' if i + 1 < chars.len() && chars[i + 1] == ';' => {
                    return chars[..i].iter().collect::<String>().trim_end().to_string();
                }
                _ => {}
            },
        }
        i += 1;
    }
    text.to_string()
}

fn strip_comment(text: &str) -> &str {
    match text.find(';') {
        Some(at) => &text[..at],
        None => text,
    }
}
