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

//! Canonical assembly state: symbol tables, storages, the location counter
//! and the dependency graph that re-evaluates dependents when a symbol's
//! value changes. Symbols and storages live in arenas and are referenced by
//! index so the graph never holds self-referential pointers.

use crate::assembler::eval::{self, Evaluation, SymbolLookup};
use crate::assembler::transputer;
use crate::ast::{CasePolicy, CasedName, CellWidth, Expression, Line, Processor, SourceLocation};
use crate::errors::{AssemblyError, ErrorList};
use log::trace;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Constant,
    Variable,
    Label,
}

impl SymbolKind {
    fn describe(self) -> &'static str {
        match self {
            SymbolKind::Constant => "constant",
            SymbolKind::Variable => "variable",
            SymbolKind::Label => "label",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: CasedName,
    pub kind: SymbolKind,
    pub value: Option<i32>,
    expr: Option<Expression>,
    eval_dollar: i32,
    pub line_index: usize,
}

/// A node that must be re-evaluated when one of the symbols it references
/// becomes known or changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Dependent {
    Symbol(usize),
    Storage(usize),
}

#[derive(Debug, Clone)]
pub enum StorageKind {
    Data { width: CellWidth },
    Dup { width: CellWidth },
    Direct { mnemonic: &'static str, op: u8, branch: bool },
    Bytes,
}

/// A contiguous run of bytes emitted by one line at a known address. The
/// expressions are retained so the contents can be recomputed in place when
/// a referenced symbol changes; the address is only moved by a re-walk.
#[derive(Debug, Clone)]
pub struct Storage {
    pub line_index: usize,
    pub address: i32,
    pub kind: StorageKind,
    pub data: Vec<i32>,
    pub exprs: Vec<Expression>,
    pub length: usize,
    pub unresolved: BTreeSet<CasedName>,
}

impl Storage {
    pub fn cell_width(&self) -> usize {
        match self.kind {
            StorageKind::Data { width } | StorageKind::Dup { width } => width.bytes(),
            StorageKind::Direct { .. } | StorageKind::Bytes => 1,
        }
    }
}

/// Value shown in the listing gutter for one line.
pub enum SourcedValue<'a> {
    Storage(&'a Storage),
    Value(i32),
}

#[derive(Debug)]
pub struct AssemblyModel {
    policy: CasePolicy,
    pub endianness: Endianness,
    pub processor: Option<Processor>,
    pub title: String,
    pub page_rows: usize,
    pub page_cols: usize,
    dollar: i32,
    pub lines: Vec<Line>,
    storages: Vec<Storage>,
    storage_by_line: HashMap<usize, usize>,
    symbols: Vec<Symbol>,
    names: HashMap<CasedName, usize>,
    dependents: HashMap<CasedName, BTreeSet<Dependent>>,
    assignment_values: HashMap<usize, i32>,
    pub errors: ErrorList,
    pub lengths_changed: bool,
    pub entry_point: Option<i32>,
}

impl SymbolLookup for AssemblyModel {
    fn symbol_value(&self, name: &CasedName) -> Option<i32> {
        self.names
            .get(name)
            .and_then(|&i| self.symbols[i].value)
    }
}

impl AssemblyModel {
    pub fn new(policy: CasePolicy) -> Self {
        AssemblyModel {
            policy,
            endianness: Endianness::Big,
            processor: None,
            title: String::new(),
            page_rows: 60,
            page_cols: 132,
            dollar: 0,
            lines: Vec::new(),
            storages: Vec::new(),
            storage_by_line: HashMap::new(),
            symbols: Vec::new(),
            names: HashMap::new(),
            dependents: HashMap::new(),
            assignment_values: HashMap::new(),
            errors: ErrorList::new(),
            lengths_changed: false,
            entry_point: None,
        }
    }

    pub fn policy(&self) -> CasePolicy {
        self.policy
    }

    pub fn cased(&self, text: &str) -> CasedName {
        CasedName::new(text, self.policy)
    }

    pub fn dollar(&self) -> i32 {
        self.dollar
    }

    pub fn set_dollar(&mut self, addr: i32) {
        self.dollar = addr;
    }

    pub fn advance_dollar(&mut self, bytes: usize) {
        self.dollar = self.dollar.wrapping_add(bytes as i32);
    }

    pub fn set_lines(&mut self, lines: Vec<Line>) {
        self.lines = lines;
    }

    fn location(&self, line_index: usize) -> SourceLocation {
        self.lines[line_index].location.clone()
    }

    fn model_error(&self, line_index: usize, reason: String) -> AssemblyError {
        AssemblyError::Model {
            location: self.location(line_index),
            reason,
        }
    }

    /// Reset per-iteration state for the next convergence walk: labels lose
    /// their values, variables lose values and defining expressions, the
    /// dependency edges are rebuilt from scratch, and `$` returns to zero.
    pub fn begin_iteration(&mut self) {
        for symbol in &mut self.symbols {
            match symbol.kind {
                SymbolKind::Label => symbol.value = None,
                SymbolKind::Variable => {
                    symbol.value = None;
                    symbol.expr = None;
                }
                SymbolKind::Constant => {}
            }
        }
        self.dependents.clear();
        self.errors.clear();
        self.lengths_changed = false;
        self.dollar = 0;
    }

    // ------------- symbols -------------

    pub fn symbol(&self, name: &CasedName) -> Option<&Symbol> {
        self.names.get(name).map(|&i| &self.symbols[i])
    }

    pub fn set_constant(
        &mut self,
        name: &CasedName,
        expr: &Expression,
        line_index: usize,
    ) -> Result<(), AssemblyError> {
        if let Some(&existing) = self.names.get(name) {
            let symbol = &self.symbols[existing];
            match symbol.kind {
                SymbolKind::Constant if symbol.line_index == line_index => {
                    // re-walk of the defining line; refresh in case $ moved
                }
                SymbolKind::Constant => {
                    return Err(self.model_error(
                        line_index,
                        format!("constant '{}' already defined", name),
                    ));
                }
                other => {
                    return Err(self.model_error(
                        line_index,
                        format!("'{}' already defined as a {}", name, other.describe()),
                    ));
                }
            }
        }
        let value = match eval::evaluate(expr, self, self.dollar) {
            Ok(Evaluation::Value(v)) => v,
            Ok(Evaluation::Undefined(names)) => {
                return Err(self.model_error(
                    line_index,
                    format!(
                        "forward reference in constant '{}': {}",
                        name,
                        join_names(&names)
                    ),
                ));
            }
            Err(reason) => return Err(self.model_error(line_index, reason)),
        };
        self.store_symbol(
            name,
            SymbolKind::Constant,
            Some(value),
            Some(expr.clone()),
            line_index,
        );
        Ok(())
    }

    pub fn set_variable(
        &mut self,
        name: &CasedName,
        expr: &Expression,
        line_index: usize,
    ) -> Result<(), AssemblyError> {
        if let Some(&existing) = self.names.get(name) {
            match self.symbols[existing].kind {
                SymbolKind::Variable => {}
                other => {
                    return Err(self.model_error(
                        line_index,
                        format!("'{}' already defined as a {}", name, other.describe()),
                    ));
                }
            }
        }
        let value = match eval::evaluate(expr, self, self.dollar) {
            Ok(Evaluation::Value(v)) => Some(v),
            Ok(Evaluation::Undefined(undefined)) => {
                let index = self.store_symbol(
                    name,
                    SymbolKind::Variable,
                    None,
                    Some(expr.clone()),
                    line_index,
                );
                self.register_dependents(&undefined, Dependent::Symbol(index));
                return Ok(());
            }
            Err(reason) => return Err(self.model_error(line_index, reason)),
        };
        self.store_symbol(
            name,
            SymbolKind::Variable,
            value,
            Some(expr.clone()),
            line_index,
        );
        Ok(())
    }

    pub fn set_label(
        &mut self,
        name: &CasedName,
        addr: i32,
        line_index: usize,
    ) -> Result<(), AssemblyError> {
        if let Some(&existing) = self.names.get(name) {
            let symbol = &self.symbols[existing];
            match symbol.kind {
                SymbolKind::Label => {
                    if symbol.value.is_some() && symbol.line_index != line_index {
                        return Err(self.model_error(
                            line_index,
                            format!("label '{}' already defined", name),
                        ));
                    }
                }
                other => {
                    return Err(self.model_error(
                        line_index,
                        format!("label '{}' collides with a {}", name, other.describe()),
                    ));
                }
            }
        }
        self.store_symbol(name, SymbolKind::Label, Some(addr), None, line_index);
        Ok(())
    }

    /// Insert or update a symbol and propagate to dependents. Labels always
    /// propagate: dependents may be waiting even when the address did not
    /// move between iterations.
    fn store_symbol(
        &mut self,
        name: &CasedName,
        kind: SymbolKind,
        value: Option<i32>,
        expr: Option<Expression>,
        line_index: usize,
    ) -> usize {
        let dollar = self.dollar;
        let index = match self.names.get(name) {
            Some(&i) => i,
            None => {
                self.symbols.push(Symbol {
                    name: name.clone(),
                    kind,
                    value: None,
                    expr: None,
                    eval_dollar: dollar,
                    line_index,
                });
                let i = self.symbols.len() - 1;
                self.names.insert(name.clone(), i);
                i
            }
        };
        let changed = self.symbols[index].value != value;
        let symbol = &mut self.symbols[index];
        symbol.kind = kind;
        symbol.value = value;
        symbol.expr = expr;
        symbol.eval_dollar = dollar;
        symbol.line_index = line_index;
        if let Some(v) = value {
            self.assignment_values.insert(line_index, v);
        }
        if value.is_some() && (changed || kind == SymbolKind::Label) {
            trace!("symbol {} <- {:?}", name, value);
            self.symbol_changed(name);
        }
        index
    }

    fn register_dependents(&mut self, undefined: &BTreeSet<CasedName>, dependent: Dependent) {
        for name in undefined {
            self.dependents
                .entry(name.clone())
                .or_default()
                .insert(dependent);
        }
    }

    /// Re-evaluation protocol: when a symbol's value changes, every storage
    /// and symbol whose expression referenced it while undefined is
    /// recomputed, in source order of the defining line, and newly resolved
    /// symbols propagate further.
    fn symbol_changed(&mut self, name: &CasedName) {
        let mut queue: VecDeque<CasedName> = VecDeque::new();
        queue.push_back(name.clone());
        while let Some(current) = queue.pop_front() {
            let Some(set) = self.dependents.get(&current).cloned() else {
                continue;
            };
            let mut ordered: Vec<Dependent> = set.iter().copied().collect();
            ordered.sort_by_key(|d| match *d {
                Dependent::Symbol(i) => (self.symbols[i].line_index, 0, i),
                Dependent::Storage(i) => (self.storages[i].line_index, 1, i),
            });
            for dependent in ordered {
                match dependent {
                    Dependent::Symbol(i) => {
                        let Some(expr) = self.symbols[i].expr.clone() else {
                            continue;
                        };
                        let dollar = self.symbols[i].eval_dollar;
                        let line_index = self.symbols[i].line_index;
                        match eval::evaluate(&expr, self, dollar) {
                            Ok(Evaluation::Value(v)) => {
                                if self.symbols[i].value != Some(v) {
                                    self.symbols[i].value = Some(v);
                                    self.assignment_values.insert(line_index, v);
                                    queue.push_back(self.symbols[i].name.clone());
                                }
                            }
                            Ok(Evaluation::Undefined(_)) => {}
                            Err(reason) => {
                                let error = self.model_error(line_index, reason);
                                self.errors.push(error);
                            }
                        }
                    }
                    Dependent::Storage(i) => {
                        self.reevaluate_storage(i);
                    }
                }
            }
        }
    }

    // ------------- storages -------------

    pub fn storage_index_for_line(&self, line_index: usize) -> Option<usize> {
        self.storage_by_line.get(&line_index).copied()
    }

    pub fn storage(&self, index: usize) -> &Storage {
        &self.storages[index]
    }

    /// Storages ordered by source line; overlapping output is resolved in
    /// this order (last write wins).
    pub fn storages_in_source_order(&self) -> Vec<&Storage> {
        let mut ordered: Vec<&Storage> = self.storages.iter().collect();
        ordered.sort_by_key(|s| s.line_index);
        ordered
    }

    pub fn storage_count(&self) -> usize {
        self.storages.len()
    }

    /// Allocate or re-address a DB/DW/DD storage at `$` and advance `$` past
    /// it. On a re-walk the recorded expressions are replaced by the freshly
    /// offset-bound ones.
    pub fn upsert_data(
        &mut self,
        line_index: usize,
        width: CellWidth,
        exprs: Vec<Expression>,
    ) -> Result<(), AssemblyError> {
        let index = match self.storage_by_line.get(&line_index) {
            Some(&i) => {
                let storage = &mut self.storages[i];
                storage.address = self.dollar;
                storage.exprs = exprs;
                i
            }
            None => {
                let cells = exprs
                    .iter()
                    .map(|e| match e {
                        Expression::Characters(s) => s.len(),
                        _ => 1,
                    })
                    .sum::<usize>();
                self.push_storage(Storage {
                    line_index,
                    address: self.dollar,
                    kind: StorageKind::Data { width },
                    data: vec![0; cells],
                    exprs,
                    length: cells * width.bytes(),
                    unresolved: BTreeSet::new(),
                })
            }
        };
        self.reevaluate_storage(index);
        self.advance_dollar(self.storages[index].length);
        Ok(())
    }

    /// DUP storage: the count must evaluate immediately and be non-negative;
    /// the repeated expression may resolve later.
    pub fn upsert_dup(
        &mut self,
        line_index: usize,
        width: CellWidth,
        count_expr: &Expression,
        repeated: Expression,
    ) -> Result<(), AssemblyError> {
        let count = match eval::evaluate(count_expr, self, self.dollar) {
            Ok(Evaluation::Value(v)) if v >= 0 => v as usize,
            Ok(Evaluation::Value(v)) => {
                return Err(self.model_error(
                    line_index,
                    format!("DUP count must be non-negative, got {}", v),
                ));
            }
            Ok(Evaluation::Undefined(names)) => {
                return Err(self.model_error(
                    line_index,
                    format!("DUP count may not forward-reference: {}", join_names(&names)),
                ));
            }
            Err(reason) => return Err(self.model_error(line_index, reason)),
        };
        let index = match self.storage_by_line.get(&line_index) {
            Some(&i) => {
                let new_length = count * width.bytes();
                let storage = &mut self.storages[i];
                storage.address = self.dollar;
                storage.exprs = vec![repeated];
                if storage.length != new_length {
                    storage.data.resize(count, 0);
                    storage.length = new_length;
                    self.lengths_changed = true;
                }
                i
            }
            None => self.push_storage(Storage {
                line_index,
                address: self.dollar,
                kind: StorageKind::Dup { width },
                data: vec![0; count],
                exprs: vec![repeated],
                length: count * width.bytes(),
                unresolved: BTreeSet::new(),
            }),
        };
        self.reevaluate_storage(index);
        self.advance_dollar(self.storages[index].length);
        Ok(())
    }

    /// Direct instruction storage. Unresolvable operands reserve a one-byte
    /// placeholder and are marked variable-length; the committed length only
    /// ever grows across iterations.
    pub fn upsert_direct(
        &mut self,
        line_index: usize,
        mnemonic: &'static str,
        op: u8,
        branch: bool,
        expr: Expression,
    ) -> Result<(), AssemblyError> {
        let index = match self.storage_by_line.get(&line_index) {
            Some(&i) => {
                let storage = &mut self.storages[i];
                storage.address = self.dollar;
                storage.exprs = vec![expr];
                i
            }
            None => self.push_storage(Storage {
                line_index,
                address: self.dollar,
                kind: StorageKind::Direct { mnemonic, op, branch },
                data: vec![0],
                exprs: vec![expr],
                length: 1,
                unresolved: BTreeSet::new(),
            }),
        };
        self.reevaluate_storage(index);
        self.advance_dollar(self.storages[index].length);
        Ok(())
    }

    /// Fixed byte sequence (indirect and FPU-entry instructions). Never
    /// varies in length.
    pub fn upsert_bytes(
        &mut self,
        line_index: usize,
        bytes: &[u8],
    ) -> Result<(), AssemblyError> {
        let index = match self.storage_by_line.get(&line_index) {
            Some(&i) => {
                self.storages[i].address = self.dollar;
                i
            }
            None => self.push_storage(Storage {
                line_index,
                address: self.dollar,
                kind: StorageKind::Bytes,
                data: bytes.iter().map(|&b| b as i32).collect(),
                exprs: Vec::new(),
                length: bytes.len(),
                unresolved: BTreeSet::new(),
            }),
        };
        self.advance_dollar(self.storages[index].length);
        Ok(())
    }

    /// Re-address a storage owned by a line that is skipped this walk
    /// (IF1/ELSE gating): layout is preserved, contents are not recomputed.
    pub fn readdress_storage(&mut self, line_index: usize) {
        if let Some(&i) = self.storage_by_line.get(&line_index) {
            self.storages[i].address = self.dollar;
            self.advance_dollar(self.storages[i].length);
        }
    }

    fn push_storage(&mut self, storage: Storage) -> usize {
        let line_index = storage.line_index;
        self.storages.push(storage);
        let index = self.storages.len() - 1;
        self.storage_by_line.insert(line_index, index);
        index
    }

    /// Recompute a storage's contents in place at its recorded address.
    /// Undefined references leave placeholder cells and register dependency
    /// edges; length growth of a direct instruction flags another
    /// convergence iteration.
    fn reevaluate_storage(&mut self, index: usize) {
        let address = self.storages[index].address;
        let exprs = self.storages[index].exprs.clone();
        let kind = self.storages[index].kind.clone();
        let line_index = self.storages[index].line_index;
        let mut unresolved: BTreeSet<CasedName> = BTreeSet::new();

        match kind {
            StorageKind::Data { width } => {
                let mut cells: Vec<Option<i32>> = Vec::new();
                for expr in &exprs {
                    if let Expression::Characters(text) = expr {
                        for byte in text.bytes() {
                            cells.push(Some(byte as i32));
                        }
                        continue;
                    }
                    match eval::evaluate(expr, self, address) {
                        Ok(Evaluation::Value(v)) => match check_fit(v, width) {
                            Ok(()) => cells.push(Some(v)),
                            Err(reason) => {
                                let error = self.model_error(line_index, reason);
                                self.errors.push(error);
                                cells.push(Some(0));
                            }
                        },
                        Ok(Evaluation::Undefined(names)) => {
                            unresolved.extend(names);
                            cells.push(None);
                        }
                        Err(reason) => {
                            let error = self.model_error(line_index, reason);
                            self.errors.push(error);
                            cells.push(Some(0));
                        }
                    }
                }
                let storage = &mut self.storages[index];
                for (slot, cell) in storage.data.iter_mut().zip(cells) {
                    if let Some(v) = cell {
                        *slot = v;
                    }
                }
            }
            StorageKind::Dup { width } => {
                match eval::evaluate(&exprs[0], self, address) {
                    Ok(Evaluation::Value(v)) => match check_fit(v, width) {
                        Ok(()) => self.storages[index].data.fill(v),
                        Err(reason) => {
                            let error = self.model_error(line_index, reason);
                            self.errors.push(error);
                        }
                    },
                    Ok(Evaluation::Undefined(names)) => {
                        unresolved.extend(names);
                    }
                    Err(reason) => {
                        let error = self.model_error(line_index, reason);
                        self.errors.push(error);
                    }
                }
            }
            StorageKind::Direct { op, branch, .. } => {
                match eval::evaluate(&exprs[0], self, address) {
                    Ok(Evaluation::Value(v)) => {
                        let previous = self.storages[index].length;
                        let (operand, length) = if branch {
                            solve_branch_length(v, previous)
                        } else {
                            let length = previous.max(transputer::min_length(v));
                            (v, length)
                        };
                        let bytes = transputer::encode(op, operand, length);
                        let storage = &mut self.storages[index];
                        storage.data = bytes.iter().map(|&b| b as i32).collect();
                        if length != previous {
                            storage.length = length;
                            self.lengths_changed = true;
                        }
                    }
                    Ok(Evaluation::Undefined(names)) => {
                        unresolved.extend(names);
                    }
                    Err(reason) => {
                        let error = self.model_error(line_index, reason);
                        self.errors.push(error);
                    }
                }
            }
            StorageKind::Bytes => {}
        }

        if !unresolved.is_empty() {
            self.register_dependents(&unresolved, Dependent::Storage(index));
        }
        self.storages[index].unresolved = unresolved;
    }

    // ------------- queries for the code generator and writers -------------

    /// Names still blocking full resolution, across all storages.
    pub fn unresolved_names(&self) -> BTreeSet<CasedName> {
        let mut out = BTreeSet::new();
        for storage in &self.storages {
            out.extend(storage.unresolved.iter().cloned());
        }
        out
    }

    pub fn direct_instruction_count(&self) -> usize {
        self.storages
            .iter()
            .filter(|s| matches!(s.kind, StorageKind::Direct { .. }))
            .count()
    }

    /// Fixed-point detector: a hash over label addresses and storage
    /// addresses and lengths. Two equal fingerprints across iterations mean
    /// the layout converged.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for symbol in &self.symbols {
            if symbol.kind == SymbolKind::Label {
                symbol.name.as_str().hash(&mut hasher);
                symbol.value.hash(&mut hasher);
            }
        }
        for storage in &self.storages {
            storage.address.hash(&mut hasher);
            storage.length.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// The listing gutter value for a line: its storage, or the value a
    /// symbol assignment produced there.
    pub fn sourced_value_for_line(&self, line_index: usize) -> Option<SourcedValue<'_>> {
        if let Some(&i) = self.storage_by_line.get(&line_index) {
            return Some(SourcedValue::Storage(&self.storages[i]));
        }
        self.assignment_values
            .get(&line_index)
            .map(|&v| SourcedValue::Value(v))
    }

    pub fn symbols_by_name(&self) -> Vec<&Symbol> {
        let mut out: Vec<&Symbol> = self.symbols.iter().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn symbols_by_value(&self) -> Vec<&Symbol> {
        let mut out: Vec<&Symbol> = self.symbols.iter().collect();
        out.sort_by_key(|s| (s.value.map(|v| v as u32), s.name.clone()));
        out
    }
}

fn check_fit(value: i32, width: CellWidth) -> Result<(), String> {
    let fits = match width {
        CellWidth::Byte => (-128..=255).contains(&value),
        CellWidth::Word => (-32768..=65535).contains(&value),
        CellWidth::DWord => true,
    };
    if fits {
        Ok(())
    } else {
        Err(format!(
            "value {} does not fit in {} byte(s)",
            value,
            width.bytes()
        ))
    }
}

/// Branch operands are measured from the address after the instruction's own
/// bytes, so the encoded length feeds back into the operand. Starting from
/// the committed length keeps growth monotone and guarantees convergence.
fn solve_branch_length(distance: i32, committed: usize) -> (i32, usize) {
    let mut length = committed.max(1);
    loop {
        let operand = distance.wrapping_sub(length as i32);
        if transputer::min_length(operand) <= length || length >= 16 {
            return (operand, length);
        }
        length += 1;
    }
}

fn join_names(names: &BTreeSet<CasedName>) -> String {
    names
        .iter()
        .map(|n| n.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Statement};

    fn model_with_lines(count: usize) -> AssemblyModel {
        let mut model = AssemblyModel::new(CasePolicy::Insensitive);
        let lines = (0..count)
            .map(|i| {
                let mut line = Line::new(SourceLocation::new("test.asm", i as u32 + 1), "");
                line.statement = Some(Statement::Ignored);
                line
            })
            .collect();
        model.set_lines(lines);
        model
    }

    fn name(model: &AssemblyModel, text: &str) -> CasedName {
        model.cased(text)
    }

    fn sym(model: &AssemblyModel, text: &str) -> Expression {
        Expression::SymbolRef(name(model, text))
    }

    #[test]
    fn test_constant_defined_once() {
        let mut model = model_with_lines(4);
        let a = name(&model, "A");
        model.set_constant(&a, &Expression::Number(5), 0).unwrap();
        let err = model
            .set_constant(&a, &Expression::Number(6), 1)
            .unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }

    #[test]
    fn test_constant_forward_reference_fatal() {
        let mut model = model_with_lines(4);
        let a = name(&model, "A");
        let expr = sym(&model, "LATER");
        let err = model.set_constant(&a, &expr, 0).unwrap_err();
        assert!(err.to_string().contains("forward reference"));
    }

    #[test]
    fn test_constant_chain_evaluates() {
        let mut model = model_with_lines(4);
        let a = name(&model, "A");
        let b = name(&model, "B");
        model.set_constant(&a, &Expression::Number(5), 0).unwrap();
        let expr = Expression::binary(BinaryOp::Add, sym(&model, "A"), Expression::Number(3));
        model.set_constant(&b, &expr, 1).unwrap();
        assert_eq!(model.symbol(&b).unwrap().value, Some(8));
    }

    #[test]
    fn test_label_collision_with_constant() {
        let mut model = model_with_lines(4);
        let a = name(&model, "A");
        model.set_constant(&a, &Expression::Number(5), 0).unwrap();
        let err = model.set_label(&a, 0x10, 1).unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn test_variable_may_be_reassigned() {
        let mut model = model_with_lines(4);
        let v = name(&model, "V");
        model.set_variable(&v, &Expression::Number(1), 0).unwrap();
        model.set_variable(&v, &Expression::Number(2), 1).unwrap();
        assert_eq!(model.symbol(&v).unwrap().value, Some(2));
    }

    #[test]
    fn test_forward_reference_resolves_through_chain() {
        let mut model = model_with_lines(6);
        let v = name(&model, "V");
        let w = name(&model, "W");
        let target = name(&model, "TARGET");

        // V = TARGET + 1, W = V + 1, both before TARGET exists
        let v_expr =
            Expression::binary(BinaryOp::Add, sym(&model, "TARGET"), Expression::Number(1));
        let w_expr = Expression::binary(BinaryOp::Add, sym(&model, "V"), Expression::Number(1));
        model.set_variable(&v, &v_expr, 0).unwrap();
        model.set_variable(&w, &w_expr, 1).unwrap();
        assert_eq!(model.symbol(&v).unwrap().value, None);
        assert_eq!(model.symbol(&w).unwrap().value, None);

        model.set_label(&target, 0x100, 2).unwrap();
        assert_eq!(model.symbol(&v).unwrap().value, Some(0x101));
        assert_eq!(model.symbol(&w).unwrap().value, Some(0x102));
    }

    #[test]
    fn test_storage_reevaluated_when_label_set() {
        let mut model = model_with_lines(4);
        model.set_dollar(0x10);
        model
            .upsert_data(0, CellWidth::Byte, vec![sym(&model, "LATER")])
            .unwrap();
        let index = model.storage_index_for_line(0).unwrap();
        assert!(!model.storage(index).unresolved.is_empty());
        assert_eq!(model.storage(index).data, vec![0]);

        let later = name(&model, "LATER");
        model.set_label(&later, 0x42, 1).unwrap();
        assert!(model.storage(index).unresolved.is_empty());
        assert_eq!(model.storage(index).data, vec![0x42]);
        // re-evaluation does not move the storage
        assert_eq!(model.storage(index).address, 0x10);
    }

    #[test]
    fn test_sequential_variable_semantics() {
        let mut model = model_with_lines(4);
        let v = name(&model, "V");
        model.set_variable(&v, &Expression::Number(1), 0).unwrap();
        model
            .upsert_data(1, CellWidth::Byte, vec![sym(&model, "V")])
            .unwrap();
        model.set_variable(&v, &Expression::Number(2), 2).unwrap();
        let index = model.storage_index_for_line(1).unwrap();
        assert_eq!(model.storage(index).data, vec![1]);
    }

    #[test]
    fn test_characters_expand_to_cells() {
        let mut model = model_with_lines(2);
        model
            .upsert_data(
                0,
                CellWidth::Byte,
                vec![
                    Expression::Characters("AB".to_string()),
                    Expression::Number(0),
                ],
            )
            .unwrap();
        let index = model.storage_index_for_line(0).unwrap();
        assert_eq!(model.storage(index).data, vec![0x41, 0x42, 0]);
        assert_eq!(model.dollar(), 3);
    }

    #[test]
    fn test_dup_count_must_be_immediate() {
        let mut model = model_with_lines(2);
        let count = sym(&model, "N");
        let err = model
            .upsert_dup(0, CellWidth::Byte, &count, Expression::Number(1))
            .unwrap_err();
        assert!(err.to_string().contains("forward-reference"));
    }

    #[test]
    fn test_dup_fills_cells() {
        let mut model = model_with_lines(2);
        model
            .upsert_dup(
                0,
                CellWidth::Byte,
                &Expression::Number(5),
                Expression::Number(7),
            )
            .unwrap();
        let index = model.storage_index_for_line(0).unwrap();
        assert_eq!(model.storage(index).data, vec![7, 7, 7, 7, 7]);
        assert_eq!(model.dollar(), 5);
    }

    #[test]
    fn test_byte_width_overflow_reported() {
        let mut model = model_with_lines(2);
        model
            .upsert_data(0, CellWidth::Byte, vec![Expression::Number(256)])
            .unwrap();
        assert!(!model.errors.is_empty());
    }

    #[test]
    fn test_direct_instruction_grows_but_never_shrinks() {
        let mut model = model_with_lines(3);
        model
            .upsert_direct(0, "ldc", 0x4, false, Expression::Number(16))
            .unwrap();
        let index = model.storage_index_for_line(0).unwrap();
        assert_eq!(model.storage(index).length, 2);
        assert_eq!(model.storage(index).data, vec![0x21, 0x40]);

        // a later walk with a smaller operand keeps the committed length
        model.begin_iteration();
        model
            .upsert_direct(0, "ldc", 0x4, false, Expression::Number(1))
            .unwrap();
        assert_eq!(model.storage(index).length, 2);
        assert_eq!(model.storage(index).data, vec![0x20, 0x41]);
    }

    #[test]
    fn test_labels_cleared_per_iteration() {
        let mut model = model_with_lines(3);
        let l = name(&model, "L");
        model.set_label(&l, 5, 0).unwrap();
        model.begin_iteration();
        assert_eq!(model.symbol(&l).unwrap().value, None);
        model.set_label(&l, 6, 0).unwrap();
        assert_eq!(model.symbol(&l).unwrap().value, Some(6));
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let mut model = model_with_lines(3);
        let l = name(&model, "L");
        model.set_label(&l, 5, 0).unwrap();
        let err = model.set_label(&l, 6, 1).unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }

    #[test]
    fn test_fingerprint_stable_when_nothing_moves() {
        let mut model = model_with_lines(2);
        model
            .upsert_data(0, CellWidth::Byte, vec![Expression::Number(1)])
            .unwrap();
        let first = model.fingerprint();
        let second = model.fingerprint();
        assert_eq!(first, second);
    }

    #[test]
    fn test_branch_length_solver() {
        // fifteen bytes past the end fits a nibble
        assert_eq!(solve_branch_length(16, 1), (15, 1));
        // sixteen bytes past the end forces a two-byte encoding
        assert_eq!(solve_branch_length(17, 1), (15, 2));
        // backward branch to self
        assert_eq!(solve_branch_length(0, 1), (-2, 2));
    }
}
