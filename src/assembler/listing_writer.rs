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

//! Paginated listing: a gutter of address and encoded bytes, the original
//! source text, and a terminal symbol table sorted by name and by value.

use crate::assembler::binary_writer::storage_bytes;
use crate::assembler::model::{AssemblyModel, SourcedValue, Storage, SymbolKind};
use std::io::{self, Write};

// Cells shown on one listing line before wrapping to a continuation line.
fn cells_per_listing_line(cell_width: usize) -> usize {
    match cell_width {
        1 => 5,
        2 => 3,
        _ => 1,
    }
}

struct Paginator<'a, W: Write> {
    out: &'a mut W,
    title: String,
    rows: usize,
    cols: usize,
    row: usize,
    page: usize,
}

impl<'a, W: Write> Paginator<'a, W> {
    fn new(out: &'a mut W, title: &str, rows: usize, cols: usize) -> Self {
        Paginator {
            out,
            title: title.to_string(),
            rows: rows.max(8),
            cols: cols.max(40),
            row: 0,
            page: 0,
        }
    }

    fn emit(&mut self, text: &str) -> io::Result<()> {
        if self.row == 0 {
            self.header()?;
        }
        let truncated: String = text.chars().take(self.cols).collect();
        writeln!(self.out, "{}", truncated)?;
        self.row += 1;
        if self.row >= self.rows - 2 {
            self.row = 0;
        }
        Ok(())
    }

    fn new_page(&mut self) {
        self.row = 0;
    }

    fn header(&mut self) -> io::Result<()> {
        self.page += 1;
        let page_marker = format!("Page {}", self.page);
        let width = self.cols.saturating_sub(page_marker.len());
        writeln!(self.out, "{:<width$}{}", self.title, page_marker, width = width)?;
        writeln!(self.out)?;
        self.row = 2;
        Ok(())
    }
}

/// Write the full listing for an assembled model.
pub fn write_listing<W: Write>(model: &AssemblyModel, out: &mut W) -> io::Result<()> {
    let mut pages = Paginator::new(out, &model.title, model.page_rows, model.page_cols);

    for (index, line) in model.lines.iter().enumerate() {
        match model.sourced_value_for_line(index) {
            Some(SourcedValue::Storage(storage)) => {
                emit_storage_lines(&mut pages, model, storage, &line.text)?;
            }
            Some(SourcedValue::Value(value)) => {
                let gutter = format!("       = {:08X}", value as u32);
                pages.emit(&format!("{:<22}{}", gutter, line.text))?;
            }
            None => {
                pages.emit(&format!("{:22}{}", "", line.text))?;
            }
        }
    }

    if let Some(entry) = model.entry_point {
        pages.emit("")?;
        pages.emit(&format!("Entry point {:08X}", entry as u32))?;
    }

    write_symbol_tables(&mut pages, model)
}

fn emit_storage_lines<W: Write>(
    pages: &mut Paginator<'_, W>,
    model: &AssemblyModel,
    storage: &Storage,
    text: &str,
) -> io::Result<()> {
    let width = storage.cell_width();
    let bytes = storage_bytes(storage, model.endianness);
    let per_line = cells_per_listing_line(width) * width;

    if bytes.is_empty() {
        pages.emit(&format!("{:08X} {:<12} {}", storage.address as u32, "", text))?;
        return Ok(());
    }

    let mut offset = 0;
    let mut first = true;
    while offset < bytes.len() {
        let chunk = &bytes[offset..bytes.len().min(offset + per_line)];
        let rendered = render_chunk(chunk, width);
        let address = (storage.address as u32).wrapping_add(offset as u32);
        if first {
            pages.emit(&format!("{:08X} {:<12} {}", address, rendered, text))?;
            first = false;
        } else {
            pages.emit(&format!("{:08X} {:<12}", address, rendered))?;
        }
        offset += chunk.len();
    }
    Ok(())
}

fn render_chunk(chunk: &[u8], width: usize) -> String {
    chunk
        .chunks(width)
        .map(|cell| cell.iter().map(|b| format!("{:02X}", b)).collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_symbol_tables<W: Write>(
    pages: &mut Paginator<'_, W>,
    model: &AssemblyModel,
) -> io::Result<()> {
    if model.symbols_by_name().is_empty() {
        return Ok(());
    }

    pages.new_page();
    pages.emit("Symbol Table - by Name")?;
    pages.emit("")?;
    for symbol in model.symbols_by_name() {
        pages.emit(&format_symbol(symbol.name.as_str(), symbol.kind, symbol.value))?;
    }

    pages.new_page();
    pages.emit("Symbol Table - by Value")?;
    pages.emit("")?;
    for symbol in model.symbols_by_value() {
        pages.emit(&format_symbol(symbol.name.as_str(), symbol.kind, symbol.value))?;
    }
    Ok(())
}

fn format_symbol(name: &str, kind: SymbolKind, value: Option<i32>) -> String {
    let kind = match kind {
        SymbolKind::Constant => "CONST",
        SymbolKind::Variable => "VAR",
        SymbolKind::Label => "LABEL",
    };
    match value {
        Some(v) => format!("{:<24} {:08X}  {}", name, v as u32, kind),
        None => format!("{:<24} --------  {}", name, kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CasePolicy, CellWidth, Expression, Line, SourceLocation};

    fn listing_for(model: &AssemblyModel) -> String {
        let mut out = Vec::new();
        write_listing(model, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn basic_model() -> AssemblyModel {
        let mut model = AssemblyModel::new(CasePolicy::Insensitive);
        let mut lines = Vec::new();
        for i in 0..2 {
            let mut line = Line::new(SourceLocation::new("test.asm", i + 1), "");
            line.text = format!("line {}", i + 1);
            lines.push(line);
        }
        model.set_lines(lines);
        model
    }

    #[test]
    fn test_header_carries_title_and_page() {
        let mut model = basic_model();
        model.title = "demo".to_string();
        let listing = listing_for(&model);
        let first = listing.lines().next().unwrap();
        assert!(first.starts_with("demo"));
        assert!(first.trim_end().ends_with("Page 1"));
    }

    #[test]
    fn test_storage_gutter_shows_address_and_bytes() {
        let mut model = basic_model();
        model.set_dollar(0x100);
        model
            .upsert_data(
                0,
                CellWidth::Byte,
                vec![Expression::Number(1), Expression::Number(2)],
            )
            .unwrap();
        let listing = listing_for(&model);
        assert!(listing.contains("00000100 01 02"));
    }

    #[test]
    fn test_long_storage_wraps_to_continuation() {
        let mut model = basic_model();
        model
            .upsert_data(
                0,
                CellWidth::Byte,
                (1..=7).map(Expression::Number).collect(),
            )
            .unwrap();
        let listing = listing_for(&model);
        // five bytes on the first line, two carried over at the advanced address
        assert!(listing.contains("00000000 01 02 03 04 05"));
        assert!(listing.contains("00000005 06 07"));
    }

    #[test]
    fn test_assignment_value_in_gutter() {
        let mut model = basic_model();
        let name = model.cased("K");
        model.set_constant(&name, &Expression::Number(0x2A), 0).unwrap();
        let listing = listing_for(&model);
        assert!(listing.contains("= 0000002A"));
    }

    #[test]
    fn test_symbol_tables_present_and_sorted() {
        let mut model = basic_model();
        let b = model.cased("BETA");
        let a = model.cased("ALPHA");
        model.set_constant(&b, &Expression::Number(1), 0).unwrap();
        model.set_constant(&a, &Expression::Number(2), 1).unwrap();
        let listing = listing_for(&model);
        assert!(listing.contains("Symbol Table - by Name"));
        assert!(listing.contains("Symbol Table - by Value"));
        let alpha_at = listing.find("ALPHA").unwrap();
        let beta_at = listing.find("BETA").unwrap();
        assert!(alpha_at < beta_at);
    }
}
