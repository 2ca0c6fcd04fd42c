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

pub mod assembler;
pub mod ast;
pub mod errors;
pub mod file_reader;
pub mod macro_manager;
pub mod parser;
pub mod source_stream;

use crate::assembler::model::AssemblyModel;
use crate::ast::CasePolicy;
use crate::file_reader::FileReader;
use crate::parser::SourceParser;
use crate::source_stream::SourceStream;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

extern crate pest;
extern crate pest_derive;

#[derive(Default)]
pub struct AssemblerOptions {
    pub case_policy: CasePolicy,
    pub include_paths: Vec<PathBuf>,
}

/// A fully converged assembly, ready for the output writers.
pub struct Assembly {
    pub model: AssemblyModel,
}

impl Assembly {
    pub fn binary(&self) -> Result<Vec<u8>> {
        assembler::binary_writer::write_binary(&self.model)
            .context("Failed to lay out the binary image")
    }

    pub fn listing(&self) -> Result<String> {
        let mut out = Vec::new();
        assembler::listing_writer::write_listing(&self.model, &mut out)
            .context("Failed to format the listing")?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

pub fn assemble<F: FileReader>(
    source_path: &Path,
    options: &AssemblerOptions,
    reader: &F,
) -> Result<Assembly> {
    let mut stream = SourceStream::new(reader);
    for dir in &options.include_paths {
        stream.add_include_path(dir)?;
    }
    stream
        .open(source_path)
        .context("Failed to open the root source file")?;

    let mut parser = SourceParser::new(options.case_policy);
    let (lines, parse_errors) = parser.parse_program(&mut stream);
    if !parse_errors.is_empty() {
        return Err(anyhow::Error::new(parse_errors));
    }

    let mut model = AssemblyModel::new(options.case_policy);
    model.set_lines(lines);
    assembler::generate(&mut model).map_err(anyhow::Error::new)?;

    Ok(Assembly { model })
}
