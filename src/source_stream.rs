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

use crate::ast::SourceLocation;
use crate::errors::AssemblyError;
use crate::file_reader::FileReader;
use log::debug;
use std::path::{Path, PathBuf};

/// One raw line as delivered by the stream, with the include call stack that
/// led to it (outermost first, not including the line's own file).
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub nested_locations: Vec<SourceLocation>,
    pub location: SourceLocation,
    pub text: String,
}

struct OpenFile {
    name: String,
    line_counter: u32,
    lines: std::vec::IntoIter<String>,
}

/// Ordered line stream over a push-down stack of include files. The parser
/// pushes onto the stack when it sees an INCLUDE statement; iteration then
/// yields the included file's lines transparently and resumes the parent at
/// its EOF.
pub struct SourceStream<'a, F: FileReader> {
    reader: &'a F,
    include_paths: Vec<PathBuf>,
    stack: Vec<OpenFile>,
}

impl<'a, F: FileReader> SourceStream<'a, F> {
    pub fn new(reader: &'a F) -> Self {
        SourceStream {
            reader,
            include_paths: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Append a directory to the include search path. The directory must
    /// exist.
    pub fn add_include_path(&mut self, dir: &Path) -> Result<(), AssemblyError> {
        if !self.reader.is_dir(dir) {
            return Err(AssemblyError::Io {
                reason: format!("include path is not a directory: {}", dir.display()),
            });
        }
        self.include_paths.push(dir.to_path_buf());
        Ok(())
    }

    pub fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    /// Open the root source file; lines are then pulled with `next_item`.
    pub fn open(&mut self, root: &Path) -> Result<(), AssemblyError> {
        self.push_file(root)
    }

    /// Push an include file. Absolute paths are taken as-is; relative paths
    /// are searched in the current working directory first and then in each
    /// include path in the order added.
    pub fn push_include(&mut self, path: &str) -> Result<(), AssemblyError> {
        let resolved = self
            .resolve(Path::new(path))
            .ok_or_else(|| AssemblyError::Io {
                reason: format!("include not found: {}", path),
            })?;
        debug!("including {}", resolved.display());
        self.push_file(&resolved)
    }

    /// The next raw line, or None once every file on the stack is exhausted.
    pub fn next_item(&mut self) -> Option<SourceItem> {
        loop {
            let top = self.stack.last_mut()?;
            match top.lines.next() {
                Some(text) => {
                    top.line_counter += 1;
                    let location = SourceLocation::new(&top.name, top.line_counter);
                    let nested_locations = self.stack[..self.stack.len() - 1]
                        .iter()
                        .map(|f| SourceLocation::new(&f.name, f.line_counter))
                        .collect();
                    return Some(SourceItem {
                        nested_locations,
                        location,
                        text,
                    });
                }
                None => {
                    let finished = self.stack.pop()?;
                    debug!("end of {}", finished.name);
                }
            }
        }
    }

    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute() {
            return self.reader.exists(path).then(|| path.to_path_buf());
        }
        if self.reader.exists(path) {
            return Some(path.to_path_buf());
        }
        for dir in &self.include_paths {
            let candidate = dir.join(path);
            if self.reader.exists(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn push_file(&mut self, path: &Path) -> Result<(), AssemblyError> {
        let content = self
            .reader
            .read_to_string(path)
            .map_err(|e| AssemblyError::Io {
                reason: format!("cannot read {}: {}", path.display(), e),
            })?;
        let lines: Vec<String> = content
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        // A trailing newline yields one phantom empty line; drop it.
        let lines = match lines.last() {
            Some(last) if last.is_empty() => lines[..lines.len() - 1].to_vec(),
            _ => lines,
        };
        self.stack.push(OpenFile {
            name: path.display().to_string(),
            line_counter: 0,
            lines: lines.into_iter(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_reader::MockFileReader;

    #[test]
    fn test_lines_numbered_per_file_from_one() {
        let mut reader = MockFileReader::default();
        reader.add_file("a.asm", "one\ntwo\n");

        let mut stream = SourceStream::new(&reader);
        stream.open(Path::new("a.asm")).unwrap();

        let first = stream.next_item().unwrap();
        assert_eq!(first.location.line, 1);
        assert_eq!(first.text, "one");
        let second = stream.next_item().unwrap();
        assert_eq!(second.location.line, 2);
        assert_eq!(second.text, "two");
        assert!(stream.next_item().is_none());
    }

    #[test]
    fn test_include_resumes_parent_after_eof() {
        let mut reader = MockFileReader::default();
        reader.add_file("main.asm", "before\nafter\n");
        reader.add_file("inc.asm", "inner\n");

        let mut stream = SourceStream::new(&reader);
        stream.open(Path::new("main.asm")).unwrap();

        assert_eq!(stream.next_item().unwrap().text, "before");
        stream.push_include("inc.asm").unwrap();
        let inner = stream.next_item().unwrap();
        assert_eq!(inner.text, "inner");
        assert_eq!(inner.location.file, "inc.asm");
        assert_eq!(inner.nested_locations.len(), 1);
        assert_eq!(inner.nested_locations[0].file, "main.asm");
        assert_eq!(inner.nested_locations[0].line, 1);

        let resumed = stream.next_item().unwrap();
        assert_eq!(resumed.text, "after");
        assert_eq!(resumed.location.line, 2);
    }

    #[test]
    fn test_include_searched_in_added_paths() {
        let mut reader = MockFileReader::default();
        reader.add_file("main.asm", "x\n");
        reader.add_file("lib/defs.asm", "y\n");

        let mut stream = SourceStream::new(&reader);
        stream.add_include_path(Path::new("lib")).unwrap();
        stream.open(Path::new("main.asm")).unwrap();
        stream.next_item();

        stream.push_include("defs.asm").unwrap();
        assert_eq!(stream.next_item().unwrap().location.file, "lib/defs.asm");
    }

    #[test]
    fn test_missing_include_reported() {
        let mut reader = MockFileReader::default();
        reader.add_file("main.asm", "x\n");

        let mut stream = SourceStream::new(&reader);
        stream.open(Path::new("main.asm")).unwrap();
        let err = stream.push_include("nowhere.asm").unwrap_err();
        assert!(err.to_string().contains("include not found"));
    }

    #[test]
    fn test_include_path_must_be_directory() {
        let mut reader = MockFileReader::default();
        reader.add_file("main.asm", "x\n");

        let mut stream = SourceStream::new(&reader);
        assert!(stream.add_include_path(Path::new("main.asm")).is_err());
    }
}
