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
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("{location}: Parse error: {reason}")]
    Parse {
        location: SourceLocation,
        reason: String,
    },

    #[error("{location}: Macro error: {reason}")]
    Macro {
        location: SourceLocation,
        reason: String,
    },

    #[error("{location}: Model error: {reason}")]
    Model {
        location: SourceLocation,
        reason: String,
    },

    #[error("Convergence error: {reason}")]
    Convergence { reason: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },
}

impl AssemblyError {
    fn location(&self) -> Option<&SourceLocation> {
        match self {
            AssemblyError::Parse { location, .. }
            | AssemblyError::Macro { location, .. }
            | AssemblyError::Model { location, .. } => Some(location),
            _ => None,
        }
    }
}

/// Accumulated errors for one phase, reported together in source order.
#[derive(Debug, Default, Clone)]
pub struct ErrorList {
    errors: Vec<AssemblyError>,
}

impl ErrorList {
    pub fn new() -> Self {
        ErrorList::default()
    }

    pub fn push(&mut self, error: AssemblyError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    pub fn extend(&mut self, other: ErrorList) {
        self.errors.extend(other.errors);
    }

    pub fn errors(&self) -> &[AssemblyError] {
        &self.errors
    }

    /// Errors ordered by (file, line); errors without a location sort last.
    pub fn sorted(&self) -> Vec<AssemblyError> {
        let mut out = self.errors.clone();
        out.sort_by(|a, b| match (a.location(), b.location()) {
            (Some(la), Some(lb)) => la.file.cmp(&lb.file).then(la.line.cmp(&lb.line)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        out
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in self.sorted() {
            if !first {
                writeln!(f)?;
            }
            write!(f, "{}", error)?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}
