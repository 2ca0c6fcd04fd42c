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

use crate::ast::{CasePolicy, CasedName};
use log::debug;
use std::collections::HashMap;

/// Characters that end a parameter occurrence inside a macro body line, in
/// addition to whitespace. Matching a parameter requires a delimiter (or the
/// string boundary) on both sides, giving word-boundary semantics that
/// respect identifier syntax.
const DELIMITERS: &str = ",.<>/?;:{}[]|!@#$%^&*()-+=";

#[derive(Debug, Clone)]
pub struct MacroDefinition {
    pub name: CasedName,
    pub parameters: Vec<String>,
    pub lines: Vec<String>,
}

/// Macro definition table and definition state machine: Idle until MACRO,
/// Defining until ENDM, then the definition is sealed and immutable.
pub struct MacroManager {
    policy: CasePolicy,
    macros: HashMap<CasedName, MacroDefinition>,
    defining: Option<MacroDefinition>,
}

impl MacroManager {
    pub fn new(policy: CasePolicy) -> Self {
        MacroManager {
            policy,
            macros: HashMap::new(),
            defining: None,
        }
    }

    pub fn is_defining(&self) -> bool {
        self.defining.is_some()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.macros
            .contains_key(&CasedName::new(name, self.policy))
    }

    pub fn get(&self, name: &str) -> Option<&MacroDefinition> {
        self.macros.get(&CasedName::new(name, self.policy))
    }

    pub fn start_macro(&mut self, name: &str, parameters: &[String]) -> Result<(), String> {
        if self.defining.is_some() {
            return Err("macro definitions cannot nest".to_string());
        }
        let cased = CasedName::new(name, self.policy);
        if self.macros.contains_key(&cased) {
            return Err(format!("macro '{}' already defined", cased));
        }
        let mut seen: Vec<CasedName> = Vec::new();
        for parameter in parameters {
            let folded = CasedName::new(parameter, self.policy);
            if seen.contains(&folded) {
                return Err(format!("duplicate macro parameter '{}'", parameter));
            }
            seen.push(folded);
        }
        self.defining = Some(MacroDefinition {
            name: cased,
            parameters: parameters.to_vec(),
            lines: Vec::new(),
        });
        Ok(())
    }

    pub fn add_macro_line(&mut self, raw: &str) -> Result<(), String> {
        match &mut self.defining {
            Some(definition) => {
                definition.lines.push(raw.to_string());
                Ok(())
            }
            None => Err("macro body line outside a macro definition".to_string()),
        }
    }

    pub fn end_macro(&mut self) -> Result<CasedName, String> {
        match self.defining.take() {
            Some(definition) => {
                let name = definition.name.clone();
                debug!(
                    "sealed macro '{}' ({} lines, {} parameters)",
                    name,
                    definition.lines.len(),
                    definition.parameters.len()
                );
                self.macros.insert(name.clone(), definition);
                Ok(name)
            }
            None => Err("ENDM without a macro definition".to_string()),
        }
    }

    /// Expand a macro into text lines. Missing trailing arguments substitute
    /// as the empty string; surplus arguments are an error. Body lines
    /// starting with ';;' are dropped from the expansion.
    pub fn expand(&self, name: &str, arguments: &[String]) -> Result<Vec<String>, String> {
        let definition = self
            .get(name)
            .ok_or_else(|| format!("macro '{}' is not defined", name))?;
        if arguments.len() > definition.parameters.len() {
            return Err(format!(
                "macro '{}' takes {} argument(s), {} given",
                definition.name,
                definition.parameters.len(),
                arguments.len()
            ));
        }
        let mut out = Vec::new();
        for line in &definition.lines {
            if line.trim_start().starts_with(";;") {
                continue;
            }
            out.push(self.substitute(line, &definition.parameters, arguments));
        }
        debug!("expanded macro '{}' into {} line(s)", definition.name, out.len());
        Ok(out)
    }

    /// Substitute every parameter occurrence in one pass, left to right, so
    /// that substituted argument text is never rescanned.
    fn substitute(&self, line: &str, parameters: &[String], arguments: &[String]) -> String {
        let chars: Vec<char> = line.chars().collect();
        let mut out = String::with_capacity(line.len());
        let mut i = 0;
        'scan: while i < chars.len() {
            if boundary_before(&chars, i) {
                for (p, parameter) in parameters.iter().enumerate() {
                    if self.matches_at(&chars, i, parameter) {
                        let end = i + parameter.chars().count();
                        if boundary_after(&chars, end) {
                            out.push_str(arguments.get(p).map(String::as_str).unwrap_or(""));
                            i = end;
                            continue 'scan;
                        }
                    }
                }
            }
            // the position itself was not a match start; emit and advance
            out.push(chars[i]);
            i += 1;
        }
        out
    }

    fn matches_at(&self, chars: &[char], at: usize, parameter: &str) -> bool {
        let mut i = at;
        for pc in parameter.chars() {
            match chars.get(i) {
                Some(&c) if chars_equal(c, pc, self.policy) => i += 1,
                _ => return false,
            }
        }
        true
    }
}

fn chars_equal(a: char, b: char, policy: CasePolicy) -> bool {
    match policy {
        CasePolicy::Insensitive => a.eq_ignore_ascii_case(&b),
        CasePolicy::Sensitive => a == b,
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || DELIMITERS.contains(c)
}

/// A match may start at the line start or after a delimiter.
fn boundary_before(chars: &[char], at: usize) -> bool {
    at == 0 || is_delimiter(chars[at - 1])
}

/// A match may end at the line end or before a delimiter.
fn boundary_after(chars: &[char], end: usize) -> bool {
    end >= chars.len() || is_delimiter(chars[end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(name: &str, parameters: &[&str], body: &[&str]) -> MacroManager {
        let mut manager = MacroManager::new(CasePolicy::Insensitive);
        let parameters: Vec<String> = parameters.iter().map(|s| s.to_string()).collect();
        manager.start_macro(name, &parameters).unwrap();
        for line in body {
            manager.add_macro_line(line).unwrap();
        }
        manager.end_macro().unwrap();
        manager
    }

    #[test]
    fn test_expand_substitutes_parameters() {
        let manager = manager_with("STORE", &["X"], &["\tDB X"]);
        let lines = manager
            .expand("STORE", &["42".to_string()])
            .unwrap();
        assert_eq!(lines, vec!["\tDB 42"]);
    }

    #[test]
    fn test_parameter_needs_word_boundary() {
        let manager = manager_with("M", &["X"], &["\tDB XRAY, X"]);
        let lines = manager.expand("M", &["1".to_string()]).unwrap();
        assert_eq!(lines, vec!["\tDB XRAY, 1"]);
    }

    #[test]
    fn test_parameter_matches_between_delimiters() {
        let manager = manager_with("M", &["A"], &["\tDB A+A,(A)"]);
        let lines = manager.expand("M", &["7".to_string()]).unwrap();
        assert_eq!(lines, vec!["\tDB 7+7,(7)"]);
    }

    #[test]
    fn test_missing_trailing_arguments_are_empty() {
        let manager = manager_with("M", &["A", "B"], &["\tDB A B"]);
        let lines = manager.expand("M", &["1".to_string()]).unwrap();
        assert_eq!(lines, vec!["\tDB 1 "]);
    }

    #[test]
    fn test_too_many_arguments_rejected() {
        let manager = manager_with("M", &["A"], &["\tDB A"]);
        let err = manager
            .expand("M", &["1".to_string(), "2".to_string()])
            .unwrap_err();
        assert!(err.contains("takes 1 argument"));
    }

    #[test]
    fn test_double_semicolon_lines_dropped() {
        let manager = manager_with("M", &[], &[";; internal note", "; kept comment", "\tDB 1"]);
        let lines = manager.expand("M", &[]).unwrap();
        assert_eq!(lines, vec!["; kept comment", "\tDB 1"]);
    }

    #[test]
    fn test_redefinition_rejected() {
        let mut manager = manager_with("M", &[], &["\tDB 1"]);
        let err = manager.start_macro("m", &[]).unwrap_err();
        assert!(err.contains("already defined"));
    }

    #[test]
    fn test_duplicate_parameters_rejected() {
        let mut manager = MacroManager::new(CasePolicy::Insensitive);
        let err = manager
            .start_macro("M", &["A".to_string(), "a".to_string()])
            .unwrap_err();
        assert!(err.contains("duplicate macro parameter"));
    }

    #[test]
    fn test_nested_definition_rejected() {
        let mut manager = MacroManager::new(CasePolicy::Insensitive);
        manager.start_macro("OUTER", &[]).unwrap();
        let err = manager.start_macro("INNER", &[]).unwrap_err();
        assert!(err.contains("cannot nest"));
    }

    #[test]
    fn test_case_sensitive_names_distinct() {
        let mut manager = MacroManager::new(CasePolicy::Sensitive);
        manager.start_macro("m", &[]).unwrap();
        manager.end_macro().unwrap();
        manager.start_macro("M", &[]).unwrap();
        manager.end_macro().unwrap();
        assert!(manager.exists("m"));
        assert!(manager.exists("M"));
    }

    #[test]
    fn test_expansion_is_pure() {
        let manager = manager_with("M", &["A"], &["\tDB A"]);
        let first = manager.expand("M", &["9".to_string()]).unwrap();
        let second = manager.expand("M", &["9".to_string()]).unwrap();
        assert_eq!(first, second);
    }
}
