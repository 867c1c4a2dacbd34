//! Static import validation of candidate Python source.
//!
//! The source is parsed with tree-sitter and every `import` /
//! `from ... import` node is inspected, wherever it appears (inside
//! functions, `try` blocks, conditionals). Nothing is executed. Imports
//! assembled at runtime (`__import__`, `exec`, reflection) are invisible
//! here; the executor's isolation is what bounds those.

use std::collections::HashSet;

use serde::Serialize;
use tree_sitter::{Node, Parser, Tree};

use crate::policy::AllowListPolicy;

/// Outcome of validating one request. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Disallowed top-level modules, deduplicated, in first-seen order.
    pub disallowed_modules: Vec<String>,
    pub message: String,
}

impl ValidationResult {
    pub fn accepted() -> Self {
        Self {
            is_valid: true,
            disallowed_modules: Vec::new(),
            message: String::new(),
        }
    }

    pub fn rejected(disallowed_modules: Vec<String>) -> Self {
        let message = rejection_message(&disallowed_modules);
        Self {
            is_valid: false,
            disallowed_modules,
            message,
        }
    }

    /// Rejection whose message also lists what the policy permits.
    pub fn rejected_with_hint(disallowed_modules: Vec<String>, hint: &str) -> Self {
        let message = format!("{}\n\n{hint}", rejection_message(&disallowed_modules));
        Self {
            is_valid: false,
            disallowed_modules,
            message,
        }
    }

    pub fn parse_error(detail: &str) -> Self {
        Self {
            is_valid: false,
            disallowed_modules: Vec::new(),
            message: format!("Syntax error in code: {detail}"),
        }
    }
}

fn rejection_message(modules: &[String]) -> String {
    format!(
        "Import restriction violation: The following imports are not allowed: {}",
        modules.join(", ")
    )
}

/// Checks every import in `source` against `policy`.
pub fn validate(source: &str, policy: &AllowListPolicy) -> ValidationResult {
    let modules = match extract_imports(source) {
        Ok(modules) => modules,
        Err(detail) => return ValidationResult::parse_error(&detail),
    };

    let disallowed: Vec<String> = modules
        .into_iter()
        .filter(|module| !policy.is_allowed(module))
        .collect();

    if disallowed.is_empty() {
        ValidationResult::accepted()
    } else {
        ValidationResult::rejected_with_hint(disallowed, &policy.describe())
    }
}

/// Returns the top-level module of every import, deduplicated in
/// first-seen order, or a description of the first syntax error.
pub fn extract_imports(source: &str) -> Result<Vec<String>, String> {
    let tree = parse(source)?;
    let root = tree.root_node();

    if root.has_error() {
        return Err(describe_error(root));
    }
    if let Some(detail) = python2_statement(root) {
        return Err(detail);
    }

    let bytes = source.as_bytes();
    let mut seen = HashSet::new();
    let mut modules = Vec::new();
    let mut push = |module: String| {
        if seen.insert(module.clone()) {
            modules.push(module);
        }
    };

    walk(root, |node| match node.kind() {
        "import_statement" => {
            let mut cursor = node.walk();
            for name in node.children_by_field_name("name", &mut cursor) {
                if let Some(module) = top_level_module(name, bytes) {
                    push(module);
                }
            }
            false
        }
        "import_from_statement" => {
            // `from . import x` has no module to check
            if let Some(module) = node
                .child_by_field_name("module_name")
                .and_then(|n| top_level_module(n, bytes))
            {
                push(module);
            }
            false
        }
        "future_import_statement" => {
            push("__future__".to_string());
            false
        }
        _ => true,
    });

    Ok(modules)
}

fn parse(source: &str) -> Result<Tree, String> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| format!("python grammar unavailable: {e}"))?;
    parser
        .parse(source, None)
        .ok_or_else(|| "parser produced no syntax tree".to_string())
}

/// First identifier of a `dotted_name`, looking through `aliased_import`
/// and `relative_import` wrappers. Whitespace around dots is legal
/// Python, so the identifier node is used rather than splitting text.
fn top_level_module(node: Node, source: &[u8]) -> Option<String> {
    match node.kind() {
        "dotted_name" => {
            let mut cursor = node.walk();
            let first = node.named_children(&mut cursor).next()?;
            first.utf8_text(source).ok().map(str::to_string)
        }
        "aliased_import" => node
            .child_by_field_name("name")
            .and_then(|n| top_level_module(n, source)),
        "relative_import" => {
            let mut cursor = node.walk();
            let dotted = node
                .named_children(&mut cursor)
                .find(|child| child.kind() == "dotted_name")?;
            top_level_module(dotted, source)
        }
        _ => None,
    }
}

fn describe_error(root: Node) -> String {
    let mut first = None;
    walk(root, |node| {
        if first.is_some() {
            return false;
        }
        if node.is_error() || node.is_missing() {
            first = Some(node);
            return false;
        }
        node.has_error()
    });

    match first {
        Some(node) => {
            let pos = node.start_position();
            let what = if node.is_missing() {
                format!("missing '{}'", node.kind())
            } else {
                "invalid syntax".to_string()
            };
            format!("{what} at line {}, column {}", pos.row + 1, pos.column + 1)
        }
        None => "invalid syntax".to_string(),
    }
}

/// The grammar still accepts Python 2 `print` / `exec` statements, which
/// Python 3 rejects at compile time.
fn python2_statement(root: Node) -> Option<String> {
    let mut found = None;
    walk(root, |node| {
        if found.is_some() {
            return false;
        }
        let what = match node.kind() {
            "print_statement" => "Python 2 print statement",
            "exec_statement" => "Python 2 exec statement",
            _ => return true,
        };
        let pos = node.start_position();
        found = Some(format!(
            "{what} at line {}, column {}",
            pos.row + 1,
            pos.column + 1
        ));
        false
    });
    found
}

/// Pre-order traversal without recursion. `visit` returns whether to
/// descend into the node's children.
fn walk<'t>(root: Node<'t>, mut visit: impl FnMut(Node<'t>) -> bool) {
    let mut cursor = root.walk();
    loop {
        if visit(cursor.node()) && cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> AllowListPolicy {
        AllowListPolicy::builtin()
    }

    // ── allowed code ────────────────────────────────────

    #[test]
    fn test_allowed_imports_pass() {
        let cases = [
            "import numpy",
            "import pandas as pd",
            "import matplotlib.pyplot as plt",
            "from scipy import stats",
            "import sys",
            "from pathlib import Path",
            "import os, json, re",
        ];
        for code in cases {
            let result = validate(code, &builtin());
            assert!(result.is_valid, "{code}: {}", result.message);
            assert!(result.disallowed_modules.is_empty());
        }
    }

    #[test]
    fn test_no_imports_is_valid() {
        let result = validate("x = 1 + 2\nprint(x)\n", &builtin());
        assert!(result.is_valid);
        assert!(result.message.is_empty());
    }

    #[test]
    fn test_empty_source_is_valid() {
        assert!(validate("", &builtin()).is_valid);
    }

    #[test]
    fn test_future_import_allowed() {
        let result = validate("from __future__ import annotations\n", &builtin());
        assert!(result.is_valid, "{}", result.message);
    }

    // ── disallowed code ─────────────────────────────────

    #[test]
    fn test_numpy_allowed_requests_rejected() {
        let result = validate("import numpy as np\nimport requests\n", &builtin());
        assert!(!result.is_valid);
        assert_eq!(result.disallowed_modules, vec!["requests"]);
        assert!(result
            .message
            .starts_with("Import restriction violation: The following imports are not allowed: requests"));
    }

    #[test]
    fn test_disallowed_listed_once_in_first_seen_order() {
        let code = "\
import torch
import requests
from torch import nn
import requests.adapters
import flask
";
        let result = validate(code, &builtin());
        assert!(!result.is_valid);
        assert_eq!(result.disallowed_modules, vec!["torch", "requests", "flask"]);
    }

    #[test]
    fn test_aliasing_and_from_resolve_to_same_module() {
        let a = validate("import requests as r", &builtin());
        let b = validate("from requests import get", &builtin());
        let c = validate("from requests.sessions import Session as S", &builtin());
        assert_eq!(a.disallowed_modules, vec!["requests"]);
        assert_eq!(b.disallowed_modules, vec!["requests"]);
        assert_eq!(c.disallowed_modules, vec!["requests"]);
    }

    #[test]
    fn test_multiple_names_in_one_statement() {
        let result = validate("import os, requests, flask as f", &builtin());
        assert_eq!(result.disallowed_modules, vec!["requests", "flask"]);
    }

    #[test]
    fn test_nested_imports_are_found() {
        let code = "\
def fetch():
    try:
        import requests
    except ImportError:
        pass

class Loader:
    def load(self):
        if True:
            from urllib3 import PoolManager
";
        let result = validate(code, &builtin());
        assert_eq!(result.disallowed_modules, vec!["requests", "urllib3"]);
    }

    #[test]
    fn test_import_inside_string_is_ignored() {
        let code = "s = 'import requests'\nprint(s)\n";
        assert!(validate(code, &builtin()).is_valid);
    }

    #[test]
    fn test_dynamic_import_is_not_detected() {
        // Runtime construction is out of reach of static validation
        let code = "m = __import__('req' + 'uests')\n";
        assert!(validate(code, &builtin()).is_valid);
    }

    #[test]
    fn test_importlib_rejected() {
        let result = validate("import importlib\n", &builtin());
        assert_eq!(result.disallowed_modules, vec!["importlib"]);
    }

    #[test]
    fn test_relative_imports() {
        let bare = validate("from . import helpers\n", &builtin());
        assert!(bare.is_valid);

        let named = validate("from .helpers import tool\n", &builtin());
        assert_eq!(named.disallowed_modules, vec!["helpers"]);
    }

    #[test]
    fn test_wildcard_import() {
        let result = validate("from requests import *\n", &builtin());
        assert_eq!(result.disallowed_modules, vec!["requests"]);
    }

    #[test]
    fn test_rejection_message_lists_allowed_libraries() {
        let result = validate("import requests", &builtin());
        assert!(result.message.contains("Allowed libraries:"));
        assert!(result.message.contains("numpy"));
    }

    #[test]
    fn test_custom_policy() {
        let policy = AllowListPolicy::new(["math"], ["requests"]);
        assert!(validate("import requests\nimport math", &policy).is_valid);
        assert_eq!(
            validate("import json", &policy).disallowed_modules,
            vec!["json"]
        );
    }

    // ── syntax errors ───────────────────────────────────

    #[test]
    fn test_syntax_error_reports_parse_failure() {
        let result = validate("def broken(:\n    pass\n", &builtin());
        assert!(!result.is_valid);
        assert!(result.disallowed_modules.is_empty());
        assert!(result.message.starts_with("Syntax error in code:"));
        assert!(result.message.contains("line 1"));
    }

    #[test]
    fn test_syntax_error_wins_over_imports() {
        let result = validate("import requests\nx = (\n", &builtin());
        assert!(!result.is_valid);
        assert!(result.disallowed_modules.is_empty());
        assert!(result.message.starts_with("Syntax error in code:"));
    }

    #[test]
    fn test_python2_statements_are_syntax_errors() {
        for code in [
            "print 'hello'\n",
            "exec 'x=1'\n",
            "print >>sys.stderr, 'x'\n",
            "import json\nif True:\n    print 'nested'\n",
        ] {
            let result = validate(code, &builtin());
            assert!(!result.is_valid, "{code}");
            assert!(result.disallowed_modules.is_empty(), "{code}");
            assert!(result.message.starts_with("Syntax error in code: Python 2"), "{code}: {}", result.message);
        }
    }

    #[test]
    fn test_python3_print_and_exec_calls_are_valid() {
        for code in ["print('hello')\n", "print ('spaced')\n", "exec('x = 1')\n", "print\n"] {
            let result = validate(code, &builtin());
            assert!(result.is_valid, "{code}: {}", result.message);
        }
    }

    #[test]
    fn test_python2_statement_location() {
        let result = validate("x = 1\nprint x\n", &builtin());
        assert!(result.message.contains("line 2, column 1"), "{}", result.message);
    }

    // ── extract_imports ─────────────────────────────────

    #[test]
    fn test_extract_imports_order_and_dedup() {
        let modules = extract_imports("import b\nimport a\nfrom b.c import d\nimport a.x\n").unwrap();
        assert_eq!(modules, vec!["b", "a"]);
    }

    #[test]
    fn test_extract_imports_whitespace_in_dotted_name() {
        let modules = extract_imports("import os . path\n").unwrap();
        assert_eq!(modules, vec!["os"]);
    }
}
