//! Allow-list of importable top-level modules.
//!
//! The policy is plain data: built once at startup from the built-in
//! tables plus `[policy]` overrides, then shared read-only (usually
//! behind an `Arc`) and passed explicitly to the validator.

use std::collections::BTreeSet;

use crate::config::PolicyConfig;

/// Standard library modules code may import.
///
/// Not exhaustive; covers what data-processing snippets reach for.
/// Dynamic-loading primitives (`importlib`, `ctypes`, `builtins`) are
/// not listed.
const STANDARD_LIBRARY: &[&str] = &[
    "__future__", "sys", "os", "math", "random", "datetime", "time", "json", "csv", "io",
    "collections", "itertools", "functools", "operator", "re", "string", "textwrap",
    "unicodedata", "struct", "codecs", "base64", "binascii", "hashlib", "hmac", "secrets",
    "pathlib", "glob", "fnmatch", "tempfile", "shutil", "pickle", "shelve", "sqlite3", "gzip",
    "bz2", "lzma", "zipfile", "tarfile", "configparser", "argparse", "logging", "warnings",
    "traceback", "decimal", "fractions", "statistics", "enum", "typing", "copy", "pprint",
    "heapq", "bisect", "array", "queue", "threading", "multiprocessing", "subprocess",
    "socket", "ssl", "email", "urllib", "http", "html", "xml", "webbrowser", "uuid",
    "contextlib", "abc", "dataclasses",
];

/// Third-party packages baked into the execution image, by import name.
const THIRD_PARTY: &[&str] = &[
    "numpy", "pandas", "matplotlib", "scipy", "sklearn", "pdfplumber", "fitz", "pymupdf",
    "docx", "pptx", "openpyxl", "chardet", "magic",
];

/// Immutable set of permitted top-level module names.
///
/// The standard/third-party split is informational (operator output);
/// membership checks treat the union as one set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowListPolicy {
    standard: BTreeSet<String>,
    third_party: BTreeSet<String>,
}

impl AllowListPolicy {
    /// The built-in allow-list with no overrides.
    pub fn builtin() -> Self {
        Self::new(STANDARD_LIBRARY.iter().copied(), THIRD_PARTY.iter().copied())
    }

    pub fn new<S, T>(standard: S, third_party: T) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            standard: standard.into_iter().map(Into::into).collect(),
            third_party: third_party.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds the process-wide policy from the `[policy]` config section.
    ///
    /// `replace = true` discards the built-in tables and uses `allow` as
    /// the whole set. Otherwise `allow` extends the third-party partition.
    /// `deny` is applied last in both cases.
    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut policy = if config.replace {
            Self::new(Vec::<String>::new(), config.allow.iter().cloned())
        } else {
            let mut policy = Self::builtin();
            policy.third_party.extend(config.allow.iter().cloned());
            policy
        };
        for module in &config.deny {
            policy.standard.remove(module);
            policy.third_party.remove(module);
        }
        policy
    }

    /// Case-sensitive membership check on the first dotted segment,
    /// so allow-listing `foo` authorizes `foo.bar`.
    pub fn is_allowed(&self, module: &str) -> bool {
        let top = top_level(module);
        self.standard.contains(top) || self.third_party.contains(top)
    }

    pub fn standard_library(&self) -> impl Iterator<Item = &str> {
        self.standard.iter().map(String::as_str)
    }

    pub fn third_party(&self) -> impl Iterator<Item = &str> {
        self.third_party.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.standard.union(&self.third_party).count()
    }

    pub fn is_empty(&self) -> bool {
        self.standard.is_empty() && self.third_party.is_empty()
    }

    /// Human-readable list of what is allowed, appended to rejection
    /// messages so the code author can rewrite without guessing.
    pub fn describe(&self) -> String {
        let mut out = String::from("Allowed libraries:");
        if !self.standard.is_empty() {
            out.push_str("\n- Standard Python library modules");
        }
        if !self.third_party.is_empty() {
            let names: Vec<&str> = self.third_party().collect();
            out.push_str(&format!("\n- {}", names.join(", ")));
        }
        out
    }
}

impl Default for AllowListPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}

/// First segment of a dotted module path (`"a.b.c"` -> `"a"`).
pub fn top_level(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_config(allow: &[&str], deny: &[&str], replace: bool) -> PolicyConfig {
        PolicyConfig {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            replace,
        }
    }

    // ── membership ──────────────────────────────────────

    #[test]
    fn test_builtin_allows_standard_and_third_party() {
        let policy = AllowListPolicy::builtin();
        assert!(policy.is_allowed("json"));
        assert!(policy.is_allowed("pathlib"));
        assert!(policy.is_allowed("numpy"));
        assert!(policy.is_allowed("sklearn"));
    }

    #[test]
    fn test_builtin_rejects_unknown_modules() {
        let policy = AllowListPolicy::builtin();
        assert!(!policy.is_allowed("requests"));
        assert!(!policy.is_allowed("torch"));
        assert!(!policy.is_allowed("pip"));
    }

    #[test]
    fn test_dynamic_loading_primitives_not_allowed() {
        let policy = AllowListPolicy::builtin();
        assert!(!policy.is_allowed("importlib"));
        assert!(!policy.is_allowed("ctypes"));
        assert!(!policy.is_allowed("builtins"));
    }

    #[test]
    fn test_dotted_path_uses_top_level() {
        let policy = AllowListPolicy::builtin();
        assert!(policy.is_allowed("matplotlib.pyplot"));
        assert!(policy.is_allowed("os.path"));
        assert!(!policy.is_allowed("requests.adapters"));
    }

    #[test]
    fn test_membership_is_case_sensitive() {
        let policy = AllowListPolicy::builtin();
        assert!(!policy.is_allowed("NumPy"));
        assert!(!policy.is_allowed("JSON"));
    }

    #[test]
    fn test_prefix_is_not_membership() {
        let policy = AllowListPolicy::new(["os"], Vec::<String>::new());
        assert!(!policy.is_allowed("osx"));
    }

    // ── overrides ───────────────────────────────────────

    #[test]
    fn test_from_config_extends() {
        let policy = AllowListPolicy::from_config(&policy_config(&["requests"], &[], false));
        assert!(policy.is_allowed("requests"));
        assert!(policy.is_allowed("numpy"));
        assert!(policy.third_party().any(|m| m == "requests"));
    }

    #[test]
    fn test_from_config_deny_removes_from_both_partitions() {
        let policy =
            AllowListPolicy::from_config(&policy_config(&[], &["subprocess", "pandas"], false));
        assert!(!policy.is_allowed("subprocess"));
        assert!(!policy.is_allowed("pandas"));
        assert!(policy.is_allowed("numpy"));
    }

    #[test]
    fn test_from_config_replace() {
        let policy = AllowListPolicy::from_config(&policy_config(&["math"], &[], true));
        assert!(policy.is_allowed("math"));
        assert!(!policy.is_allowed("json"));
        assert_eq!(policy.len(), 1);
    }

    #[test]
    fn test_default_config_equals_builtin() {
        let policy = AllowListPolicy::from_config(&PolicyConfig::default());
        assert_eq!(policy, AllowListPolicy::builtin());
    }

    // ── describe ────────────────────────────────────────

    #[test]
    fn test_describe_lists_third_party() {
        let text = AllowListPolicy::builtin().describe();
        assert!(text.starts_with("Allowed libraries:"));
        assert!(text.contains("Standard Python library modules"));
        assert!(text.contains("numpy"));
    }

    #[test]
    fn test_top_level() {
        assert_eq!(top_level("a.b.c"), "a");
        assert_eq!(top_level("numpy"), "numpy");
        assert_eq!(top_level(""), "");
    }
}
