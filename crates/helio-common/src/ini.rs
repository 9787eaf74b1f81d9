//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Shared primitives and utilities for the monitoring runtime."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Minimal `key = value` configuration parser.
//!
//! The format is deliberately small: `[section]` headers, one `key = value`
//! pair per line, and comments introduced by `;` or `#`. A comment marker
//! only counts when it is at the start of the line or preceded by
//! whitespace, so values such as device keys containing `;` survive intact.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use tracing::warn;

/// One parsed configuration document: ordered sections of ordered keys.
/// Section and key names are normalised to lowercase.
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    sections: IndexMap<String, IndexMap<String, String>>,
}

impl IniDocument {
    /// Read and parse a configuration file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        Self::parse(&contents)
    }

    /// Parse configuration text.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut sections: IndexMap<String, IndexMap<String, String>> = IndexMap::new();
        let mut current = String::from("default");

        for (line_no, raw_line) in contents.lines().enumerate() {
            let line = strip_inline_comment(raw_line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_ascii_lowercase();
                sections.entry(current.clone()).or_default();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(anyhow!(
                    "config line {} is neither a section header nor a key = value pair: {:?}",
                    line_no + 1,
                    raw_line
                ));
            };

            let key = key.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(anyhow!("config line {} has an empty key", line_no + 1));
            }
            let value = strip_quotes(value.trim()).to_owned();
            sections
                .entry(current.clone())
                .or_default()
                .insert(key, value);
        }

        Ok(Self { sections })
    }

    /// Whether the named section exists.
    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(&section.to_ascii_lowercase())
    }

    /// All keys of a section in declaration order, or an empty map.
    pub fn section(&self, section: &str) -> IndexMap<String, String> {
        self.sections
            .get(&section.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Raw string value lookup.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(&section.to_ascii_lowercase())
            .and_then(|s| s.get(&key.to_ascii_lowercase()))
            .map(String::as_str)
    }

    /// String lookup with a default.
    pub fn get_str(&self, section: &str, key: &str, default: &str) -> String {
        self.get(section, key)
            .map(str::to_owned)
            .unwrap_or_else(|| default.to_owned())
    }

    /// Integer lookup with a default; malformed values are logged and
    /// replaced by the default rather than aborting startup.
    pub fn get_i64(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.get(section, key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(section, key, value = raw, "not an integer, using default");
                default
            }),
        }
    }

    /// Unsigned integer lookup with a default.
    pub fn get_u64(&self, section: &str, key: &str, default: u64) -> u64 {
        match self.get(section, key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(section, key, value = raw, "not an unsigned integer, using default");
                default
            }),
        }
    }

    /// Float lookup with a default.
    pub fn get_f64(&self, section: &str, key: &str, default: f64) -> f64 {
        match self.get(section, key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(section, key, value = raw, "not a number, using default");
                default
            }),
        }
    }

    /// Boolean lookup accepting `true|false|1|0|yes|no` case-insensitively.
    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            None => default,
            Some(raw) => match parse_bool(raw) {
                Some(v) => v,
                None => {
                    warn!(section, key, value = raw, "not a boolean, using default");
                    default
                }
            },
        }
    }
}

/// Parse the accepted boolean spellings.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Cut the line at the first `;` or `#` that starts a comment. A marker
/// only starts a comment at the beginning of the line or after whitespace.
fn strip_inline_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        if b != b';' && b != b'#' {
            continue;
        }
        if idx == 0 || bytes[idx - 1].is_ascii_whitespace() {
            return &line[..idx];
        }
    }
    line
}

/// Strip one pair of surrounding ASCII quotes, if present.
fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_pairs() {
        let doc = IniDocument::parse(
            "[general]\npoll_interval_seconds = 5\n[plugin_inv]\nplugin_type = inverter.deye\n",
        )
        .unwrap();
        assert_eq!(doc.get("general", "poll_interval_seconds"), Some("5"));
        assert_eq!(doc.get("PLUGIN_INV", "PLUGIN_TYPE"), Some("inverter.deye"));
    }

    #[test]
    fn comment_requires_preceding_whitespace() {
        let doc =
            IniDocument::parse("[tuya]\ntuya_local_key = abc;def#ghi ; inline note\n").unwrap();
        assert_eq!(doc.get("tuya", "tuya_local_key"), Some("abc;def#ghi"));
    }

    #[test]
    fn full_line_comments_are_ignored() {
        let doc = IniDocument::parse("; leading comment\n# another\n[a]\nk = v\n").unwrap();
        assert_eq!(doc.get("a", "k"), Some("v"));
    }

    #[test]
    fn quotes_are_stripped_once() {
        let doc = IniDocument::parse("[s]\na = \"hello world\"\nb = 'x'\nc = \"\"\n").unwrap();
        assert_eq!(doc.get("s", "a"), Some("hello world"));
        assert_eq!(doc.get("s", "b"), Some("x"));
        assert_eq!(doc.get("s", "c"), Some(""));
    }

    #[test]
    fn booleans_accept_loose_spellings() {
        let doc = IniDocument::parse("[s]\na = YES\nb = 0\nc = True\nd = nope\n").unwrap();
        assert!(doc.get_bool("s", "a", false));
        assert!(!doc.get_bool("s", "b", true));
        assert!(doc.get_bool("s", "c", false));
        assert!(doc.get_bool("s", "d", true));
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(IniDocument::parse("[s]\nthis is not a pair\n").is_err());
    }
}
