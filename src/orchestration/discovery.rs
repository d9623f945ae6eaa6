//! Target discovery and static profiling.
//!
//! Walks the project (respecting `.gitignore`), keeps files with a
//! configured extension, and profiles each one with cheap signals: bracket
//! balance for a suspected syntax error, branch keywords plus nesting depth
//! for complexity. The profile only decides priority; nothing here parses
//! the language.

use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::config::DiscoveryConfig;
use crate::core::task::Priority;
use crate::util::fingerprint_bytes;
use crate::{mlog_debug, mlog_warn, Error, Result};

static BRANCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(if|for|while|case|catch)\b|&&|\|\|").unwrap());

/// A file the fix chain runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Relative to the project root.
    pub path: PathBuf,
    pub lines: usize,
    pub complexity: u32,
    pub suspect_syntax: bool,
    /// SHA-256 of the content at discovery time.
    pub fingerprint: String,
}

impl Target {
    /// Syntax suspects first, then complex files, then the rest.
    pub fn priority(&self, complexity_threshold: u32) -> Priority {
        if self.suspect_syntax {
            Priority::High
        } else if self.complexity >= complexity_threshold {
            Priority::Normal
        } else {
            Priority::Low
        }
    }
}

/// Static signals for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Profile {
    pub lines: usize,
    pub complexity: u32,
    pub suspect_syntax: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum Scan {
    Code,
    LineComment,
    BlockComment,
    Str(char),
}

/// Profile source text.
///
/// Strings and comments are blanked before counting, so a brace inside a
/// string literal does not unbalance the file.
pub fn profile(content: &str) -> Profile {
    let mut code = String::with_capacity(content.len());
    let mut stack: Vec<char> = Vec::new();
    let mut mismatched = false;
    let mut max_depth = 0usize;
    let mut state = Scan::Code;

    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            Scan::LineComment => {
                if c == '\n' {
                    code.push('\n');
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = Scan::Code;
                } else if c == '\n' {
                    code.push('\n');
                }
            }
            Scan::Str(quote) => {
                if c == '\\' {
                    chars.next();
                } else if c == quote {
                    state = Scan::Code;
                } else if c == '\n' && quote != '`' {
                    // Unterminated literal; resync at the line end.
                    code.push('\n');
                    state = Scan::Code;
                }
            }
            Scan::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = Scan::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = Scan::BlockComment;
                }
                '"' | '\'' | '`' => {
                    code.push(' ');
                    state = Scan::Str(c);
                }
                '(' | '[' | '{' => {
                    stack.push(c);
                    max_depth = max_depth.max(stack.len());
                    code.push(c);
                }
                ')' | ']' | '}' => {
                    let open = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if stack.pop() != Some(open) {
                        mismatched = true;
                    }
                    code.push(c);
                }
                _ => code.push(c),
            },
        }
    }

    let branches = BRANCH_RE.find_iter(&code).count();
    Profile {
        lines: content.lines().count(),
        complexity: (branches + max_depth) as u32,
        suspect_syntax: mismatched || !stack.is_empty() || matches!(state, Scan::BlockComment),
    }
}

fn is_excluded(rel: &Path, exclude: &[String]) -> bool {
    exclude.iter().any(|pattern| {
        let pattern = pattern.trim().trim_end_matches('/');
        if pattern.is_empty() {
            return false;
        }
        rel.starts_with(pattern) || rel.components().any(|c| c.as_os_str() == pattern)
    })
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Find and profile every target under `root`, sorted by path.
///
/// Hidden files and gitignored paths are skipped. When `max_targets` is set,
/// the most urgent targets are kept.
pub fn discover(root: &Path, config: &DiscoveryConfig) -> Result<Vec<Target>> {
    if !root.is_dir() {
        return Err(Error::RootMissing(root.to_path_buf()));
    }

    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .follow_links(false)
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false)
        .sort_by_file_path(|a, b| a.cmp(b));

    let mut targets = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth().unwrap_or(0) == 0 => return Err(e.into()),
            Err(e) => {
                mlog_warn!("discover: skipping entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        if is_excluded(rel, &config.exclude) || !has_extension(rel, &config.extensions) {
            continue;
        }

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                mlog_warn!("discover: cannot read {}: {}", rel.display(), e);
                continue;
            }
        };
        let profile = profile(&String::from_utf8_lossy(&bytes));
        targets.push(Target {
            path: rel.to_path_buf(),
            lines: profile.lines,
            complexity: profile.complexity,
            suspect_syntax: profile.suspect_syntax,
            fingerprint: fingerprint_bytes(&bytes),
        });
    }

    if config.max_targets > 0 && targets.len() > config.max_targets {
        let threshold = config.complexity_threshold;
        targets.sort_by_key(|t| (t.priority(threshold), Reverse(t.complexity), t.path.clone()));
        targets.truncate(config.max_targets);
        targets.sort_by(|a, b| a.path.cmp(&b.path));
    }

    mlog_debug!(
        "discover: {} targets under {} ({} suspected syntax errors)",
        targets.len(),
        root.display(),
        targets.iter().filter(|t| t.suspect_syntax).count()
    );
    Ok(targets)
}
