//! `.gridignore` parsing and matching.
//!
//! A gitignore-style subset: `#` comments, `*`/`?` wildcards, `dir/`
//! directory patterns, `/`-anchored patterns, `**` segments, and `!`
//! negation with last match winning. Patterns apply per packaged source
//! directory; the `.gridignore` file itself is always excluded.

use std::path::Path;

use crate::error::PipelineError;

pub const IGNORE_FILE: &str = ".gridignore";

#[derive(Debug, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

#[derive(Debug)]
struct Rule {
    negated: bool,
    dir_only: bool,
    rooted: bool,
    segments: Vec<Segment>,
}

#[derive(Debug)]
enum Segment {
    /// `**`: spans directory levels. Leading position requires at least one.
    Any,
    Glob(String),
}

impl IgnoreRules {
    pub fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (negated, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            let (dir_only, pattern) = match pattern.strip_suffix('/') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            let (rooted, pattern) = match pattern.strip_prefix('/') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            if pattern.is_empty() {
                continue;
            }

            let segments = pattern
                .split('/')
                .map(|seg| {
                    if seg == "**" {
                        Segment::Any
                    } else {
                        Segment::Glob(seg.to_string())
                    }
                })
                .collect();
            rules.push(Rule {
                negated,
                dir_only,
                rooted,
                segments,
            });
        }
        Self { rules }
    }

    /// Load `<dir>/.gridignore` if present; no file means no rules.
    pub fn load(dir: &Path) -> Result<Self, PipelineError> {
        let file = dir.join(IGNORE_FILE);
        if !file.is_file() {
            return Ok(Self::default());
        }
        Ok(Self::parse(&std::fs::read_to_string(file)?))
    }

    /// Whether a file at this path (relative to the rules' directory) is
    /// excluded. Later rules override earlier ones.
    pub fn is_ignored(&self, rel: &Path) -> bool {
        let parts: Vec<&str> = rel
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        let Some(name) = parts.last() else {
            return false;
        };
        if *name == IGNORE_FILE {
            return true;
        }

        let mut ignored = false;
        for rule in &self.rules {
            if rule.matches(&parts) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}

impl Rule {
    fn matches(&self, parts: &[&str]) -> bool {
        if self.dir_only {
            // The pattern names a directory, so only ancestors of the file
            // can satisfy it.
            for end in 1..parts.len() {
                if match_segments(&self.segments, &parts[..end], true) {
                    return true;
                }
            }
            if !self.rooted && self.segments.len() == 1 {
                if let Segment::Glob(glob) = &self.segments[0] {
                    return parts[..parts.len() - 1]
                        .iter()
                        .any(|dir| glob_match(glob, dir));
                }
            }
            return false;
        }

        if match_segments(&self.segments, parts, true) {
            return true;
        }
        // A bare pattern also matches by file name at any depth.
        if !self.rooted && self.segments.len() == 1 {
            if let Segment::Glob(glob) = &self.segments[0] {
                return glob_match(glob, parts[parts.len() - 1]);
            }
        }
        false
    }
}

fn match_segments(pattern: &[Segment], parts: &[&str], at_start: bool) -> bool {
    match pattern.split_first() {
        None => parts.is_empty(),
        Some((Segment::Any, rest)) => {
            let min_skip = usize::from(at_start);
            (min_skip..=parts.len()).any(|skip| match_segments(rest, &parts[skip..], false))
        }
        Some((Segment::Glob(glob), rest)) => {
            !parts.is_empty()
                && glob_match(glob, parts[0])
                && match_segments(rest, &parts[1..], false)
        }
    }
}

/// Wildcard match over one path segment: `*` spans any run of characters,
/// `?` exactly one. Neither crosses a `/`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_at(&pattern, 0, &text, 0)
}

fn glob_match_at(pattern: &[char], pi: usize, text: &[char], ti: usize) -> bool {
    if pi >= pattern.len() {
        return ti >= text.len();
    }
    match pattern[pi] {
        '*' => {
            (ti..=text.len()).any(|next| glob_match_at(pattern, pi + 1, text, next))
        }
        '?' => ti < text.len() && glob_match_at(pattern, pi + 1, text, ti + 1),
        c => ti < text.len() && text[ti] == c && glob_match_at(pattern, pi + 1, text, ti + 1),
    }
}
