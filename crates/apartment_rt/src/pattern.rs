// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Compiles the comma/semicolon/pipe/whitespace-separated glob list used by both flow task-name
//! observers and the notification center into a single precompiled [`Regex`].

use regex::Regex;

/// Splits `pattern` on any of `,`, `;`, `|`, or whitespace, compiles each item as a glob (`*`
/// matches any run of characters, `?` matches exactly one) with everything else escaped, and joins
/// the items into one alternation anchored at both ends.
///
/// Returns `None` if `pattern` contains no items (empty after splitting).
#[must_use]
pub(crate) fn compile(pattern: &str) -> Option<Regex> {
    let items: Vec<String> = pattern
        .split(|c: char| c == ',' || c == ';' || c == '|' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(glob_to_regex_fragment)
        .collect();

    if items.is_empty() {
        return None;
    }

    let joined = format!("^(?:{})$", items.join("|"));
    Regex::new(&joined).ok()
}

fn glob_to_regex_fragment(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_literal_matches_exactly() {
        let re = compile("build").unwrap();
        assert!(re.is_match("build"));
        assert!(!re.is_match("build2"));
    }

    #[test]
    fn star_matches_any_suffix() {
        let re = compile("build_*").unwrap();
        assert!(re.is_match("build_debug"));
        assert!(!re.is_match("rebuild_debug"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let re = compile("task?").unwrap();
        assert!(re.is_match("task1"));
        assert!(!re.is_match("task12"));
    }

    #[test]
    fn comma_semicolon_pipe_and_whitespace_all_separate_items() {
        let re = compile("a, b; c|d e").unwrap();
        for name in ["a", "b", "c", "d", "e"] {
            assert!(re.is_match(name), "expected {name} to match");
        }
        assert!(!re.is_match("f"));
    }

    #[test]
    fn empty_pattern_compiles_to_none() {
        assert!(compile("  ,; ").is_none());
    }
}
