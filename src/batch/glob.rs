//! Shell-style pattern matching for input enumeration.
//!
//! Supported syntax: `*`, `?`, `[abc]`, `[a-z]`, `[!abc]`/`[^abc]`, `{a,b}`
//! alternation and a `**` path segment matching any number of directories.

/// Bound on recursive match calls so patterns like `*a*a*a*a*b` stay cheap.
const MAX_MATCH_CALLS: usize = 50_000;

pub fn is_recursive_pattern(pattern: &str) -> bool {
    pattern.split('/').any(|segment| segment == "**")
}

/// Matches a `/`-separated relative path against a pattern.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let path_segments = path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
    expand_braces(pattern).iter().any(|expanded| {
        let pattern_segments = expanded
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        segments_match(pattern_segments.as_slice(), path_segments.as_slice())
    })
}

/// Matches a single path component (no `/`) against a pattern.
pub fn name_matches(pattern: &str, name: &str) -> bool {
    let name_chars = name.chars().collect::<Vec<_>>();
    expand_braces(pattern).iter().any(|expanded| {
        let pattern_chars = expanded.chars().collect::<Vec<_>>();
        let mut calls = 0usize;
        match_chars(&pattern_chars, 0, &name_chars, 0, &mut calls)
    })
}

fn segments_match(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| segments_match(rest, &path[skip..])),
        Some((head, rest)) => match path.split_first() {
            Some((segment, path_rest)) => {
                name_matches(head, segment) && segments_match(rest, path_rest)
            }
            None => false,
        },
    }
}

pub fn expand_braces(pattern: &str) -> Vec<String> {
    let chars = pattern.chars().collect::<Vec<_>>();
    let mut depth = 0usize;
    let mut open = None;
    let mut close = None;
    for (i, &ch) in chars.iter().enumerate() {
        match ch {
            '{' => {
                if depth == 0 {
                    open = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let (Some(start), Some(end)) = (open, close) else {
        return vec![pattern.to_string()];
    };

    let prefix = chars[..start].iter().collect::<String>();
    let suffix = chars[end + 1..].iter().collect::<String>();
    let body = chars[start + 1..end].iter().collect::<String>();

    let mut out = Vec::new();
    for alternative in split_alternatives(body.as_str()) {
        out.extend(expand_braces(
            format!("{prefix}{alternative}{suffix}").as_str(),
        ));
    }
    out
}

fn split_alternatives(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for ch in body.chars() {
        match ch {
            '{' => {
                depth += 1;
                current.push(ch);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);
    parts
}

fn match_chars(
    pattern: &[char],
    pi: usize,
    input: &[char],
    ii: usize,
    calls: &mut usize,
) -> bool {
    *calls += 1;
    if *calls > MAX_MATCH_CALLS {
        return false;
    }
    if pi >= pattern.len() {
        return ii >= input.len();
    }

    match pattern[pi] {
        '*' => {
            let mut next = pi;
            while next < pattern.len() && pattern[next] == '*' {
                next += 1;
            }
            if next >= pattern.len() {
                return true;
            }
            (ii..=input.len()).any(|start| match_chars(pattern, next, input, start, calls))
        }
        '?' => ii < input.len() && match_chars(pattern, pi + 1, input, ii + 1, calls),
        '[' => {
            let Some(&ch) = input.get(ii) else {
                return false;
            };
            match match_class(pattern, pi, ch) {
                Some((true, next)) => match_chars(pattern, next, input, ii + 1, calls),
                Some((false, _)) => false,
                // Unterminated class: treat '[' literally.
                None => ch == '[' && match_chars(pattern, pi + 1, input, ii + 1, calls),
            }
        }
        '\\' if pi + 1 < pattern.len() => {
            ii < input.len()
                && input[ii] == pattern[pi + 1]
                && match_chars(pattern, pi + 2, input, ii + 1, calls)
        }
        literal => {
            ii < input.len()
                && input[ii] == literal
                && match_chars(pattern, pi + 1, input, ii + 1, calls)
        }
    }
}

/// Returns whether `ch` is in the class starting at `pattern[start] == '['`
/// and the index just past the closing `]`.
fn match_class(pattern: &[char], start: usize, ch: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negated = matches!(pattern.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let current = pattern[i];
        if current == ']' && !first {
            return Some((matched != negated, i + 1));
        }
        first = false;
        if pattern.get(i + 1) == Some(&'-') && pattern.get(i + 2).is_some_and(|c| *c != ']') {
            let end = pattern[i + 2];
            if current <= ch && ch <= end {
                matched = true;
            }
            i += 3;
        } else {
            if current == ch {
                matched = true;
            }
            i += 1;
        }
    }
    None
}
