use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

/// Capability set a program is checked and run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Extraction,
    Validation,
}

const EXTRACTION_IMPORTS: &[&str] = &["json", "re", "math", "io", "csv", "pandas"];

const PURE_BUILTINS: &[&str] = &[
    "len", "str", "int", "float", "bool", "list", "dict", "set", "tuple", "range",
    "enumerate", "zip", "map", "filter", "sorted", "reversed", "min", "max", "sum", "abs",
    "round", "any", "all", "isinstance", "hasattr", "repr", "chr", "ord", "True", "False",
    "None", "Exception", "ValueError", "TypeError", "KeyError", "IndexError",
    "AttributeError",
];

const DENIED_CALLS: &[&str] = &[
    "exec", "eval", "compile", "open", "__import__", "globals", "locals", "vars", "getattr",
    "setattr", "delattr", "breakpoint", "input", "memoryview",
];

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Extraction => "extraction",
            Profile::Validation => "validation",
        }
    }

    pub fn allowed_imports(&self) -> &'static [&'static str] {
        match self {
            Profile::Extraction => EXTRACTION_IMPORTS,
            Profile::Validation => &[],
        }
    }

    /// Builtin names exposed to the program. `print` is wired by the harness
    /// per profile and is not part of this list.
    pub fn builtins(&self) -> Vec<&'static str> {
        let mut names = PURE_BUILTINS.to_vec();
        if *self == Profile::Extraction {
            names.extend(["type", "print"]);
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("import of '{0}' is not allowed")]
    Import(String),
    #[error("access to '{0}' is not allowed")]
    Dunder(String),
    #[error("call to '{0}' is not allowed")]
    Call(String),
}

static DUNDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^A-Za-z0-9_])(__[A-Za-z0-9_]*)").expect("dunder regex"));
// Imports are matched as keywords anywhere in the masked text, so a suite
// after `try:` or `if ...:` on the same line is covered.
static IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^.A-Za-z0-9_])(import)(?:[ \t]|\\\r?\n)+([^;\n#]+)").expect("import regex")
});
static FROM_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:^|[^.A-Za-z0-9_])from(?:[ \t]|\\\r?\n)+(\.*[A-Za-z0-9_.]*)(?:[ \t]|\\\r?\n)+(import)\b",
    )
    .expect("from regex")
});
static CALL: Lazy<Regex> = Lazy::new(|| {
    let names = DENIED_CALLS.join("|");
    Regex::new(&format!(r"(?:^|[^.A-Za-z0-9_])({names})[ \t]*\(")).expect("call regex")
});

/// Static admission check. Depends only on the program text.
pub fn check(program: &str, profile: Profile) -> Result<(), Violation> {
    let code = mask_literals(program);

    if let Some(caps) = DUNDER.captures(&code) {
        return Err(Violation::Dunder(caps[1].to_string()));
    }

    let allowed = profile.allowed_imports();
    let mut from_keywords = HashSet::new();
    for caps in FROM_IMPORT.captures_iter(&code) {
        let module = &caps[1];
        let root = module.split('.').next().unwrap_or_default();
        if module.starts_with('.') || !allowed.contains(&root) {
            return Err(Violation::Import(module.to_string()));
        }
        from_keywords.insert(caps.get(2).map_or(0, |m| m.start()));
    }
    for caps in IMPORT.captures_iter(&code) {
        if caps.get(1).is_some_and(|m| from_keywords.contains(&m.start())) {
            continue;
        }
        for clause in caps[2].split(',') {
            let module = clause.split_whitespace().next().unwrap_or_default();
            let root = module.split('.').next().unwrap_or_default();
            if !allowed.contains(&root) {
                return Err(Violation::Import(module.to_string()));
            }
        }
    }

    if let Some(caps) = CALL.captures(&code) {
        return Err(Violation::Call(caps[1].to_string()));
    }
    Ok(())
}

/// Blanks out comments and string-literal bodies so that prose inside them
/// cannot trip the checks. Line structure is preserved. f-strings are left
/// intact because their braces hold live expressions.
fn mask_literals(program: &str) -> String {
    let chars: Vec<char> = program.chars().collect();
    let mut out = String::with_capacity(program.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                out.push(' ');
                i += 1;
            }
            continue;
        }
        if c == '"' || c == '\'' {
            let formatted = string_prefix(&chars, i).contains(['f', 'F']);
            let triple = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
            let delim_len = if triple { 3 } else { 1 };
            for _ in 0..delim_len {
                out.push(c);
            }
            i += delim_len;
            while i < chars.len() {
                let ch = chars[i];
                if ch == '\\' && i + 1 < chars.len() {
                    push_masked(&mut out, ch, formatted);
                    push_masked(&mut out, chars[i + 1], formatted);
                    i += 2;
                    continue;
                }
                let closes = if triple {
                    ch == c && i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c
                } else {
                    ch == c || ch == '\n'
                };
                if closes {
                    break;
                }
                push_masked(&mut out, ch, formatted);
                i += 1;
            }
            let end = (i + delim_len).min(chars.len());
            while i < end {
                out.push(chars[i]);
                i += 1;
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

fn push_masked(out: &mut String, ch: char, keep: bool) {
    if keep || ch == '\n' {
        out.push(ch);
    } else {
        out.push(' ');
    }
}

fn string_prefix(chars: &[char], quote_at: usize) -> String {
    let mut start = quote_at;
    while start > 0 && chars[start - 1].is_ascii_alphabetic() && quote_at - start < 2 {
        start -= 1;
    }
    chars[start..quote_at].iter().collect()
}
