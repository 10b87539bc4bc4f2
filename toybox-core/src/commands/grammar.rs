// File: src/commands/grammar.rs

use once_cell::sync::Lazy;
use regex::Regex;

use toybox_common::models::{CommandDefinition, CommandParam, ParamType, ParamValue, Params};

/// A double-quoted run (quotes stripped) or a bare word. An unterminated
/// quote simply falls through to whitespace splitting.
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""([^"]*)"|(\S+)"#).expect("token pattern is valid")
});

/// Splits `!keyword rest` into `("keyword", "rest")`. Exactly one separating
/// whitespace character is consumed, the rest is left verbatim.
pub fn split_command(text: &str) -> Option<(&str, &str)> {
    let body = text.strip_prefix('!')?;
    match body.char_indices().find(|(_, c)| c.is_whitespace()) {
        Some((i, c)) => Some((&body[..i], &body[i + c.len_utf8()..])),
        None => Some((body, "")),
    }
}

/// Parses the arguments of `text` against `def`'s parameter list.
///
/// Returns `None` when `text` is not a command at all.
pub fn parse(text: &str, def: &CommandDefinition) -> Option<Params> {
    let (_, remainder) = split_command(text)?;
    Some(parse_remainder(remainder, &def.params))
}

pub fn parse_remainder(remainder: &str, schema: &[CommandParam]) -> Params {
    let mut params = Params::new();
    match schema {
        [] => {}
        [only] => {
            if !remainder.is_empty() {
                params.insert(only.name.clone(), coerce(only.kind, remainder));
            }
        }
        _ => {
            let tokens = tokenize(remainder);
            let last = schema.len() - 1;
            for (i, param) in schema.iter().enumerate() {
                let raw = if i < last {
                    tokens.get(i).cloned()
                } else if tokens.len() > last {
                    Some(tokens[last..].join(" "))
                } else {
                    None
                };
                if let Some(raw) = raw {
                    params.insert(param.name.clone(), coerce(param.kind, &raw));
                }
            }
        }
    }
    params
}

pub fn tokenize(input: &str) -> Vec<String> {
    TOKEN_RE
        .captures_iter(input)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Numbers that fail to parse become NaN; the dispatcher decides whether
/// that is acceptable.
pub fn coerce(kind: ParamType, raw: &str) -> ParamValue {
    match kind {
        ParamType::Number => {
            let n = raw.trim().parse::<f64>().unwrap_or(f64::NAN);
            ParamValue::Number(if n.is_finite() { n } else { f64::NAN })
        }
        ParamType::Username => {
            ParamValue::Text(raw.strip_prefix('@').unwrap_or(raw).to_string())
        }
        ParamType::String => ParamValue::Text(raw.to_string()),
    }
}
