//! Placeholder substitution for filter templates.
//!
//! `{{ name }}` and `@name` are interchangeable and resolve from one
//! variable map. An `@` directly after an identifier character (as in
//! `user@example.com`) is not a placeholder.

use crate::error::{CoreError, CoreResult};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::OnceLock;

/// Variable map used for substitution
pub type TemplateVars = BTreeMap<String, String>;

fn placeholder_pattern() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}|@([A-Za-z_][A-Za-z0-9_]*)")
            .expect("valid regex literal")
    })
}

/// Every placeholder in `template` as (byte span, variable name), in order.
///
/// An `@name` only counts when the byte before the `@` is not an identifier
/// character or another `@`. That byte is looked up in the template itself,
/// so a placeholder right after `{{ a }}` is still found.
fn scan(template: &str) -> Vec<(Range<usize>, &str)> {
    let bytes = template.as_bytes();
    placeholder_pattern()
        .captures_iter(template)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            if let Some(name) = captures.get(1) {
                return Some((whole.range(), name.as_str()));
            }
            let name = captures.get(2)?;
            let glued = whole.start() > 0 && {
                let prev = bytes[whole.start() - 1];
                prev.is_ascii_alphanumeric() || prev == b'_' || prev == b'@'
            };
            (!glued).then(|| (whole.range(), name.as_str()))
        })
        .collect()
}

/// Substitute every placeholder in `template` for `node`.
///
/// Fails with every missing variable listed when any placeholder has no
/// value; nothing is ever replaced by an empty string.
pub fn render(template: &str, vars: &TemplateVars, node: &str) -> CoreResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut missing = BTreeSet::new();
    let mut last = 0;

    for (span, name) in scan(template) {
        out.push_str(&template[last..span.start]);
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => {
                missing.insert(name.to_string());
                out.push_str(&template[span.clone()]);
            }
        }
        last = span.end;
    }
    out.push_str(&template[last..]);

    if !missing.is_empty() {
        return Err(CoreError::VariableSubstitution {
            node: node.to_string(),
            missing: missing.into_iter().collect(),
        });
    }
    Ok(out)
}

/// Names referenced by `template`, sorted and deduplicated
pub fn placeholders(template: &str) -> Vec<String> {
    scan(template)
        .into_iter()
        .map(|(_, name)| name.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_both_syntaxes_resolve_from_one_map() {
        let v = vars(&[("watermark", "5"), ("region", "'eu'")]);
        let out = render("id > @watermark AND region = {{ region }}", &v, "m").unwrap();
        assert_eq!(out, "id > 5 AND region = 'eu'");

        let same = render("id > {{watermark}} AND region = @region", &v, "m").unwrap();
        assert_eq!(same, out);
    }

    #[test]
    fn test_placeholder_at_start() {
        let out = render("@flag", &vars(&[("flag", "TRUE")]), "m").unwrap();
        assert_eq!(out, "TRUE");
    }

    #[test]
    fn test_email_like_text_untouched() {
        let template = "email <> 'ops@example.com' AND ts >= @watermark";
        let out = render(template, &vars(&[("watermark", "1")]), "m").unwrap();
        assert_eq!(out, "email <> 'ops@example.com' AND ts >= 1");
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        let err = render("a = @x AND b = {{ y }} AND c = @x", &vars(&[]), "main.m").unwrap_err();
        match err {
            CoreError::VariableSubstitution { node, missing } => {
                assert_eq!(node, "main.m");
                assert_eq!(missing, vec!["x", "y"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_at_placeholder_directly_after_braces() {
        let v = vars(&[("a", "1"), ("b", "2")]);
        assert_eq!(render("{{a}}@b", &v, "m").unwrap(), "12");

        let err = render("{{a}}@b", &vars(&[("a", "1")]), "m").unwrap_err();
        match err {
            CoreError::VariableSubstitution { missing, .. } => assert_eq!(missing, vec!["b"]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(placeholders("{{ a }}@b"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_doubled_at_is_not_a_placeholder() {
        let out = render("x = '@@name' AND y = @v", &vars(&[("v", "3")]), "m").unwrap();
        assert_eq!(out, "x = '@@name' AND y = 3");
    }

    #[test]
    fn test_placeholders_listed() {
        assert_eq!(
            placeholders("(@b, {{a}}, @b, x@y)"),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
