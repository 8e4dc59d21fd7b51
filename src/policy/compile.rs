use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::{
    MaskKind, MethodMatch, RequestRule, ResponseRule, UrlMask, ValidatedSource,
    parse_policy_source,
};
use crate::error::PolicyError;

use super::model::{
    CompiledPolicy, CompiledRequestRule, CompiledResponseRule, MethodMask, UrlMatcher,
};

/// Parses and compiles policy text in one step. Every failure is reported as
/// [`PolicyError::Compile`] carrying the full context chain.
pub fn compile_policy_text(text: &str) -> Result<CompiledPolicy, PolicyError> {
    parse_policy_source(text)
        .and_then(|source| compile_policy(&source))
        .map_err(|err| PolicyError::Compile(format!("{err:#}")))
}

/// Transforms a validated rule document into its evaluation model: exact URL
/// masks stay literal strings, wildcard masks become anchored regexes, and
/// method lists collapse into a bitmask.
pub fn compile_policy(source: &ValidatedSource) -> Result<CompiledPolicy> {
    let source = source.as_ref();

    let mut request_rules = Vec::with_capacity(source.request_rules.len());
    for rule in &source.request_rules {
        request_rules.push(compile_request_rule(rule)?);
    }

    let response_rules: Vec<CompiledResponseRule> = source
        .response_rules
        .iter()
        .map(compile_response_rule)
        .collect();

    Ok(CompiledPolicy {
        configuration: source.configuration.clone(),
        request_rules: Arc::from(request_rules.into_boxed_slice()),
        response_rules: Arc::from(response_rules.into_boxed_slice()),
    })
}

fn compile_request_rule(rule: &RequestRule) -> Result<CompiledRequestRule> {
    let url = compile_url_mask(&rule.url)
        .with_context(|| format!("failed to compile url mask '{}'", rule.url.mask))?;
    Ok(CompiledRequestRule {
        id: rule.id.clone(),
        url,
        methods: compile_methods(&rule.methods),
        ttl: rule.ttl,
        negative: rule.negative,
    })
}

fn compile_response_rule(rule: &ResponseRule) -> CompiledResponseRule {
    CompiledResponseRule {
        id: rule.id.clone(),
        content_type: rule.content_type.clone(),
        statuses: rule
            .statuses
            .as_ref()
            .map(|list| Arc::from(list.clone().into_boxed_slice())),
        cacheable: rule.cacheable,
    }
}

fn compile_methods(methods: &MethodMatch) -> MethodMask {
    match methods {
        MethodMatch::Any => MethodMask::any(),
        MethodMatch::List(list) => MethodMask::from_methods(list),
    }
}

fn compile_url_mask(mask: &UrlMask) -> Result<UrlMatcher> {
    if mask.kind == MaskKind::Exact {
        return Ok(UrlMatcher::Exact(mask.mask.clone()));
    }

    let mut regex = String::from("^");
    let mut literal = String::new();
    for ch in mask.mask.chars() {
        match ch {
            '*' | '?' => {
                if !literal.is_empty() {
                    regex.push_str(&regex::escape(&literal));
                    literal.clear();
                }
                regex.push_str(if ch == '*' { "(?s:.*)" } else { "(?s:.)" });
            }
            _ => literal.push(ch),
        }
    }
    if !literal.is_empty() {
        regex.push_str(&regex::escape(&literal));
    }
    regex.push('$');

    let compiled = Regex::new(&regex).with_context(|| format!("invalid url regex '{}'", regex))?;
    Ok(UrlMatcher::Wildcard {
        regex: compiled,
        original: mask.mask.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wildcard(mask: &str) -> UrlMatcher {
        compile_url_mask(&UrlMask::new(mask)).expect("compile mask")
    }

    #[test]
    fn star_matches_any_run() {
        let matcher = wildcard("http://example.com/*.html");
        assert!(matcher.matches("http://example.com/a.html"));
        assert!(matcher.matches("http://example.com/deep/path/b.html"));
        assert!(!matcher.matches("http://example.com/a.htm"));
        assert!(!matcher.matches("https://example.com/a.html"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let matcher = wildcard("http://example.com/v?/index");
        assert!(matcher.matches("http://example.com/v1/index"));
        assert!(!matcher.matches("http://example.com/v10/index"));
    }

    #[test]
    fn masks_are_case_sensitive_and_escape_regex_meta() {
        let matcher = wildcard("http://example.com/a+b/*");
        assert!(matcher.matches("http://example.com/a+b/c"));
        assert!(!matcher.matches("http://example.com/aab/c"));
        assert!(!matcher.matches("http://EXAMPLE.com/a+b/c"));
    }

    #[test]
    fn exact_masks_compare_literally() {
        let matcher = compile_url_mask(&UrlMask::new("http://example.com/a.html")).unwrap();
        assert!(matches!(matcher, UrlMatcher::Exact(_)));
        assert!(matcher.matches("http://example.com/a.html"));
        assert!(!matcher.matches("http://example.com/a.html?x=1"));
    }

    #[test]
    fn compile_text_maps_errors_to_compile_variant() {
        let err = compile_policy_text("[[request]\nurl = ").unwrap_err();
        assert!(matches!(err, PolicyError::Compile(_)));
    }

    #[test]
    fn unbounded_ttl_fails_to_compile() {
        let err = compile_policy_text(
            "[[request]]\nurl = \"http://example.com/*\"\nttl = 9223372036854775807\n",
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::Compile(ref msg) if msg.contains("exceeds the maximum")));
    }

    #[test]
    fn compile_text_builds_rules_in_order() {
        let compiled = compile_policy_text(
            r#"[[request]]
url = "http://example.com/private/*"
negative = true

[[request]]
url = "http://example.com/*"
ttl = 30
"#,
        )
        .unwrap();
        assert_eq!(compiled.request_rules.len(), 2);
        assert!(compiled.request_rules[0].negative);
        assert_eq!(compiled.request_rules[1].ttl, 30);
        assert_eq!(compiled.response_rules.len(), 1);
    }
}
