use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use http::{Method, StatusCode};
use serde::Deserialize;

use super::{
    ValidatedSource,
    model::{EngineConfiguration, MethodMatch, PolicySource, RequestRule, ResponseRule, UrlMask},
};
use crate::error::ConfigError;

pub fn read_policy_source(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses a policy document. Errors carry enough context to point at the
/// offending table; callers surface them as compile failures.
pub fn parse_policy_source(text: &str) -> Result<ValidatedSource> {
    let doc: PolicyDoc = toml::from_str(text).context("failed to parse policy document")?;

    let configuration = match doc.configuration {
        Some(raw) => EngineConfiguration {
            lru_max_items: raw.lru_max_items,
            remote_servers: raw.remote_servers,
        },
        None => EngineConfiguration::default(),
    };

    let mut request_rules = Vec::with_capacity(doc.requests.len());
    for (idx, raw) in doc.requests.into_iter().enumerate() {
        let id = Arc::<str>::from(format!("request#{}", idx));
        let methods =
            parse_methods(raw.methods.as_deref()).with_context(|| format!("rule '{}'", id))?;
        let ttl = match (raw.ttl, raw.negative) {
            (Some(ttl), _) => ttl,
            (None, true) => 0,
            (None, false) => bail!("request rule '{}' must set ttl", id),
        };
        request_rules.push(RequestRule {
            id,
            url: UrlMask::new(&raw.url),
            methods,
            ttl,
            negative: raw.negative,
        });
    }

    let mut response_rules = Vec::with_capacity(doc.responses.len());
    for (idx, raw) in doc.responses.into_iter().enumerate() {
        let id = Arc::<str>::from(format!("response#{}", idx));
        let statuses = match raw.status {
            None => None,
            Some(codes) if codes.is_empty() => {
                bail!("response rule '{}' status array must not be empty", id)
            }
            Some(codes) => {
                let mut parsed = Vec::with_capacity(codes.len());
                for code in codes {
                    let status = StatusCode::from_u16(code).with_context(|| {
                        format!("response rule '{}' has invalid status code {}", id, code)
                    })?;
                    parsed.push(status);
                }
                Some(parsed)
            }
        };
        let content_type = match raw.content_type {
            Some(value) if value.trim().is_empty() => {
                bail!("response rule '{}' content_type must not be empty", id)
            }
            Some(value) => Some(Arc::<str>::from(value.to_ascii_lowercase())),
            None => None,
        };
        response_rules.push(ResponseRule {
            id,
            content_type,
            statuses,
            cacheable: raw.cacheable,
        });
    }
    if response_rules.is_empty() {
        response_rules.push(ResponseRule::html_default());
    }

    ValidatedSource::new(PolicySource {
        configuration,
        request_rules,
        response_rules,
    })
}

fn parse_methods(methods: Option<&[String]>) -> Result<MethodMatch> {
    match methods {
        None => Ok(MethodMatch::Any),
        Some([]) => bail!("methods array must not be empty"),
        Some([only]) if only.eq_ignore_ascii_case("ANY") => Ok(MethodMatch::Any),
        Some(methods) => {
            let mut seen = HashSet::new();
            let mut parsed = Vec::with_capacity(methods.len());
            for method in methods {
                if method.eq_ignore_ascii_case("ANY") {
                    bail!("methods array must not mix ANY with explicit methods");
                }
                let normalized = method.to_ascii_uppercase();
                let parsed_method: Method = normalized
                    .parse()
                    .map_err(|_| anyhow!("invalid HTTP method '{}'", method))?;
                if !seen.insert(parsed_method.clone()) {
                    bail!("duplicate HTTP method '{}'", method);
                }
                parsed.push(parsed_method);
            }
            Ok(MethodMatch::List(parsed))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDoc {
    #[serde(default)]
    configuration: Option<RawConfiguration>,
    #[serde(default, rename = "request")]
    requests: Vec<RawRequestRule>,
    #[serde(default, rename = "response")]
    responses: Vec<RawResponseRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfiguration {
    #[serde(default)]
    lru_max_items: Option<usize>,
    #[serde(default)]
    remote_servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequestRule {
    url: String,
    #[serde(default)]
    methods: Option<Vec<String>>,
    #[serde(default)]
    ttl: Option<i64>,
    #[serde(default)]
    negative: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResponseRule {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    status: Option<Vec<u16>>,
    #[serde(default = "default_cacheable")]
    cacheable: bool,
}

fn default_cacheable() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaskKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_full_document() {
        let source = parse_policy_source(
            r#"[configuration]
lru_max_items = 64
remote_servers = ["127.0.0.1:11211"]

[[request]]
url = "http://example.com/static/*"
methods = ["get", "HEAD"]
ttl = 600

[[request]]
url = "http://example.com/admin/login"
negative = true

[[response]]
content_type = "TEXT/HTML"
status = [200]
"#,
        )
        .unwrap();

        assert_eq!(source.configuration.lru_max_items, Some(64));
        assert_eq!(source.configuration.remote_servers, vec!["127.0.0.1:11211"]);
        assert_eq!(source.request_rules.len(), 2);
        assert_eq!(source.request_rules[0].url.kind, MaskKind::Wildcard);
        assert_eq!(source.request_rules[0].ttl, 600);
        match &source.request_rules[0].methods {
            MethodMatch::List(methods) => {
                assert_eq!(methods, &vec![Method::GET, Method::HEAD]);
            }
            MethodMatch::Any => panic!("expected explicit method list"),
        }
        assert!(source.request_rules[1].negative);
        assert_eq!(source.request_rules[1].url.kind, MaskKind::Exact);
        assert_eq!(
            source.response_rules[0].content_type.as_deref(),
            Some("text/html")
        );
    }

    #[test]
    fn missing_response_rules_default_to_html() {
        let source = parse_policy_source(
            r#"[[request]]
url = "*"
ttl = 60
"#,
        )
        .unwrap();
        assert_eq!(source.response_rules.len(), 1);
        assert_eq!(source.response_rules[0].id.as_ref(), "default#html");
    }

    #[test]
    fn rejects_request_without_ttl() {
        let err = parse_policy_source(
            r#"[[request]]
url = "http://example.com/*"
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("must set ttl"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = parse_policy_source(
            r#"[[request]]
url = "http://example.com/*"
ttl = 10
bogus = 1
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse policy document"));
    }

    #[test]
    fn rejects_mixed_any_method() {
        let err = parse_policy_source(
            r#"[[request]]
url = "*"
methods = ["ANY", "GET"]
ttl = 10
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("must not mix ANY"));
    }

    #[test]
    fn rejects_invalid_status_code() {
        let err = parse_policy_source(
            r#"[[response]]
content_type = "text/html"
status = [42]
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid status code"));
    }

    #[test]
    fn read_reports_path_on_failure() {
        let err = read_policy_source(Path::new("/nonexistent/cachegate/policy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/cachegate/policy.toml"));
    }

    #[test]
    fn read_returns_file_contents() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[[request]]\nurl = \"*\"\nttl = 5\n")
            .unwrap();
        let text = read_policy_source(file.path()).unwrap();
        assert!(parse_policy_source(&text).is_ok());
    }
}
