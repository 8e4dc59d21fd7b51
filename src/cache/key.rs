use std::sync::Arc;

/// Variant tag for responses sent without a content-encoding.
pub const NO_ENCODING: &str = "none";

const KEY_PREFIX: &str = "enc-";

pub fn variant_key(encoding: &str, url: &str) -> String {
    format!("{KEY_PREFIX}{encoding}:{url}")
}

/// Splits a variant key back into `(encoding, url)`.
pub fn split_variant_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(KEY_PREFIX)?;
    let (encoding, url) = rest.split_once(':')?;
    if encoding.is_empty() || url.is_empty() {
        return None;
    }
    Some((encoding, url))
}

/// Normalised variant tag for an observed `content-encoding` value.
pub fn encoding_tag(content_encoding: Option<&str>) -> String {
    match content_encoding.map(str::trim) {
        None | Some("") => NO_ENCODING.to_string(),
        Some(value) if value.eq_ignore_ascii_case("identity") => NO_ENCODING.to_string(),
        Some(value) => value.to_ascii_lowercase(),
    }
}

/// Client-side view of an `Accept-Encoding` header.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AcceptedEncodings {
    accepted: Vec<String>,
    refused: Vec<String>,
    wildcard: bool,
}

impl AcceptedEncodings {
    pub fn parse(header: &str) -> Self {
        let mut parsed = Self::default();
        for item in header.split(',') {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
            if coding.is_empty() {
                continue;
            }
            let refused = parts.any(|param| is_zero_quality(param.trim()));
            match (coding.as_str(), refused) {
                ("*", false) => parsed.wildcard = true,
                ("*", true) => parsed.wildcard = false,
                (_, false) => parsed.accepted.push(coding),
                (_, true) => parsed.refused.push(coding),
            }
        }
        parsed
    }

    pub fn accepts(&self, coding: &str) -> bool {
        if self.refused.iter().any(|c| c.eq_ignore_ascii_case(coding)) {
            return false;
        }
        self.wildcard || self.accepted.iter().any(|c| c.eq_ignore_ascii_case(coding))
    }
}

fn is_zero_quality(param: &str) -> bool {
    let Some((name, value)) = param.split_once('=') else {
        return false;
    };
    if !name.trim().eq_ignore_ascii_case("q") {
        return false;
    }
    value
        .trim()
        .parse::<f32>()
        .map(|q| q <= 0.0)
        .unwrap_or(false)
}

/// Produces probe keys in server-preference order.
#[derive(Debug, Clone)]
pub struct VariantResolver {
    preferred: Arc<[String]>,
}

impl VariantResolver {
    pub fn new<I, S>(preferred: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let preferred: Vec<String> = preferred
            .into_iter()
            .map(|s| s.as_ref().trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty() && s != NO_ENCODING)
            .collect();
        Self {
            preferred: Arc::from(preferred.into_boxed_slice()),
        }
    }

    pub fn preferred(&self) -> &[String] {
        &self.preferred
    }

    /// Candidate keys for a lookup; the unencoded variant is always last.
    pub fn candidates(&self, accept_encoding: Option<&str>, url: &str) -> Vec<String> {
        let accepted = accept_encoding
            .map(AcceptedEncodings::parse)
            .unwrap_or_default();
        let mut keys: Vec<String> = self
            .preferred
            .iter()
            .filter(|coding| accepted.accepts(coding))
            .map(|coding| variant_key(coding, url))
            .collect();
        keys.push(variant_key(NO_ENCODING, url));
        keys
    }

    /// Key a captured response commits under, taken from what was actually sent.
    pub fn commit_key(&self, content_encoding: Option<&str>, url: &str) -> String {
        variant_key(&encoding_tag(content_encoding), url)
    }
}

impl Default for VariantResolver {
    fn default() -> Self {
        Self::new(["br", "gzip"])
    }
}
