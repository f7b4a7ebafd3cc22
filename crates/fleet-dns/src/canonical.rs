//! DNS-label-safe names.

use regex::Regex;

/// Turns instance group, network and deployment names into DNS labels.
///
/// Lowercase, `_` becomes `-`, everything else outside `[a-z0-9-]` is
/// dropped: `simple.local_dns` becomes `simplelocal-dns`.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    disallowed: Regex,
}

impl Canonicalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            disallowed: Regex::new(r"[^a-z0-9-]")?,
        })
    }

    pub fn canonicalize(&self, name: &str) -> String {
        let lowered = name.to_lowercase().replace('_', "-");
        self.disallowed.replace_all(&lowered, "").into_owned()
    }
}
