//! Classification allow-list applied before any datastore work.

/// Upper-cased, keeping only `[A-Z0-9*]`.
pub fn normalize_code(raw: &str) -> String {
    raw.chars()
        .flat_map(char::to_uppercase)
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '*')
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationFilter {
    patterns: Vec<String>,
}

impl ClassificationFilter {
    /// Comma-separated patterns; `*` matches any run of characters.
    pub fn parse(csv: &str) -> Self {
        let patterns = csv
            .split(',')
            .map(normalize_code)
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn accepts(&self, code: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let code = normalize_code(code);
        self.patterns.iter().any(|p| wildcard_match(p.as_bytes(), code.as_bytes()))
    }

    /// Exact codes the server can filter on. `None` when a pattern needs client-side matching.
    pub fn server_filter_values(&self) -> Option<Vec<String>> {
        if self.patterns.is_empty() || self.patterns.iter().any(|p| p.contains('*')) {
            return None;
        }
        Some(self.patterns.clone())
    }
}

fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
