//! Identifier canonicalization. Pure functions, no I/O.

/// Canonical form of a raw registry identifier: digits only, with a spreadsheet-style
/// trailing `.0` collapsed first. Empty when no digit remains.
pub fn canonicalize(raw: &str) -> String {
    strip_float_artifact(raw.trim())
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}

/// Canonical establishment key `<parent>-<secondary>`.
///
/// A pre-combined establishment value wins when it yields at least two numeric groups
/// (`"55-0"`, `"55.0 / 0.0"`). Otherwise the key is built from the parent and secondary
/// identifiers; a combined value with a single group stands in for a missing secondary.
pub fn establishment_key(parent: &str, secondary: &str, combined: Option<&str>) -> Option<String> {
    let groups = combined.map(numeric_groups).unwrap_or_default();
    if groups.len() >= 2 {
        return Some(format!("{}-{}", groups[0], groups[1]));
    }

    let parent = canonicalize(parent);
    if parent.is_empty() {
        return None;
    }
    let secondary = canonicalize(secondary);
    if !secondary.is_empty() {
        return Some(format!("{parent}-{secondary}"));
    }
    groups.first().map(|group| format!("{parent}-{group}"))
}

/// Stable reference code for a legal-form value: lower-case, spaces as `_`, `[a-z0-9_]` only.
pub fn company_type_code(legal_form: &str) -> Option<String> {
    let code: String = legal_form
        .trim()
        .to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect();
    (!code.is_empty()).then_some(code)
}

fn numeric_groups(value: &str) -> Vec<String> {
    value
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(canonicalize)
        .filter(|group| !group.is_empty())
        .collect()
}

fn strip_float_artifact(value: &str) -> &str {
    match value.rsplit_once('.') {
        Some((int, frac))
            if !frac.is_empty()
                && frac.chars().all(|c| c == '0')
                && int.ends_with(|c: char| c.is_ascii_digit()) =>
        {
            int
        }
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_collapses_float_artifact() {
        assert_eq!(canonicalize("123456.0"), "123456");
        assert_eq!(canonicalize("55.00"), "55");
        assert_eq!(canonicalize("0.0"), "0");
    }

    #[test]
    fn canonicalize_strips_spacing_and_noise() {
        assert_eq!(canonicalize(" 123 456 "), "123456");
        assert_eq!(canonicalize("A-123.456"), "123456");
    }

    #[test]
    fn canonicalize_without_digits_is_empty() {
        assert_eq!(canonicalize("abc"), "");
        assert_eq!(canonicalize("   "), "");
        assert_eq!(canonicalize(""), "");
    }

    #[test]
    fn establishment_key_from_parent_and_secondary() {
        assert_eq!(establishment_key("55.0", "0.0", None).as_deref(), Some("55-0"));
        assert_eq!(establishment_key("55", "", Some("")).as_deref(), None);
        assert_eq!(establishment_key("", "3", None), None);
    }

    #[test]
    fn establishment_key_prefers_combined_groups() {
        assert_eq!(establishment_key("55", "", Some("55-0")).as_deref(), Some("55-0"));
        assert_eq!(establishment_key("55", "9", Some("55.0 / 1.0")).as_deref(), Some("55-1"));
    }

    #[test]
    fn single_group_combined_value_acts_as_secondary() {
        assert_eq!(establishment_key("55", "", Some("7")).as_deref(), Some("55-7"));
        assert_eq!(establishment_key("55", "2", Some("7")).as_deref(), Some("55-2"));
    }

    #[test]
    fn company_type_codes_are_stable() {
        assert_eq!(company_type_code(" SARL ").as_deref(), Some("sarl"));
        assert_eq!(company_type_code("Société anonyme").as_deref(), Some("socit_anonyme"));
        assert_eq!(company_type_code("5499").as_deref(), Some("5499"));
        assert_eq!(company_type_code("  "), None);
        assert_eq!(company_type_code("--"), None);
    }

    #[test]
    fn combined_and_split_forms_agree() {
        let split = establishment_key("55.0", "0.0", Some(""));
        let combined = establishment_key("55.0", "", Some("55-0"));
        assert_eq!(split, combined);
        assert_eq!(canonicalize("55.0"), "55");
    }
}
