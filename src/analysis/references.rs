//! Best-effort identifier matching in SQL and procedural text
//!
//! Used where the catalog does not record column usage: trigger function bodies, index
//! expressions and predicates, and view definitions from backends without column-level
//! dependency tracking. Matching errs towards false positives: string literals are scanned
//! too, since dynamic SQL inside `EXECUTE '...'` is still a reference.

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""((?:[^"]|"")*)"|([A-Za-z_][A-Za-z0-9_$]*)"#).expect("static regex")
});

/// Whether `text` mentions `identifier` as a whole token
///
/// Quoted tokens must match exactly; bare tokens match case-insensitively.
pub fn mentions_identifier(text: &str, identifier: &str) -> bool {
    if identifier.is_empty() {
        return false;
    }

    TOKEN.captures_iter(text).any(|caps| {
        if let Some(quoted) = caps.get(1) {
            quoted.as_str().replace("\"\"", "\"") == identifier
        } else if let Some(bare) = caps.get(2) {
            bare.as_str().eq_ignore_ascii_case(identifier)
        } else {
            false
        }
    })
}

/// Whether any of the optional fragments mentions the identifier
pub fn any_mentions<'a, I>(fragments: I, identifier: &str) -> bool
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    fragments
        .into_iter()
        .flatten()
        .any(|text| mentions_identifier(text, identifier))
}
