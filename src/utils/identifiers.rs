// rds-pitr-restore/src/utils/identifiers.rs
use anyhow::{Result, bail};
use regex::Regex;
use std::sync::OnceLock;

const MAX_IDENTIFIER_LEN: usize = 63;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Letter first, then letters/digits, single hyphens only between them.
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z](?:-?[A-Za-z0-9])*$").expect("identifier pattern is valid")
    })
}

/// Checks a DB instance identifier against the RDS naming rules.
pub fn validate_instance_identifier(field: &str, identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        bail!("{} must not be empty", field);
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        bail!(
            "{} '{}' is longer than {} characters",
            field,
            identifier,
            MAX_IDENTIFIER_LEN
        );
    }
    if !identifier_pattern().is_match(identifier) {
        bail!(
            "{} '{}' is not a valid DB instance identifier (must start with a letter, contain only letters, digits and hyphens, and not end with or repeat a hyphen)",
            field,
            identifier
        );
    }
    Ok(())
}

/// RDS stores identifiers lowercased, so comparisons ignore case.
pub fn same_instance(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
