//! Extraction of the declared compatible version from free-text release notes.

use std::sync::LazyLock;

use regex::Regex;

use crate::product::ProductKind;

static CLIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)works\s+with\s+version\s+v?(\d+(?:\.\d+)+)").expect("valid client pattern")
});

static SERVER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)works\s+with\s+(?:(?:game|client)\s+)?version\s+v?(\d+(?:\.\d+)+)")
        .expect("valid server pattern")
});

static MODS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)works\s+with\s+client\s+version\s+v?(\d+(?:\.\d+)+)")
        .expect("valid mods pattern")
});

static DOTTED_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)+").expect("valid version pattern"));

fn pattern_for(product: ProductKind) -> Option<&'static Regex> {
    match product {
        ProductKind::Client => Some(&CLIENT_PATTERN),
        ProductKind::Server => Some(&SERVER_PATTERN),
        ProductKind::Mods => Some(&MODS_PATTERN),
        ProductKind::Game => None,
    }
}

/// The version a release declares it works with; the first match wins.
pub fn parse_compatible_version(body: &str, product: ProductKind) -> Option<String> {
    let captures = pattern_for(product)?.captures(body)?;
    captures.get(1).map(|m| m.as_str().to_owned())
}

/// First dotted number in a release name or tag, e.g. "SPT 3.10.1" -> "3.10.1".
pub fn release_version_from(label: &str) -> Option<String> {
    DOTTED_VERSION
        .find(label)
        .map(|m| m.as_str().to_owned())
}
