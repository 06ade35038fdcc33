//! Reseller provider variants: request-time username composition over a
//! vendor gateway. Each vendor's token grammar is vendor-local;
//! [`compose`] is the shared `key-value` joiner all of them build on.

mod databay;
mod dataimpulse;
mod proxyverse;
mod ttproxy;

pub use databay::Databay;
pub use dataimpulse::DataImpulse;
pub use proxyverse::Proxyverse;
pub use ttproxy::TtProxy;

/// Joins `key-value` tokens with `-`, skipping absent ones, matching the
/// dash-delimited grammar shared across all reseller vendors.
fn compose(tokens: &[(&str, Option<String>)]) -> String {
    tokens
        .iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| format!("{key}-{v}")))
        .collect::<Vec<_>>()
        .join("-")
}

/// Country `rr` means "any country" and is rewritten to the vendor-specific
/// `worldwide` sentinel in reseller username composition. This computes a
/// local substitution rather than mutating the shared Request.
fn rewrite_country(country: Option<&str>, uppercase: bool) -> Option<String> {
    country.map(|c| {
        if c.eq_ignore_ascii_case("rr") {
            "worldwide".to_string()
        } else if uppercase {
            c.to_ascii_uppercase()
        } else {
            c.to_ascii_lowercase()
        }
    })
}
