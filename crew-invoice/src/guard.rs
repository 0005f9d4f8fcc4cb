//! Two-layer denial of destructive invoice mutations.
//!
//! The same closed set is checked before a suggestion row is written and
//! again, inside the transaction, before any batch of suggestions is
//! applied. A row smuggled into the table by any other path still cannot
//! reach the invoice.

pub const FORBIDDEN_OPS: [&str; 3] = ["delete_item", "update_total", "mass_replace"];

/// Suggestion kinds that are allowed to reach an invoice.
pub const ALLOWED_OPS: [&str; 3] = ["add_item", "update_item", "update_description"];

#[must_use]
pub fn is_forbidden(kind: &str) -> bool {
    FORBIDDEN_OPS.contains(&kind)
}

#[must_use]
pub fn is_allowed(kind: &str) -> bool {
    ALLOWED_OPS.contains(&kind)
}

/// The audit reason recorded when a forbidden kind is denied.
#[must_use]
pub fn denial_reason(kind: &str) -> String {
    format!("forbidden_op:{kind}")
}
