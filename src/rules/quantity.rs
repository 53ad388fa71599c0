//! Kubernetes resource quantity validation.

use std::sync::LazyLock;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;

use super::RuleError;

/// Decimal or binary-suffixed quantity, as accepted by the API server.
static QUANTITY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)(([KMGTPE]i)|[numkMGTPE]|[eE][+-]?\d+)?$").ok()
});

/// Parse a quantity string such as `100m`, `64Mi` or `1e3`.
pub fn parse_quantity(value: &str) -> Result<Quantity, RuleError> {
    let trimmed = value.trim();
    if QUANTITY.as_ref().is_some_and(|re| re.is_match(trimmed)) {
        Ok(Quantity(trimmed.to_string()))
    } else {
        Err(RuleError::InvalidQuantity {
            value: value.to_string(),
        })
    }
}
