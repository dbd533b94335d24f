use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hash of a data source's column names, used to key program reuse.
///
/// Equal fingerprints mean equal header sets, not equal meaning: two "price"
/// columns in different currencies collide. Cached programs are therefore
/// always re-run through the full-dataset checks before being trusted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnFingerprint(String);

impl ColumnFingerprint {
    pub fn of<S: AsRef<str>>(headers: &[S]) -> Self {
        let mut normalized: Vec<String> = headers
            .iter()
            .map(|header| header.as_ref().trim().to_lowercase())
            .collect();
        normalized.sort();
        let digest = Sha256::digest(normalized.join("|").as_bytes());
        Self(hex::encode(digest)[..16].to_string())
    }

}

impl fmt::Display for ColumnFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_case_and_padding_do_not_matter() {
        let a = ColumnFingerprint::of(&["SKU", " Title", "price "]);
        let b = ColumnFingerprint::of(&["price", "sku", "title"]);
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 16);
        assert!(a.to_string().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_columns_differ() {
        let a = ColumnFingerprint::of(&["sku", "title"]);
        let b = ColumnFingerprint::of(&["sku", "title", "colour"]);
        assert_ne!(a, b);
    }
}
