//! Built-in structural rules used when a recipe's validation program cannot
//! be run.

use crate::models::StyleProfile;
use serde_json::Value;

pub const TITLE_MAX_CHARS: usize = 140;
pub const TITLE_MIN_CHARS: usize = 5;
pub const DESCRIPTION_MIN_WORDS: usize = 30;
pub const DESCRIPTION_MAX_WORDS: usize = 500;
pub const MIN_TAGS: usize = 3;

pub fn check(listing: &Value, style: &StyleProfile) -> Vec<String> {
    let mut issues = Vec::new();
    let text = |key: &str| listing.get(key).and_then(Value::as_str).unwrap_or("");

    let title_len = text("title").chars().count();
    if title_len > TITLE_MAX_CHARS {
        issues.push(format!("Title exceeds {TITLE_MAX_CHARS} characters"));
    }
    if title_len < TITLE_MIN_CHARS {
        issues.push("Title is too short".to_string());
    }

    let description = text("description");
    let words = description.split_whitespace().count();
    if words < DESCRIPTION_MIN_WORDS {
        issues.push(format!("Description too short ({words} words)"));
    }
    if words > DESCRIPTION_MAX_WORDS {
        issues.push(format!("Description too long ({words} words)"));
    }

    let tags = listing
        .get("tags")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if tags < MIN_TAGS {
        issues.push(format!("Too few tags ({tags})"));
    }

    let price = listing.get("suggested_price").and_then(Value::as_f64);
    if !price.is_some_and(|price| price > 0.0) {
        issues.push("Invalid or missing price".to_string());
    }

    let lowered = description.to_lowercase();
    for mention in &style.always_mention {
        if !lowered.contains(&mention.to_lowercase()) {
            issues.push(format!("Missing mandatory mention: '{mention}'"));
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn good_listing_has_no_issues() {
        let listing = json!({
            "title": "Hand-thrown stoneware mug",
            "description": format!("{} ships free", words(40)),
            "tags": ["mug", "stoneware", "handmade"],
            "suggested_price": 28.0
        });
        let style = StyleProfile {
            always_mention: vec!["Ships FREE".into()],
            ..StyleProfile::default()
        };
        assert!(check(&listing, &style).is_empty());
    }

    #[test]
    fn each_rule_reports_once() {
        let listing = json!({
            "title": "Mug",
            "description": words(10),
            "tags": ["mug"],
            "suggested_price": "12"
        });
        let style = StyleProfile {
            always_mention: vec!["gift box".into()],
            ..StyleProfile::default()
        };
        assert_eq!(
            check(&listing, &style),
            vec![
                "Title is too short".to_string(),
                "Description too short (10 words)".to_string(),
                "Too few tags (1)".to_string(),
                "Invalid or missing price".to_string(),
                "Missing mandatory mention: 'gift box'".to_string(),
            ]
        );
    }

    #[test]
    fn long_fields_are_flagged() {
        let listing = json!({
            "title": "x".repeat(141),
            "description": words(501),
            "tags": ["a", "b", "c"],
            "suggested_price": 1
        });
        let issues = check(&listing, &StyleProfile::default());
        assert_eq!(
            issues,
            vec![
                "Title exceeds 140 characters".to_string(),
                "Description too long (501 words)".to_string(),
            ]
        );
    }
}
