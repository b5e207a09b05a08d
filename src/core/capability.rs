//! Capability tagging
//!
//! Local servers expose nothing beyond a model name, so capabilities are
//! inferred from well-known name substrings. The rule table is data, and
//! the lookup is a pure function, so the heuristics stay testable and in
//! one place.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Vision,
    Code,
    Reasoning,
    Tools,
    Embedding,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Vision => "vision",
            Capability::Code => "code",
            Capability::Reasoning => "reasoning",
            Capability::Tools => "tools",
            Capability::Embedding => "embedding",
        }
    }
}

/// Bracketed tag suffix for a model listing line, empty when the model has
/// no recognized capabilities.
pub fn capability_suffix(model: &str) -> String {
    let tags = capabilities_for_model(model);
    if tags.is_empty() {
        return String::new();
    }
    let labels: Vec<&str> = tags.iter().map(|tag| tag.as_str()).collect();
    format!("  [{}]", labels.join(", "))
}

/// Substring patterns matched case-insensitively against the model name.
const RULES: &[(&str, Capability)] = &[
    ("llava", Capability::Vision),
    ("vision", Capability::Vision),
    ("-vl", Capability::Vision),
    ("pixtral", Capability::Vision),
    ("coder", Capability::Code),
    ("codestral", Capability::Code),
    ("starcoder", Capability::Code),
    ("deepseek-r1", Capability::Reasoning),
    ("qwq", Capability::Reasoning),
    ("-thinking", Capability::Reasoning),
    ("o3", Capability::Reasoning),
    ("tool", Capability::Tools),
    ("hermes", Capability::Tools),
    ("embed", Capability::Embedding),
    ("bge-", Capability::Embedding),
];

/// Capability tags for a model name, deduplicated, in rule-table order.
pub fn capabilities_for_model(model: &str) -> Vec<Capability> {
    let lowered = model.to_lowercase();
    let mut tags = Vec::new();
    for (pattern, capability) in RULES {
        if lowered.contains(pattern) && !tags.contains(capability) {
            tags.push(*capability);
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vision_models_are_tagged() {
        assert_eq!(
            capabilities_for_model("llava:13b"),
            vec![Capability::Vision]
        );
        assert_eq!(
            capabilities_for_model("Qwen2-VL-7B"),
            vec![Capability::Vision]
        );
    }

    #[test]
    fn tags_are_deduplicated() {
        // Matches both "llava" and "vision" rules
        assert_eq!(
            capabilities_for_model("llava-vision-preview"),
            vec![Capability::Vision]
        );
    }

    #[test]
    fn multiple_distinct_capabilities_accumulate() {
        let tags = capabilities_for_model("deepseek-r1-coder");
        assert!(tags.contains(&Capability::Code));
        assert!(tags.contains(&Capability::Reasoning));
    }

    #[test]
    fn unknown_models_get_no_tags() {
        assert!(capabilities_for_model("llama3.1:8b").is_empty());
        assert!(capabilities_for_model("").is_empty());
    }

    #[test]
    fn listing_suffix_names_the_tags() {
        assert_eq!(capability_suffix("llama3.1:8b"), "");
        assert_eq!(capability_suffix("llava:13b"), "  [vision]");
        assert_eq!(
            capability_suffix("deepseek-r1-coder"),
            "  [code, reasoning]"
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(
            capabilities_for_model("CODESTRAL-22B"),
            vec![Capability::Code]
        );
    }
}
