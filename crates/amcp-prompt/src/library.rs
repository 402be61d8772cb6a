//! Model profiles and few-shot examples.
//!
//! Profiles are data, not code: they live in a YAML document so tests and
//! deployments can supply alternatives without rebuilding. The embedded
//! default document ships with the crate.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{PromptError, PromptKind};

/// The embedded default profile document.
const BUILTIN_PROFILES: &str = include_str!("../assets/profiles.yaml");

/// Prompt-shaping options for one model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Text prepended before everything else.
    pub system_prefix: String,
    /// Text appended after everything else.
    #[serde(default)]
    pub system_suffix: String,
    /// Few-shot examples included, at most.
    pub max_few_shot_examples: usize,
    /// Whether to append the strict JSON-only enforcement block.
    pub strict_json_mode: bool,
    /// Completion budget hint for this profile.
    pub max_tokens: u32,
}

/// One worked example embedded in a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    /// Example user query.
    pub query: String,
    /// Example model output.
    pub output: String,
}

#[derive(Debug, Deserialize)]
struct LibraryDocument {
    default_profile: String,
    profiles: HashMap<String, ModelProfile>,
    #[serde(default)]
    examples: HashMap<String, Vec<FewShotExample>>,
}

/// Immutable library of profiles and examples, loaded once at startup.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    default_profile: String,
    profiles: HashMap<String, ModelProfile>,
    examples: HashMap<String, Vec<FewShotExample>>,
}

impl PromptLibrary {
    /// Parse a library from a YAML document.
    pub fn from_yaml(document: &str) -> Result<Self, PromptError> {
        let document: LibraryDocument = serde_yaml::from_str(document)?;
        if !document.profiles.contains_key(&document.default_profile) {
            return Err(PromptError::MissingProfile(document.default_profile));
        }
        debug!(
            profiles = document.profiles.len(),
            "prompt library loaded"
        );
        Ok(Self {
            default_profile: document.default_profile,
            profiles: document.profiles,
            examples: document.examples,
        })
    }

    /// Load a library from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PromptError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// The library embedded in the crate.
    pub fn builtin() -> Self {
        Self::from_yaml(BUILTIN_PROFILES).expect("embedded profile document is valid")
    }

    /// Resolve the profile for a model name by longest prefix; unknown
    /// models get the default profile.
    pub fn profile_for(&self, model: &str) -> &ModelProfile {
        let model = model.to_lowercase();
        self.profiles
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, profile)| profile)
            .unwrap_or_else(|| {
                self.profiles
                    .get(&self.default_profile)
                    .expect("default profile validated at load")
            })
    }

    /// Few-shot examples for a prompt kind, in document order.
    pub fn examples_for(&self, kind: PromptKind) -> &[FewShotExample] {
        self.examples
            .get(kind.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_document_parses() {
        let library = PromptLibrary::builtin();
        assert!(!library.examples_for(PromptKind::TaskPlanning).is_empty());
    }

    #[test]
    fn profile_resolution_prefers_longest_prefix() {
        let library = PromptLibrary::from_yaml(
            r#"
default_profile: default
profiles:
  default: { system_prefix: "d", max_few_shot_examples: 1, strict_json_mode: true, max_tokens: 512 }
  gpt: { system_prefix: "g", max_few_shot_examples: 1, strict_json_mode: true, max_tokens: 512 }
  gpt-4: { system_prefix: "g4", max_few_shot_examples: 1, strict_json_mode: true, max_tokens: 512 }
"#,
        )
        .unwrap();

        assert_eq!(library.profile_for("gpt-4-turbo").system_prefix, "g4");
        assert_eq!(library.profile_for("gpt-3.5").system_prefix, "g");
        assert_eq!(library.profile_for("mistral").system_prefix, "d");
    }

    #[test]
    fn missing_default_profile_is_rejected() {
        let err = PromptLibrary::from_yaml(
            r#"
default_profile: nope
profiles:
  default: { system_prefix: "d", max_few_shot_examples: 1, strict_json_mode: true, max_tokens: 512 }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, PromptError::MissingProfile(_)));
    }
}
