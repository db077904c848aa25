//! Per-version image configuration (`image.yaml`).
//!
//! Image-build jobs may drop an `image.yaml` next to a version's artifacts.
//! Only its `simplestream` block matters here: a pretty distribution name,
//! extra release aliases, and the runtime requirements the image expects.
//! Everything else in the file is build-tool input and is ignored.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::{self, Deserializer};
use serde::Deserialize;

/// The `simplestream` block of a version's `image.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    /// Pretty name of the operating system (e.g. "Ubuntu").
    #[serde(default)]
    pub distro_name: String,

    /// Map of release name to a comma-separated list of extra aliases
    /// (e.g. `noble: "24,24.04"`).
    #[serde(default, deserialize_with = "scalar_string_map")]
    pub release_aliases: BTreeMap<String, String>,

    /// Requirement rules, applied in order when their filter matches.
    #[serde(default)]
    pub requirements: Vec<RequirementRule>,
}

/// A set of requirements gated on optional release/architecture/variant
/// filters. An absent (empty) filter list matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequirementRule {
    /// Configuration key to expected value.
    #[serde(default, deserialize_with = "scalar_string_map")]
    pub requirements: BTreeMap<String, String>,

    #[serde(default)]
    pub releases: Vec<String>,

    #[serde(default)]
    pub architectures: Vec<String>,

    #[serde(default)]
    pub variants: Vec<String>,
}

impl RequirementRule {
    /// Whether this rule applies to the given product identity.
    pub fn applies_to(&self, release: &str, architecture: &str, variant: &str) -> bool {
        let matches = |filter: &[String], value: &str| {
            filter.is_empty() || filter.iter().any(|f| f == value)
        };

        matches(&self.releases, release)
            && matches(&self.architectures, architecture)
            && matches(&self.variants, variant)
    }
}

/// Deserialize a YAML mapping whose values may be plain scalars
/// (`secure_boot: false`) into string-to-string pairs.
fn scalar_string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, serde_yaml::Value> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                other => {
                    return Err(de::Error::custom(format!(
                        "expected a scalar value for {key:?}, got {other:?}"
                    )))
                }
            };
            Ok((key, value))
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct ImageDefinition {
    #[serde(default)]
    simplestream: ImageConfig,
}

/// Read the `simplestream` block from an `image.yaml` file.
pub fn read_image_config(path: &Path) -> Result<ImageConfig> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let definition: ImageDefinition = serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(definition.simplestream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn parses_simplestream_block_and_ignores_the_rest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.yaml");
        fs::write(
            &path,
            concat!(
                "image:\n",
                "  distribution: ubuntu\n",
                "simplestream:\n",
                "  distro_name: Ubuntu\n",
                "  release_aliases:\n",
                "    noble: 24,24.04\n",
                "  requirements:\n",
                "  - requirements:\n",
                "      secure_boot: false\n",
                "    variants:\n",
                "    - default\n",
            ),
        )
        .unwrap();

        let config = read_image_config(&path).unwrap();
        assert_eq!(config.distro_name, "Ubuntu");
        assert_eq!(config.release_aliases.get("noble").unwrap(), "24,24.04");
        assert_eq!(config.requirements.len(), 1);
        assert_eq!(
            config.requirements[0].requirements.get("secure_boot").unwrap(),
            "false"
        );
    }

    #[test]
    fn missing_simplestream_block_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.yaml");
        fs::write(&path, "image:\n  distribution: ubuntu\n").unwrap();

        let config = read_image_config(&path).unwrap();
        assert!(config.distro_name.is_empty());
        assert!(config.release_aliases.is_empty());
        assert!(config.requirements.is_empty());
    }

    #[test]
    fn invalid_yaml_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.yaml");
        fs::write(&path, "simplestream: [not: a: mapping\n").unwrap();

        assert!(read_image_config(&path).is_err());
    }

    #[test]
    fn filters_match_when_absent_or_listed() {
        let rule = RequirementRule {
            requirements: BTreeMap::new(),
            releases: vec![],
            architectures: vec!["amd64".to_string()],
            variants: vec!["default".to_string(), "cloud".to_string()],
        };

        assert!(rule.applies_to("noble", "amd64", "cloud"));
        assert!(rule.applies_to("jammy", "amd64", "default"));
        assert!(!rule.applies_to("noble", "arm64", "cloud"));
        assert!(!rule.applies_to("noble", "amd64", "desktop"));
    }
}
