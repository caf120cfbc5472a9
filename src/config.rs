//! Groups configuration helpers.
//!
//! The groups config is a JSON document mapping each archive group to a
//! type tag and the ordered list of subject-relative files that feed it.
//! Loading validates the schema up front so packaging can stay
//! deterministic and fail before any volume is read.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Group type tags accepted in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Volume,
    Streamlines,
}

/// Standardization modes for volume groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Standardization {
    All,
    Independent,
    PerFile,
    None,
}

/// One group declaration from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    #[serde(rename = "type")]
    pub kind: GroupKind,
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standardization: Option<Standardization>,
}

/// The full groups configuration, keyed by group name.
pub type GroupsConfig = BTreeMap<String, GroupSpec>;

/// Load the groups config from a JSON file and validate it.
pub fn load_groups_config(path: &Path) -> Result<GroupsConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let raw: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&bytes).context("parse groups config JSON")?;

    let mut config = GroupsConfig::new();
    for (group, value) in raw {
        let spec: GroupSpec = serde_json::from_value(value)
            .with_context(|| format!("group {group:?}: expected type, files and, for volume groups, standardization"))?;
        config.insert(group, spec);
    }
    validate_groups_config(&config)?;
    Ok(config)
}

/// Validate group declarations beyond what deserialization enforces.
pub fn validate_groups_config(config: &GroupsConfig) -> Result<()> {
    if config.is_empty() {
        return Err(anyhow!("groups config declares no groups"));
    }
    for (group, spec) in config {
        if spec.files.is_empty() {
            return Err(anyhow!("group {group:?} lists no files"));
        }
        for rel in &spec.files {
            validate_relative_path(rel, group)?;
        }
        if spec.kind == GroupKind::Volume && spec.standardization.is_none() {
            return Err(anyhow!(
                "volume group {group:?} must declare standardization \
                 (one of all, independent, per_file, none)"
            ));
        }
    }
    Ok(())
}

/// Groups of one kind, in config order.
pub fn groups_of_kind(config: &GroupsConfig, kind: GroupKind) -> Vec<(&String, &GroupSpec)> {
    config.iter().filter(|(_, spec)| spec.kind == kind).collect()
}

fn validate_relative_path(rel: &str, group: &str) -> Result<()> {
    let path = Path::new(rel);
    if path.is_absolute() || has_parent_components(path) {
        return Err(anyhow!(
            "group {group:?}: file entries must be relative paths without '..' (got {rel:?})"
        ));
    }
    Ok(())
}

fn has_parent_components(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, std::path::Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<GroupsConfig> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");
        fs::write(&path, json).unwrap();
        load_groups_config(&path)
    }

    #[test]
    fn accepts_volume_and_streamline_groups() {
        let config = parse(
            r#"{
                "input": {
                    "type": "volume",
                    "standardization": "per_file",
                    "files": ["dwi/dwi.nii.gz", "anat/t1.nii.gz"]
                },
                "streamlines": {
                    "type": "streamlines",
                    "files": ["bundles/*_af.trk"]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config["input"].kind, GroupKind::Volume);
        assert_eq!(
            config["input"].standardization,
            Some(Standardization::PerFile)
        );
        assert_eq!(groups_of_kind(&config, GroupKind::Streamlines).len(), 1);
    }

    #[test]
    fn rejects_unknown_type_tag() {
        let err = parse(r#"{"input": {"type": "surface", "files": ["a.nii.gz"]}}"#).unwrap_err();
        assert!(format!("{err:#}").contains("input"));
    }

    #[test]
    fn rejects_volume_without_standardization() {
        let err = parse(r#"{"input": {"type": "volume", "files": ["a.nii.gz"]}}"#).unwrap_err();
        assert!(err.to_string().contains("standardization"));
    }

    #[test]
    fn rejects_escaping_paths() {
        let err = parse(
            r#"{"input": {"type": "volume", "standardization": "none",
                "files": ["../other/a.nii.gz"]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("relative paths"));
    }

    #[test]
    fn rejects_empty_file_list() {
        let err = parse(r#"{"input": {"type": "streamlines", "files": []}}"#).unwrap_err();
        assert!(err.to_string().contains("lists no files"));
    }
}
