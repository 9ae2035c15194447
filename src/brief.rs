//! Brief: the creative request that drives one pipeline run.
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brief {
    pub task: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<u32>,
    #[serde(default, alias = "skills_required")]
    pub capabilities_required: Vec<String>,
    #[serde(default)]
    pub constraints: Map<String, Value>,
    #[serde(default)]
    pub reference_assets: Vec<String>,
}

impl Brief {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            style: None,
            duration_seconds: None,
            capabilities_required: Vec::new(),
            constraints: Map::new(),
            reference_assets: Vec::new(),
        }
    }

    /// Load and validate a brief from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!("brief file not found: {}", path.display()));
        }
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if !is_json {
            return Err(anyhow::anyhow!(
                "brief must be a .json file, got '{}'",
                path.display()
            ));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read brief file '{}'", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("invalid brief in '{}'", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let brief = serde_json::from_str::<Brief>(content)
            .context("brief is not valid JSON or is missing the \"task\" field")?;
        if brief.task.trim().is_empty() {
            return Err(anyhow::anyhow!("brief \"task\" cannot be empty"));
        }
        Ok(brief)
    }

    pub fn summary(&self) -> String {
        let mut parts = vec![format!("Task: {}", self.task)];
        if let Some(style) = self.style.as_deref().filter(|s| !s.is_empty()) {
            parts.push(format!("Style: {style}"));
        }
        if let Some(duration) = self.duration_seconds.filter(|d| *d > 0) {
            parts.push(format!("Duration: {duration}s"));
        }
        if !self.capabilities_required.is_empty() {
            parts.push(format!(
                "Capabilities: {}",
                self.capabilities_required.join(", ")
            ));
        }
        if !self.constraints.is_empty() {
            parts.push(format!(
                "Constraints: {}",
                Value::Object(self.constraints.clone())
            ));
        }
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_brief_with_legacy_skill_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("brief.json");
        std::fs::write(
            &path,
            r#"{"task": "Test trailer", "style": "cyberpunk", "duration_seconds": 30,
                "skills_required": ["image_gen"], "constraints": {"aspect_ratio": "16:9"}}"#,
        )
        .unwrap();

        let brief = Brief::from_file(&path).unwrap();
        assert_eq!(brief.task, "Test trailer");
        assert_eq!(brief.capabilities_required, vec!["image_gen".to_string()]);
        assert_eq!(
            brief.summary(),
            "Task: Test trailer | Style: cyberpunk | Duration: 30s | Capabilities: image_gen | Constraints: {\"aspect_ratio\":\"16:9\"}"
        );
    }

    #[test]
    fn rejects_missing_non_json_and_empty_task() {
        let dir = tempdir().unwrap();
        assert!(Brief::from_file(&dir.path().join("missing.json")).is_err());

        let yaml = dir.path().join("brief.yaml");
        std::fs::write(&yaml, "task: x").unwrap();
        let err = Brief::from_file(&yaml).unwrap_err();
        assert!(err.to_string().contains(".json"));

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, r#"{"task": "   "}"#).unwrap();
        assert!(Brief::from_file(&empty).is_err());
    }
}
