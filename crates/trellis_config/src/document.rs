//! Project and pipeline configuration documents.
//!
//! Documents are YAML or JSON. Parse errors surface here, before any
//! layer is merged.

use crate::error::{ConfigError, ConfigResult};
use crate::layer::{ConfigLayer, LayerScope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Project-scope document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectDocument {
    /// Project name
    pub name: Option<String>,
    /// Adapter settings, passed through untouched
    pub adapter: Map<String, Value>,
    /// Project-wide run defaults
    pub run: Map<String, Value>,
}

/// Pipeline-scope document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineDocument {
    /// Values reachable by parameterization templates
    pub params: Map<String, Value>,
    /// Run options for this pipeline
    pub run: Map<String, Value>,
    /// Adapter settings, passed through untouched
    pub adapter: Map<String, Value>,
}

impl ProjectDocument {
    /// Parse YAML text
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input
    pub fn from_yaml_str(text: &str) -> ConfigResult<Self> {
        parse_yaml("project document", text)
    }

    /// Parse JSON text
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input
    pub fn from_json_str(text: &str) -> ConfigResult<Self> {
        parse_json("project document", text)
    }

    /// Load from a `.yml`, `.yaml` or `.json` file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        load_file(path.as_ref())
    }

    /// The project-scope layer
    #[must_use]
    pub fn layer(&self) -> ConfigLayer {
        ConfigLayer::from_map(LayerScope::Project, self.run.clone())
    }
}

impl PipelineDocument {
    /// Parse YAML text
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input
    pub fn from_yaml_str(text: &str) -> ConfigResult<Self> {
        parse_yaml("pipeline document", text)
    }

    /// Parse JSON text
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input
    pub fn from_json_str(text: &str) -> ConfigResult<Self> {
        parse_json("pipeline document", text)
    }

    /// Load from a `.yml`, `.yaml` or `.json` file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        load_file(path.as_ref())
    }

    /// The pipeline-scope layer
    #[must_use]
    pub fn layer(&self) -> ConfigLayer {
        ConfigLayer::from_map(LayerScope::Pipeline, self.run.clone())
    }

    /// Look up a dotted path in `params`, e.g. `regions.eu`
    #[must_use]
    pub fn param(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        parts.try_fold(self.params.get(first)?, |value, part| match value {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

fn parse_yaml<T: DeserializeOwned + Default>(origin: &str, text: &str) -> ConfigResult<T> {
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(text).map_err(|e| {
        let message = match e.location() {
            Some(loc) => format!("{} (line {}, column {})", e, loc.line(), loc.column()),
            None => e.to_string(),
        };
        ConfigError::Parse {
            origin: origin.to_string(),
            message,
        }
    })
}

fn parse_json<T: DeserializeOwned>(origin: &str, text: &str) -> ConfigResult<T> {
    serde_json::from_str(text).map_err(|e| ConfigError::Parse {
        origin: origin.to_string(),
        message: e.to_string(),
    })
}

fn load_file<T: DeserializeOwned + Default>(path: &Path) -> ConfigResult<T> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let origin = path.display().to_string();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&origin, &text),
        _ => parse_yaml(&origin, &text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::merge;
    use serde_json::json;
    use std::io::Write;

    const PIPELINE_YAML: &str = r#"
params:
  regions:
    eu: {currency: EUR}
    us: {currency: USD}
run:
  final_vars: [summary]
  executor:
    type: threadpool
    max_workers: 4
  retry:
    max_retries: 3
    retry_exceptions: [TimeoutError]
"#;

    #[test]
    fn test_pipeline_yaml() {
        let doc = PipelineDocument::from_yaml_str(PIPELINE_YAML).unwrap();
        assert_eq!(doc.run.get("final_vars"), Some(&json!(["summary"])));
        assert_eq!(doc.param("regions.eu.currency"), Some(&json!("EUR")));
        assert_eq!(doc.param("regions.asia"), None);
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = PipelineDocument::from_yaml_str("run: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_unknown_top_level_section_rejected() {
        let err = ProjectDocument::from_yaml_str("nmae: demo\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(ProjectDocument::from_yaml_str("").unwrap(), ProjectDocument::default());
    }

    #[test]
    fn test_load_json_and_yaml_files() {
        let dir = tempfile::tempdir().unwrap();

        let project_path = dir.path().join("project.json");
        std::fs::write(
            &project_path,
            r#"{"name": "demo", "run": {"executor": {"type": "synchronous"}}}"#,
        )
        .unwrap();

        let pipeline_path = dir.path().join("pipeline.yml");
        let mut file = std::fs::File::create(&pipeline_path).unwrap();
        file.write_all(PIPELINE_YAML.as_bytes()).unwrap();

        let project = ProjectDocument::load(&project_path).unwrap();
        let pipeline = PipelineDocument::load(&pipeline_path).unwrap();
        assert_eq!(project.name.as_deref(), Some("demo"));

        let run = merge([project.layer(), pipeline.layer()])
            .into_run_config()
            .unwrap();
        assert_eq!(run.executor.max_workers, Some(4));
        assert_eq!(run.retry.max_retries, 3);
        assert_eq!(run.retry.retry_exceptions, vec!["TimeoutError"]);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineDocument::load(dir.path().join("absent.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
