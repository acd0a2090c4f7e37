use std::collections::HashSet;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;

use crate::domain::traits::ModelCatalog;
use crate::domain::types::ModelSpec;

/// In-memory model catalog, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticModelCatalog {
    models: Vec<ModelSpec>,
}

impl StaticModelCatalog {
    pub fn new(models: Vec<ModelSpec>) -> Self {
        Self { models }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn get(&self, id: &str) -> Option<ModelSpec> {
        self.models.iter().find(|model| model.id == id).cloned()
    }

    fn ids(&self) -> Vec<String> {
        self.models.iter().map(|model| model.id.clone()).collect()
    }
}

/// Parse a YAML list of models. Ids must be unique.
pub fn parse_models(yaml: &str) -> anyhow::Result<StaticModelCatalog> {
    let models: Vec<ModelSpec> = serde_yaml::from_str(yaml)?;

    let mut seen = HashSet::new();
    for model in &models {
        if model.id.trim().is_empty() {
            bail!("model with path {} has an empty id", model.path);
        }
        if !seen.insert(model.id.as_str()) {
            bail!("model id {} is defined more than once", model.id);
        }
    }
    Ok(StaticModelCatalog::new(models))
}

/// load the model catalog from a YAML file
pub async fn load_model_catalog(path: &Path) -> anyhow::Result<StaticModelCatalog> {
    tracing::info!("Loading model catalog from {:?}", path);

    let yaml_content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read model catalog {}", path.display()))?;
    let catalog = parse_models(&yaml_content)
        .with_context(|| format!("Invalid model catalog {}", path.display()))?;

    tracing::info!("Loaded {} model(s)", catalog.len());
    for model in &catalog.models {
        if !Path::new(&model.path).exists() {
            tracing::warn!(model_id = %model.id, path = %model.path, "Model file does not exist");
        }
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    const CATALOG: &str = r#"
- id: qwen-coder
  name: Qwen Coder 7B
  path: /models/qwen-coder.gguf
  parameters:
    ctx_size: 16384
    n_gpu_layers: 99
    extra_args: ["--flash-attn"]
- id: llama3
  name: Llama 3 8B
  path: /models/llama3.gguf
"#;

    #[test]
    fn parses_catalog_with_optional_parameters() {
        let catalog = parse_models(CATALOG).expect("should parse catalog");

        assert_eq!(catalog.ids(), vec!["qwen-coder", "llama3"]);
        let qwen = catalog.get("qwen-coder").expect("qwen should exist");
        assert_eq!(qwen.parameters.ctx_size, Some(16384));
        assert_eq!(qwen.parameters.extra_args, vec!["--flash-attn"]);
        let llama = catalog.get("llama3").expect("llama3 should exist");
        assert_eq!(llama.parameters.n_gpu_layers, None);
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let yaml = "- {id: a, name: A, path: /a}\n- {id: a, name: B, path: /b}\n";
        assert!(parse_models(yaml).is_err());
    }

    #[test(tokio::test)]
    async fn loads_from_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("models.yaml");
        std::fs::write(&path, CATALOG).expect("should write catalog");

        let catalog = load_model_catalog(&path).await.expect("should load catalog");
        assert_eq!(catalog.len(), 2);
    }

    #[test(tokio::test)]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        assert!(load_model_catalog(&dir.path().join("absent.yaml")).await.is_err());
    }
}
