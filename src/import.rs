// Chargement d'un fichier de seed : tableau plat, ou export imbriqué du scanner
// `groups.*.repos.*.images.*.vulnerabilities[]`.
use crate::models::VulnerabilityRecord;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("cannot read seed file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid seed document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("seed document is neither an array nor a `groups` export")]
    UnsupportedLayout,
}

pub async fn load_seed_file(path: &Path) -> Result<Vec<VulnerabilityRecord>, ImportError> {
    info!("Reading seed file {}...", path.display());
    let raw = tokio::fs::read(path).await?;
    let records = parse_seed_document(&raw)?;
    info!("Found {} vulnerability records", records.len());
    Ok(records)
}

pub fn parse_seed_document(raw: &[u8]) -> Result<Vec<VulnerabilityRecord>, ImportError> {
    let document: Value = serde_json::from_slice(raw)?;
    extract_vulnerabilities(document)?
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(ImportError::from))
        .collect()
}

fn extract_vulnerabilities(document: Value) -> Result<Vec<Value>, ImportError> {
    let mut document = match document {
        Value::Array(items) => return Ok(items),
        Value::Object(map) => map,
        _ => return Err(ImportError::UnsupportedLayout),
    };
    let Some(Value::Object(groups)) = document.remove("groups") else {
        return Err(ImportError::UnsupportedLayout);
    };

    // Les niveaux absents ou mal typés sont simplement ignorés.
    let mut vulnerabilities = Vec::new();
    for group in groups.into_values() {
        let Some(Value::Object(repos)) = take_field(group, "repos") else {
            continue;
        };
        for repo in repos.into_values() {
            let Some(Value::Object(images)) = take_field(repo, "images") else {
                continue;
            };
            for image in images.into_values() {
                if let Some(Value::Array(items)) = take_field(image, "vulnerabilities") {
                    vulnerabilities.extend(items);
                }
            }
        }
    }
    Ok(vulnerabilities)
}

fn take_field(value: Value, field: &str) -> Option<Value> {
    match value {
        Value::Object(mut map) => map.remove(field),
        _ => None,
    }
}
