use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authorization service unavailable: {0}")]
    Unavailable(String),
}

/// Answers whether an API key is currently valid for a project.
#[async_trait]
pub trait ApiKeyValidator: Send + Sync {
    async fn validate(&self, project_id: &str, api_key: &str) -> Result<bool, AuthError>;
}

/// Key registry parsed from `project:key` entries.
///
/// A project may own several keys. Revoked keys are rejected for every
/// project even if they are still listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticApiKeyValidator {
    keys_by_project: HashMap<String, Vec<String>>,
    revoked_api_keys: HashSet<String>,
}

impl StaticApiKeyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(keys_raw: Option<&str>, revoked_raw: Option<&str>) -> Self {
        Self {
            keys_by_project: parse_project_keys(keys_raw),
            revoked_api_keys: parse_api_key_set(revoked_raw),
        }
    }

    pub fn with_key(mut self, project_id: &str, api_key: &str) -> Self {
        self.insert(project_id, api_key);
        self
    }

    pub fn insert(&mut self, project_id: &str, api_key: &str) {
        let (project_id, api_key) = (project_id.trim(), api_key.trim());
        if project_id.is_empty() || api_key.is_empty() {
            return;
        }
        let keys = self.keys_by_project.entry(project_id.to_string()).or_default();
        if !keys.iter().any(|existing| existing == api_key) {
            keys.push(api_key.to_string());
        }
    }

    pub fn revoke(&mut self, api_key: &str) {
        let api_key = api_key.trim();
        if !api_key.is_empty() {
            self.revoked_api_keys.insert(api_key.to_string());
        }
    }

    pub fn projects_len(&self) -> usize {
        self.keys_by_project.len()
    }

    pub fn is_valid(&self, project_id: &str, api_key: &str) -> bool {
        if project_id.is_empty() || api_key.is_empty() {
            return false;
        }
        if self.revoked_api_keys.contains(api_key) {
            return false;
        }
        let Some(keys) = self.keys_by_project.get(project_id) else {
            return false;
        };
        // Check every candidate so timing does not reveal which key matched.
        let mut matched = false;
        for key in keys {
            matched |= constant_time_eq(key.as_bytes(), api_key.as_bytes());
        }
        matched
    }
}

#[async_trait]
impl ApiKeyValidator for StaticApiKeyValidator {
    async fn validate(&self, project_id: &str, api_key: &str) -> Result<bool, AuthError> {
        Ok(self.is_valid(project_id, api_key))
    }
}

fn parse_project_keys(raw: Option<&str>) -> HashMap<String, Vec<String>> {
    let mut registry = StaticApiKeyValidator::new();
    let Some(raw) = raw else {
        return registry.keys_by_project;
    };

    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((project_id, api_key)) = entry.split_once(':') else {
            continue;
        };
        registry.insert(project_id, api_key);
    }
    registry.keys_by_project
}

fn parse_api_key_set(raw: Option<&str>) -> HashSet<String> {
    let mut keys = HashSet::new();
    if let Some(raw) = raw {
        for key in raw.split(',') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            keys.insert(key.to_string());
        }
    }
    keys
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}
