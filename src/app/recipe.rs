//! Recipe and AWM (C3): parsed resource-request vectors with quality values
//! and constraints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::res::path::ResourcePath;

/// One admissible resource-request vector with an associated quality value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Awm {
    pub id: u32,
    /// Quality value in `[0.0, 1.0]`.
    pub value: f64,
    /// Template path -> required amount. Bound to concrete ids by the
    /// scheduler when choosing a view.
    pub requests: HashMap<String, u64>,
}

impl Awm {
    pub fn request_paths(&self) -> crate::error::Result<Vec<(ResourcePath, u64)>> {
        self.requests
            .iter()
            .map(|(p, amount)| Ok((ResourcePath::parse(p)?, *amount)))
            .collect()
    }
}

/// A resource-request vector whose template ids have been substituted with
/// concrete ids chosen against a specific view.
#[derive(Debug, Clone)]
pub struct BoundRequest {
    pub awm_id: u32,
    pub requests: Vec<(ResourcePath, u64)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    pub forbidden_awm_ids: Vec<u32>,
    /// path -> forbidden amount (an AWM requesting exactly this amount on
    /// this path is filtered out even if the AWM itself isn't forbidden).
    #[serde(default)]
    pub forbidden_values: HashMap<String, u64>,
}

/// Immutable bundle of AWMs and optional constraints submitted by an
/// application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "awm")]
    pub awms: Vec<Awm>,
    #[serde(default)]
    pub constraints: Constraints,
}

impl Recipe {
    /// AWMs not excluded by the constraint block, in ascending id order.
    pub fn enabled_awms(&self) -> Vec<&Awm> {
        let mut enabled: Vec<&Awm> = self
            .awms
            .iter()
            .filter(|awm| !self.constraints.forbidden_awm_ids.contains(&awm.id))
            .filter(|awm| {
                !awm.requests.iter().any(|(path, amount)| {
                    self.constraints
                        .forbidden_values
                        .get(path)
                        .is_some_and(|forbidden| forbidden == amount)
                })
            })
            .collect();
        enabled.sort_by_key(|awm| awm.id);
        enabled
    }

    /// The enabled AWM with the lowest quality value.
    pub fn low_value_awm(&self) -> Option<&Awm> {
        self.enabled_awms()
            .into_iter()
            .min_by(|a, b| a.value.total_cmp(&b.value))
    }

    /// The enabled AWM with the highest quality value.
    pub fn high_value_awm(&self) -> Option<&Awm> {
        self.enabled_awms()
            .into_iter()
            .max_by(|a, b| a.value.total_cmp(&b.value))
    }

    pub fn awm(&self, id: u32) -> Option<&Awm> {
        self.awms.iter().find(|a| a.id == id)
    }

    /// Bind an AWM's template requests to concrete ids. In this
    /// implementation resource templates already name concrete leaf paths
    /// (the scheduler's job is choosing *which* AWM, not which physical
    /// core within a template); binding is therefore principally a
    /// validation + parse step.
    pub fn bind(&self, awm_id: u32) -> crate::error::Result<BoundRequest> {
        let awm = self
            .awm(awm_id)
            .ok_or_else(|| crate::error::RtrmError::NotFound(format!("awm {awm_id}")))?;
        Ok(BoundRequest {
            awm_id,
            requests: awm.request_paths()?,
        })
    }

    /// Parse a recipe file. `name` defaults to the file stem when the
    /// document has none.
    pub fn from_toml_str(s: &str, default_name: &str) -> crate::error::Result<Self> {
        let mut recipe: Recipe = toml::from_str(s)
            .map_err(|e| crate::error::RtrmError::ConfigInvalid(format!("recipe parse failed: {e}")))?;
        if recipe.name.is_empty() {
            recipe.name = default_name.to_string();
        }
        for awm in &recipe.awms {
            if !(0.0..=1.0).contains(&awm.value) {
                return Err(crate::error::RtrmError::ConfigInvalid(format!(
                    "awm {} has value {} outside [0.0, 1.0]",
                    awm.id, awm.value
                )));
            }
        }
        Ok(recipe)
    }

    /// Load and parse a recipe file from disk.
    pub fn load_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::error::RtrmError::ConfigInvalid(format!("reading {}: {e}", path.display())))?;
        let default_name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("recipe");
        Self::from_toml_str(&contents, default_name)
    }
}
