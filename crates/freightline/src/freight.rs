//! Freight: the versioned artifact bundles a promotion moves into a stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Kind of origin that produced a piece of Freight.
pub const WAREHOUSE_KIND: &str = "Warehouse";

/// Where a piece of Freight came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreightOrigin {
    #[serde(default = "default_origin_kind")]
    pub kind: String,
    pub name: String,
}

fn default_origin_kind() -> String {
    WAREHOUSE_KIND.to_string()
}

impl FreightOrigin {
    pub fn warehouse(name: impl Into<String>) -> Self {
        Self {
            kind: WAREHOUSE_KIND.to_string(),
            name: name.into(),
        }
    }

    /// Key identifying the origin inside a [`FreightCollection`].
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// A specific commit of a git repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCommit {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// A specific container image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
}

/// A specific Helm chart version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// One piece of Freight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreightReference {
    pub name: String,
    pub origin: FreightOrigin,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<GitCommit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<Chart>,
}

/// The Freight a promotion moves into its stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetFreight {
    pub name: String,
    pub origin: Option<FreightOrigin>,
}

/// A request for Freight from a particular origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreightRequest {
    pub origin: FreightOrigin,
}

/// All Freight resolved for a promotion, at most one per origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FreightCollection {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub items: BTreeMap<String, FreightReference>,
}

/// Errors raised while looking up artifacts in a [`FreightCollection`].
#[derive(Debug, Error, PartialEq)]
pub enum LookupError {
    /// More than one piece of Freight carries a matching artifact.
    #[error("{artifact} {repo_url} found in more than one piece of Freight; specify an origin")]
    Ambiguous { artifact: &'static str, repo_url: String },

    /// The requested origin has no Freight in the collection.
    #[error("no Freight from origin {0} in collection")]
    UnknownOrigin(String),
}

impl FreightCollection {
    /// Add or replace the Freight of its origin.
    pub fn update_or_push(&mut self, freight: FreightReference) {
        self.items.insert(freight.origin.key(), freight);
    }

    pub fn references(&self) -> impl Iterator<Item = &FreightReference> {
        self.items.values()
    }

    /// Find the commit for a repository.
    pub fn find_commit(
        &self,
        repo_url: &str,
        origin: Option<&FreightOrigin>,
        requests: &[FreightRequest],
    ) -> Result<Option<&GitCommit>, LookupError> {
        let wanted = normalize_git_url(repo_url);
        self.find_artifact("commit", repo_url, origin, requests, |f| {
            f.commits
                .iter()
                .find(|c| normalize_git_url(&c.repo_url) == wanted)
        })
    }

    /// Find the image for a repository.
    pub fn find_image(
        &self,
        repo_url: &str,
        origin: Option<&FreightOrigin>,
        requests: &[FreightRequest],
    ) -> Result<Option<&Image>, LookupError> {
        let wanted = normalize_url(repo_url);
        self.find_artifact("image", repo_url, origin, requests, |f| {
            f.images.iter().find(|i| normalize_url(&i.repo_url) == wanted)
        })
    }

    /// Find the chart for a repository and, for classic repositories, a
    /// chart name.
    pub fn find_chart(
        &self,
        repo_url: &str,
        chart_name: Option<&str>,
        origin: Option<&FreightOrigin>,
        requests: &[FreightRequest],
    ) -> Result<Option<&Chart>, LookupError> {
        let wanted = normalize_url(repo_url);
        self.find_artifact("chart", repo_url, origin, requests, |f| {
            f.charts.iter().find(|c| {
                normalize_url(&c.repo_url) == wanted
                    && chart_name.map_or(true, |name| c.name == name)
            })
        })
    }

    fn find_artifact<'a, T>(
        &'a self,
        artifact: &'static str,
        repo_url: &str,
        origin: Option<&FreightOrigin>,
        requests: &[FreightRequest],
        matcher: impl Fn(&'a FreightReference) -> Option<&'a T>,
    ) -> Result<Option<&'a T>, LookupError> {
        if let Some(origin) = origin {
            let freight = self
                .items
                .get(&origin.key())
                .ok_or_else(|| LookupError::UnknownOrigin(origin.key()))?;
            return Ok(matcher(freight));
        }

        let mut found = None;
        for freight in self.items.values() {
            if !requests.is_empty() && !requests.iter().any(|r| r.origin == freight.origin) {
                continue;
            }
            if let Some(artifact_ref) = matcher(freight) {
                if found.is_some() {
                    return Err(LookupError::Ambiguous {
                        artifact,
                        repo_url: repo_url.to_string(),
                    });
                }
                found = Some(artifact_ref);
            }
        }
        Ok(found)
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}

fn normalize_git_url(url: &str) -> String {
    let url = normalize_url(url);
    url.strip_suffix(".git").map(str::to_string).unwrap_or(url)
}
