//! Promotion documents.
//!
//! A promotion document is the YAML description of one promotion: who
//! promotes what into which stage, and the steps to run.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use freightline::context::Secrets;
use freightline::freight::{FreightCollection, FreightReference, FreightRequest, TargetFreight};
use freightline::step::ExpressionVariable;
use freightline::{PromotionContext, Step};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionDocument {
    pub project: String,
    pub stage: String,
    pub promotion: String,

    #[serde(default)]
    pub actor: String,

    #[serde(default, rename = "uiBaseURL")]
    pub ui_base_url: String,

    #[serde(default)]
    pub target_freight_ref: TargetFreight,

    #[serde(default)]
    pub freight_requests: Vec<FreightRequest>,

    /// Resolved Freight, one entry per origin.
    #[serde(default)]
    pub freight: Vec<FreightReference>,

    #[serde(default)]
    pub vars: Vec<ExpressionVariable>,

    #[serde(default)]
    pub secrets: Secrets,

    pub steps: Vec<Step>,
}

impl PromotionDocument {
    /// Read a document from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read promotion file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse promotion file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Build the context of a first engine invocation.
    pub fn to_context(&self) -> PromotionContext {
        let mut freight = FreightCollection::default();
        for reference in &self.freight {
            freight.update_or_push(reference.clone());
        }

        let mut ctx = PromotionContext::new(&self.project, &self.stage, &self.promotion)
            .with_actor(&self.actor);
        ctx.ui_base_url = self.ui_base_url.clone();
        ctx.target_freight_ref = self.target_freight_ref.clone();
        ctx.freight_requests = self.freight_requests.clone();
        ctx.freight = freight;
        ctx.vars = self.vars.clone();
        ctx.secrets = self.secrets.clone();
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
project: demo
stage: prod
promotion: prod.01
actor: alice
uiBaseURL: https://kargo.example.com
targetFreightRef:
  name: f-123
  origin:
    kind: Warehouse
    name: main
freightRequests:
  - origin:
      name: main
freight:
  - name: f-123
    origin:
      name: main
    commits:
      - repoURL: https://github.com/example/app
        id: abc123
vars:
  - name: branch
    value: stage/${{ ctx.stage }}
secrets:
  git:
    token: s3cr3t
steps:
  - uses: compose-output
    as: pick
    config:
      commit: ${{ commitFrom("https://github.com/example/app").id }}
  - uses: compose-output
    if: ${{ success() }}
    continueOnError: true
    retry:
      timeout: 5m
      errorThreshold: 3
"#;

    #[test]
    fn test_parse_document() {
        let doc = PromotionDocument::parse(DOCUMENT).unwrap();
        assert_eq!(doc.project, "demo");
        assert_eq!(doc.steps.len(), 2);
        assert_eq!(doc.steps[0].alias.as_deref(), Some("pick"));
        assert_eq!(doc.steps[1].condition(), Some("${{ success() }}"));
        assert!(doc.steps[1].continue_on_error);

        let retry = doc.steps[1].retry.as_ref().unwrap();
        assert_eq!(retry.timeout(), Some(std::time::Duration::from_secs(300)));
        assert_eq!(retry.error_threshold(), Some(3));
    }

    #[test]
    fn test_document_to_context() {
        let doc = PromotionDocument::parse(DOCUMENT).unwrap();
        let ctx = doc.to_context();

        assert_eq!(ctx.stage, "prod");
        assert_eq!(ctx.actor, "alice");
        assert_eq!(ctx.ui_base_url, "https://kargo.example.com");
        assert_eq!(ctx.target_freight_ref.name, "f-123");
        assert_eq!(ctx.freight.items.len(), 1);
        assert!(ctx.freight.items.contains_key("Warehouse/main"));
        assert_eq!(ctx.vars[0].name, "branch");
        assert_eq!(ctx.secrets["git"]["token"], "s3cr3t");
        assert_eq!(ctx.start_from_step, 0);
        assert!(ctx.work_dir.is_none());
    }

    #[test]
    fn test_missing_steps_rejected() {
        assert!(PromotionDocument::parse("project: demo\nstage: prod\npromotion: p\n").is_err());
    }
}
