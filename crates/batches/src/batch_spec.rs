//! Batch spec documents.
//!
//! A batch spec is a YAML (or JSON) document describing a large-scale change:
//! which repositories to target (`on`), the steps to run in each workspace,
//! and the template for the resulting changesets. [`BatchSpec`] is the stored
//! row; [`BatchSpecDocument`] is its parsed form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchforge_core::{BatchSpecId, UserId};

/// Parse error for batch spec documents.
#[derive(Debug, thiserror::Error)]
pub enum SpecParseError {
    #[error("malformed batch spec: {0}")]
    Syntax(#[from] serde_yaml::Error),
    #[error("invalid batch spec: {0}")]
    Invalid(String),
}

impl SpecParseError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Stored batch spec row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpec {
    pub id: BatchSpecId,
    /// Opaque public identifier, as embedded in apply URLs.
    pub rand_id: String,
    pub user_id: UserId,
    /// The document exactly as submitted.
    pub raw_spec: String,
    pub created_at: DateTime<Utc>,
}

impl BatchSpec {
    pub fn parse(&self) -> Result<BatchSpecDocument, SpecParseError> {
        BatchSpecDocument::parse(&self.raw_spec)
    }
}

/// A spec submitted for server-side execution whose resulting batch spec is
/// not known yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBatchSpec {
    pub user_id: UserId,
    pub raw_spec: String,
    /// Filled in once execution reports the created batch spec.
    pub batch_spec_rand_id: Option<String>,
}

/// Parsed batch spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BatchSpecDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub on: Vec<OnTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspaces: Option<Vec<WorkspaceConfiguration>>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_changes: Option<TransformChanges>,
    #[serde(default)]
    pub import_changesets: Vec<ImportChangeset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeset_template: Option<ChangesetTemplate>,
}

impl BatchSpecDocument {
    /// Parse and validate a raw document. JSON is accepted as a YAML subset.
    pub fn parse(raw: &str) -> Result<Self, SpecParseError> {
        let doc: BatchSpecDocument = serde_yaml::from_str(raw)?;
        doc.validate()?;
        Ok(doc)
    }

    fn validate(&self) -> Result<(), SpecParseError> {
        if self.name.is_empty() {
            return Err(SpecParseError::invalid("name must not be empty"));
        }
        if let Some(c) = self
            .name
            .chars()
            .find(|c| !(c.is_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(SpecParseError::invalid(format!(
                "name {:?} contains invalid character {c:?}",
                self.name
            )));
        }

        if self.steps.is_empty() && self.import_changesets.is_empty() {
            return Err(SpecParseError::invalid(
                "steps must be set unless changesets are imported",
            ));
        }
        if !self.steps.is_empty() && self.changeset_template.is_none() {
            return Err(SpecParseError::invalid(
                "changesetTemplate must be set when steps are set",
            ));
        }

        for (idx, target) in self.on.iter().enumerate() {
            if let OnTarget::Repository(repo) = target {
                if repo.branch.is_some() && repo.branches.is_some() {
                    return Err(SpecParseError::invalid(format!(
                        "on[{idx}]: branch and branches are mutually exclusive"
                    )));
                }
            }
        }
        for (idx, step) in self.steps.iter().enumerate() {
            if step.run.trim().is_empty() {
                return Err(SpecParseError::invalid(format!("steps[{idx}]: run must not be empty")));
            }
            if step.container.trim().is_empty() {
                return Err(SpecParseError::invalid(format!(
                    "steps[{idx}]: container must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// Whether resolution of this spec will only import existing changesets.
    pub fn is_import_only(&self) -> bool {
        self.on.is_empty() && self.steps.is_empty()
    }
}

/// An `on` entry: either a search query or a single repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OnTarget {
    Query(OnQuery),
    Repository(OnRepository),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OnQuery {
    pub repositories_matching_query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnRepository {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,
}

/// Monorepo workspace layout for repositories matching `in`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkspaceConfiguration {
    pub root_at_location_of: String,
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub in_glob: Option<String>,
    #[serde(default)]
    pub only_fetch_workspace: bool,
}

/// One step executed inside a workspace container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Step {
    pub run: String,
    pub container: String,
    #[serde(default, skip_serializing_if = "StepEnv::is_empty")]
    pub env: StepEnv,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, StepOutput>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
}

/// Step environment, written either as a map or as a list whose items are
/// `NAME` (inherit from the outer environment), `NAME=value` strings or
/// single-entry `NAME: value` maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepEnv {
    Map(BTreeMap<String, String>),
    List(Vec<EnvItem>),
}

impl Default for StepEnv {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvItem {
    Inherit(String),
    Set(BTreeMap<String, String>),
}

/// A resolved environment variable; `value` is `None` when inherited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: Option<String>,
}

impl StepEnv {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Map(m) => m.is_empty(),
            Self::List(l) => l.is_empty(),
        }
    }

    /// Flatten both notations into an ordered variable list.
    pub fn vars(&self) -> Vec<EnvVar> {
        match self {
            Self::Map(m) => m
                .iter()
                .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()) })
                .collect(),
            Self::List(items) => items
                .iter()
                .flat_map(|item| match item {
                    EnvItem::Inherit(raw) => match raw.split_once('=') {
                        Some((name, value)) => vec![EnvVar {
                            name: name.to_string(),
                            value: Some(value.to_string()),
                        }],
                        None => vec![EnvVar { name: raw.clone(), value: None }],
                    },
                    EnvItem::Set(m) => m
                        .iter()
                        .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()) })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// `if:` on a step: a literal boolean or a template evaluated at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepCondition {
    Bool(bool),
    Template(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepOutput {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformChanges {
    #[serde(default)]
    pub group: Vec<ChangeGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeGroup {
    pub directory: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportChangeset {
    pub repository: String,
    #[serde(rename = "externalIDs")]
    pub external_ids: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangesetTemplate {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub branch: String,
    pub commit: CommitTemplate,
    #[serde(default)]
    pub published: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitTemplate {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<CommitAuthor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
name: hello-world
description: Add Hello World to READMEs
on:
  - repositoriesMatchingQuery: file:README.md
  - repository: github.com/sourcegraph/src-cli
    branch: main
steps:
  - run: echo Hello World | tee -a $(find -name README.md)
    container: alpine:3
    env:
      - FOO
      - BAR: baz
      - QUX=1
    if: ${{ eq repository.name "github.com/sourcegraph/src-cli" }}
  - run: echo done
    container: alpine:3
    env:
      ONE: "1"
    if: false
changesetTemplate:
  title: Hello World
  body: My first batch change!
  branch: hello-world
  commit:
    message: Append Hello World to all README.md files
  published: false
"#;

    #[test]
    fn parses_full_document() {
        let doc = BatchSpecDocument::parse(SPEC).unwrap();

        assert_eq!(doc.name, "hello-world");
        assert_eq!(doc.on.len(), 2);
        assert!(matches!(doc.on[0], OnTarget::Query(_)));
        assert!(matches!(doc.on[1], OnTarget::Repository(_)));
        assert_eq!(doc.steps.len(), 2);
        assert!(matches!(doc.steps[0].condition, Some(StepCondition::Template(_))));
        assert_eq!(doc.steps[1].condition, Some(StepCondition::Bool(false)));
    }

    #[test]
    fn env_accepts_both_notations() {
        let doc = BatchSpecDocument::parse(SPEC).unwrap();

        let list = doc.steps[0].env.vars();
        assert_eq!(list[0], EnvVar { name: "FOO".into(), value: None });
        assert_eq!(list[1], EnvVar { name: "BAR".into(), value: Some("baz".into()) });
        assert_eq!(list[2], EnvVar { name: "QUX".into(), value: Some("1".into()) });

        let map = doc.steps[1].env.vars();
        assert_eq!(map, vec![EnvVar { name: "ONE".into(), value: Some("1".into()) }]);
    }

    #[test]
    fn accepts_json_documents() {
        let raw = r#"{"name": "json-spec", "importChangesets": [{"repository": "github.com/a/b", "externalIDs": [1, "2"]}]}"#;
        let doc = BatchSpecDocument::parse(raw).unwrap();
        assert_eq!(doc.import_changesets[0].external_ids.len(), 2);
        assert!(doc.is_import_only());
    }

    #[test]
    fn rejects_unknown_keys() {
        let raw = "name: x\nbogus: true\n";
        assert!(matches!(BatchSpecDocument::parse(raw), Err(SpecParseError::Syntax(_))));
    }

    #[test]
    fn rejects_bad_names() {
        let err = BatchSpecDocument::parse("name: hello world\n").unwrap_err();
        assert!(err.to_string().contains("invalid character"));
    }

    #[test]
    fn requires_steps_or_imports() {
        let err = BatchSpecDocument::parse("name: x\n").unwrap_err();
        assert!(err.to_string().contains("steps must be set"));
    }

    #[test]
    fn steps_require_template() {
        let raw = "name: x\non:\n  - repository: github.com/a/b\nsteps:\n  - run: ls\n    container: alpine\n";
        let err = BatchSpecDocument::parse(raw).unwrap_err();
        assert!(err.to_string().contains("changesetTemplate"));
    }

    #[test]
    fn branch_and_branches_are_exclusive() {
        let raw = r#"
name: x
on:
  - repository: github.com/a/b
    branch: main
    branches: [main, dev]
steps:
  - run: ls
    container: alpine
changesetTemplate:
  title: t
  branch: b
  commit:
    message: m
"#;
        let err = BatchSpecDocument::parse(raw).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn steps_round_trip_through_json() {
        let doc = BatchSpecDocument::parse(SPEC).unwrap();
        let json = serde_json::to_value(&doc.steps).unwrap();
        let back: Vec<Step> = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc.steps);
    }
}
