//! Validation and lint report types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{Connections, ToolCatalog};

/// Workflow document stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Template,
    Executable,
    Dag,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Template => "template",
            Stage::Executable => "executable",
            Stage::Dag => "dag",
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "template" => Ok(Stage::Template),
            "executable" => Ok(Stage::Executable),
            "dag" => Ok(Stage::Dag),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Hint,
    Warning,
    Error,
}

/// A blocking violation found by `validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: String,
    pub path: String,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ValidationError {
    pub fn new(code: &str, stage: Stage, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            path: path.into(),
            stage,
            message: message.into(),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// A single lint finding; never blocks unless it is an auto-repairable
/// error that repair fails to clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintFinding {
    pub code: String,
    pub severity: Severity,
    pub path: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default)]
    pub auto_repairable: bool,
}

impl LintFinding {
    pub fn new(
        code: &str,
        severity: Severity,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.to_string(),
            severity,
            path: path.into(),
            message: message.into(),
            hint: None,
            auto_repairable: false,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn repairable(mut self) -> Self {
        self.auto_repairable = true;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LintReport {
    pub errors: Vec<LintFinding>,
    pub warnings: Vec<LintFinding>,
    pub hints: Vec<LintFinding>,
}

impl LintReport {
    pub fn push(&mut self, finding: LintFinding) {
        match finding.severity {
            Severity::Error => self.errors.push(finding),
            Severity::Warning => self.warnings.push(finding),
            Severity::Hint => self.hints.push(finding),
        }
    }

    pub fn extend(&mut self, findings: impl IntoIterator<Item = LintFinding>) {
        for finding in findings {
            self.push(finding);
        }
    }

    pub fn repairable_errors(&self) -> impl Iterator<Item = &LintFinding> {
        self.errors.iter().filter(|f| f.auto_repairable)
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty() && self.hints.is_empty()
    }
}

/// Record of one applied auto-repair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRecord {
    pub rule_code: String,
    pub description: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Stop at the first error.
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LintOptions {
    pub max_findings: usize,
}

impl Default for LintOptions {
    fn default() -> Self {
        Self { max_findings: 100 }
    }
}

/// Context handed to catalog-aware checks.
pub struct LintContext<'a> {
    pub catalog: &'a dyn ToolCatalog,
    pub connections: Option<&'a Connections>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub ok: bool,
    pub errors: Vec<ValidationError>,
}

/// Result of the full validate -> lint -> repair -> lower pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<crate::dag::Dag>,
    pub errors: Vec<ValidationError>,
    pub report: LintReport,
    pub repairs: Vec<RepairRecord>,
}
