use serde::Deserialize;
use serde_json::Value;

/// API group under which Gatekeeper serves one kind per constraint template.
pub const CONSTRAINTS_GROUP: &str = "constraints.gatekeeper.sh";

/// Audit results recorded on a constraint's status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstraintReport {
    pub kind: String,
    pub name: String,
    pub enforcement_action: Option<String>,
    pub total_violations: u64,
    pub violations: Vec<Violation>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    pub namespace: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConstraintStatus {
    total_violations: Option<u64>,
    #[serde(default)]
    violations: Vec<Violation>,
}

pub fn constraint_report(obj: &Value) -> Option<ConstraintReport> {
    let kind = obj.get("kind")?.as_str()?.to_string();
    let name = obj.pointer("/metadata/name")?.as_str()?.to_string();
    let enforcement_action = obj
        .pointer("/spec/enforcementAction")
        .and_then(Value::as_str)
        .map(String::from);
    let status = obj
        .get("status")
        .and_then(|s| ConstraintStatus::deserialize(s).ok())
        .unwrap_or_default();
    Some(ConstraintReport {
        kind,
        name,
        enforcement_action,
        total_violations: status
            .total_violations
            .unwrap_or(status.violations.len() as u64),
        violations: status.violations,
    })
}
