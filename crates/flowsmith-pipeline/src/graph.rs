//! Typed workflow graph.
//!
//! The compiled workflow is a strongly-typed node/edge structure inside the
//! pipeline; it serializes to the external engine's JSON shape only at the
//! staging boundary. Validation is therefore language-native: duplicate
//! ids, dangling edges and cycles are structural checks, not string
//! inspection.
//!
//! Credential references in node parameters are aliases (`name` + optional
//! `scope`). Only the vault ever holds ciphertext; the compiled config
//! stores the alias and resolution happens at staging time.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a workflow starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Webhook,
    Schedule,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub kind: TriggerKind,
    #[serde(default)]
    pub parameters: Value,
}

/// An alias pointing into the credential vault. Never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// One step in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Engine node type, e.g. `http-request`, `slack-message`, `transform`.
    pub node_type: String,
    pub label: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
}

/// A directed connection between nodes. `on_error` edges carry the failure
/// path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub on_error: bool,
}

/// The generated artifact's structured configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    pub trigger: TriggerSpec,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: Value,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Severity of a validation finding. Blocking halts the pipeline; advisory
/// is recorded and lowers the best-practices score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocking,
    Advisory,
}

/// One validation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn blocking(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Blocking,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn advisory(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Advisory,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl WorkflowConfig {
    /// Parse a config from the JSON a backend produced.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Structural validation.
    ///
    /// Blocking: no nodes, duplicate node ids, edges referencing unknown
    /// nodes, cycles. Advisory: no error-handling path, unreachable nodes.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.nodes.is_empty() {
            issues.push(ValidationIssue::blocking("empty-graph", "workflow has no nodes"));
            return issues;
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                issues.push(ValidationIssue::blocking(
                    "duplicate-node",
                    format!("duplicate node id: {}", node.id),
                ));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !ids.contains(endpoint.as_str()) {
                    issues.push(ValidationIssue::blocking(
                        "dangling-edge",
                        format!("edge references unknown node: {endpoint}"),
                    ));
                }
            }
        }

        // Cycle and reachability checks only make sense on a well-formed
        // edge set.
        if issues.iter().any(|i| i.is_blocking()) {
            return issues;
        }

        if self.has_cycle() {
            issues.push(ValidationIssue::blocking("cycle", "workflow graph contains a cycle"));
        } else {
            let reachable = self.reachable_from_entry();
            for node in &self.nodes {
                if !reachable.contains(node.id.as_str()) {
                    issues.push(ValidationIssue::advisory(
                        "unreachable-node",
                        format!("node is not reachable from the trigger: {}", node.id),
                    ));
                }
            }
        }

        if !self.edges.iter().any(|e| e.on_error) && self.nodes.len() > 1 {
            issues.push(ValidationIssue::advisory(
                "no-error-path",
                "workflow has no explicit error-handling path",
            ));
        }

        issues
    }

    /// Every credential alias referenced by the graph.
    pub fn credential_references(&self) -> Vec<&CredentialRef> {
        self.nodes.iter().filter_map(|n| n.credential.as_ref()).collect()
    }

    /// Serialize to the external engine's JSON shape.
    ///
    /// Credential aliases go out as `{name, scope}` references; the engine
    /// holds its own credential records and the secret never transits here.
    pub fn to_engine_json(&self) -> Value {
        json!({
            "name": self.name,
            "trigger": {
                "type": match self.trigger.kind {
                    TriggerKind::Webhook => "webhook",
                    TriggerKind::Schedule => "schedule",
                    TriggerKind::Manual => "manual",
                },
                "parameters": self.trigger.parameters,
            },
            "nodes": self.nodes.iter().map(|n| json!({
                "id": n.id,
                "type": n.node_type,
                "label": n.label,
                "parameters": n.parameters,
                "credential": n.credential.as_ref().map(|c| json!({
                    "name": c.name,
                    "scope": c.scope,
                })),
            })).collect::<Vec<_>>(),
            "connections": self.edges.iter().map(|e| json!({
                "from": e.from,
                "to": e.to,
                "onError": e.on_error,
            })).collect::<Vec<_>>(),
            "settings": self.settings,
        })
    }

    // ── internals ────────────────────────────────────────────────────

    fn adjacency(&self) -> HashMap<&str, Vec<&str>> {
        let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            adj.entry(node.id.as_str()).or_default();
        }
        for edge in &self.edges {
            adj.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }
        adj
    }

    fn has_cycle(&self) -> bool {
        let adj = self.adjacency();
        let mut state: HashMap<&str, u8> = HashMap::new(); // 0 unvisited, 1 in-stack, 2 done

        fn visit<'a>(
            node: &'a str,
            adj: &HashMap<&'a str, Vec<&'a str>>,
            state: &mut HashMap<&'a str, u8>,
        ) -> bool {
            match state.get(node) {
                Some(1) => return true,
                Some(2) => return false,
                _ => {}
            }
            state.insert(node, 1);
            for next in adj.get(node).into_iter().flatten() {
                if visit(next, adj, state) {
                    return true;
                }
            }
            state.insert(node, 2);
            false
        }

        self.nodes.iter().any(|n| visit(n.id.as_str(), &adj, &mut state))
    }

    /// Nodes reachable from the entry node (the first node, which the
    /// trigger feeds).
    fn reachable_from_entry(&self) -> HashSet<&str> {
        let adj = self.adjacency();
        let mut seen = HashSet::new();
        let Some(entry) = self.nodes.first() else {
            return seen;
        };
        let mut stack = vec![entry.id.as_str()];
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(adj.get(node).into_iter().flatten());
            }
        }
        seen
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: "transform".into(),
            label: id.to_string(),
            parameters: json!({}),
            credential: None,
        }
    }

    fn edge(from: &str, to: &str) -> Edge {
        Edge {
            from: from.to_string(),
            to: to.to_string(),
            on_error: false,
        }
    }

    fn config(nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowConfig {
        WorkflowConfig {
            name: "test".into(),
            trigger: TriggerSpec {
                kind: TriggerKind::Webhook,
                parameters: json!({"path": "/hook"}),
            },
            nodes,
            edges,
            settings: json!({}),
        }
    }

    #[test]
    fn valid_linear_graph_has_no_blocking_issues() {
        let cfg = config(
            vec![node("a"), node("b"), node("err")],
            vec![edge("a", "b"), Edge {
                from: "a".into(),
                to: "err".into(),
                on_error: true,
            }],
        );
        let issues = cfg.validate();
        assert!(issues.iter().all(|i| !i.is_blocking()), "{issues:?}");
    }

    #[test]
    fn empty_graph_is_blocking() {
        let cfg = config(vec![], vec![]);
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.is_blocking() && i.code == "empty-graph"));
    }

    #[test]
    fn duplicate_node_ids_are_blocking() {
        let cfg = config(vec![node("a"), node("a")], vec![]);
        assert!(cfg.validate().iter().any(|i| i.code == "duplicate-node"));
    }

    #[test]
    fn dangling_edge_is_blocking() {
        let cfg = config(vec![node("a")], vec![edge("a", "ghost")]);
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.is_blocking() && i.code == "dangling-edge"));
    }

    #[test]
    fn cycle_is_blocking() {
        let cfg = config(
            vec![node("a"), node("b")],
            vec![edge("a", "b"), edge("b", "a")],
        );
        assert!(cfg.validate().iter().any(|i| i.code == "cycle"));
    }

    #[test]
    fn missing_error_path_is_advisory() {
        let cfg = config(vec![node("a"), node("b")], vec![edge("a", "b")]);
        let issues = cfg.validate();
        let finding = issues.iter().find(|i| i.code == "no-error-path").unwrap();
        assert_eq!(finding.severity, Severity::Advisory);
    }

    #[test]
    fn unreachable_node_is_advisory() {
        let cfg = config(vec![node("a"), node("b"), node("island")], vec![edge("a", "b")]);
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.code == "unreachable-node" && !i.is_blocking()));
    }

    #[test]
    fn credential_references_are_collected() {
        let mut with_cred = node("a");
        with_cred.credential = Some(CredentialRef {
            name: "slack-token".into(),
            scope: Some("slack".into()),
        });
        let cfg = config(vec![with_cred, node("b")], vec![edge("a", "b")]);

        let refs = cfg.credential_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "slack-token");
    }

    #[test]
    fn engine_json_carries_aliases_not_secrets() {
        let mut with_cred = node("a");
        with_cred.credential = Some(CredentialRef {
            name: "slack-token".into(),
            scope: None,
        });
        let cfg = config(vec![with_cred], vec![]);

        let engine_json = cfg.to_engine_json();
        assert_eq!(engine_json["nodes"][0]["credential"]["name"], "slack-token");
        assert_eq!(engine_json["trigger"]["type"], "webhook");
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = config(vec![node("a"), node("b")], vec![edge("a", "b")]);
        let value = serde_json::to_value(&cfg).unwrap();
        let parsed = WorkflowConfig::from_value(value).unwrap();
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.edges[0].from, "a");
    }
}
