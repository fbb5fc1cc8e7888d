use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    Active,
    Done,
    Failed,
}

/// One unit of planned work. Ordering is fixed by the topological sort; a
/// subtask is consumed once and never revisited after completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub name: String,
    /// Free-text instructions for the executor.
    pub info: String,
    #[serde(default)]
    pub status: SubtaskStatus,
}

impl Subtask {
    pub fn new(name: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            info: info.into(),
            status: SubtaskStatus::Pending,
        }
    }
}

/// Dependency graph over subtasks, validated acyclic at parse time. Edges
/// are (before, after) index pairs into `nodes`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dag {
    pub nodes: Vec<Subtask>,
    pub edges: Vec<(usize, usize)>,
}

/// Untrusted engine output either parses into a proper DAG or falls back to
/// a strictly-chained linear plan. The fallback is a first-class variant,
/// not an error path.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskGraph {
    Dag(Dag),
    Linear(Vec<Subtask>),
}

impl TaskGraph {
    /// Orders the subtasks so that for every edge (u, v), u comes before v.
    /// Depth-first post-order, reversed; roots are seeded in reverse list
    /// order so that ties among independent nodes keep their stable
    /// node-list order rather than an alphabetical one. The linear variant
    /// is already ordered.
    pub fn topological_sort(&self) -> Vec<Subtask> {
        match self {
            TaskGraph::Linear(nodes) => nodes.clone(),
            TaskGraph::Dag(dag) => {
                let n = dag.nodes.len();
                let mut adjacency = vec![Vec::new(); n];
                for &(u, v) in &dag.edges {
                    adjacency[u].push(v);
                }

                let mut visited = vec![false; n];
                let mut stack = Vec::with_capacity(n);
                for i in (0..n).rev() {
                    if !visited[i] {
                        dfs_post_order(i, &adjacency, &mut visited, &mut stack);
                    }
                }

                stack
                    .into_iter()
                    .rev()
                    .map(|i| dag.nodes[i].clone())
                    .collect()
            }
        }
    }
}

fn dfs_post_order(
    node: usize,
    adjacency: &[Vec<usize>],
    visited: &mut [bool],
    stack: &mut Vec<usize>,
) {
    visited[node] = true;
    for &next in &adjacency[node] {
        if !visited[next] {
            dfs_post_order(next, adjacency, visited, stack);
        }
    }
    stack.push(node);
}

/// Attempts to parse the engine's DAG translation. The JSON may sit inside
/// `<json>` tags, a ```json fence, or bare in the response. Malformed
/// structure, edges naming unknown nodes, and cycles all yield None so the
/// caller can build the linear fallback.
pub fn parse_dag(raw: &str) -> Option<Dag> {
    let json_text = extract_json(raw)?;
    let value: serde_json::Value = serde_json::from_str(&json_text).ok()?;
    let dag_value = if value.get("dag").is_some() {
        &value["dag"]
    } else {
        &value
    };

    #[derive(Deserialize)]
    struct WireNode {
        name: String,
        #[serde(default)]
        info: String,
    }

    let wire_nodes: Vec<WireNode> =
        serde_json::from_value(dag_value.get("nodes")?.clone()).ok()?;
    if wire_nodes.is_empty() {
        return None;
    }

    let nodes: Vec<Subtask> = wire_nodes
        .iter()
        .map(|w| Subtask::new(w.name.clone(), w.info.clone()))
        .collect();

    let index_of = |name: &str| nodes.iter().position(|n| n.name == name);

    let mut edges = Vec::new();
    if let Some(wire_edges) = dag_value.get("edges").and_then(|e| e.as_array()) {
        for pair in wire_edges {
            let pair = pair.as_array()?;
            if pair.len() != 2 {
                return None;
            }
            let u = index_of(pair[0]["name"].as_str()?)?;
            let v = index_of(pair[1]["name"].as_str()?)?;
            edges.push((u, v));
        }
    }

    let dag = Dag { nodes, edges };
    if is_acyclic(&dag) {
        Some(dag)
    } else {
        tracing::warn!("engine produced a cyclic graph, rejecting");
        None
    }
}

/// Deterministic fallback: one node per non-empty plan line, chained
/// linearly, which is acyclic by construction.
pub fn linear_fallback(plan: &str) -> TaskGraph {
    let nodes: Vec<Subtask> = plan
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, line)| Subtask::new(format!("step_{}", i + 1), line))
        .collect();
    TaskGraph::Linear(nodes)
}

fn is_acyclic(dag: &Dag) -> bool {
    // 0 = unvisited, 1 = on the current path, 2 = finished
    let n = dag.nodes.len();
    let mut adjacency = vec![Vec::new(); n];
    for &(u, v) in &dag.edges {
        if u >= n || v >= n {
            return false;
        }
        adjacency[u].push(v);
    }
    fn visit(node: usize, adjacency: &[Vec<usize>], state: &mut [u8]) -> bool {
        state[node] = 1;
        for &next in &adjacency[node] {
            let next_state = state[next];
            if next_state == 1 {
                return false;
            } else if next_state == 0 && !visit(next, adjacency, state) {
                return false;
            }
        }
        state[node] = 2;
        true
    }

    let mut state = vec![0u8; n];
    for i in 0..n {
        if state[i] == 0 && !visit(i, &adjacency, &mut state) {
            return false;
        }
    }
    true
}

fn extract_json(raw: &str) -> Option<String> {
    if let Some(start) = raw.find("<json>") {
        if let Some(end) = raw[start..].find("</json>") {
            return Some(raw[start + 6..start + end].trim().to_string());
        }
    }
    if let Some(start) = raw.find("```json") {
        let rest = &raw[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(raw[start..=end].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAG_JSON: &str = r#"Here is the graph.
<json>
{"dag": {
  "nodes": [
    {"name": "open_app", "info": "Open the text editor"},
    {"name": "type_text", "info": "Type the report body"},
    {"name": "save_file", "info": "Save with ctrl+s"}
  ],
  "edges": [
    [{"name": "open_app"}, {"name": "type_text"}],
    [{"name": "type_text"}, {"name": "save_file"}]
  ]
}}
</json>"#;

    #[test]
    fn parses_tagged_json_dag() {
        let dag = parse_dag(DAG_JSON).unwrap();
        assert_eq!(dag.nodes.len(), 3);
        assert_eq!(dag.edges, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn parses_fenced_json_dag() {
        let raw = "```json\n{\"nodes\": [{\"name\": \"a\", \"info\": \"x\"}], \"edges\": []}\n```";
        let dag = parse_dag(raw).unwrap();
        assert_eq!(dag.nodes[0].name, "a");
    }

    #[test]
    fn cyclic_graph_is_rejected() {
        let raw = r#"{"nodes": [{"name": "a"}, {"name": "b"}],
                      "edges": [[{"name": "a"}, {"name": "b"}],
                                [{"name": "b"}, {"name": "a"}]]}"#;
        assert!(parse_dag(raw).is_none());
    }

    #[test]
    fn edge_naming_unknown_node_is_rejected() {
        let raw = r#"{"nodes": [{"name": "a"}],
                      "edges": [[{"name": "a"}, {"name": "ghost"}]]}"#;
        assert!(parse_dag(raw).is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_dag("no json here at all").is_none());
        assert!(parse_dag("{ truncated").is_none());
    }

    #[test]
    fn fallback_creates_one_node_per_nonempty_line_in_order() {
        let plan = "1. Open the browser\n\n2. Search for rust\n   \n3. Open the first result";
        let TaskGraph::Linear(nodes) = linear_fallback(plan) else {
            panic!("expected linear variant")
        };
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].name, "step_1");
        assert_eq!(nodes[0].info, "1. Open the browser");
        assert_eq!(nodes[2].info, "3. Open the first result");
    }

    #[test]
    fn topological_sort_respects_every_edge() {
        let dag = parse_dag(DAG_JSON).unwrap();
        let edges = dag.edges.clone();
        let nodes = dag.nodes.clone();
        let sorted = TaskGraph::Dag(dag).topological_sort();
        let pos = |name: &str| sorted.iter().position(|s| s.name == name).unwrap();
        for (u, v) in edges {
            assert!(pos(&nodes[u].name) < pos(&nodes[v].name));
        }
    }

    #[test]
    fn independent_nodes_keep_list_order() {
        let raw = r#"{"nodes": [{"name": "a"}, {"name": "b"}, {"name": "c"}], "edges": []}"#;
        let dag = parse_dag(raw).unwrap();
        let sorted = TaskGraph::Dag(dag).topological_sort();
        let names: Vec<&str> = sorted.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn linear_sort_is_identity() {
        let graph = linear_fallback("a\nb");
        let sorted = graph.topological_sort();
        assert_eq!(sorted[0].info, "a");
        assert_eq!(sorted[1].info, "b");
    }
}
