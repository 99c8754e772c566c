/// Import planning for ComfyUI UI-export workflows (LiteGraph JSON).
///
/// Turns a workflow into a list of placeholder compositing nodes and the
/// connections between them. Creating the nodes is left to the host
/// application; this module only decides what would be created.
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Node class created in the host for a ComfyUI node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostClass {
    Read,
    Write,
    NoOp,
}

impl HostClass {
    pub fn for_comfy_type(comfy_type: &str) -> Self {
        match comfy_type {
            "LoadImage" => HostClass::Read,
            "SaveImage" | "SaveImageSimple" => HostClass::Write,
            _ => HostClass::NoOp,
        }
    }

    /// Number of inputs the host class accepts.
    pub fn max_inputs(self) -> usize {
        match self {
            HostClass::Read => 0,
            HostClass::Write | HostClass::NoOp => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedNode {
    pub id: i64,
    pub comfy_type: String,
    pub class: HostClass,
    /// Unique within the plan: `CU_<type>`, then `CU_<type>_2`, ...
    pub name: String,
    pub position: Option<(i64, i64)>,
    /// Image path for Read nodes, taken from the first widget value.
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedLink {
    pub from: i64,
    pub from_slot: i64,
    pub to: i64,
    pub input: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportPlan {
    pub nodes: Vec<PlannedNode>,
    pub links: Vec<PlannedLink>,
}

#[derive(Debug)]
pub enum WorkflowError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    NoNodes { path: PathBuf },
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowError::Io { path, source } => {
                write!(f, "could not read {}: {source}", path.display())
            }
            WorkflowError::Parse { path, source } => {
                write!(f, "could not parse {} as JSON: {source}", path.display())
            }
            WorkflowError::NoNodes { path } => {
                write!(f, "no nodes found in {}", path.display())
            }
        }
    }
}

impl std::error::Error for WorkflowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkflowError::Io { source, .. } => Some(source),
            WorkflowError::Parse { source, .. } => Some(source),
            WorkflowError::NoNodes { .. } => None,
        }
    }
}

/// Read a workflow file and plan its import.
pub fn load_plan(path: &Path) -> Result<ImportPlan, WorkflowError> {
    let contents = std::fs::read_to_string(path).map_err(|e| WorkflowError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let data: Value = serde_json::from_str(&contents).map_err(|e| WorkflowError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    let plan = plan(&data);
    if plan.nodes.is_empty() {
        return Err(WorkflowError::NoNodes {
            path: path.to_path_buf(),
        });
    }
    tracing::debug!(
        nodes = plan.nodes.len(),
        links = plan.links.len(),
        path = %path.display(),
        "planned workflow import"
    );
    Ok(plan)
}

fn list<'a>(v: &'a Value, key: &str) -> Option<&'a [Value]> {
    v.get(key).and_then(Value::as_array).map(Vec::as_slice)
}

/// `nodes`/`links` at the top level, or nested under `graph`.
fn graph_parts(data: &Value) -> (&[Value], &[Value]) {
    let empty: &[Value] = &[];

    let nodes = list(data, "nodes").unwrap_or(empty);
    if nodes.is_empty() {
        if let Some(graph) = data.get("graph").filter(|g| g.is_object()) {
            return (
                list(graph, "nodes").unwrap_or(empty),
                list(graph, "links").unwrap_or(empty),
            );
        }
    }
    (nodes, list(data, "links").unwrap_or(empty))
}

/// Accepts JSON numbers and numeric strings.
fn as_coord(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_f64().map(|f| f as i64),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

fn position(node: &Value) -> Option<(i64, i64)> {
    let p = node.get("pos").or_else(|| node.get("position"))?;
    match p {
        Value::Array(xy) if xy.len() >= 2 => Some((as_coord(&xy[0])?, as_coord(&xy[1])?)),
        // Some exports store positions as {"0": x, "1": y}.
        Value::Object(map) => Some((as_coord(map.get("0")?)?, as_coord(map.get("1")?)?)),
        _ => None,
    }
}

fn first_string_widget(node: &Value) -> Option<String> {
    let first = node.get("widgets_values")?.as_array()?.first()?;
    first
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn first_present<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

/// (src, src_slot, dst, dst_slot) from either link encoding.
fn link_parts(link: &Value) -> Option<(i64, i64, i64, Option<f64>)> {
    match link {
        Value::Array(items) if items.len() >= 5 => Some((
            items[1].as_i64()?,
            items[2].as_i64().unwrap_or(0),
            items[3].as_i64()?,
            items[4].as_f64(),
        )),
        Value::Object(obj) => Some((
            first_present(obj, &["from", "src", "output"])?.as_i64()?,
            first_present(obj, &["from_slot", "src_slot"])
                .and_then(Value::as_i64)
                .unwrap_or(0),
            first_present(obj, &["to", "dst", "input"])?.as_i64()?,
            first_present(obj, &["to_slot", "dst_slot"]).and_then(Value::as_f64),
        )),
        _ => None,
    }
}

/// Plan the import of an already-parsed workflow.
///
/// Nodes without an integer id are dropped. Links that reference unknown
/// nodes, or target a class with no inputs, are dropped; an input slot
/// outside the target's range falls back to 0.
pub fn plan(data: &Value) -> ImportPlan {
    let (raw_nodes, raw_links) = graph_parts(data);

    let mut used_names = HashSet::new();
    let mut nodes = Vec::new();
    for node in raw_nodes {
        let Some(id) = node.get("id").and_then(Value::as_i64) else {
            continue;
        };
        let comfy_type = node
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| node.get("class_type").and_then(Value::as_str))
            .filter(|t| !t.is_empty())
            .unwrap_or("Unknown")
            .to_string();
        let class = HostClass::for_comfy_type(&comfy_type);

        let base = format!("CU_{comfy_type}");
        let mut name = base.clone();
        let mut suffix = 1;
        while used_names.contains(&name) {
            suffix += 1;
            name = format!("{base}_{suffix}");
        }
        used_names.insert(name.clone());

        let file = match class {
            HostClass::Read => first_string_widget(node),
            _ => None,
        };

        nodes.push(PlannedNode {
            id,
            comfy_type,
            class,
            name,
            position: position(node),
            file,
        });
    }

    let classes: HashMap<i64, HostClass> = nodes.iter().map(|n| (n.id, n.class)).collect();
    let mut links = Vec::new();
    for link in raw_links {
        let Some((from, from_slot, to, dst_slot)) = link_parts(link) else {
            tracing::debug!(link = %link, "skipping malformed link");
            continue;
        };
        let (Some(_), Some(target)) = (classes.get(&from), classes.get(&to)) else {
            continue;
        };
        let max_inputs = target.max_inputs();
        if max_inputs == 0 {
            continue;
        }
        let input = match dst_slot {
            Some(slot) if slot >= 0.0 && (slot as usize) < max_inputs => slot as usize,
            _ => 0,
        };
        links.push(PlannedLink {
            from,
            from_slot,
            to,
            input,
        });
    }

    ImportPlan { nodes, links }
}

impl ImportPlan {
    /// Human-readable plan, one line per node and connection.
    pub fn render(&self) -> Vec<String> {
        let names: HashMap<i64, &str> = self.nodes.iter().map(|n| (n.id, n.name.as_str())).collect();
        let mut out = vec![format!(
            "Planned {} nodes, {} links.",
            self.nodes.len(),
            self.links.len()
        )];
        for node in &self.nodes {
            let mut line = format!("  {} ({:?}) <- {}", node.name, node.class, node.comfy_type);
            if let Some((x, y)) = node.position {
                line.push_str(&format!(" at {x},{y}"));
            }
            if let Some(file) = &node.file {
                line.push_str(&format!(" file={file}"));
            }
            out.push(line);
        }
        for link in &self.links {
            out.push(format!(
                "  {} -> {} [input {}]",
                names.get(&link.from).copied().unwrap_or("?"),
                names.get(&link.to).copied().unwrap_or("?"),
                link.input
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "nodes": [
                {"id": 1, "type": "LoadImage", "pos": [10.7, 20.2], "widgets_values": ["plate.png", "image"]},
                {"id": 2, "type": "KSampler", "pos": [300, 40]},
                {"id": 3, "type": "SaveImage", "pos": {"0": 600, "1": 40}},
                {"id": 4, "type": "KSampler"}
            ],
            "links": [
                [1, 1, 0, 2, 0, "IMAGE"],
                [2, 2, 0, 3, 0, "IMAGE"],
                [3, 4, 0, 2, 3, "LATENT"]
            ]
        })
    }

    #[test]
    fn test_maps_known_types() {
        assert_eq!(HostClass::for_comfy_type("LoadImage"), HostClass::Read);
        assert_eq!(HostClass::for_comfy_type("SaveImage"), HostClass::Write);
        assert_eq!(HostClass::for_comfy_type("SaveImageSimple"), HostClass::Write);
        assert_eq!(HostClass::for_comfy_type("CLIPTextEncode"), HostClass::NoOp);
    }

    #[test]
    fn test_plan_nodes() {
        let plan = plan(&sample());
        assert_eq!(plan.nodes.len(), 4);

        let read = &plan.nodes[0];
        assert_eq!(read.class, HostClass::Read);
        assert_eq!(read.name, "CU_LoadImage");
        assert_eq!(read.position, Some((10, 20)));
        assert_eq!(read.file.as_deref(), Some("plate.png"));

        assert_eq!(plan.nodes[2].position, Some((600, 40)));
        assert_eq!(plan.nodes[2].file, None);
        assert_eq!(plan.nodes[3].position, None);
    }

    #[test]
    fn test_duplicate_types_get_unique_names() {
        let plan = plan(&sample());
        assert_eq!(plan.nodes[1].name, "CU_KSampler");
        assert_eq!(plan.nodes[3].name, "CU_KSampler_2");
    }

    #[test]
    fn test_out_of_range_slot_is_clamped() {
        let plan = plan(&sample());
        assert_eq!(plan.links.len(), 3);
        let clamped = plan.links.iter().find(|l| l.from == 4).unwrap();
        assert_eq!(clamped.to, 2);
        assert_eq!(clamped.input, 0);
    }

    #[test]
    fn test_links_into_read_and_unknown_nodes_are_skipped() {
        let data = json!({
            "nodes": [
                {"id": 1, "type": "LoadImage"},
                {"id": 2, "type": "VAEDecode"}
            ],
            "links": [
                [1, 2, 0, 1, 0, "IMAGE"],
                [2, 2, 0, 99, 0, "IMAGE"],
                [3, "x", 0, 2, 0, "IMAGE"],
                "garbage"
            ]
        });
        let plan = plan(&data);
        assert!(plan.links.is_empty());
    }

    #[test]
    fn test_object_links() {
        let data = json!({
            "nodes": [
                {"id": 5, "class_type": "VAEDecode"},
                {"id": 6, "class_type": "SaveImage"}
            ],
            "links": [
                {"src": 5, "dst": 6, "src_slot": 1, "dst_slot": 0}
            ]
        });
        let plan = plan(&data);
        assert_eq!(plan.nodes[0].comfy_type, "VAEDecode");
        assert_eq!(
            plan.links,
            vec![PlannedLink {
                from: 5,
                from_slot: 1,
                to: 6,
                input: 0,
            }]
        );
    }

    #[test]
    fn test_nested_graph() {
        let data = json!({
            "graph": {
                "nodes": [{"id": 1, "type": "SaveImageSimple"}],
                "links": []
            }
        });
        let plan = plan(&data);
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].class, HostClass::Write);
    }

    #[test]
    fn test_nodes_without_integer_id_are_dropped() {
        let data = json!({
            "nodes": [{"id": "a", "type": "LoadImage"}, {"type": "LoadImage"}, {"id": 7}]
        });
        let plan = plan(&data);
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].comfy_type, "Unknown");
        assert_eq!(plan.nodes[0].name, "CU_Unknown");
    }

    #[test]
    fn test_render_summary() {
        let lines = plan(&sample()).render();
        assert_eq!(lines[0], "Planned 4 nodes, 3 links.");
        assert!(lines.contains(&"  CU_LoadImage (Read) <- LoadImage at 10,20 file=plate.png".to_string()));
        assert!(lines.contains(&"  CU_LoadImage -> CU_KSampler [input 0]".to_string()));
    }

    #[test]
    fn test_load_plan_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = load_plan(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, WorkflowError::Io { .. }));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            load_plan(&bad).unwrap_err(),
            WorkflowError::Parse { .. }
        ));

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, r#"{"nodes": [], "links": []}"#).unwrap();
        assert!(matches!(
            load_plan(&empty).unwrap_err(),
            WorkflowError::NoNodes { .. }
        ));
    }

    #[test]
    fn test_load_plan_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        std::fs::write(&path, sample().to_string()).unwrap();
        let plan = load_plan(&path).unwrap();
        assert_eq!(plan.nodes.len(), 4);
    }
}
