//! Flow graph construction and HTML rendering.
//!
//! Nodes are addresses and edges are followed ledger rows, so the graph shows
//! the paths the trace actually walked. Rejected candidates stay in the CSV
//! only. Parallel edges are kept: one address can pay another in several
//! transactions.
//!
//! The HTML output is a standalone page driven by vis-network, with node
//! colour by cluster category, edge colour by hop and a side panel showing
//! the clicked node's details.

use std::collections::HashMap;
use std::path::Path;

use eyre::{Context, Result};
use fundflow_data::types::{ClusterType, FundFlowRecord};
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{json, Value};

const ROOT_COLOR: &str = "#FF4136";
const DEFAULT_NODE_COLOR: &str = "#DDDDDD";
const HOP_COLORS: [&str; 6] = ["#FF4136", "#FF851B", "#FFDC00", "#2ECC40", "#0074D9", "#B10DC9"];

/// Address node of the flow graph.
#[derive(Debug, Clone)]
pub struct FlowNode {
    pub address: String,
    pub hop: u32,
    pub path_id: u64,
    pub classification: ClusterType,
    pub wallet_id: Option<String>,
    pub is_root: bool,
    /// BTC of the edge that first reached this node.
    pub btc: f64,
    pub event_time: String,
}

/// One followed movement.
#[derive(Debug, Clone)]
pub struct FlowEdge {
    pub txid: String,
    pub hop: u32,
    pub path_id: u64,
    pub btc: f64,
}

/// Directed graph of the followed flow.
pub struct FlowGraph {
    pub graph: DiGraph<FlowNode, FlowEdge>,
    pub addr_to_ix: HashMap<String, NodeIndex>,
    pub root: NodeIndex,
}

impl FlowGraph {
    /// Builds the graph from followed records, rooted at `root_address`.
    pub fn from_records(records: &[FundFlowRecord], root_address: &str) -> Self {
        let mut graph = DiGraph::new();
        let mut addr_to_ix = HashMap::new();

        let root = graph.add_node(FlowNode {
            address: root_address.to_string(),
            hop: 0,
            path_id: 0,
            classification: ClusterType::Unknown,
            wallet_id: None,
            is_root: true,
            btc: 0.0,
            event_time: String::new(),
        });
        addr_to_ix.insert(root_address.to_string(), root);

        for record in records.iter().filter(|r| r.follow && !r.input.is_empty()) {
            let from_ix = *addr_to_ix
                .entry(record.input.clone())
                .or_insert_with(|| graph.add_node(node_from_record(record, &record.input)));
            let to_ix = *addr_to_ix
                .entry(record.output.clone())
                .or_insert_with(|| graph.add_node(node_from_record(record, &record.output)));

            graph.add_edge(
                from_ix,
                to_ix,
                FlowEdge {
                    txid: record.txid.clone(),
                    hop: record.hop,
                    path_id: record.path_id,
                    btc: record.btc,
                },
            );
        }

        Self {
            graph,
            addr_to_ix,
            root,
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Addresses directly paid by `address`.
    pub fn successors(&self, address: &str) -> Vec<&str> {
        let Some(&ix) = self.addr_to_ix.get(address) else {
            return Vec::new();
        };
        let mut out: Vec<&str> = self
            .graph
            .neighbors(ix)
            .map(|n| self.graph[n].address.as_str())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// vis-network node and edge data sets.
    pub fn to_vis_data(&self) -> (Value, Value) {
        let nodes: Vec<Value> = self
            .graph
            .node_indices()
            .map(|ix| {
                let node = &self.graph[ix];
                if node.is_root {
                    json!({
                        "id": node.address,
                        "label": truncate_address(&node.address),
                        "title": format!("ROOT: {}", node.address),
                        "color": ROOT_COLOR,
                        "size": 30,
                        "shape": "star",
                    })
                } else {
                    json!({
                        "id": node.address,
                        "label": truncate_address(&node.address),
                        "title": node_tooltip(node),
                        "color": classification_color(node.classification),
                        "size": 15 + node.hop * 2,
                        "shape": "dot",
                    })
                }
            })
            .collect();

        let edges: Vec<Value> = self
            .graph
            .edge_indices()
            .filter_map(|ix| {
                let (from, to) = self.graph.edge_endpoints(ix)?;
                let edge = &self.graph[ix];
                Some(json!({
                    "from": self.graph[from].address,
                    "to": self.graph[to].address,
                    "value": edge.btc * 10.0,
                    "title": format!("Hop {} | {:.6} BTC | Path {} | {}", edge.hop, edge.btc, edge.path_id, edge.txid),
                    "label": format!("{:.4} BTC", edge.btc),
                    "color": hop_color(edge.hop),
                    "arrows": "to",
                }))
            })
            .collect();

        (Value::Array(nodes), Value::Array(edges))
    }

    /// Renders a standalone HTML page.
    pub fn to_html(&self) -> String {
        let (nodes, edges) = self.to_vis_data();
        let root_address = &self.graph[self.root].address;
        HTML_TEMPLATE
            .replace("{{TITLE}}", &format!("Fund flow from {}", html_escape(root_address)))
            .replace("{{NODES}}", &script_safe(&nodes.to_string()))
            .replace("{{EDGES}}", &script_safe(&edges.to_string()))
    }

    /// Writes the HTML page to `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn write_html(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_html())
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            nodes = self.node_count(),
            edges = self.edge_count(),
            "flow graph written"
        );
        Ok(())
    }
}

fn node_from_record(record: &FundFlowRecord, address: &str) -> FlowNode {
    FlowNode {
        address: address.to_string(),
        hop: record.hop,
        path_id: record.path_id,
        classification: record.wallet_classification,
        wallet_id: record.wallet_id.clone(),
        is_root: false,
        btc: record.btc,
        event_time: record
            .event_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S %:z").to_string())
            .unwrap_or_default(),
    }
}

fn node_tooltip(node: &FlowNode) -> String {
    format!(
        "Address: {}\nHop: {}\nPath: {}\nClassification: {}\nWallet ID: {}\nBTC: {:.8}\nDate: {}",
        node.address,
        node.hop,
        node.path_id,
        node.classification,
        node.wallet_id.as_deref().unwrap_or("N/A"),
        node.btc,
        node.event_time
    )
}

/// Shortens long addresses to `prefix...suffix` for node labels.
pub fn truncate_address(address: &str) -> String {
    if address.len() <= 10 || !address.is_ascii() {
        return address.to_string();
    }
    format!("{}...{}", &address[..6], &address[address.len() - 4..])
}

pub fn classification_color(cluster_type: ClusterType) -> &'static str {
    match cluster_type {
        ClusterType::Exchange => "#0074D9",
        ClusterType::Mixer => "#B10DC9",
        ClusterType::Mining | ClusterType::MiningOrConsolidation => "#FF851B",
        ClusterType::Gambling => "#FFDC00",
        ClusterType::Darknet => "#85144b",
        ClusterType::PersonalWallet => "#2ECC40",
        ClusterType::Entity => "#AAAAAA",
        ClusterType::Unclustered => "#FFFFFF",
        ClusterType::LabeledEntity => "#39CCCC",
        ClusterType::PayoutService => "#01FF70",
        _ => DEFAULT_NODE_COLOR,
    }
}

pub fn hop_color(hop: u32) -> &'static str {
    let index = (hop.max(1) as usize - 1).min(HOP_COLORS.len() - 1);
    HOP_COLORS[index]
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Keeps embedded JSON from closing the surrounding script element.
fn script_safe(json: &str) -> String {
    json.replace("</", "<\\/")
}

const HTML_TEMPLATE: &str = r##"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{{TITLE}}</title>
<script type="text/javascript" src="https://unpkg.com/vis-network/standalone/umd/vis-network.min.js"></script>
<style>
body { margin: 0; display: flex; background: #222222; color: white; }
#mynetwork { flex: 1; height: 900px; }
#info-panel {
    width: 300px;
    background: #1a1a1a;
    padding: 20px;
    font-family: monospace;
    font-size: 12px;
    overflow-y: auto;
    border-left: 2px solid #FF4136;
}
#info-panel h3 { color: #FF4136; margin-top: 0; }
#info-panel .info-row { margin: 10px 0; word-wrap: break-word; }
#info-panel .label { color: #888; font-size: 10px; }
#info-panel .value { color: #fff; font-size: 12px; }
</style>
</head>
<body>
<div id="mynetwork"></div>
<div id="info-panel"><h3>Node Info</h3><p>Click a node to see its details</p></div>
<script type="text/javascript">
var nodes = new vis.DataSet({{NODES}});
var edges = new vis.DataSet({{EDGES}});
var container = document.getElementById("mynetwork");
var options = {
  physics: { barnesHut: { gravitationalConstant: -30000, centralGravity: 0.3, springLength: 200 } },
  edges: { arrows: { to: { enabled: true, scaleFactor: 0.5 } }, smooth: { type: "cubicBezier" }, font: { color: "#ffffff", strokeWidth: 0 } },
  nodes: { font: { color: "#ffffff" } }
};
var network = new vis.Network(container, { nodes: nodes, edges: edges }, options);

network.on("click", function (params) {
  if (params.nodes.length > 0) {
    showNodeInfo(params.nodes[0]);
  }
});

function showNodeInfo(nodeId) {
  var node = nodes.get(nodeId);
  var panel = document.getElementById("info-panel");
  var html = "<h3>Node Info</h3>";
  html += '<div class="info-row"><div class="label">ADDRESS</div><div class="value">' + nodeId + "</div></div>";
  if (node.title) {
    node.title.split("\n").forEach(function (line) {
      var at = line.indexOf(":");
      if (at > 0) {
        html += '<div class="info-row"><div class="label">' + line.slice(0, at).trim() +
          '</div><div class="value">' + line.slice(at + 1).trim() + "</div></div>";
      }
    });
  }
  panel.innerHTML = html;
}
</script>
</body>
</html>
"##;
