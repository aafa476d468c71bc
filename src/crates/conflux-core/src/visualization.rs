//! Graph visualization: Mermaid flowcharts and a text describer
//!
//! Renders an immutable [`Graph`] for documentation and debugging. Mermaid
//! output drops straight into markdown; the text format is a quick terminal
//! summary. Neither output is compatibility-critical.
//!
//! # Examples
//!
//! ```rust,ignore
//! let mermaid = visualize(pipeline.graph(), &VisualizationOptions::mermaid());
//! println!("```mermaid\n{mermaid}```");
//! ```

use crate::graph::{Graph, InputPort, JoinSide};

/// Output format for [`visualize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualizationFormat {
    /// Mermaid `graph TD` flowchart.
    Mermaid,
    /// Human-readable text description.
    Text,
}

/// Rendering options.
#[derive(Debug, Clone)]
pub struct VisualizationOptions {
    /// Output format.
    pub format: VisualizationFormat,
    /// Optional title rendered above the graph.
    pub title: Option<String>,
    /// Include item type names on edges (text format only).
    pub include_types: bool,
}

impl Default for VisualizationOptions {
    fn default() -> Self {
        Self {
            format: VisualizationFormat::Mermaid,
            title: None,
            include_types: false,
        }
    }
}

impl VisualizationOptions {
    /// Mermaid flowchart output.
    pub fn mermaid() -> Self {
        Self::default()
    }

    /// Text describer output.
    pub fn text() -> Self {
        Self {
            format: VisualizationFormat::Text,
            ..Self::default()
        }
    }

    /// Set a title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Annotate edges with item type names (text format).
    pub fn with_types(mut self) -> Self {
        self.include_types = true;
        self
    }
}

/// Render a graph to a string in the configured format.
pub fn visualize(graph: &Graph, options: &VisualizationOptions) -> String {
    match options.format {
        VisualizationFormat::Mermaid => visualize_mermaid(graph, options),
        VisualizationFormat::Text => visualize_text(graph, options),
    }
}

fn visualize_mermaid(graph: &Graph, options: &VisualizationOptions) -> String {
    let mut out = String::new();
    if let Some(title) = &options.title {
        out.push_str(&format!("%% {}\n", title));
    }
    out.push_str("graph TD\n");
    for def in graph.nodes() {
        out.push_str(&format!(
            "    {}[\"{} : {}\"]\n",
            def.id,
            escape_mermaid(&def.name),
            def.kind.label()
        ));
    }
    for edge in graph.edges() {
        match edge.port {
            InputPort::Primary => {
                out.push_str(&format!("    {} --> {}\n", edge.source, edge.target));
            }
            InputPort::Join(side) => {
                let label = match side {
                    JoinSide::Left => "first",
                    JoinSide::Right => "second",
                };
                out.push_str(&format!(
                    "    {} -->|{}| {}\n",
                    edge.source, label, edge.target
                ));
            }
        }
    }
    out
}

fn visualize_text(graph: &Graph, options: &VisualizationOptions) -> String {
    let mut out = String::new();
    if let Some(title) = &options.title {
        out.push_str(title);
        out.push('\n');
    }
    out.push_str(&format!(
        "Pipeline with {} node(s) and {} edge(s)\n",
        graph.nodes().len(),
        graph.edges().len()
    ));
    for def in graph.nodes() {
        out.push_str(&format!("  {} '{}' ({})", def.kind.label(), def.name, def.id));
        let targets: Vec<String> = graph
            .outgoing(&def.id)
            .map(|edge| {
                if options.include_types {
                    format!(
                        "{} [{}]",
                        edge.target,
                        def.output_token.map(|t| t.name()).unwrap_or("?")
                    )
                } else {
                    edge.target.to_string()
                }
            })
            .collect();
        if targets.is_empty() {
            out.push('\n');
        } else {
            out.push_str(&format!(" -> {}\n", targets.join(", ")));
        }
    }
    out
}

fn escape_mermaid(text: &str) -> String {
    text.replace('"', "&quot;")
}
