//! Structural graph validation
//!
//! Validation runs over an assembled [`Graph`] and produces a
//! [`ValidationReport`] of issues. The standard rules always run; the
//! extended rules (disconnected subgraphs, orphan transforms, arrival-time
//! sliding windows) are opt-in; custom rules are plain functions from graph
//! to issues.
//!
//! What happens to the report depends on the builder's [`ValidationMode`]:
//! `Error` fails the build with every error rendered into the message,
//! `Warn` logs each issue and proceeds, `Off` skips validation entirely.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::graph::{topological_order, Graph, InputPort, JoinSide, NodeId};
use crate::node::NodeKind;

/// Tracing target for validation.
pub(crate) const TRACING_TARGET: &str = "conflux_core::validation";

/// What to do with validation findings at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Skip validation.
    Off,
    /// Log findings and build anyway.
    Warn,
    /// Fail the build on any error-severity finding. The default.
    #[default]
    Error,
}

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    /// Informational note.
    Info,
    /// Suspicious but runnable.
    Warning,
    /// The graph must not execute.
    Error,
}

/// Closed set of finding categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueCategory {
    /// Graph has no nodes.
    EmptyGraph,
    /// Two nodes share a display name.
    DuplicateName,
    /// An edge references a node that does not exist.
    MissingEndpoint,
    /// The graph contains a directed cycle.
    Cycle,
    /// A source has incoming edges.
    SourceInDegree,
    /// A sink has outgoing edges.
    SinkOutDegree,
    /// A source has no outgoing edge.
    StandaloneSource,
    /// Edge endpoint item types disagree.
    TypeMismatch,
    /// A join is missing one of its two inputs.
    JoinArity,
    /// Window configuration is invalid or risky.
    WindowConfig,
    /// The graph splits into unconnected islands.
    Disconnected,
    /// A non-source node is fed by nothing.
    OrphanNode,
    /// Raised by a user-supplied rule.
    Custom,
}

/// One validation finding.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    /// How bad it is.
    pub severity: Severity,
    /// What class of problem it is.
    pub category: IssueCategory,
    /// Human-readable description.
    pub message: String,
    /// Node the finding is about, when there is a single one.
    pub node: Option<NodeId>,
}

impl ValidationIssue {
    /// An error-severity finding.
    pub fn error(category: IssueCategory, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            message: message.into(),
            node: None,
        }
    }

    /// A warning-severity finding.
    pub fn warning(category: IssueCategory, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            message: message.into(),
            node: None,
        }
    }

    /// Attach the node the finding is about.
    pub fn for_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}/{:?}] {}", self.severity, self.category, self.message)?;
        if let Some(node) = &self.node {
            write!(f, " (node '{node}')")?;
        }
        Ok(())
    }
}

/// Outcome of validating a graph.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// All findings.
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    /// True when no error-severity finding is present.
    pub fn is_valid(&self) -> bool {
        !self
            .issues
            .iter()
            .any(|issue| issue.severity == Severity::Error)
    }

    /// Error-severity findings only.
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == Severity::Error)
    }

    /// Render one finding per line.
    pub fn render(&self) -> String {
        self.issues
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Log every finding through tracing at its severity.
    pub(crate) fn emit_warnings(&self) {
        for issue in &self.issues {
            match issue.severity {
                Severity::Error | Severity::Warning => tracing::warn!(
                    target: TRACING_TARGET,
                    category = ?issue.category,
                    node = issue.node.as_ref().map(|n| n.as_str()),
                    "{}",
                    issue.message
                ),
                Severity::Info => tracing::debug!(
                    target: TRACING_TARGET,
                    category = ?issue.category,
                    "{}",
                    issue.message
                ),
            }
        }
    }
}

/// A user-supplied validation rule.
pub type CustomRule = Arc<dyn Fn(&Graph) -> Vec<ValidationIssue> + Send + Sync>;

/// Validate `graph` with the standard rules, plus the extended rules and
/// custom rules when configured.
pub fn validate(
    graph: &Graph,
    extended: bool,
    allow_standalone_sources: bool,
    custom_rules: &[CustomRule],
) -> ValidationReport {
    let mut issues = Vec::new();

    if graph.nodes().is_empty() {
        issues.push(ValidationIssue::error(
            IssueCategory::EmptyGraph,
            "pipeline graph has no nodes",
        ));
        return ValidationReport { issues };
    }

    check_duplicate_names(graph, &mut issues);
    let endpoints_ok = check_endpoints(graph, &mut issues);
    if endpoints_ok {
        check_cycles(graph, &mut issues);
        check_edge_types(graph, &mut issues);
    }
    check_degrees(graph, allow_standalone_sources, &mut issues);
    check_join_arity(graph, &mut issues);
    check_windows(graph, &mut issues);

    if extended {
        check_connectivity(graph, &mut issues);
        check_orphans(graph, &mut issues);
        check_sliding_event_time(graph, &mut issues);
    }

    for rule in custom_rules {
        issues.extend(rule(graph));
    }

    ValidationReport { issues }
}

fn check_duplicate_names(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for def in graph.nodes() {
        *seen.entry(def.name.as_str()).or_default() += 1;
    }
    for (name, count) in seen {
        if count > 1 {
            issues.push(ValidationIssue::error(
                IssueCategory::DuplicateName,
                format!("node name '{name}' is used by {count} nodes"),
            ));
        }
    }
}

fn check_endpoints(graph: &Graph, issues: &mut Vec<ValidationIssue>) -> bool {
    let mut ok = true;
    for edge in graph.edges() {
        for endpoint in [&edge.source, &edge.target] {
            if graph.node(endpoint).is_none() {
                ok = false;
                issues.push(
                    ValidationIssue::error(
                        IssueCategory::MissingEndpoint,
                        format!(
                            "edge {} -> {} references unknown node '{endpoint}'",
                            edge.source, edge.target
                        ),
                    )
                    .for_node(endpoint.clone()),
                );
            }
        }
        if edge.source == edge.target {
            ok = false;
            issues.push(
                ValidationIssue::error(
                    IssueCategory::Cycle,
                    format!("edge {} -> {} is a self-loop", edge.source, edge.target),
                )
                .for_node(edge.source.clone()),
            );
        }
    }
    ok
}

fn check_cycles(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let order = topological_order(
        graph.nodes().iter().map(|n| n.id.clone()),
        graph
            .edges()
            .iter()
            .map(|e| (e.source.clone(), e.target.clone())),
    );
    if order.is_none() {
        issues.push(ValidationIssue::error(
            IssueCategory::Cycle,
            "pipeline graph contains a directed cycle",
        ));
    }
}

fn check_edge_types(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    for edge in graph.edges() {
        let (Some(source), Some(target)) = (graph.node(&edge.source), graph.node(&edge.target))
        else {
            continue;
        };
        let Some(output) = source.output_token else {
            issues.push(
                ValidationIssue::error(
                    IssueCategory::SinkOutDegree,
                    format!("sink '{}' cannot feed '{}'", source.id, target.id),
                )
                .for_node(source.id.clone()),
            );
            continue;
        };
        let port = edge.port.index();
        let Some(input) = target.input_tokens.get(port) else {
            issues.push(
                ValidationIssue::error(
                    IssueCategory::JoinArity,
                    format!(
                        "edge {} -> {} addresses input port {port} which '{}' does not have",
                        source.id, target.id, target.id
                    ),
                )
                .for_node(target.id.clone()),
            );
            continue;
        };
        if output != *input {
            issues.push(
                ValidationIssue::error(
                    IssueCategory::TypeMismatch,
                    format!(
                        "edge {} -> {} carries {} but the target consumes {}",
                        source.id,
                        target.id,
                        output.name(),
                        input.name()
                    ),
                )
                .for_node(target.id.clone()),
            );
        }
    }
}

fn check_degrees(graph: &Graph, allow_standalone: bool, issues: &mut Vec<ValidationIssue>) {
    for def in graph.nodes() {
        let incoming = graph.incoming(&def.id).count();
        let outgoing = graph.outgoing(&def.id).count();
        match def.kind {
            NodeKind::Source => {
                if incoming > 0 {
                    issues.push(
                        ValidationIssue::error(
                            IssueCategory::SourceInDegree,
                            format!("source '{}' has {incoming} incoming edge(s)", def.id),
                        )
                        .for_node(def.id.clone()),
                    );
                }
                if outgoing == 0 && !allow_standalone {
                    issues.push(
                        ValidationIssue::error(
                            IssueCategory::StandaloneSource,
                            format!(
                                "source '{}' has no outgoing edge; enable standalone sources \
                                 if this is intentional",
                                def.id
                            ),
                        )
                        .for_node(def.id.clone()),
                    );
                }
            }
            NodeKind::Sink => {
                if outgoing > 0 {
                    issues.push(
                        ValidationIssue::error(
                            IssueCategory::SinkOutDegree,
                            format!("sink '{}' has {outgoing} outgoing edge(s)", def.id),
                        )
                        .for_node(def.id.clone()),
                    );
                }
            }
            _ => {}
        }
    }
}

fn check_join_arity(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    for def in graph.nodes() {
        if def.kind != NodeKind::Join {
            continue;
        }
        for side in [JoinSide::Left, JoinSide::Right] {
            let fed = graph
                .incoming(&def.id)
                .any(|edge| edge.port == InputPort::Join(side));
            if !fed {
                issues.push(
                    ValidationIssue::error(
                        IssueCategory::JoinArity,
                        format!("join '{}' has no edge into its {side:?} input", def.id),
                    )
                    .for_node(def.id.clone()),
                );
            }
        }
    }
}

fn check_windows(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    for def in graph.nodes() {
        if let Some(window) = &def.window {
            if let Err(message) = window.check() {
                issues.push(
                    ValidationIssue::error(
                        IssueCategory::WindowConfig,
                        format!("aggregate '{}': {message}", def.id),
                    )
                    .for_node(def.id.clone()),
                );
            }
        }
    }
}

fn check_connectivity(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let Some(first) = graph.nodes().first() else {
        return;
    };
    let mut undirected: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for edge in graph.edges() {
        undirected.entry(&edge.source).or_default().push(&edge.target);
        undirected.entry(&edge.target).or_default().push(&edge.source);
    }
    let mut seen: HashSet<&NodeId> = HashSet::new();
    let mut stack = vec![&first.id];
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = undirected.get(node) {
            stack.extend(next);
        }
    }
    if seen.len() != graph.nodes().len() {
        issues.push(ValidationIssue::warning(
            IssueCategory::Disconnected,
            format!(
                "graph splits into disconnected subgraphs ({} of {} nodes reachable from '{}')",
                seen.len(),
                graph.nodes().len(),
                first.id
            ),
        ));
    }
}

fn check_orphans(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    for def in graph.nodes() {
        if def.kind != NodeKind::Source && graph.incoming(&def.id).count() == 0 {
            issues.push(
                ValidationIssue::warning(
                    IssueCategory::OrphanNode,
                    format!(
                        "{} '{}' is fed by no edge and will see an empty stream",
                        def.kind.label(),
                        def.id
                    ),
                )
                .for_node(def.id.clone()),
            );
        }
    }
}

fn check_sliding_event_time(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    for def in graph.nodes() {
        if let Some(window) = &def.window {
            if window.is_sliding() && !def.event_time {
                issues.push(
                    ValidationIssue::warning(
                        IssueCategory::WindowConfig,
                        format!(
                            "aggregate '{}' uses sliding windows over arrival time; window \
                             membership will depend on scheduling order",
                            def.id
                        ),
                    )
                    .for_node(def.id.clone()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PipelineBuilder;
    use crate::context::Context;
    use crate::erased::SourceOutput;
    use crate::error::{BoxError, PipelineError};
    use crate::node::{Aggregate, Join, Sink, Source, Transform};
    use crate::window::{WindowAssigner, WindowBounds};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Numbers;

    #[async_trait]
    impl Source for Numbers {
        type Out = i64;
        async fn run(
            &mut self,
            _out: &mut SourceOutput<i64>,
            _ctx: &Context,
        ) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    struct Passthrough;

    #[async_trait]
    impl Transform for Passthrough {
        type In = i64;
        type Out = i64;
        async fn apply(
            &self,
            item: i64,
            _ctx: &Context,
        ) -> std::result::Result<Vec<i64>, BoxError> {
            Ok(vec![item])
        }
    }

    #[derive(Default)]
    struct Discard;

    #[async_trait]
    impl Sink for Discard {
        type In = i64;
        async fn write(&mut self, _item: i64, _ctx: &Context) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    struct KeyedJoin;

    #[async_trait]
    impl Join for KeyedJoin {
        type Left = i64;
        type Right = i64;
        type Key = i64;
        type Out = i64;

        fn left_key(&self, item: &i64) -> i64 {
            *item
        }

        fn right_key(&self, item: &i64) -> i64 {
            *item
        }

        async fn merge(
            &mut self,
            left: i64,
            _right: i64,
            _ctx: &Context,
        ) -> std::result::Result<i64, BoxError> {
            Ok(left)
        }
    }

    /// Sliding windows with the default arrival-time stamping.
    struct ArrivalSliding;

    #[async_trait]
    impl Aggregate for ArrivalSliding {
        type In = i64;
        type Key = i64;
        type Acc = i64;
        type Out = i64;

        fn assigner() -> WindowAssigner {
            WindowAssigner::sliding(Duration::from_secs(10), Duration::from_secs(5))
        }

        fn key(&self, item: &i64) -> i64 {
            *item
        }

        fn init(&self) -> i64 {
            0
        }

        fn fold(&self, acc: i64, item: &i64) -> i64 {
            acc + item
        }

        fn finish(&mut self, _key: i64, _window: WindowBounds, acc: i64) -> i64 {
            acc
        }
    }

    /// Sliding window whose slide equals its size.
    struct BadWindow;

    #[async_trait]
    impl Aggregate for BadWindow {
        type In = i64;
        type Key = i64;
        type Acc = i64;
        type Out = i64;

        fn assigner() -> WindowAssigner {
            WindowAssigner::sliding(Duration::from_secs(10), Duration::from_secs(10))
        }

        fn key(&self, item: &i64) -> i64 {
            *item
        }

        fn init(&self) -> i64 {
            0
        }

        fn fold(&self, acc: i64, item: &i64) -> i64 {
            acc + item
        }

        fn finish(&mut self, _key: i64, _window: WindowBounds, acc: i64) -> i64 {
            acc
        }
    }

    fn categories(report: &ValidationReport) -> Vec<IssueCategory> {
        report.issues().iter().map(|issue| issue.category).collect()
    }

    #[test]
    fn test_extended_rules_flag_disconnected_and_orphans() {
        let mut builder = PipelineBuilder::new();
        builder.with_extended_rules();
        let numbers = builder.add_source("numbers", Numbers).unwrap();
        let left_out = builder.add_sink_default::<Discard>("left_out").unwrap();
        builder.connect(&numbers, &left_out).unwrap();
        // Second island: a transform fed by no edge at all.
        let orphan = builder.add_transform("orphan", Passthrough).unwrap();
        let right_out = builder.add_sink_default::<Discard>("right_out").unwrap();
        builder.connect(&orphan, &right_out).unwrap();

        let (graph, report) = builder.try_build();
        // Both findings are warnings, so the graph still builds.
        assert!(graph.is_some(), "{}", report.render());
        assert!(report.is_valid());
        let cats = categories(&report);
        assert!(cats.contains(&IssueCategory::Disconnected), "{}", report.render());
        assert!(cats.contains(&IssueCategory::OrphanNode), "{}", report.render());
    }

    #[test]
    fn test_extended_rules_flag_arrival_time_sliding_window() {
        let wire = |builder: &mut PipelineBuilder| {
            let numbers = builder.add_source("numbers", Numbers).unwrap();
            let agg = builder.add_aggregate("sums", ArrivalSliding).unwrap();
            let sink = builder.add_sink_default::<Discard>("collect").unwrap();
            builder.connect(&numbers, &agg).unwrap();
            builder.connect(&agg, &sink).unwrap();
        };

        let mut builder = PipelineBuilder::new();
        builder.with_extended_rules();
        wire(&mut builder);
        let (graph, report) = builder.try_build();
        assert!(graph.is_some(), "{}", report.render());
        assert!(report.is_valid());
        assert!(
            categories(&report).contains(&IssueCategory::WindowConfig),
            "{}",
            report.render()
        );

        // The rule is opt-in: without extended rules the same graph is clean.
        let mut builder = PipelineBuilder::new();
        wire(&mut builder);
        let (graph, report) = builder.try_build();
        assert!(graph.is_some());
        assert!(!categories(&report).contains(&IssueCategory::WindowConfig));
    }

    #[test]
    fn test_join_missing_side_rejected() {
        let mut builder = PipelineBuilder::new();
        let numbers = builder.add_source("numbers", Numbers).unwrap();
        let join = builder.add_join("pair", KeyedJoin).unwrap();
        let sink = builder.add_sink_default::<Discard>("collect").unwrap();
        // Only the first input is wired; the second stays open.
        builder.connect(&numbers, &join.first()).unwrap();
        builder.connect(&join, &sink).unwrap();

        let err = builder.build().unwrap_err();
        match err {
            PipelineError::Validation { report } => {
                assert!(report.contains("JoinArity"), "{report}");
                assert!(report.contains("Right"), "{report}");
            }
            other => panic!("expected Validation, got {other}"),
        }
    }

    #[test]
    fn test_invalid_window_rejected_at_build() {
        let mut builder = PipelineBuilder::new();
        let numbers = builder.add_source("numbers", Numbers).unwrap();
        let agg = builder.add_aggregate("sums", BadWindow).unwrap();
        let sink = builder.add_sink_default::<Discard>("collect").unwrap();
        builder.connect(&numbers, &agg).unwrap();
        builder.connect(&agg, &sink).unwrap();

        let err = builder.build().unwrap_err();
        match err {
            PipelineError::Validation { report } => {
                assert!(report.contains("WindowConfig"), "{report}");
                assert!(report.contains("slide"), "{report}");
            }
            other => panic!("expected Validation, got {other}"),
        }
    }
}
