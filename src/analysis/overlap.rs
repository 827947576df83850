//! 日志与标识图的重叠.
//!
//! 每条轨迹在图上维护一个当前状态集合, 从初始状态的静默闭包出发. 每个活动沿标签
//! 相同的非静默边前进, 再取目标集合的静默闭包. 没有可走的边时该事件记为不拟合并被
//! 跳过, 当前集合保持不变. 所有轨迹走过的状态与边构成日志与模型的重叠部分.
use std::collections::BTreeSet;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::marking_graph::MarkingGraph;
use crate::analysis::replay_result::{LogTrace, TraceId};
use crate::threaded::{
    AnalysisCallable, CancellationToken, Interrupter, ThreadedComputation, ThreadedError,
};

#[derive(Debug, Error)]
pub enum OverlapError {
    #[error("overlap calculation was cancelled")]
    Cancelled,
    #[error("interrupted while waiting for the overlap result")]
    Interrupted,
    #[error("trace id {0} occurs more than once")]
    DuplicateTrace(TraceId),
    #[error("overlap calculation failed: {message}")]
    Computation { message: String },
}

impl From<ThreadedError<OverlapError>> for OverlapError {
    fn from(err: ThreadedError<OverlapError>) -> Self {
        match err {
            ThreadedError::Cancelled => OverlapError::Cancelled,
            ThreadedError::Interrupted => OverlapError::Interrupted,
            ThreadedError::Failed(err) => err,
            ThreadedError::Computation { message } => OverlapError::Computation { message },
        }
    }
}

/// 单条轨迹与图的重叠.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOverlap {
    pub trace_id: TraceId,
    pub length: usize,
    pub matched: usize,
    /// 没有匹配边的事件在轨迹中的位置.
    pub non_fitting_events: Vec<usize>,
}

impl TraceOverlap {
    pub fn fits(&self) -> bool {
        self.non_fitting_events.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapResult {
    /// 按轨迹编号升序.
    pub traces: Vec<TraceOverlap>,
    pub state_count: usize,
    pub edge_count: usize,
    pub visited_states: BTreeSet<usize>,
    pub visited_edges: BTreeSet<usize>,
}

impl OverlapResult {
    pub fn num_traces(&self) -> usize {
        self.traces.len()
    }

    pub fn trace(&self, trace: TraceId) -> Option<&TraceOverlap> {
        self.traces
            .binary_search_by_key(&trace, |overlap| overlap.trace_id)
            .ok()
            .map(|index| &self.traces[index])
    }

    pub fn fitting_traces(&self) -> Vec<TraceId> {
        self.traces
            .iter()
            .filter(|overlap| overlap.fits())
            .map(|overlap| overlap.trace_id)
            .collect()
    }

    pub fn num_events(&self) -> usize {
        self.traces.iter().map(|overlap| overlap.length).sum()
    }

    pub fn num_matched_events(&self) -> usize {
        self.traces.iter().map(|overlap| overlap.matched).sum()
    }

    /// 能在图中匹配的事件占全部事件的比例.
    pub fn event_overlap(&self) -> f64 {
        ratio(self.num_matched_events(), self.num_events())
    }

    /// 被日志走到的状态占全部状态的比例.
    pub fn state_coverage(&self) -> f64 {
        ratio(self.visited_states.len(), self.state_count)
    }

    pub fn edge_coverage(&self) -> f64 {
        ratio(self.visited_edges.len(), self.edge_count)
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64
}

/// 绑定一个标识图的重叠计算.
pub struct OverlapCalculator<'a> {
    graph: &'a MarkingGraph,
}

impl<'a> OverlapCalculator<'a> {
    pub fn new(graph: &'a MarkingGraph) -> Self {
        Self { graph }
    }

    /// 沿静默边扩展 `states`, 并记录走过的边.
    fn silent_closure(&self, states: &mut BTreeSet<NodeIndex>, edges: &mut FxHashSet<EdgeIndex>) {
        let mut stack: Vec<NodeIndex> = states.iter().copied().collect();
        while let Some(state) = stack.pop() {
            for edge in self.graph.graph.edges_directed(state, Direction::Outgoing) {
                if !edge.weight().silent {
                    continue;
                }
                edges.insert(edge.id());
                if states.insert(edge.target()) {
                    stack.push(edge.target());
                }
            }
        }
    }

    /// 计算一个活动序列的重叠, 走过的状态与边并入 `states` / `edges`.
    fn trace(
        &self,
        trace: &LogTrace,
        states: &mut FxHashSet<NodeIndex>,
        edges: &mut FxHashSet<EdgeIndex>,
        cancel: &CancellationToken,
    ) -> Result<TraceOverlap, OverlapError> {
        let mut current = BTreeSet::from([self.graph.initial]);
        self.silent_closure(&mut current, edges);
        states.extend(current.iter().copied());

        let mut non_fitting_events = Vec::new();
        for (position, activity) in trace.activities.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(OverlapError::Cancelled);
            }
            let mut next = BTreeSet::new();
            let mut matched_edges = Vec::new();
            for &state in &current {
                for edge in self.graph.graph.edges_directed(state, Direction::Outgoing) {
                    let relation = edge.weight();
                    if !relation.silent && relation.label == *activity {
                        matched_edges.push(edge.id());
                        next.insert(edge.target());
                    }
                }
            }
            if next.is_empty() {
                log::trace!("trace {}: `{}` at {} has no matching edge", trace.id, activity, position);
                non_fitting_events.push(position);
                continue;
            }
            edges.extend(matched_edges);
            self.silent_closure(&mut next, edges);
            states.extend(next.iter().copied());
            current = next;
        }

        Ok(TraceOverlap {
            trace_id: trace.id,
            length: trace.len(),
            matched: trace.len() - non_fitting_events.len(),
            non_fitting_events,
        })
    }

    pub fn calculate(&self, traces: &[LogTrace], cancel: &CancellationToken) -> Result<OverlapResult, OverlapError> {
        let mut ids = FxHashSet::default();
        for trace in traces {
            if !ids.insert(trace.id) {
                return Err(OverlapError::DuplicateTrace(trace.id));
            }
        }

        let mut states = FxHashSet::default();
        let mut edges = FxHashSet::default();
        let mut overlaps = Vec::with_capacity(traces.len());
        for trace in traces {
            if cancel.is_cancelled() {
                return Err(OverlapError::Cancelled);
            }
            overlaps.push(self.trace(trace, &mut states, &mut edges, cancel)?);
        }
        overlaps.sort_by_key(|overlap| overlap.trace_id);

        let result = OverlapResult {
            traces: overlaps,
            state_count: self.graph.state_count(),
            edge_count: self.graph.graph.edge_count(),
            visited_states: states.into_iter().map(|state| state.index()).collect(),
            visited_edges: edges.into_iter().map(|edge| edge.index()).collect(),
        };
        log::info!(
            "overlap of {} traces: {}/{} events, {}/{} states, {}/{} edges",
            result.num_traces(),
            result.num_matched_events(),
            result.num_events(),
            result.visited_states.len(),
            result.state_count,
            result.visited_edges.len(),
            result.edge_count
        );
        Ok(result)
    }
}

/// 交给线程化计算的工作单元: 已构造的标识图与日志.
#[derive(Debug, Clone)]
pub struct OverlapGenerator {
    pub graph: Arc<MarkingGraph>,
    pub traces: Vec<LogTrace>,
}

impl OverlapGenerator {
    pub fn new(graph: Arc<MarkingGraph>, traces: Vec<LogTrace>) -> Self {
        Self { graph, traces }
    }
}

impl AnalysisCallable for OverlapGenerator {
    type Output = OverlapResult;
    type Error = OverlapError;

    fn call(self, cancel: &CancellationToken) -> Result<OverlapResult, OverlapError> {
        OverlapCalculator::new(&self.graph).calculate(&self.traces, cancel)
    }
}

/// 后台计算重叠.
#[derive(Debug)]
pub struct ThreadedOverlapCalculator {
    computation: ThreadedComputation<OverlapResult, OverlapError>,
}

impl ThreadedOverlapCalculator {
    pub fn submit(generator: OverlapGenerator) -> Self {
        Self {
            computation: ThreadedComputation::submit(generator),
        }
    }

    pub fn submit_in(pool: &rayon::ThreadPool, generator: OverlapGenerator) -> Self {
        Self {
            computation: ThreadedComputation::submit_in(pool, generator),
        }
    }

    pub fn cancel(&self) -> bool {
        self.computation.cancel()
    }

    pub fn is_done(&self) -> bool {
        self.computation.is_done()
    }

    pub fn interrupter(&self) -> Interrupter<OverlapResult, OverlapError> {
        self.computation.interrupter()
    }

    pub fn get_result(self) -> Result<OverlapResult, OverlapError> {
        Ok(self.computation.get_result()?)
    }
}

/// 提交并等待重叠结果.
pub fn calculate_overlap(generator: OverlapGenerator) -> Result<OverlapResult, OverlapError> {
    ThreadedOverlapCalculator::submit(generator).get_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Net, NetKind, Place, Transition};

    /// start -a-> p1 -tau-> p2 -b-> end
    fn build_sequence() -> MarkingGraph {
        let mut net = Net::new("sequence", NetKind::PlaceTransition);
        for place in ["start", "p1", "p2", "end"] {
            net.add_place(Place::new(place)).unwrap();
        }
        net.add_transition(Transition::new("a")).unwrap();
        net.add_transition(Transition::silent("tau")).unwrap();
        net.add_transition(Transition::new("b")).unwrap();
        net.add_flow_relation("start", "a", 1).unwrap();
        net.add_flow_relation("a", "p1", 1).unwrap();
        net.add_flow_relation("p1", "tau", 1).unwrap();
        net.add_flow_relation("tau", "p2", 1).unwrap();
        net.add_flow_relation("p2", "b", 1).unwrap();
        net.add_flow_relation("b", "end", 1).unwrap();
        net.set_initial_marking(net.marking_from_counts(&[("start", 1)]).unwrap())
            .unwrap();
        MarkingGraph::from_net(&net).unwrap()
    }

    /// 两个标签同为 `a` 的迁移分出两支, 分别以 `b` 和 `c` 汇合.
    fn build_choice() -> MarkingGraph {
        let mut net = Net::new("choice", NetKind::PlaceTransition);
        for place in ["start", "left", "right", "end"] {
            net.add_place(Place::new(place)).unwrap();
        }
        net.add_transition(Transition::with_label("a1", "a")).unwrap();
        net.add_transition(Transition::with_label("a2", "a")).unwrap();
        net.add_transition(Transition::new("b")).unwrap();
        net.add_transition(Transition::new("c")).unwrap();
        net.add_flow_relation("start", "a1", 1).unwrap();
        net.add_flow_relation("a1", "left", 1).unwrap();
        net.add_flow_relation("start", "a2", 1).unwrap();
        net.add_flow_relation("a2", "right", 1).unwrap();
        net.add_flow_relation("left", "b", 1).unwrap();
        net.add_flow_relation("b", "end", 1).unwrap();
        net.add_flow_relation("right", "c", 1).unwrap();
        net.add_flow_relation("c", "end", 1).unwrap();
        net.set_initial_marking(net.marking_from_counts(&[("start", 1)]).unwrap())
            .unwrap();
        MarkingGraph::from_net(&net).unwrap()
    }

    #[test]
    fn silent_edges_are_crossed_without_consuming_events() {
        let graph = build_sequence();
        let traces = vec![LogTrace::from_activities(1, &["a", "b"])];
        let result = OverlapCalculator::new(&graph)
            .calculate(&traces, &CancellationToken::new())
            .unwrap();
        assert!(result.trace(1).unwrap().fits());
        assert_eq!(result.visited_states.len(), 4);
        assert_eq!(result.edge_coverage(), 1.0);
        assert_eq!(result.event_overlap(), 1.0);
    }

    #[test]
    fn unmatched_events_are_skipped() {
        let graph = build_sequence();
        let traces = vec![
            LogTrace::from_activities(2, &["a", "x", "b"]),
            LogTrace::from_activities(1, &["b"]),
        ];
        let result = OverlapCalculator::new(&graph)
            .calculate(&traces, &CancellationToken::new())
            .unwrap();
        assert_eq!(result.traces[0].trace_id, 1);
        assert_eq!(result.trace(1).unwrap().non_fitting_events, vec![0]);

        let skipped = result.trace(2).unwrap();
        assert_eq!(skipped.matched, 2);
        assert_eq!(skipped.non_fitting_events, vec![1]);
        assert!(result.fitting_traces().is_empty());
        assert_eq!(result.num_events(), 4);
        assert!((result.event_overlap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn same_label_branches_are_followed_together() {
        let graph = build_choice();
        let traces = vec![LogTrace::from_activities(7, &["a", "c"])];
        let result = OverlapCalculator::new(&graph)
            .calculate(&traces, &CancellationToken::new())
            .unwrap();
        assert!(result.trace(7).unwrap().fits());
        assert_eq!(result.state_coverage(), 1.0);
        // a1, a2 与 c 被走过, b 没有.
        assert_eq!(result.visited_edges.len(), 3);
        assert_eq!(result.edge_count, 4);
    }

    #[test]
    fn duplicate_trace_ids_are_rejected() {
        let graph = build_sequence();
        let traces = vec![LogTrace::from_activities(3, &["a"]), LogTrace::from_activities(3, &["b"])];
        let err = OverlapCalculator::new(&graph)
            .calculate(&traces, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, OverlapError::DuplicateTrace(3)));
    }

    #[test]
    fn cancelled_token_stops_the_calculation() {
        let generator = OverlapGenerator::new(
            Arc::new(build_sequence()),
            vec![LogTrace::from_activities(1, &["a", "b"])],
        );
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(generator.call(&token), Err(OverlapError::Cancelled)));
    }

    #[test]
    fn threaded_calculation_returns_the_overlap() {
        let generator = OverlapGenerator::new(
            Arc::new(build_choice()),
            vec![
                LogTrace::from_activities(1, &["a", "b"]),
                LogTrace::from_activities(2, &["a", "c"]),
            ],
        );
        let result = calculate_overlap(generator).unwrap();
        assert_eq!(result.fitting_traces(), vec![1, 2]);
        assert_eq!(result.edge_coverage(), 1.0);
    }
}
