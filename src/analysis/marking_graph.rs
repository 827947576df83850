//! 标识图 (可达图) 的广度优先构造.
//!
//! 节点以标识的值为身份: 两个状态是同一节点当且仅当标识相等. 迁移枚举顺序
//! 只影响边的发现顺序, 不影响节点集合与边关系. 状态数超过上限时构造失败,
//! 不返回截断的图.
//!
//! 每个可达标识只在 [`MarkingArena`] 中保存一份, 其下标即图中节点下标;
//! 节点本身只记录编号与使能迁移.
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexSet;
use itertools::Itertools;
use petgraph::Direction;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, EdgeReference, NodeIndex};
use petgraph::visit::EdgeRef;
use rustc_hash::{FxBuildHasher, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::{Marking, Net, PlaceId, TokenContainer, TransitionId, Weight};
use crate::threaded::{
    AnalysisCallable, CancellationToken, Interrupter, ThreadedComputation, ThreadedError,
};

#[derive(Debug, Error)]
pub enum MarkingGraphError {
    #[error("marking graph computation was cancelled")]
    Cancelled,
    #[error("interrupted while waiting for the marking graph")]
    Interrupted,
    #[error("state space exceeds the limit of {limit} markings, the net may be unbounded")]
    StateSpace { limit: usize },
    #[error("marking graph computation failed: {message}")]
    Computation { message: String },
}

impl From<ThreadedError<MarkingGraphError>> for MarkingGraphError {
    fn from(err: ThreadedError<MarkingGraphError>) -> Self {
        match err {
            ThreadedError::Cancelled => MarkingGraphError::Cancelled,
            ThreadedError::Interrupted => MarkingGraphError::Interrupted,
            ThreadedError::Failed(err) => err,
            ThreadedError::Computation { message } => MarkingGraphError::Computation { message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceTokens {
    pub place: PlaceId,
    pub name: String,
    pub tokens: TokenContainer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenChange {
    pub place: PlaceId,
    pub name: String,
    pub before: Weight,
    pub after: Weight,
    /// `after - before`, 在 i128 中计算, 任意两个 `Weight` 之差都不会溢出.
    pub delta: i128,
}

impl TokenChange {
    fn new(place: PlaceId, name: &str, before: Weight, after: Weight) -> Option<Self> {
        if before == after {
            return None;
        }
        Some(Self {
            place,
            name: name.to_string(),
            before,
            after,
            delta: i128::from(after) - i128::from(before),
        })
    }
}

/// 状态标识的存储, 按发现顺序编号.
pub type MarkingArena = IndexSet<Marking, FxBuildHasher>;

/// 图中的一个状态. 标识本身保存在 [`MarkingGraph::markings`] 中.
#[derive(Debug, Clone)]
pub struct MarkingState {
    pub index: usize,
    pub enabled: Vec<TransitionId>,
}

/// 状态之间的发生关系.
#[derive(Debug, Clone)]
pub struct MarkingRelation {
    pub transition: TransitionId,
    pub name: String,
    pub label: String,
    pub silent: bool,
    pub changes: Vec<TokenChange>,
}

impl MarkingRelation {
    fn new(net: &Net, transition_id: TransitionId, before: &Marking, after: &Marking) -> Self {
        let transition = &net.transitions[transition_id];
        let changes = net
            .places
            .iter_enumerated()
            .filter_map(|(place_id, place)| {
                TokenChange::new(place_id, &place.name, before.tokens(place_id), after.tokens(place_id))
            })
            .collect();
        Self {
            transition: transition_id,
            name: transition.name.clone(),
            label: transition.label.clone(),
            silent: transition.silent,
            changes,
        }
    }
}

/// 使能但被有效性检查拒绝的迁移.
#[derive(Debug, Clone)]
pub struct FiringFailure {
    pub source: NodeIndex,
    pub transition: TransitionId,
    pub transition_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkingGraphStats {
    pub state_count: usize,
    pub edge_count: usize,
    pub terminal_count: usize,
    pub failure_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkingGraphConfig {
    /// 最多探索的状态数量. None 表示不设上限.
    pub state_limit: Option<usize>,
    /// 是否在节点快照中保留没有令牌的库所.
    pub include_zero_tokens: bool,
}

impl Default for MarkingGraphConfig {
    fn default() -> Self {
        Self {
            state_limit: Some(10_000),
            include_zero_tokens: false,
        }
    }
}

#[derive(Debug)]
pub struct MarkingGraph {
    pub graph: DiGraph<MarkingState, MarkingRelation>,
    pub initial: NodeIndex,
    /// 没有使能迁移的状态.
    pub terminal: FxHashSet<NodeIndex>,
    pub failures: Vec<FiringFailure>,
    /// 下标与 `graph` 的节点下标一致.
    pub markings: MarkingArena,
    place_names: Vec<String>,
    include_zero_tokens: bool,
}

impl MarkingGraph {
    /// 在当前线程上以默认配置构造, 不可取消.
    pub fn from_net(net: &Net) -> Result<Self, MarkingGraphError> {
        MarkingGraphBuilder::new(net, MarkingGraphConfig::default()).build(&CancellationToken::new())
    }

    pub fn dot(&self) -> String {
        fn escape(s: &str) -> String {
            s.replace('\\', "\\\\").replace('"', "\\\"")
        }

        let edge_attr = |_, edge: EdgeReference<MarkingRelation>| -> String {
            let label = escape(&edge.weight().name);
            if edge.weight().silent {
                format!("label=\"{}\", style=dashed", label)
            } else {
                format!("label=\"{}\"", label)
            }
        };

        let node_attr = |_, (idx, node): (NodeIndex, &MarkingState)| -> String {
            let marking = self
                .place_tokens(idx)
                .iter()
                .map(|place| format!("{}:{:?}", place.name, place.tokens))
                .join(", ");
            let label = format!("s{}\\n{}", node.index, escape(&marking));
            if node.enabled.is_empty() {
                format!("label=\"{}\", peripheries=2", label)
            } else {
                format!("label=\"{}\"", label)
            }
        };

        format!(
            "{:?}",
            Dot::with_attr_getters(
                &self.graph,
                &[Config::EdgeNoLabel, Config::NodeNoLabel],
                &edge_attr,
                &node_attr
            )
        )
    }

    pub fn write_dot<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let dot = self.dot();
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, dot)
    }

    pub fn stats(&self) -> MarkingGraphStats {
        MarkingGraphStats {
            state_count: self.graph.node_count(),
            edge_count: self.graph.edge_count(),
            terminal_count: self.terminal.len(),
            failure_count: self.failures.len(),
        }
    }

    pub fn state_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node(&self, index: NodeIndex) -> &MarkingState {
        &self.graph[index]
    }

    pub fn marking(&self, index: NodeIndex) -> &Marking {
        &self.markings[index.index()]
    }

    /// 状态中各库所的令牌, 用于展示. 默认省略空库所.
    pub fn place_tokens(&self, index: NodeIndex) -> Vec<PlaceTokens> {
        self.marking(index)
            .iter()
            .filter(|(_, tokens)| self.include_zero_tokens || !tokens.is_empty())
            .map(|(place, tokens)| PlaceTokens {
                place,
                name: self.place_names[place.0 as usize].clone(),
                tokens: tokens.clone(),
            })
            .collect()
    }

    pub fn contains_marking(&self, marking: &Marking) -> bool {
        self.markings.contains(marking)
    }

    pub fn state_of(&self, marking: &Marking) -> Option<NodeIndex> {
        self.markings.get_index_of(marking).map(NodeIndex::new)
    }

    /// 所有 `(源标识, 关系, 目标标识)` 三元组.
    pub fn relations(&self) -> impl Iterator<Item = (&Marking, &MarkingRelation, &Marking)> {
        self.graph
            .edge_references()
            .map(|edge| (self.marking(edge.source()), edge.weight(), self.marking(edge.target())))
    }

    pub fn successors(&self, index: NodeIndex) -> impl Iterator<Item = (&MarkingRelation, NodeIndex)> {
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| (edge.weight(), edge.target()))
    }

    /// 每个库所在所有可达标识中的最大令牌数.
    pub fn place_bounds(&self) -> Vec<Weight> {
        let mut bounds = vec![0; self.place_names.len()];
        for marking in &self.markings {
            for (place, container) in marking.iter() {
                let slot = &mut bounds[place.0 as usize];
                *slot = (*slot).max(container.total());
            }
        }
        bounds
    }
}

/// 单线程的标识图构造器, 每探索一个状态检查一次取消标记.
pub struct MarkingGraphBuilder<'a> {
    net: &'a Net,
    config: MarkingGraphConfig,
}

impl<'a> MarkingGraphBuilder<'a> {
    pub fn new(net: &'a Net, config: MarkingGraphConfig) -> Self {
        Self { net, config }
    }

    pub fn build(&self, cancel: &CancellationToken) -> Result<MarkingGraph, MarkingGraphError> {
        let net = self.net;
        let config = &self.config;
        let mut graph = DiGraph::new();
        let mut markings = MarkingArena::default();
        let mut queue = VecDeque::new();
        let mut terminal = FxHashSet::default();
        let mut failures = Vec::new();

        let initial_index = graph.add_node(MarkingState {
            index: 0,
            enabled: Vec::new(),
        });
        markings.insert(net.initial_marking().clone());
        queue.push_back(initial_index);

        while let Some(state_index) = queue.pop_front() {
            if cancel.is_cancelled() {
                log::debug!(
                    "marking graph of `{}` cancelled after {} states",
                    net.name,
                    graph.node_count()
                );
                return Err(MarkingGraphError::Cancelled);
            }

            let current_marking = markings[state_index.index()].clone();
            let enabled = net.enabled_transitions(&current_marking);
            if enabled.is_empty() {
                terminal.insert(state_index);
            }

            for &transition_id in &enabled {
                let next_marking = match net.fire_transition(&current_marking, transition_id) {
                    Ok(next_marking) => next_marking,
                    Err(err) => {
                        log::debug!("{:?} rejected at s{}: {}", transition_id, state_index.index(), err);
                        failures.push(FiringFailure {
                            source: state_index,
                            transition: transition_id,
                            transition_name: net.transitions[transition_id].name.clone(),
                            reason: err.to_string(),
                        });
                        continue;
                    }
                };

                let relation = MarkingRelation::new(net, transition_id, &current_marking, &next_marking);
                let target_index = match markings.get_index_of(&next_marking) {
                    Some(known) => NodeIndex::new(known),
                    None => {
                        if let Some(limit) = config.state_limit {
                            if markings.len() >= limit {
                                log::warn!("marking graph of `{}` exceeds {} states", net.name, limit);
                                return Err(MarkingGraphError::StateSpace { limit });
                            }
                        }
                        let (position, _) = markings.insert_full(next_marking);
                        let index = graph.add_node(MarkingState {
                            index: position,
                            enabled: Vec::new(),
                        });
                        debug_assert_eq!(index.index(), position);
                        queue.push_back(index);
                        index
                    }
                };
                graph.add_edge(state_index, target_index, relation);
            }
            graph[state_index].enabled = enabled;
        }

        log::info!(
            "marking graph of `{}`: {} states, {} edges",
            net.name,
            graph.node_count(),
            graph.edge_count()
        );
        Ok(MarkingGraph {
            graph,
            initial: initial_index,
            terminal,
            failures,
            markings,
            place_names: net.places.iter().map(|place| place.name.clone()).collect(),
            include_zero_tokens: config.include_zero_tokens,
        })
    }
}

/// 交给线程化计算的工作单元: 网快照与构造参数.
#[derive(Debug, Clone)]
pub struct MarkingGraphGenerator {
    pub net: Arc<Net>,
    pub config: MarkingGraphConfig,
}

impl MarkingGraphGenerator {
    pub fn new(net: Arc<Net>, config: MarkingGraphConfig) -> Self {
        Self { net, config }
    }
}

impl AnalysisCallable for MarkingGraphGenerator {
    type Output = MarkingGraph;
    type Error = MarkingGraphError;

    fn call(self, cancel: &CancellationToken) -> Result<MarkingGraph, MarkingGraphError> {
        MarkingGraphBuilder::new(&self.net, self.config).build(cancel)
    }
}

/// 后台构造标识图.
#[derive(Debug)]
pub struct ThreadedMarkingGraphCalculator {
    computation: ThreadedComputation<MarkingGraph, MarkingGraphError>,
}

impl ThreadedMarkingGraphCalculator {
    pub fn submit(generator: MarkingGraphGenerator) -> Self {
        Self {
            computation: ThreadedComputation::submit(generator),
        }
    }

    pub fn submit_in(pool: &rayon::ThreadPool, generator: MarkingGraphGenerator) -> Self {
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

    pub fn interrupter(&self) -> Interrupter<MarkingGraph, MarkingGraphError> {
        self.computation.interrupter()
    }

    pub fn get_result(self) -> Result<MarkingGraph, MarkingGraphError> {
        Ok(self.computation.get_result()?)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::generator::shared_resource;
    use crate::net::{NetKind, Place, Transition};

    /// p0(cap 1) -t0-> p1(cap 1)
    fn build_simple_net() -> Net {
        let mut net = Net::empty();
        net.add_place(Place::with_capacity("p0", 1)).unwrap();
        net.add_place(Place::with_capacity("p1", 1)).unwrap();
        net.add_transition(Transition::new("t0")).unwrap();
        net.add_flow_relation("p0", "t0", 1).unwrap();
        net.add_flow_relation("t0", "p1", 1).unwrap();
        net.set_initial_marking(net.marking_from_counts(&[("p0", 1)]).unwrap())
            .unwrap();
        net
    }

    /// t0 不断向 p 产生令牌.
    fn build_unbounded_net() -> Net {
        let mut net = Net::new("unbounded", NetKind::PlaceTransition);
        net.add_place(Place::new("p")).unwrap();
        net.add_transition(Transition::new("t0")).unwrap();
        net.add_flow_relation("t0", "p", 1).unwrap();
        net
    }

    /// 两个并发分支, 迁移按给定顺序插入.
    fn build_diamond(order: &[&str]) -> Net {
        let mut net = Net::empty();
        for place in ["a", "b", "c", "d"] {
            net.add_place(Place::new(place)).unwrap();
        }
        for name in order {
            net.add_transition(Transition::new(*name)).unwrap();
        }
        net.add_flow_relation("a", "ta", 1).unwrap();
        net.add_flow_relation("ta", "c", 1).unwrap();
        net.add_flow_relation("b", "tb", 1).unwrap();
        net.add_flow_relation("tb", "d", 1).unwrap();
        net.add_flow_relation("c", "tj", 1).unwrap();
        net.add_flow_relation("d", "tj", 1).unwrap();
        net.add_flow_relation("tj", "a", 1).unwrap();
        net.add_flow_relation("tj", "b", 1).unwrap();
        net.set_initial_marking(net.marking_from_counts(&[("a", 1), ("b", 1)]).unwrap())
            .unwrap();
        net
    }

    #[test]
    fn explores_simple_net() {
        let net = build_simple_net();
        let graph = MarkingGraph::from_net(&net).unwrap();
        assert_eq!(graph.state_count(), 2);
        assert_eq!(graph.stats().edge_count, 1);
        assert_eq!(graph.terminal.len(), 1);
        let (relation, target) = graph.successors(graph.initial).next().unwrap();
        assert_eq!(relation.name, "t0");
        assert_eq!(relation.changes.len(), 2);
        assert!(graph.terminal.contains(&target));
        assert_eq!(graph.place_bounds(), vec![1, 1]);
    }

    #[test]
    fn each_marking_is_stored_once_at_its_node_index() {
        let graph = MarkingGraph::from_net(&shared_resource(2, 1).unwrap()).unwrap();
        assert_eq!(graph.markings.len(), graph.state_count());
        for index in graph.graph.node_indices() {
            assert_eq!(graph.node(index).index, index.index());
            assert_eq!(graph.state_of(graph.marking(index)), Some(index));
        }
        assert_eq!(graph.marking(graph.initial), shared_resource(2, 1).unwrap().initial_marking());
    }

    #[test]
    fn place_tokens_hide_empty_places_unless_requested() {
        let net = build_simple_net();
        let graph = MarkingGraph::from_net(&net).unwrap();
        let shown = graph.place_tokens(graph.initial);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].name, "p0");

        let config = MarkingGraphConfig {
            include_zero_tokens: true,
            ..MarkingGraphConfig::default()
        };
        let full = MarkingGraphBuilder::new(&net, config).build(&CancellationToken::new()).unwrap();
        assert_eq!(full.place_tokens(full.initial).len(), 2);
    }

    #[test]
    fn token_delta_spans_the_full_weight_range() {
        let up = TokenChange::new(PlaceId::new(0), "p", 0, Weight::MAX).unwrap();
        assert_eq!(up.delta, i128::from(Weight::MAX));
        let down = TokenChange::new(PlaceId::new(0), "p", Weight::MAX, 0).unwrap();
        assert_eq!(down.delta, -i128::from(Weight::MAX));
        assert!(TokenChange::new(PlaceId::new(0), "p", 3, 3).is_none());
    }

    #[test]
    fn state_limit_is_an_error() {
        let net = build_simple_net();
        let config = MarkingGraphConfig {
            state_limit: Some(1),
            include_zero_tokens: false,
        };
        let err = MarkingGraphBuilder::new(&net, config)
            .build(&CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, MarkingGraphError::StateSpace { limit: 1 }));

        let exact = MarkingGraphConfig {
            state_limit: Some(2),
            ..MarkingGraphConfig::default()
        };
        assert!(MarkingGraphBuilder::new(&net, exact).build(&CancellationToken::new()).is_ok());
    }

    #[test]
    fn unbounded_net_exceeds_limit() {
        let net = build_unbounded_net();
        let config = MarkingGraphConfig {
            state_limit: Some(50),
            ..MarkingGraphConfig::default()
        };
        let err = MarkingGraphBuilder::new(&net, config)
            .build(&CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, MarkingGraphError::StateSpace { limit: 50 }));
    }

    #[test]
    fn graph_is_independent_of_transition_order() {
        let first = MarkingGraph::from_net(&build_diamond(&["ta", "tb", "tj"])).unwrap();
        let second = MarkingGraph::from_net(&build_diamond(&["tj", "tb", "ta"])).unwrap();

        let states = |graph: &MarkingGraph| graph.markings.iter().cloned().collect::<FxHashSet<_>>();
        let edges = |graph: &MarkingGraph| {
            graph
                .relations()
                .map(|(from, relation, to)| (from.clone(), relation.name.clone(), to.clone()))
                .collect::<FxHashSet<_>>()
        };
        assert_eq!(first.state_count(), 4);
        assert_eq!(states(&first), states(&second));
        assert_eq!(edges(&first), edges(&second));
        assert!(first.terminal.is_empty());
    }

    #[test]
    fn validator_rejections_are_recorded_without_edges() {
        let mut net = build_simple_net();
        let t0 = net.transition_id("t0").unwrap();
        net.add_validator(
            t0,
            Arc::new(|_: &Net, _: TransitionId, _: &Marking| -> Result<(), String> {
                Err("label clash".to_string())
            }),
        );
        let graph = MarkingGraph::from_net(&net).unwrap();
        assert_eq!(graph.state_count(), 1);
        assert_eq!(graph.failures.len(), 1);
        assert_eq!(graph.failures[0].transition_name, "t0");
        assert!(graph.failures[0].reason.contains("label clash"));
        assert!(graph.terminal.is_empty());
    }

    #[test]
    fn shared_resource_state_space() {
        let net = Arc::new(shared_resource(2, 1).unwrap());
        let calculator =
            ThreadedMarkingGraphCalculator::submit(MarkingGraphGenerator::new(net, MarkingGraphConfig::default()));
        let graph = calculator.get_result().unwrap();
        // 4 x 4 种阶段组合, 去掉两个进程同时持有资源的一种.
        assert_eq!(graph.state_count(), 15);
        assert!(graph.terminal.is_empty());
        assert!(graph.dot().contains("t11"));
    }

    #[test]
    fn cancel_during_exploration() {
        let config = MarkingGraphConfig {
            state_limit: None,
            include_zero_tokens: false,
        };
        let generator = MarkingGraphGenerator::new(Arc::new(build_unbounded_net()), config);
        let calculator = ThreadedMarkingGraphCalculator::submit(generator);
        thread::sleep(Duration::from_millis(20));
        assert!(calculator.cancel());
        assert!(matches!(calculator.get_result(), Err(MarkingGraphError::Cancelled)));
    }

    #[test]
    fn interrupting_the_waiter_stops_an_unbounded_exploration() {
        let config = MarkingGraphConfig {
            state_limit: None,
            ..MarkingGraphConfig::default()
        };
        let generator = MarkingGraphGenerator::new(Arc::new(build_unbounded_net()), config);
        let calculator = ThreadedMarkingGraphCalculator::submit(generator);
        let interrupter = calculator.interrupter();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();
        });
        assert!(matches!(calculator.get_result(), Err(MarkingGraphError::Interrupted)));
        waker.join().unwrap();
    }

    #[test]
    fn write_dot_creates_parent_dirs() {
        let graph = MarkingGraph::from_net(&build_simple_net()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("mg.dot");
        graph.write_dot(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("digraph"));
        assert!(content.contains("p0:1"));
    }
}
