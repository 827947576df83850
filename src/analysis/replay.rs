//! 日志轨迹在网上的回放.
//!
//! 对每条轨迹, 在 `(已匹配位置, 标识)` 构成的状态空间上做广度优先搜索: 每一步只尝试
//! 标签等于下一个未匹配活动的迁移以及静默迁移. 相同标签的多个迁移同时使能时都会被
//! 尝试; 任一分支达到终止条件即为完整. 广度优先保证见证序列最短, 长度相同时按迁移
//! 插入顺序优先.
use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::replay_result::{Classification, LogTrace, ReplayResult, SequenceReplay, TraceId};
use crate::net::{Marking, Net, TransitionId};
use crate::threaded::{
    AnalysisCallable, CancellationToken, Interrupter, ThreadedComputation, ThreadedError,
};

/// 轨迹耗尽后判定为完整所需满足的条件.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TerminationCriteria {
    /// 存在与轨迹一致的发生序列即可.
    #[default]
    PossibleFiringSequence,
    /// 轨迹耗尽后, 仅发生静默迁移即可到达没有使能迁移的标识.
    EscapableWithSilentTransitions,
    /// 轨迹耗尽时没有任何使能迁移.
    NoEnabledTransitions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub termination: TerminationCriteria,
    /// 每条轨迹最多探索的搜索状态数. None 表示不设上限.
    pub max_states_per_trace: Option<usize>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            termination: TerminationCriteria::default(),
            max_states_per_trace: Some(100_000),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay was cancelled")]
    Cancelled,
    #[error("interrupted while waiting for the replay result")]
    Interrupted,
    #[error("replay of trace {trace} exceeds the limit of {limit} search states")]
    StateSpace { trace: TraceId, limit: usize },
    #[error("trace id {0} occurs more than once")]
    DuplicateTrace(TraceId),
    #[error("replay failed: {message}")]
    Computation { message: String },
}

impl From<ThreadedError<ReplayError>> for ReplayError {
    fn from(err: ThreadedError<ReplayError>) -> Self {
        match err {
            ThreadedError::Cancelled => ReplayError::Cancelled,
            ThreadedError::Interrupted => ReplayError::Interrupted,
            ThreadedError::Failed(err) => err,
            ThreadedError::Computation { message } => ReplayError::Computation { message },
        }
    }
}

/// 单个活动序列的搜索结果.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOutcome {
    pub classification: Classification,
    pub consumed: usize,
    pub witness: Vec<TransitionId>,
}

struct SearchNode {
    position: usize,
    marking: Marking,
    parent: Option<(usize, TransitionId)>,
}

/// 绑定一个网的回放器. 构造时按标签索引迁移.
pub struct Replayer<'a> {
    net: &'a Net,
    config: ReplayConfig,
    silent: Vec<TransitionId>,
    by_label: FxHashMap<&'a str, Vec<TransitionId>>,
}

impl<'a> Replayer<'a> {
    pub fn new(net: &'a Net, config: ReplayConfig) -> Self {
        let mut silent = Vec::new();
        let mut by_label: FxHashMap<&str, Vec<TransitionId>> = FxHashMap::default();
        for (id, transition) in net.transitions.iter_enumerated() {
            if transition.silent {
                silent.push(id);
            } else {
                by_label.entry(transition.label.as_str()).or_default().push(id);
            }
        }
        Self {
            net,
            config,
            silent,
            by_label,
        }
    }

    /// 位置 `position` 上的候选迁移, 按插入顺序.
    fn candidates(&self, activities: &[String], position: usize) -> Vec<TransitionId> {
        let mut candidates = self.silent.clone();
        if let Some(labelled) = activities
            .get(position)
            .and_then(|activity| self.by_label.get(activity.as_str()))
        {
            candidates.extend(labelled.iter().copied());
            candidates.sort_unstable();
        }
        candidates
    }

    fn is_terminal(&self, marking: &Marking) -> bool {
        self.net.enabled_transitions(marking).is_empty()
    }

    fn accepts(&self, marking: &Marking) -> bool {
        match self.config.termination {
            TerminationCriteria::PossibleFiringSequence => true,
            TerminationCriteria::EscapableWithSilentTransitions
            | TerminationCriteria::NoEnabledTransitions => self.is_terminal(marking),
        }
    }

    /// 回放一个活动序列.
    pub fn replay(
        &self,
        trace: TraceId,
        activities: &[String],
        cancel: &CancellationToken,
    ) -> Result<TraceOutcome, ReplayError> {
        let mut nodes = vec![SearchNode {
            position: 0,
            marking: self.net.initial_marking().clone(),
            parent: None,
        }];
        let mut seen: FxHashSet<(usize, Marking)> = FxHashSet::default();
        seen.insert((0, self.net.initial_marking().clone()));
        let mut queue = VecDeque::from([0usize]);
        let mut consumed = 0;
        let mut exhausted = false;

        while let Some(index) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(ReplayError::Cancelled);
            }
            let position = nodes[index].position;
            consumed = consumed.max(position);

            let candidates = if position == activities.len() {
                exhausted = true;
                if self.accepts(&nodes[index].marking) {
                    return Ok(TraceOutcome {
                        classification: Classification::Complete,
                        consumed: activities.len(),
                        witness: Self::witness(&nodes, index),
                    });
                }
                if self.config.termination != TerminationCriteria::EscapableWithSilentTransitions {
                    continue;
                }
                self.silent.clone()
            } else {
                self.candidates(activities, position)
            };

            for transition in candidates {
                let next = match self.net.fire_transition(&nodes[index].marking, transition) {
                    Ok(next) => next,
                    Err(err) => {
                        if err.is_structural_violation() {
                            log::trace!("trace {}: {}", trace, err);
                        }
                        continue;
                    }
                };
                let next_position = if self.net.transitions[transition].silent {
                    position
                } else {
                    position + 1
                };
                if !seen.insert((next_position, next.clone())) {
                    continue;
                }
                if let Some(limit) = self.config.max_states_per_trace {
                    if nodes.len() >= limit {
                        log::warn!("trace {} exceeds {} search states", trace, limit);
                        return Err(ReplayError::StateSpace { trace, limit });
                    }
                }
                nodes.push(SearchNode {
                    position: next_position,
                    marking: next,
                    parent: Some((index, transition)),
                });
                queue.push_back(nodes.len() - 1);
            }
        }

        let classification = if exhausted {
            Classification::Incomplete
        } else {
            Classification::NonFitting
        };
        Ok(TraceOutcome {
            classification,
            consumed,
            witness: Vec::new(),
        })
    }

    fn witness(nodes: &[SearchNode], mut index: usize) -> Vec<TransitionId> {
        let mut sequence = Vec::new();
        while let Some((parent, transition)) = nodes[index].parent {
            sequence.push(transition);
            index = parent;
        }
        sequence.reverse();
        sequence
    }

    /// 回放全部轨迹. 活动序列相同的轨迹只回放一次.
    pub fn replay_traces(
        &self,
        traces: &[LogTrace],
        cancel: &CancellationToken,
    ) -> Result<ReplayResult, ReplayError> {
        let mut ids = FxHashSet::default();
        let mut groups: IndexMap<&[String], Vec<TraceId>> = IndexMap::new();
        for trace in traces {
            if !ids.insert(trace.id) {
                return Err(ReplayError::DuplicateTrace(trace.id));
            }
            match groups.entry(trace.activities.as_slice()) {
                indexmap::map::Entry::Occupied(mut entry) => entry.get_mut().push(trace.id),
                indexmap::map::Entry::Vacant(entry) => {
                    entry.insert(vec![trace.id]);
                }
            }
        }

        let mut sequences = Vec::with_capacity(groups.len());
        for (activities, trace_ids) in groups {
            let outcome = self.replay(trace_ids[0], activities, cancel)?;
            log::debug!(
                "replayed {:?} ({} traces): {}",
                activities,
                trace_ids.len(),
                outcome.classification
            );
            sequences.push(SequenceReplay {
                activities: activities.to_vec(),
                trace_ids,
                classification: outcome.classification,
                consumed: outcome.consumed,
                witness: outcome
                    .witness
                    .iter()
                    .map(|t| self.net.transitions[*t].name.clone())
                    .collect(),
            });
        }

        let result = ReplayResult::new(self.config.termination, sequences);
        log::info!(
            "replay on `{}`: {} traces, fitting={:.3}, non-fitting={:.3}",
            self.net.name,
            result.num_traces(),
            result.portion_fitting(),
            result.portion_non_fitting()
        );
        Ok(result)
    }
}

/// 交给线程化计算的工作单元: 网快照、轨迹与回放参数.
#[derive(Debug, Clone)]
pub struct ReplayGenerator {
    pub net: Arc<Net>,
    pub traces: Vec<LogTrace>,
    pub config: ReplayConfig,
}

impl ReplayGenerator {
    pub fn new(net: Arc<Net>) -> Self {
        Self {
            net,
            traces: Vec::new(),
            config: ReplayConfig::default(),
        }
    }

    pub fn with_traces(mut self, traces: Vec<LogTrace>) -> Self {
        self.traces = traces;
        self
    }

    pub fn with_termination(mut self, termination: TerminationCriteria) -> Self {
        self.config.termination = termination;
        self
    }

    pub fn with_config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }
}

impl AnalysisCallable for ReplayGenerator {
    type Output = ReplayResult;
    type Error = ReplayError;

    fn call(self, cancel: &CancellationToken) -> Result<ReplayResult, ReplayError> {
        Replayer::new(&self.net, self.config).replay_traces(&self.traces, cancel)
    }
}

/// 后台回放.
#[derive(Debug)]
pub struct ThreadedReplay {
    computation: ThreadedComputation<ReplayResult, ReplayError>,
}

impl ThreadedReplay {
    pub fn submit(generator: ReplayGenerator) -> Self {
        Self {
            computation: ThreadedComputation::submit(generator),
        }
    }

    pub fn submit_in(pool: &rayon::ThreadPool, generator: ReplayGenerator) -> Self {
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

    pub fn interrupter(&self) -> Interrupter<ReplayResult, ReplayError> {
        self.computation.interrupter()
    }

    pub fn get_result(self) -> Result<ReplayResult, ReplayError> {
        Ok(self.computation.get_result()?)
    }
}

/// 提交并等待回放结果.
pub fn replay_traces(generator: ReplayGenerator) -> Result<ReplayResult, ReplayError> {
    ThreadedReplay::submit(generator).get_result()
}
