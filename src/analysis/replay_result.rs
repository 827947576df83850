//! 回放结果的汇总.
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::analysis::replay::TerminationCriteria;

pub type TraceId = u64;

/// 日志中的一条轨迹: 按顺序观察到的活动名.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogTrace {
    pub id: TraceId,
    #[serde(default)]
    pub activities: Vec<String>,
}

impl LogTrace {
    pub fn new(id: TraceId, activities: Vec<String>) -> Self {
        Self { id, activities }
    }

    pub fn from_activities<S: AsRef<str>>(id: TraceId, activities: &[S]) -> Self {
        Self::new(id, activities.iter().map(|a| a.as_ref().to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Complete,
    Incomplete,
    NonFitting,
}

impl Classification {
    pub const ALL: [Classification; 3] = [
        Classification::Complete,
        Classification::Incomplete,
        Classification::NonFitting,
    ];
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Classification::Complete => "complete",
            Classification::Incomplete => "incomplete",
            Classification::NonFitting => "non-fitting",
        };
        f.write_str(name)
    }
}

/// 一个不同活动序列的回放结果; 活动序列相同的轨迹共享同一结果.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReplay {
    pub activities: Vec<String>,
    pub trace_ids: Vec<TraceId>,
    pub classification: Classification,
    /// 任意分支上匹配到的最长前缀长度.
    pub consumed: usize,
    /// 完整轨迹的发生序列 (迁移名, 含静默迁移); 其他分类为空.
    pub witness: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResult {
    pub termination: TerminationCriteria,
    pub sequences: Vec<SequenceReplay>,
    /// 轨迹 id 到 `sequences` 下标, 按 id 升序.
    by_trace: IndexMap<TraceId, usize>,
}

impl ReplayResult {
    pub(crate) fn new(termination: TerminationCriteria, sequences: Vec<SequenceReplay>) -> Self {
        let mut by_trace = IndexMap::new();
        for (index, sequence) in sequences.iter().enumerate() {
            for id in &sequence.trace_ids {
                by_trace.insert(*id, index);
            }
        }
        by_trace.sort_keys();
        Self {
            termination,
            sequences,
            by_trace,
        }
    }

    pub fn num_traces(&self) -> usize {
        self.by_trace.len()
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn count(&self, classification: Classification) -> usize {
        self.sequences
            .iter()
            .filter(|sequence| sequence.classification == classification)
            .map(|sequence| sequence.trace_ids.len())
            .sum()
    }

    pub fn classification(&self, trace: TraceId) -> Option<Classification> {
        self.outcome(trace).map(|sequence| sequence.classification)
    }

    pub fn outcome(&self, trace: TraceId) -> Option<&SequenceReplay> {
        self.by_trace.get(&trace).map(|index| &self.sequences[*index])
    }

    /// 某一分类下的轨迹 id.
    pub fn traces(&self, classification: Classification) -> Vec<TraceId> {
        self.by_trace
            .iter()
            .filter(|(_, index)| self.sequences[**index].classification == classification)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn portion(&self, classification: Classification) -> f64 {
        let total = self.num_traces();
        if total == 0 {
            return 0.0;
        }
        self.count(classification) as f64 / total as f64
    }

    pub fn fitting_traces(&self) -> Vec<TraceId> {
        self.traces(Classification::Complete)
    }

    pub fn non_fitting_traces(&self) -> Vec<TraceId> {
        self.traces(Classification::NonFitting)
    }

    pub fn portion_fitting(&self) -> f64 {
        self.portion(Classification::Complete)
    }

    pub fn portion_incomplete(&self) -> f64 {
        self.portion(Classification::Incomplete)
    }

    pub fn portion_non_fitting(&self) -> f64 {
        self.portion(Classification::NonFitting)
    }

    fn sequences_with(&self, classification: Classification) -> Vec<&[String]> {
        self.sequences
            .iter()
            .filter(|sequence| sequence.classification == classification)
            .map(|sequence| sequence.activities.as_slice())
            .collect()
    }

    pub fn fitting_sequences(&self) -> Vec<&[String]> {
        self.sequences_with(Classification::Complete)
    }

    pub fn non_fitting_sequences(&self) -> Vec<&[String]> {
        self.sequences_with(Classification::NonFitting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(ids: &[TraceId], classification: Classification) -> SequenceReplay {
        SequenceReplay {
            activities: vec![format!("a{}", ids[0])],
            trace_ids: ids.to_vec(),
            classification,
            consumed: 0,
            witness: Vec::new(),
        }
    }

    #[test]
    fn empty_result_has_zero_portions() {
        let result = ReplayResult::new(TerminationCriteria::default(), Vec::new());
        assert_eq!(result.num_traces(), 0);
        for classification in Classification::ALL {
            assert_eq!(result.portion(classification), 0.0);
        }
    }

    #[test]
    fn counts_follow_shared_sequences() {
        let result = ReplayResult::new(
            TerminationCriteria::default(),
            vec![
                sequence(&[4, 1], Classification::Complete),
                sequence(&[2], Classification::NonFitting),
                sequence(&[3], Classification::Incomplete),
            ],
        );
        assert_eq!(result.num_traces(), 4);
        assert_eq!(result.num_sequences(), 3);
        assert_eq!(result.count(Classification::Complete), 2);
        assert_eq!(result.fitting_traces(), vec![1, 4]);
        assert_eq!(result.non_fitting_traces(), vec![2]);
        assert_eq!(result.classification(3), Some(Classification::Incomplete));
        assert_eq!(result.classification(9), None);
        assert_eq!(result.portion_fitting(), 0.5);
        assert_eq!(result.fitting_sequences().len(), 1);
    }
}
