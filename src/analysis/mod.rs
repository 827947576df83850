//! 基于网快照的分析: 标识图构造、日志回放与日志/标识图重叠.
pub mod marking_graph;
pub mod overlap;
pub mod replay;
pub mod replay_result;

pub use marking_graph::{
    MarkingArena, MarkingGraph, MarkingGraphBuilder, MarkingGraphConfig, MarkingGraphError, MarkingGraphGenerator,
    ThreadedMarkingGraphCalculator,
};
pub use overlap::{
    OverlapCalculator, OverlapError, OverlapGenerator, OverlapResult, ThreadedOverlapCalculator, TraceOverlap,
    calculate_overlap,
};
pub use replay::{
    ReplayConfig, ReplayError, ReplayGenerator, Replayer, TerminationCriteria, ThreadedReplay,
    replay_traces,
};
pub use replay_result::{Classification, LogTrace, ReplayResult, SequenceReplay, TraceId};
