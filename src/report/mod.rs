use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::analysis::marking_graph::{MarkingGraph, MarkingGraphStats};
use crate::analysis::{Classification, OverlapResult, ReplayResult, TerminationCriteria, TraceOverlap};
use crate::net::Net;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalState {
    pub state_id: String,
    pub marking: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkingGraphReport {
    pub net_name: String,
    pub analysis_time: Duration,
    pub stats: Option<MarkingGraphStats>,
    pub terminal_states: Vec<TerminalState>,
    pub place_bounds: Vec<(String, u64)>,
    pub failures: Vec<String>,
    pub error: Option<String>,
}

impl fmt::Display for MarkingGraphReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "标识图分析报告")?;
        writeln!(f, "网: {}", self.net_name)?;
        writeln!(f, "分析时间: {:?}", self.analysis_time)?;

        if let Some(stats) = &self.stats {
            writeln!(f, "\n状态空间信息:")?;
            writeln!(f, "状态数: {}", stats.state_count)?;
            writeln!(f, "边数: {}", stats.edge_count)?;
            writeln!(f, "终止状态数: {}", stats.terminal_count)?;
        }

        if !self.terminal_states.is_empty() {
            writeln!(f, "\n终止状态:")?;
            for state in &self.terminal_states {
                let marking = state
                    .marking
                    .iter()
                    .map(|(place, tokens)| format!("{}: {}", place, tokens))
                    .join(", ");
                writeln!(f, "  {} [{}]", state.state_id, marking)?;
            }
        }

        if !self.place_bounds.is_empty() {
            writeln!(f, "\n库所上界:")?;
            for (place, bound) in &self.place_bounds {
                writeln!(f, "  {}: {}", place, bound)?;
            }
        }

        if !self.failures.is_empty() {
            writeln!(f, "\n被有效性检查拒绝的发生 ({}):", self.failures.len())?;
            for failure in &self.failures {
                writeln!(f, "  {}", failure)?;
            }
        }

        if let Some(error) = &self.error {
            writeln!(f, "\n错误信息: {}", error)?;
        }

        Ok(())
    }
}

impl MarkingGraphReport {
    pub fn new(net_name: String) -> Self {
        Self {
            net_name,
            analysis_time: Duration::default(),
            stats: None,
            terminal_states: Vec::new(),
            place_bounds: Vec::new(),
            failures: Vec::new(),
            error: None,
        }
    }

    /// 分析失败时的报告, 只带错误信息.
    pub fn failed(net: &Net, analysis_time: Duration, error: impl fmt::Display) -> Self {
        Self {
            analysis_time,
            error: Some(error.to_string()),
            ..Self::new(net.name.clone())
        }
    }

    pub fn from_graph(net: &Net, graph: &MarkingGraph, analysis_time: Duration) -> Self {
        let terminal_states = graph
            .terminal
            .iter()
            .copied()
            .sorted()
            .map(|index| {
                TerminalState {
                    state_id: format!("s{}", graph.node(index).index),
                    marking: graph
                        .place_tokens(index)
                        .iter()
                        .map(|place| (place.name.clone(), format!("{:?}", place.tokens)))
                        .collect(),
                }
            })
            .collect();
        let place_bounds = net
            .places
            .iter()
            .map(|place| place.name.clone())
            .zip(graph.place_bounds())
            .collect();
        let failures = graph
            .failures
            .iter()
            .map(|failure| format!("s{}: {}", failure.source.index(), failure.reason))
            .collect();

        Self {
            analysis_time,
            stats: Some(graph.stats()),
            terminal_states,
            place_bounds,
            failures,
            ..Self::new(net.name.clone())
        }
    }

    pub fn save_to_file(&self, path: &str) -> std::io::Result<()> {
        save_report(self, path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: u64,
    pub classification: Classification,
    pub length: usize,
    pub consumed: usize,
    pub witness: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub net_name: String,
    pub termination: TerminationCriteria,
    pub analysis_time: Duration,
    pub num_traces: usize,
    pub num_sequences: usize,
    pub complete: usize,
    pub incomplete: usize,
    pub non_fitting: usize,
    pub portion_fitting: f64,
    pub portion_non_fitting: f64,
    pub traces: Vec<TraceSummary>,
    pub error: Option<String>,
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "日志回放报告")?;
        writeln!(f, "网: {}", self.net_name)?;
        writeln!(f, "终止条件: {:?}", self.termination)?;
        writeln!(f, "分析时间: {:?}", self.analysis_time)?;
        writeln!(
            f,
            "轨迹数: {} (不同序列 {})",
            self.num_traces, self.num_sequences
        )?;
        writeln!(
            f,
            "complete={} incomplete={} non-fitting={}",
            self.complete, self.incomplete, self.non_fitting
        )?;
        writeln!(
            f,
            "fitting={:.3} non-fitting={:.3}",
            self.portion_fitting, self.portion_non_fitting
        )?;

        if !self.traces.is_empty() {
            writeln!(f, "\n轨迹:")?;
            for trace in &self.traces {
                write!(
                    f,
                    "  #{} {} ({}/{})",
                    trace.trace_id, trace.classification, trace.consumed, trace.length
                )?;
                if !trace.witness.is_empty() {
                    write!(f, " <{}>", trace.witness.join(", "))?;
                }
                writeln!(f)?;
            }
        }

        if let Some(error) = &self.error {
            writeln!(f, "\n错误信息: {}", error)?;
        }

        Ok(())
    }
}

impl ReplayReport {
    pub fn new(net_name: String, termination: TerminationCriteria) -> Self {
        Self {
            net_name,
            termination,
            analysis_time: Duration::default(),
            num_traces: 0,
            num_sequences: 0,
            complete: 0,
            incomplete: 0,
            non_fitting: 0,
            portion_fitting: 0.0,
            portion_non_fitting: 0.0,
            traces: Vec::new(),
            error: None,
        }
    }

    pub fn failed(
        net: &Net,
        termination: TerminationCriteria,
        analysis_time: Duration,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            analysis_time,
            error: Some(error.to_string()),
            ..Self::new(net.name.clone(), termination)
        }
    }

    pub fn from_result(net: &Net, result: &ReplayResult, analysis_time: Duration) -> Self {
        let mut traces: Vec<TraceSummary> = result
            .sequences
            .iter()
            .flat_map(|sequence| {
                sequence.trace_ids.iter().map(move |id| TraceSummary {
                    trace_id: *id,
                    classification: sequence.classification,
                    length: sequence.activities.len(),
                    consumed: sequence.consumed,
                    witness: sequence.witness.clone(),
                })
            })
            .collect();
        traces.sort_by_key(|trace| trace.trace_id);

        Self {
            analysis_time,
            num_traces: result.num_traces(),
            num_sequences: result.num_sequences(),
            complete: result.count(Classification::Complete),
            incomplete: result.count(Classification::Incomplete),
            non_fitting: result.count(Classification::NonFitting),
            portion_fitting: result.portion_fitting(),
            portion_non_fitting: result.portion_non_fitting(),
            traces,
            ..Self::new(net.name.clone(), result.termination)
        }
    }

    pub fn save_to_file(&self, path: &str) -> std::io::Result<()> {
        save_report(self, path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlapReport {
    pub net_name: String,
    pub analysis_time: Duration,
    pub state_count: usize,
    pub edge_count: usize,
    pub visited_states: usize,
    pub visited_edges: usize,
    pub num_events: usize,
    pub matched_events: usize,
    pub traces: Vec<TraceOverlap>,
    pub error: Option<String>,
}

impl fmt::Display for OverlapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "日志重叠报告")?;
        writeln!(f, "网: {}", self.net_name)?;
        writeln!(f, "分析时间: {:?}", self.analysis_time)?;

        if self.error.is_none() {
            writeln!(f, "状态覆盖: {}/{}", self.visited_states, self.state_count)?;
            writeln!(f, "边覆盖: {}/{}", self.visited_edges, self.edge_count)?;
            writeln!(f, "事件匹配: {}/{}", self.matched_events, self.num_events)?;
        }

        let unfit = self.traces.iter().filter(|trace| !trace.fits()).collect_vec();
        if !unfit.is_empty() {
            writeln!(f, "\n含不拟合事件的轨迹:")?;
            for trace in unfit {
                writeln!(
                    f,
                    "  #{} ({}/{}) 位置 [{}]",
                    trace.trace_id,
                    trace.matched,
                    trace.length,
                    trace.non_fitting_events.iter().join(", ")
                )?;
            }
        }

        if let Some(error) = &self.error {
            writeln!(f, "\n错误信息: {}", error)?;
        }

        Ok(())
    }
}

impl OverlapReport {
    pub fn new(net_name: String) -> Self {
        Self {
            net_name,
            analysis_time: Duration::default(),
            state_count: 0,
            edge_count: 0,
            visited_states: 0,
            visited_edges: 0,
            num_events: 0,
            matched_events: 0,
            traces: Vec::new(),
            error: None,
        }
    }

    pub fn failed(net: &Net, analysis_time: Duration, error: impl fmt::Display) -> Self {
        Self {
            analysis_time,
            error: Some(error.to_string()),
            ..Self::new(net.name.clone())
        }
    }

    pub fn from_result(net: &Net, result: &OverlapResult, analysis_time: Duration) -> Self {
        Self {
            analysis_time,
            state_count: result.state_count,
            edge_count: result.edge_count,
            visited_states: result.visited_states.len(),
            visited_edges: result.visited_edges.len(),
            num_events: result.num_events(),
            matched_events: result.num_matched_events(),
            traces: result.traces.clone(),
            ..Self::new(net.name.clone())
        }
    }

    pub fn save_to_file(&self, path: &str) -> std::io::Result<()> {
        save_report(self, path)
    }
}

/// 写入文本报告, 并在 `<path>.json` 写入同一份报告的 JSON 形式.
pub fn save_report<R: fmt::Display + Serialize>(report: &R, path: &str) -> std::io::Result<()> {
    use std::fs::File;
    use std::io::Write;

    let mut file = File::create(path)?;
    writeln!(file, "{}", report)?;

    let json_path = format!("{}.json", path);
    let json = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
    std::fs::write(json_path, json.as_bytes())?;

    Ok(())
}
