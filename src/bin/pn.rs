use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use serde::Serialize;

use pn_analysis::analysis::{
    LogTrace, MarkingGraph, MarkingGraphError, MarkingGraphGenerator, OverlapGenerator, ReplayGenerator,
    ThreadedMarkingGraphCalculator, ThreadedOverlapCalculator, ThreadedReplay,
};
use pn_analysis::config::AnalysisConfig;
use pn_analysis::net::Net;
use pn_analysis::net::io::{load_net, read_json};
use pn_analysis::options::{AnalysisKind, Options};
use pn_analysis::report::{MarkingGraphReport, OverlapReport, ReplayReport, save_report};

fn main() {
    if std::env::var("PN_LOG").is_ok() {
        let e = env_logger::Env::new()
            .filter("PN_LOG")
            .write_style("PN_LOG_STYLE");
        env_logger::init_from_env(e);
    }

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if let Ok(flags) = std::env::var("PN_FLAGS") {
        match shellwords::split(&flags) {
            Ok(extra) => args.extend(extra),
            Err(err) => log::warn!("ignoring malformed PN_FLAGS: {}", err),
        }
    }

    let options = match Options::parse_from_args(&args) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(2);
        }
    };
    debug!("PN options: {:?}", options);

    if let Err(err) = run(&options) {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

/// 打印报告, 并在指定 `-o` 时写入文件. 失败的分析同样产出报告.
fn publish<R: fmt::Display + Serialize>(report: &R, options: &Options) -> Result<()> {
    print!("{}", report);
    if let Some(path) = &options.report {
        save_report(report, path).with_context(|| format!("Failed to write report {:?}", path))?;
    }
    Ok(())
}

fn graph_error(err: MarkingGraphError) -> anyhow::Error {
    match err {
        MarkingGraphError::StateSpace { .. } => anyhow!("{} (raise `state_limit` or pass --no-limit)", err),
        err => err.into(),
    }
}

fn build_graph(
    net: &Arc<Net>,
    config: &AnalysisConfig,
    pool: Option<&rayon::ThreadPool>,
) -> Result<MarkingGraph, MarkingGraphError> {
    let generator = MarkingGraphGenerator::new(net.clone(), config.marking_graph());
    let calculator = match pool {
        Some(pool) => ThreadedMarkingGraphCalculator::submit_in(pool, generator),
        None => ThreadedMarkingGraphCalculator::submit(generator),
    };
    calculator.get_result()
}

fn run(options: &Options) -> Result<()> {
    let mut config = AnalysisConfig::load_from_file(&options.config)?;
    options.apply(&mut config);
    let pool = config.thread_pool()?;

    let net = load_net(&options.net).with_context(|| format!("Failed to load net {:?}", options.net))?;
    info!("analysing `{}` from {}", net.name, options.net);
    let net = Arc::new(net);
    let start = Instant::now();

    match &options.kind {
        AnalysisKind::MarkingGraph { dot } => {
            let graph = match build_graph(&net, &config, pool.as_ref()) {
                Ok(graph) => graph,
                Err(err) => {
                    publish(&MarkingGraphReport::failed(&net, start.elapsed(), &err), options)?;
                    return Err(graph_error(err));
                }
            };
            let report = MarkingGraphReport::from_graph(&net, &graph, start.elapsed());
            publish(&report, options)?;
            if let Some(path) = dot {
                graph
                    .write_dot(path)
                    .with_context(|| format!("Failed to write dot file {:?}", path))?;
            }
        }
        AnalysisKind::Replay { traces } => {
            let traces: Vec<LogTrace> =
                read_json(traces).with_context(|| format!("Failed to read traces {:?}", traces))?;
            let generator = ReplayGenerator::new(net.clone())
                .with_traces(traces)
                .with_config(config.replay());
            let replay = match &pool {
                Some(pool) => ThreadedReplay::submit_in(pool, generator),
                None => ThreadedReplay::submit(generator),
            };
            match replay.get_result() {
                Ok(result) => publish(&ReplayReport::from_result(&net, &result, start.elapsed()), options)?,
                Err(err) => {
                    let report = ReplayReport::failed(&net, config.termination, start.elapsed(), &err);
                    publish(&report, options)?;
                    return Err(err.into());
                }
            }
        }
        AnalysisKind::Overlap { traces } => {
            let traces: Vec<LogTrace> =
                read_json(traces).with_context(|| format!("Failed to read traces {:?}", traces))?;
            let graph = match build_graph(&net, &config, pool.as_ref()) {
                Ok(graph) => graph,
                Err(err) => {
                    publish(&OverlapReport::failed(&net, start.elapsed(), &err), options)?;
                    return Err(graph_error(err));
                }
            };
            let generator = OverlapGenerator::new(Arc::new(graph), traces);
            let calculator = match &pool {
                Some(pool) => ThreadedOverlapCalculator::submit_in(pool, generator),
                None => ThreadedOverlapCalculator::submit(generator),
            };
            match calculator.get_result() {
                Ok(result) => publish(&OverlapReport::from_result(&net, &result, start.elapsed()), options)?,
                Err(err) => {
                    publish(&OverlapReport::failed(&net, start.elapsed(), &err), options)?;
                    return Err(err.into());
                }
            }
        }
    }
    Ok(())
}
