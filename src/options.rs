//! Parsing Options.
//! `pn mg <NET>` builds the marking graph, `pn replay <NET> <TRACES>` replays a log,
//! `pn overlap <NET> <TRACES>` measures how much of the marking graph a log covers.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::error::Error;

use crate::analysis::TerminationCriteria;
use crate::config::AnalysisConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisKind {
    MarkingGraph { dot: Option<String> },
    Replay { traces: String },
    Overlap { traces: String },
}

fn net_arg() -> Arg {
    Arg::new("net")
        .value_name("NET")
        .required(true)
        .help("Petri net file (.json or .ron)")
}

fn traces_arg() -> Arg {
    Arg::new("traces")
        .value_name("TRACES")
        .required(true)
        .help("JSON list of traces: [{\"id\": 1, \"activities\": [..]}]")
}

fn limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("state-limit")
                .short('l')
                .long("state-limit")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("Maximum number of explored markings"),
        )
        .arg(
            Arg::new("no-limit")
                .long("no-limit")
                .action(ArgAction::SetTrue)
                .conflicts_with("state-limit")
                .help("Explore without a state limit"),
        )
}

fn common_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Analysis configuration")
                .default_value("pn.toml"),
        )
        .arg(
            Arg::new("report")
                .short('o')
                .long("report")
                .value_name("FILE")
                .help("Path to file where the report will be stored, a .json copy is written next to it"),
        )
}

fn make_options_parser() -> Command {
    Command::new("pn")
        .no_binary_name(true)
        .version(env!("CARGO_PKG_VERSION"))
        .about("Marking graph and log replay analysis for Petri nets")
        .subcommand_required(true)
        .subcommand(common_args(limit_args(
            Command::new("mg")
                .about("Build the marking graph")
                .arg(net_arg())
                .arg(
                    Arg::new("dot")
                        .short('d')
                        .long("dot")
                        .value_name("FILE")
                        .help("Write the marking graph in Graphviz format"),
                ),
        )))
        .subcommand(common_args(
            Command::new("replay")
                .about("Replay a log of traces")
                .arg(net_arg())
                .arg(traces_arg())
                .arg(
                    Arg::new("termination")
                        .short('t')
                        .long("termination")
                        .value_parser(["possible", "escapable", "no-enabled"])
                        .help("Termination criterion for complete traces"),
                ),
        ))
        .subcommand(common_args(limit_args(
            Command::new("overlap")
                .about("Measure which states and edges of the marking graph a log covers")
                .arg(net_arg())
                .arg(traces_arg()),
        )))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub kind: AnalysisKind,
    pub net: String,
    pub config: String,
    pub report: Option<String>,
    pub state_limit: Option<usize>,
    pub no_limit: bool,
    pub termination: Option<TerminationCriteria>,
}

impl Options {
    pub fn parse_from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        let flags = shellwords::split(s)?;
        Self::parse_from_args(&flags)
    }

    pub fn parse_from_args(flags: &[String]) -> Result<Self, Box<dyn Error>> {
        let app = make_options_parser();
        let matches = app.try_get_matches_from(flags.iter())?;
        let (name, sub) = matches.subcommand().ok_or("missing subcommand")?;

        let kind = match name {
            "mg" => AnalysisKind::MarkingGraph {
                dot: string_arg(sub, "dot"),
            },
            "replay" => AnalysisKind::Replay {
                traces: string_arg(sub, "traces").ok_or("missing traces file")?,
            },
            "overlap" => AnalysisKind::Overlap {
                traces: string_arg(sub, "traces").ok_or("missing traces file")?,
            },
            _ => return Err(format!("unsupported analysis `{}`", name).into()),
        };
        let termination = match sub.try_get_one::<String>("termination").ok().flatten().map(String::as_str) {
            Some("possible") => Some(TerminationCriteria::PossibleFiringSequence),
            Some("escapable") => Some(TerminationCriteria::EscapableWithSilentTransitions),
            Some("no-enabled") => Some(TerminationCriteria::NoEnabledTransitions),
            Some(other) => return Err(format!("unsupported termination criterion `{}`", other).into()),
            None => None,
        };

        Ok(Options {
            kind,
            net: string_arg(sub, "net").ok_or("missing net file")?,
            config: string_arg(sub, "config").unwrap_or_else(|| "pn.toml".to_string()),
            report: string_arg(sub, "report"),
            state_limit: sub.try_get_one::<usize>("state-limit").ok().flatten().copied(),
            no_limit: sub.try_get_one::<bool>("no-limit").ok().flatten().copied().unwrap_or(false),
            termination,
        })
    }

    /// 命令行参数覆盖配置文件中的值.
    pub fn apply(&self, config: &mut AnalysisConfig) {
        if self.no_limit {
            config.state_limit = None;
        } else if let Some(limit) = self.state_limit {
            config.state_limit = Some(limit);
        }
        if let Some(termination) = self.termination {
            config.termination = termination;
        }
    }
}

fn string_arg(matches: &ArgMatches, id: &str) -> Option<String> {
    matches.try_get_one::<String>(id).ok().flatten().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mg() {
        let options = Options::parse_from_str("mg net.json -l 500 -d 'out/graph.dot'").unwrap();
        assert_eq!(
            options.kind,
            AnalysisKind::MarkingGraph {
                dot: Some("out/graph.dot".to_string())
            }
        );
        assert_eq!(options.net, "net.json");
        assert_eq!(options.config, "pn.toml");

        let mut config = AnalysisConfig::default();
        options.apply(&mut config);
        assert_eq!(config.state_limit, Some(500));
    }

    #[test]
    fn test_parse_replay() {
        let options = Options::parse_from_args(&[
            "replay".to_owned(),
            "net.ron".to_owned(),
            "log.json".to_owned(),
            "--termination".to_owned(),
            "no-enabled".to_owned(),
            "-o".to_owned(),
            "report.txt".to_owned(),
        ])
        .unwrap();
        assert_eq!(
            options.kind,
            AnalysisKind::Replay {
                traces: "log.json".to_string()
            }
        );
        assert_eq!(options.report.as_deref(), Some("report.txt"));
        assert_eq!(options.termination, Some(TerminationCriteria::NoEnabledTransitions));
    }

    #[test]
    fn test_parse_overlap() {
        let options = Options::parse_from_str("overlap net.json log.json -l 20").unwrap();
        assert_eq!(
            options.kind,
            AnalysisKind::Overlap {
                traces: "log.json".to_string()
            }
        );
        assert_eq!(options.state_limit, Some(20));
        assert!(Options::parse_from_str("overlap net.json log.json -t possible").is_err());
    }

    #[test]
    fn test_no_limit_overrides_config() {
        let options = Options::parse_from_str("mg net.json --no-limit").unwrap();
        let mut config = AnalysisConfig::default();
        options.apply(&mut config);
        assert_eq!(config.state_limit, None);
    }

    #[test]
    fn test_parse_from_str_err() {
        assert!(Options::parse_from_str("replay net.json").is_err());
        assert!(Options::parse_from_str("replay net.json log.json -t sometimes").is_err());
        assert!(Options::parse_from_str("mg net.json --no-limit -l 3").is_err());
        assert!(Options::parse_from_str("").is_err());
    }
}
