//! Petri 网分析: 令牌语义与发生规则、标识图构造、日志回放, 以及在后台线程池上
//! 运行这些分析的可取消计算框架.
pub mod analysis;
pub mod config;
pub mod generator;
pub mod net;
pub mod options;
pub mod report;
pub mod threaded;
