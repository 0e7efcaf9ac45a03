//! 公共模块
//!
//! 提供跨模块使用的通用组件

pub mod metrics;

pub use metrics::{MetricsAggregator, PerformanceSnapshot};
