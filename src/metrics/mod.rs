//! Interval metrics produced by traffic-generator sessions.
mod parser;
mod types;


pub use parser::{IntervalLine, ParseContext, parse_interval, parse_line, to_mbps};
pub use types::{Direction, MetricSample};
