use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::warn;

use crate::wire::{Role, SessionKey};

use super::types::{Direction, MetricSample};

static INTERVAL_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*\[\s*(?P<id>\d+|SUM)\s*\](?:\[(?P<tag>TX-C|RX-C|TX-S|RX-S)\])?\s+(?P<start>[\d.,]+)\s*-\s*(?P<end>[\d.,]+)\s+sec\s+[\d.,]+\s*[KMGT]?Bytes\s+(?P<rate>[\d.,]+)\s*(?P<unit>[KMGT]?)bits/sec(?P<tail>.*)$",
    )
    .ok()
});

static UDP_TAIL_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?P<jitter>[\d.,]+)\s*ms\s+(?P<lost>\d+)\s*/\s*(?P<total>\d+)\s*\(\s*(?P<pct>[^)%]*)%\s*\)",
    )
    .ok()
});

/// What the parser needs to know about the session a line came from.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext {
    pub session: SessionKey,
    pub reverse: bool,
    pub parallel: u32,
    pub timestamp_ms: u64,
}

/// One interval line. `aggregate` marks a `[SUM]` line over parallel streams.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalLine {
    pub sample: MetricSample,
    pub aggregate: bool,
}

impl ParseContext {
    /// Whether a session keeps `line` as a live sample.
    ///
    /// A client knows its stream count, so it keeps either the per-stream
    /// lines or the `[SUM]` lines. A server does not, so it keeps both and
    /// lets the sum replace the streams of its interval.
    #[must_use]
    pub const fn keeps(&self, line: &IntervalLine) -> bool {
        match self.session.role {
            Role::Client => line.aggregate == (self.parallel > 1),
            Role::Server => true,
        }
    }
}

/// Maps one line of generator output to at most one interval sample.
///
/// Banner, header, and final summary lines yield `None`, as do the lines a
/// session does not keep (see [`ParseContext::keeps`]).
#[must_use]
pub fn parse_line(line: &str, context: &ParseContext) -> Option<MetricSample> {
    parse_interval(line, context)
        .filter(|parsed| context.keeps(parsed))
        .map(|parsed| parsed.sample)
}

/// Parses any interval line, per-stream or `[SUM]`.
///
/// A line with the interval shape but an unreadable number is logged and
/// yields `None`.
#[must_use]
pub fn parse_interval(line: &str, context: &ParseContext) -> Option<IntervalLine> {
    let captures = INTERVAL_RE.as_ref()?.captures(line)?;
    let tail = captures.name("tail").map_or("", |value| value.as_str());
    if is_final_summary(tail) {
        return None;
    }

    let aggregate = captures
        .name("id")
        .is_some_and(|value| value.as_str().eq_ignore_ascii_case("SUM"));
    let sample = build_sample(&captures, tail, context).or_else(|| {
        warn!(
            "Skipping malformed interval line for {}: {}",
            context.session,
            line.trim()
        );
        None
    })?;
    Some(IntervalLine { sample, aggregate })
}

fn build_sample(captures: &Captures<'_>, tail: &str, context: &ParseContext) -> Option<MetricSample> {
    let interval_start = parse_decimal(captures.name("start")?.as_str())?;
    let interval_end = parse_decimal(captures.name("end")?.as_str())?;
    let rate = parse_decimal(captures.name("rate")?.as_str())?;
    let unit = captures.name("unit").map_or("", |value| value.as_str());
    let mbps = to_mbps(rate, unit);

    let (jitter_ms, loss_pct) = match UDP_TAIL_RE.as_ref().and_then(|re| re.captures(tail)) {
        Some(udp) => {
            let jitter = parse_decimal(udp.name("jitter")?.as_str())?;
            (Some(jitter), Some(loss_percent(&udp)?))
        }
        None => (None, None),
    };

    let tag = captures.name("tag").map(|value| value.as_str());
    let direction = resolve_direction(tag, tail, context);
    let (up_mbps, down_mbps) = match direction {
        Direction::Upload => (Some(mbps), None),
        Direction::Download => (None, Some(mbps)),
    };

    Some(MetricSample {
        session: context.session,
        timestamp_ms: context.timestamp_ms,
        interval_start,
        interval_end,
        up_mbps,
        down_mbps,
        jitter_ms,
        loss_pct,
    })
}

fn is_final_summary(tail: &str) -> bool {
    matches!(
        tail.split_whitespace().last(),
        Some("sender" | "receiver")
    )
}

fn resolve_direction(tag: Option<&str>, tail: &str, context: &ParseContext) -> Direction {
    match tag.map(str::to_ascii_uppercase).as_deref() {
        Some("TX-C" | "RX-S") => Direction::Upload,
        Some("RX-C" | "TX-S") => Direction::Download,
        _ => match context.session.role {
            Role::Client if context.reverse => Direction::Download,
            Role::Client => Direction::Upload,
            Role::Server if is_sender_tail(tail) => Direction::Download,
            Role::Server => Direction::Upload,
        },
    }
}

/// Sender lines carry a retransmit (TCP) or datagram (UDP) count right after
/// the bitrate; receiver lines carry nothing or the UDP jitter.
fn is_sender_tail(tail: &str) -> bool {
    tail.split_whitespace()
        .next()
        .is_some_and(|token| token.bytes().all(|byte| byte.is_ascii_digit()))
}

fn loss_percent(udp: &Captures<'_>) -> Option<f64> {
    let lost = udp.name("lost")?.as_str().parse::<u64>().ok()?;
    let total = udp.name("total")?.as_str().parse::<u64>().ok()?;
    if total == 0 {
        return udp
            .name("pct")
            .and_then(|value| parse_decimal(value.as_str()))
            .or(Some(0.0));
    }
    let lost = u32::try_from(lost).ok().map(f64::from)?;
    let total = u32::try_from(total).ok().map(f64::from)?;
    Some(lost * 100.0 / total)
}

fn parse_decimal(raw: &str) -> Option<f64> {
    let value = raw.trim().replace(',', ".").parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

/// Normalises a `<prefix>bits/sec` value to Mbps.
#[must_use]
pub fn to_mbps(value: f64, prefix: &str) -> f64 {
    match prefix.to_ascii_uppercase().as_str() {
        "K" => value / 1_000.0,
        "M" => value,
        "G" => value * 1_000.0,
        "T" => value * 1_000_000.0,
        _ => value / 1_000_000.0,
    }
}
