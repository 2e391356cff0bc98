use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{u64 as parse_u64, u8 as parse_u8},
    combinator::{all_consuming, opt},
    number::complete::double,
    sequence::{delimited, preceded, separated_pair},
    IResult, Parser as _,
};
use thiserror::Error;
use tracing::trace;

use crate::metric::{EventRecord, MetricKind, MetricUpdate, Sign, Tag};

type NomParserError<'a> = nom::Err<nom::error::Error<&'a [u8]>>;

const EVENT_PREFIX: &[u8] = b"_e";
const EVENT_LENGTHS_PREFIX: &[u8] = b"_e{";
const EVENT_BARE_PREFIX: &[u8] = b"_e:";
const SERVICE_CHECK_PREFIX: &[u8] = b"_sc|";

const TIMESTAMP_PREFIX: &[u8] = b"d:";
const HOSTNAME_PREFIX: &[u8] = b"h:";
const AGGREGATION_KEY_PREFIX: &[u8] = b"k:";
const PRIORITY_PREFIX: &[u8] = b"p:";
const SOURCE_TYPE_PREFIX: &[u8] = b"s:";
const ALERT_TYPE_PREFIX: &[u8] = b"t:";
const SERVICE_CHECK_MESSAGE_PREFIX: &[u8] = b"m:";
const TAGS_PREFIX: u8 = b'#';

const SERVICE_CHECK_STATUSES: [&str; 4] = ["OK", "WARNING", "CRITICAL", "UNKNOWN"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("packet contained no metrics or events")]
    Empty,
    #[error("invalid line '{line}'")]
    InvalidLine {
        line: String,
        #[source]
        source: LineError,
    },
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("malformed line ({0:?})")]
    Structural(nom::error::ErrorKind),
    #[error("unknown metric type '{0}'")]
    UnknownType(String),
    #[error("sample rate {0} is outside (0, 1]")]
    InvalidRate(f64),
    #[error("service check status {0} is outside 0-3")]
    InvalidStatus(u8),
    #[error("metric name is empty after sanitizing")]
    EmptyName,
    #[error("line is not valid UTF-8")]
    Utf8,
}

impl<'a> From<NomParserError<'a>> for LineError {
    fn from(err: NomParserError<'a>) -> Self {
        match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => LineError::Structural(e.code),
            nom::Err::Incomplete(_) => LineError::Structural(nom::error::ErrorKind::Complete),
        }
    }
}

/// Message totals for one packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    /// Lines classified as a metric, event or service check.
    pub messages: u64,
    /// Lines classified as an event or service check.
    pub events: u64,
}

/// Everything decoded from one datagram.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub metrics: Vec<MetricUpdate>,
    pub events: Vec<EventRecord>,
    pub counts: Counts,
}

enum Line {
    Metric(MetricUpdate),
    Event(EventRecord),
}

/// Decodes a newline-delimited statsd/dogstatsd datagram.
///
/// Parsing is all-or-nothing: a single bad line rejects the whole packet, and a packet with nothing in it
/// is rejected as [`ParseError::Empty`].
pub fn parse(packet: &[u8]) -> Result<Batch, ParseError> {
    let mut batch = Batch::default();
    let mut remaining = packet;
    while let Some((raw_line, tail)) = split_at_delimiter(remaining, b'\n') {
        remaining = tail;
        let line = raw_line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(Line::Metric(update)) => {
                batch.counts.messages += 1;
                batch.metrics.push(update);
            }
            Ok(Line::Event(event)) => {
                batch.counts.messages += 1;
                batch.counts.events += 1;
                batch.events.push(event);
            }
            Err(source) => {
                return Err(ParseError::InvalidLine {
                    line: String::from_utf8_lossy(line).into_owned(),
                    source,
                })
            }
        }
    }
    if batch.counts.messages == 0 {
        return Err(ParseError::Empty);
    }
    Ok(batch)
}

fn parse_line(line: &[u8]) -> Result<Line, LineError> {
    if line.starts_with(SERVICE_CHECK_PREFIX) {
        parse_service_check(line).map(Line::Event)
    } else if line.starts_with(EVENT_LENGTHS_PREFIX) || line.starts_with(EVENT_BARE_PREFIX) {
        parse_event(line).map(Line::Event)
    } else {
        parse_metric(line).map(Line::Metric)
    }
}

/// Flattens a client supplied name into a metric identifier.
///
/// Runs of whitespace and every `/` become `_`, a leading `.` is dropped and anything outside
/// `[A-Za-z0-9_.-]` is removed.
pub fn sanitize_name(raw: &str) -> String {
    let mut sanitized = String::with_capacity(raw.len());
    let mut in_whitespace = false;
    for c in raw.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                sanitized.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        if c == '/' {
            sanitized.push('_');
        } else if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            sanitized.push(c);
        }
    }
    match sanitized.strip_prefix('.') {
        Some(stripped) => stripped.to_string(),
        None => sanitized,
    }
}

#[inline]
fn split_at_delimiter(input: &[u8], delimiter: u8) -> Option<(&[u8], &[u8])> {
    match memchr::memchr(delimiter, input) {
        Some(index) => Some((&input[0..index], &input[index + 1..input.len()])),
        None => {
            if input.is_empty() {
                None
            } else {
                Some((input, &[]))
            }
        }
    }
}

fn utf8(input: &[u8]) -> Result<&str, LineError> {
    std::str::from_utf8(input).map_err(|_| LineError::Utf8)
}

fn clean_data(s: &str) -> String {
    s.replace("\\n", "\n")
}

#[inline]
fn metric_head(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (remaining, (name, (value, kind))) = separated_pair(
        take_while1(|c: u8| c != b':'),
        tag(":"),
        separated_pair(
            take_while1(|c: u8| c != b'|'),
            tag("|"),
            take_while1(|c: u8| c != b'|'),
        ),
    )
    .parse(input)?;
    Ok((remaining, (name, value, kind)))
}

#[inline]
fn magnitude(input: &[u8]) -> IResult<&[u8], f64> {
    all_consuming(double).parse(input)
}

#[inline]
fn sample_rate(input: &[u8]) -> IResult<&[u8], f64> {
    all_consuming(preceded(tag("@"), double)).parse(input)
}

#[inline]
fn unix_timestamp(input: &[u8]) -> IResult<&[u8], u64> {
    all_consuming(preceded(tag(TIMESTAMP_PREFIX), parse_u64)).parse(input)
}

#[inline]
fn pipe(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag("|").parse(input)
}

fn parse_metric(line: &[u8]) -> Result<MetricUpdate, LineError> {
    let (remaining, (raw_name, raw_value, raw_kind)) = metric_head(line)?;

    let kind = MetricKind::from_code(raw_kind)
        .ok_or_else(|| LineError::UnknownType(String::from_utf8_lossy(raw_kind).into_owned()))?;

    let name = sanitize_name(utf8(raw_name)?);
    if name.is_empty() {
        return Err(LineError::EmptyName);
    }

    let (sign, raw_magnitude) = match raw_value.first() {
        Some(b'+') => (Some(Sign::Plus), &raw_value[1..]),
        Some(b'-') => (Some(Sign::Minus), &raw_value[1..]),
        _ => (None, raw_value),
    };
    let (_, value) = magnitude(raw_magnitude)?;

    let mut update = MetricUpdate::new(name, value, kind);
    update.sign = sign;

    if !remaining.is_empty() {
        let (mut remaining, _) = pipe(remaining)?;
        while let Some((chunk, tail)) = split_at_delimiter(remaining, b'|') {
            remaining = tail;
            match chunk.first() {
                Some(b'@') => {
                    let (_, rate) = sample_rate(chunk)?;
                    if !(rate > 0.0 && rate <= 1.0) {
                        return Err(LineError::InvalidRate(rate));
                    }
                    update.rate = Some(rate);
                }
                Some(&TAGS_PREFIX) => {
                    for tag in parse_tags(&chunk[1..])? {
                        apply_metric_tag(&mut update, tag);
                    }
                }
                _ => {
                    trace!(chunk = %String::from_utf8_lossy(chunk), "Skipping unknown metric extension.");
                }
            }
        }
    }

    Ok(update)
}

fn parse_tags(input: &[u8]) -> Result<Vec<Tag>, LineError> {
    let raw_tags = utf8(input)?;
    Ok(raw_tags
        .split(',')
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| match raw.split_once(':') {
            Some((key, value)) => Tag::pair(key, value),
            None => Tag::new(raw, None),
        })
        .collect())
}

enum ReservedTag {
    Unit,
    SparseDataStrategy,
    ElementType,
    AppVersion,
    Host,
}

fn reserved_tag(key: &str) -> Option<ReservedTag> {
    match key {
        "un" => Some(ReservedTag::Unit),
        "sds" => Some(ReservedTag::SparseDataStrategy),
        "ty" => Some(ReservedTag::ElementType),
        "v" => Some(ReservedTag::AppVersion),
        "h" => Some(ReservedTag::Host),
        _ => None,
    }
}

fn apply_metric_tag(update: &mut MetricUpdate, tag: Tag) {
    match (reserved_tag(&tag.key), tag.value) {
        (Some(ReservedTag::Unit), Some(value)) => update.unit = Some(value),
        (Some(ReservedTag::SparseDataStrategy), Some(value)) => {
            update.sparse_data_strategy = Some(value)
        }
        (Some(ReservedTag::ElementType), Some(value)) => update.element_type = Some(value),
        (Some(ReservedTag::AppVersion), Some(value)) => update.app_version = Some(value),
        (Some(ReservedTag::Host), Some(value)) => update.element_id = Some(value),
        (_, value) => update.tags.push(Tag {
            key: tag.key,
            value,
        }),
    }
}

#[inline]
fn event_head(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    // The `{<title len>,<text len>}` block is accepted but the lengths are not checked.
    let (remaining, _) = (
        tag(EVENT_PREFIX),
        opt(delimited(tag("{"), take_while(|c: u8| c != b'}'), tag("}"))),
        tag(":"),
    )
        .parse(input)?;
    separated_pair(
        take_while1(|c: u8| c != b'|'),
        tag("|"),
        take_while(|c: u8| c != b'|'),
    )
    .parse(remaining)
}

fn parse_event(line: &[u8]) -> Result<EventRecord, LineError> {
    let (remaining, (raw_title, raw_text)) = event_head(line)?;

    let mut event = EventRecord {
        title: clean_data(utf8(raw_title)?),
        text: clean_data(utf8(raw_text)?),
        ..Default::default()
    };

    if !remaining.is_empty() {
        let (mut remaining, _) = pipe(remaining)?;
        while let Some((chunk, tail)) = split_at_delimiter(remaining, b'|') {
            remaining = tail;
            if chunk.first() == Some(&TAGS_PREFIX) {
                event.tags.extend(parse_tags(&chunk[1..])?);
                continue;
            }
            if chunk.len() < 2 {
                continue;
            }
            let value = || utf8(&chunk[2..]).map(str::to_string);
            match &chunk[..2] {
                TIMESTAMP_PREFIX => {
                    let (_, timestamp) = unix_timestamp(chunk)?;
                    event.date_happened = Some(timestamp);
                }
                HOSTNAME_PREFIX => event.hostname = Some(value()?),
                AGGREGATION_KEY_PREFIX => event.aggregation_key = Some(value()?),
                PRIORITY_PREFIX => event.priority = Some(value()?),
                SOURCE_TYPE_PREFIX => event.source_type_name = Some(value()?),
                ALERT_TYPE_PREFIX => event.alert_type = Some(value()?),
                _ => {
                    trace!(chunk = %String::from_utf8_lossy(chunk), "Skipping unknown event extension.");
                }
            }
        }
    }

    Ok(event)
}

#[inline]
fn service_check_head(input: &[u8]) -> IResult<&[u8], (&[u8], u8)> {
    preceded(
        tag(SERVICE_CHECK_PREFIX),
        separated_pair(take_while1(|c: u8| c != b'|'), tag("|"), parse_u8),
    )
    .parse(input)
}

fn parse_service_check(line: &[u8]) -> Result<EventRecord, LineError> {
    let (remaining, (raw_name, status)) = service_check_head(line)?;
    let level = SERVICE_CHECK_STATUSES
        .get(status as usize)
        .ok_or(LineError::InvalidStatus(status))?;

    let mut event = EventRecord {
        title: utf8(raw_name)?.to_string(),
        priority: Some(level.to_string()),
        ..Default::default()
    };

    if !remaining.is_empty() {
        let (mut remaining, _) = pipe(remaining)?;
        while let Some((chunk, tail)) = split_at_delimiter(remaining, b'|') {
            remaining = tail;
            if chunk.first() == Some(&TAGS_PREFIX) {
                event.tags.extend(parse_tags(&chunk[1..])?);
                continue;
            }
            if chunk.len() < 2 {
                continue;
            }
            match &chunk[..2] {
                TIMESTAMP_PREFIX => {
                    let (_, timestamp) = unix_timestamp(chunk)?;
                    event.date_happened = Some(timestamp);
                }
                HOSTNAME_PREFIX => event.hostname = Some(utf8(&chunk[2..])?.to_string()),
                SERVICE_CHECK_MESSAGE_PREFIX => event.text = clean_data(utf8(&chunk[2..])?),
                _ => {
                    trace!(chunk = %String::from_utf8_lossy(chunk), "Skipping unknown service check extension.");
                }
            }
        }
    }

    Ok(event)
}
