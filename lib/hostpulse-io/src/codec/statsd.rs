//! statsd wire codec.
//!
//! Each line of a datagram carries one sample:
//!
//! ```text
//! <name>:<value>|<c|g|s|ms|h>[|@<sample rate>][|#<tag>,<tag>...]
//! ```
//!
//! Histograms (`h`) are treated as timers. Gauge values with a leading sign (`+` or `-`) are deltas against the current
//! value rather than replacements. Set members are arbitrary strings. Unrecognized `|`-separated extensions are
//! ignored.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    combinator::{all_consuming, map},
    error::{Error, ErrorKind},
    number::complete::double,
    sequence::{preceded, separated_pair, terminated},
    IResult, Parser as _,
};
use snafu::Snafu;

/// A statsd parse error.
#[derive(Debug, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ParseError {
    /// The line did not match the statsd grammar.
    #[snafu(display("Malformed statsd line '{}': {}.", line, reason))]
    Malformed {
        /// The offending line.
        line: String,

        /// What the parser could not match.
        reason: String,
    },

    /// The value could not be parsed for the given metric type.
    #[snafu(display("Invalid value '{}' in statsd line '{}'.", value, line))]
    InvalidValue {
        /// The offending line.
        line: String,

        /// The raw value.
        value: String,
    },

    /// The sample rate was outside of `(0, 1]`.
    #[snafu(display("Invalid sample rate {} in statsd line '{}'.", rate, line))]
    InvalidSampleRate {
        /// The offending line.
        line: String,

        /// The raw sample rate.
        rate: f64,
    },
}

/// The value carried by a statsd sample.
#[derive(Clone, Debug, PartialEq)]
pub enum StatsdValue {
    /// Counter increment.
    Counter(f64),

    /// Gauge value, or a delta against the current value when `relative` is set.
    Gauge {
        /// The value, or the delta.
        value: f64,

        /// Whether the wire value was signed.
        relative: bool,
    },

    /// Set member.
    Set(String),

    /// Timer sample.
    Timer(f64),
}

/// A single parsed statsd sample.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsdSample {
    /// Metric name.
    pub name: String,

    /// Sample value.
    pub value: StatsdValue,

    /// Client-side sample rate, if any.
    pub sample_rate: Option<f64>,

    /// Tags, as sent.
    pub tags: Vec<String>,
}

#[derive(Clone, Copy)]
enum RawKind {
    Counter,
    Gauge,
    Set,
    Timer,
}

struct RawSample<'a> {
    name: &'a str,
    kind: RawKind,
    value: &'a str,
    sample_rate: Option<f64>,
    tags: Vec<&'a str>,
}

/// Parses every line of a statsd datagram.
///
/// Empty lines are skipped. Each remaining line yields either a sample or the error for that line alone.
pub fn parse_statsd_packet(packet: &[u8]) -> impl Iterator<Item = Result<StatsdSample, ParseError>> + '_ {
    Lines { remaining: packet }.map(parse_statsd_line)
}

/// Parses a single statsd line.
///
/// # Errors
///
/// If the line does not match the statsd grammar, or its value or sample rate is invalid, an error is returned.
pub fn parse_statsd_line(line: &[u8]) -> Result<StatsdSample, ParseError> {
    let raw = match all_consuming(statsd_line).parse(line) {
        Ok((_, raw)) => raw,
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            return Err(ParseError::Malformed {
                line: String::from_utf8_lossy(line).into_owned(),
                reason: describe_error(line, &e),
            })
        }
        Err(nom::Err::Incomplete(_)) => {
            return Err(ParseError::Malformed {
                line: String::from_utf8_lossy(line).into_owned(),
                reason: "unexpected end of line".to_string(),
            })
        }
    };

    if let Some(rate) = raw.sample_rate {
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ParseError::InvalidSampleRate {
                line: String::from_utf8_lossy(line).into_owned(),
                rate,
            });
        }
    }

    let invalid_value = || ParseError::InvalidValue {
        line: String::from_utf8_lossy(line).into_owned(),
        value: raw.value.to_string(),
    };

    let value = match raw.kind {
        RawKind::Counter => StatsdValue::Counter(finite_value(raw.value).ok_or_else(invalid_value)?),
        RawKind::Timer => StatsdValue::Timer(finite_value(raw.value).ok_or_else(invalid_value)?),
        RawKind::Gauge => StatsdValue::Gauge {
            value: finite_value(raw.value).ok_or_else(invalid_value)?,
            relative: raw.value.starts_with(['+', '-']),
        },
        RawKind::Set => StatsdValue::Set(raw.value.to_string()),
    };

    Ok(StatsdSample {
        name: raw.name.to_string(),
        value,
        sample_rate: raw.sample_rate,
        tags: raw.tags.into_iter().map(str::to_string).collect(),
    })
}

/// Parses a numeric value, rejecting the NaN and infinity spellings that `f64::from_str` accepts.
fn finite_value(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn describe_error(line: &[u8], e: &Error<&[u8]>) -> String {
    let offset = (e.input.as_ptr() as usize).saturating_sub(line.as_ptr() as usize);
    let expected = match e.code {
        ErrorKind::TakeWhile1 if offset == 0 => "expected a metric name",
        ErrorKind::TakeWhile1 => "expected a value",
        ErrorKind::Tag => "expected ':' after the name, '|' after the value, or a metric type",
        ErrorKind::Float => "expected a numeric sample rate",
        ErrorKind::Eof => "unexpected trailing data",
        _ => "unrecognized input",
    };
    format!("{} at offset {}", expected, offset)
}

fn statsd_line(input: &[u8]) -> IResult<&[u8], RawSample<'_>> {
    let (remaining, (name, (value, kind))) = separated_pair(metric_name, tag(":"), value_and_kind).parse(input)?;

    let mut sample = RawSample {
        name,
        kind,
        value,
        sample_rate: None,
        tags: Vec::new(),
    };

    let mut remaining = remaining;
    while !remaining.is_empty() {
        let (tail, _) = tag("|")(remaining)?;
        let end = memchr::memchr(b'|', tail).unwrap_or(tail.len());
        let (chunk, tail) = tail.split_at(end);

        match chunk.first() {
            Some(b'@') => {
                let (_, rate) = all_consuming(preceded(tag("@"), double)).parse(chunk)?;
                sample.sample_rate = Some(rate);
            }
            Some(b'#') => {
                let (_, tags) = all_consuming(preceded(tag("#"), utf8)).parse(chunk)?;
                sample.tags = tags.split(',').filter(|tag| !tag.is_empty()).collect();
            }
            _ => {}
        }

        remaining = tail;
    }

    Ok((remaining, sample))
}

fn metric_name(input: &[u8]) -> IResult<&[u8], &str> {
    // Any printable ASCII other than the separators.
    let valid_char = |c: u8| c > 31 && c < 127 && c != b':' && c != b'|';
    map(take_while1(valid_char), |b| {
        // SAFETY: `b` only contains printable ASCII, which is valid UTF-8.
        unsafe { std::str::from_utf8_unchecked(b) }
    })
    .parse(input)
}

fn value_and_kind(input: &[u8]) -> IResult<&[u8], (&str, RawKind)> {
    let (remaining, raw_value) = terminated(take_while1(|b| b != b'|'), tag("|")).parse(input)?;
    let (_, value) = utf8(raw_value)?;

    let (remaining, kind) = alt((
        map(tag("ms"), |_| RawKind::Timer),
        map(tag("c"), |_| RawKind::Counter),
        map(tag("g"), |_| RawKind::Gauge),
        map(tag("s"), |_| RawKind::Set),
        map(tag("h"), |_| RawKind::Timer),
    ))
    .parse(remaining)?;

    // The type must be followed by an extension or nothing at all, so `|cx` is not read as a counter.
    if !remaining.is_empty() && remaining[0] != b'|' {
        return Err(nom::Err::Error(Error::new(remaining, ErrorKind::Tag)));
    }

    Ok((remaining, (value, kind)))
}

fn utf8(input: &[u8]) -> IResult<&[u8], &str> {
    match simdutf8::basic::from_utf8(input) {
        Ok(s) => Ok((&input[input.len()..], s)),
        Err(_) => Err(nom::Err::Error(Error::new(input, ErrorKind::Verify))),
    }
}

struct Lines<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while !self.remaining.is_empty() {
            let (line, tail) = match memchr::memchr(b'\n', self.remaining) {
                Some(idx) => (&self.remaining[..idx], &self.remaining[idx + 1..]),
                None => (self.remaining, &self.remaining[self.remaining.len()..]),
            };
            self.remaining = tail;

            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn parse(line: &str) -> Result<StatsdSample, ParseError> {
        parse_statsd_line(line.as_bytes())
    }

    #[test]
    fn counter() {
        let sample = parse("requests:5|c").unwrap();
        assert_eq!(sample.name, "requests");
        assert_eq!(sample.value, StatsdValue::Counter(5.0));
        assert_eq!(sample.sample_rate, None);
        assert!(sample.tags.is_empty());
    }

    #[test]
    fn counter_with_rate_and_tags() {
        let sample = parse("requests:1|c|@0.1|#env:prod,az:b").unwrap();
        assert_eq!(sample.value, StatsdValue::Counter(1.0));
        assert_eq!(sample.sample_rate, Some(0.1));
        assert_eq!(sample.tags, vec!["env:prod".to_string(), "az:b".to_string()]);
    }

    #[test]
    fn gauges() {
        assert_eq!(
            parse("temp:21.5|g").unwrap().value,
            StatsdValue::Gauge {
                value: 21.5,
                relative: false
            }
        );
        assert_eq!(
            parse("temp:+2|g").unwrap().value,
            StatsdValue::Gauge {
                value: 2.0,
                relative: true
            }
        );
        assert_eq!(
            parse("temp:-3|g").unwrap().value,
            StatsdValue::Gauge {
                value: -3.0,
                relative: true
            }
        );
    }

    #[test]
    fn sets_keep_raw_members() {
        assert_eq!(
            parse("users:alice@example.com|s").unwrap().value,
            StatsdValue::Set("alice@example.com".to_string())
        );
    }

    #[test]
    fn timers_and_histograms() {
        assert_eq!(parse("db.query:12.5|ms").unwrap().value, StatsdValue::Timer(12.5));
        assert_eq!(parse("db.query:7|h").unwrap().value, StatsdValue::Timer(7.0));
    }

    #[test]
    fn unknown_extensions_are_ignored() {
        let sample = parse("requests:1|c|T1700000000|#env:prod").unwrap();
        assert_eq!(sample.tags, vec!["env:prod".to_string()]);
    }

    #[test]
    fn malformed_lines() {
        for line in [
            "",
            "requests",
            "requests:",
            ":5|c",
            "requests:5",
            "requests:5|",
            "requests:5|x",
            "requests:5|cx",
            "requests:5|c|@fast",
        ] {
            assert!(
                matches!(parse(line), Err(ParseError::Malformed { .. })),
                "expected '{}' to be malformed",
                line
            );
        }
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(parse("requests:five|c"), Err(ParseError::InvalidValue { .. })));
        assert!(matches!(parse("requests:1:2|c"), Err(ParseError::InvalidValue { .. })));
        assert!(matches!(parse("temp:warm|g"), Err(ParseError::InvalidValue { .. })));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        for line in [
            "temp:nan|g",
            "temp:NaN|g",
            "requests:inf|c",
            "requests:-infinity|c",
            "latency:+inf|ms",
            "latency:1e309|ms",
        ] {
            assert!(
                matches!(parse(line), Err(ParseError::InvalidValue { .. })),
                "{} should be rejected",
                line
            );
        }
        assert!(parse("temp:-1e308|g").is_ok());
    }

    #[test]
    fn invalid_utf8_in_value_is_malformed() {
        assert!(parse_statsd_line(b"requests:\xff|c").is_err());
        assert!(parse_statsd_line(b"requests:1|c|#env:\xfe").is_err());
    }

    #[test]
    fn invalid_sample_rates() {
        assert!(matches!(parse("requests:1|c|@0"), Err(ParseError::InvalidSampleRate { .. })));
        assert!(matches!(parse("requests:1|c|@1.5"), Err(ParseError::InvalidSampleRate { .. })));
        assert!(parse("requests:1|c|@1").is_ok());
    }

    #[test]
    fn packet_lines_are_independent() {
        let packet = b"a:1|c\nbogus\r\n\nb:2|g\r\n";
        let results = parse_statsd_packet(packet).collect::<Vec<_>>();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().name, "a");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().name, "b");
    }

    proptest! {
        #[test]
        fn property_test_never_panics(input in any::<Vec<u8>>()) {
            for _ in parse_statsd_packet(&input) {}
        }

        #[test]
        fn property_test_counters(name in "[a-z][a-z0-9_.]{0,20}", value in -1.0e9f64..1.0e9f64) {
            let line = format!("{}:{}|c", name, value);
            let sample = parse_statsd_line(line.as_bytes()).unwrap();

            prop_assert_eq!(sample.name, name);
            prop_assert_eq!(sample.value, StatsdValue::Counter(value));
        }
    }
}
