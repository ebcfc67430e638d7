use std::iter::FusedIterator;

use crate::config::ParserConfig;
use crate::event::Event;
use crate::protocol::{Metric, MetricType, MetricValue, Tags};

/// Prefix of an event line.
const EVENT_PREFIX: &str = "_e{";

/// Prefix of a service check line.
const SERVICE_CHECK_PREFIX: &str = "_sc|";

/// An error returned when a single line cannot be parsed.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// The line is not valid UTF-8.
    #[error("line is not valid utf-8")]
    InvalidUtf8,
    /// The line does not contain a `name:value` pair.
    #[error("missing value separator")]
    MissingValue,
    /// The metric name is empty.
    #[error("empty metric name")]
    EmptyName,
    /// The line does not specify a metric type.
    #[error("missing metric type")]
    MissingType,
    /// The metric type shortcode is not known.
    #[error("unknown metric type `{0}`")]
    UnknownType(String),
    /// The value is not a finite number.
    #[error("invalid metric value `{0}`")]
    InvalidValue(String),
    /// Counters must not be decremented.
    #[error("negative counter value")]
    NegativeCounter,
    /// The sample rate is not a number in `(0, 1]`.
    #[error("invalid sample rate `{0}`")]
    InvalidSampleRate(String),
    /// The event header or one of its fields is malformed.
    #[error("invalid event: {0}")]
    InvalidEvent(&'static str),
    /// Service checks are not supported.
    #[error("service checks are not supported")]
    ServiceCheck,
}

impl ParseError {
    /// Returns a short name of the error kind, used to tag internal metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MissingValue => "missing_value",
            Self::EmptyName => "empty_name",
            Self::MissingType => "missing_type",
            Self::UnknownType(_) => "unknown_type",
            Self::InvalidValue(_) => "invalid_value",
            Self::NegativeCounter => "negative_counter",
            Self::InvalidSampleRate(_) => "invalid_sample_rate",
            Self::InvalidEvent(_) => "invalid_event",
            Self::ServiceCheck => "service_check",
        }
    }
}

/// A record produced by the [`Parser`].
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    /// A metric data point.
    Metric(Metric),
    /// An event.
    Event(Event),
}

/// Parses the statsd line protocol.
///
/// A metric line has the form:
///
/// ```text
/// <name>:<value>|<type>[|@<sample_rate>][|#<tag1>,<tag2>:<value>]
/// ```
///
/// An event line has the form:
///
/// ```text
/// _e{<title_len>,<text_len>}:<title>|<text>[|d:<ts>][|h:<host>][|p:<prio>][|t:<alert>][|k:<key>][|s:<source>][|#<tags>]
/// ```
///
/// The parser is stateless. It applies the configured namespace and default tags and tags
/// metrics with the host they were received from.
#[derive(Clone, Debug, Default)]
pub struct Parser {
    namespace: Option<String>,
    default_tags: Vec<String>,
    ignore_host: bool,
    estimated_tags: usize,
}

impl Parser {
    /// Creates a parser from its configuration.
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            namespace: config.namespace.clone().filter(|ns| !ns.is_empty()),
            default_tags: config.default_tags.clone(),
            ignore_host: config.ignore_host,
            estimated_tags: config.estimated_tags,
        }
    }

    /// Parses a single line without line terminators.
    ///
    /// # Example
    ///
    /// ```
    /// use tally_metrics::{MetricValue, Parser, Record};
    ///
    /// let parser = Parser::default();
    /// let Ok(Record::Metric(metric)) = parser.parse_line("requests:1|c|#route:home", None) else {
    ///     panic!("metric should parse");
    /// };
    /// assert_eq!(metric.value, MetricValue::Counter(1.0));
    /// ```
    pub fn parse_line(&self, line: &str, source: Option<&str>) -> Result<Record, ParseError> {
        if line.starts_with(EVENT_PREFIX) {
            self.parse_event(line, source).map(Record::Event)
        } else if line.starts_with(SERVICE_CHECK_PREFIX) {
            Err(ParseError::ServiceCheck)
        } else {
            self.parse_metric(line, source).map(Record::Metric)
        }
    }

    /// Parses a buffer of newline separated lines.
    ///
    /// Returns a result for each line in `slice`, ignoring empty lines. Both UNIX newlines (`\n`)
    /// and Windows newlines (`\r\n`) are supported. It is possible to continue consuming the
    /// iterator after `Err` is yielded.
    ///
    /// # Example
    ///
    /// ```
    /// use tally_metrics::Parser;
    ///
    /// let data = b"foo.bar:1|c\nnot-a-metric\nfoo.gauge:5|g\n";
    ///
    /// let results: Vec<_> = Parser::default().parse_all(data, Some("10.0.0.1")).collect();
    /// assert_eq!(results.len(), 3);
    /// assert!(results[1].is_err());
    /// ```
    pub fn parse_all<'a>(&'a self, slice: &'a [u8], source: Option<&'a str>) -> ParseLines<'a> {
        ParseLines {
            parser: self,
            slice,
            source,
        }
    }

    fn parse_metric(&self, line: &str, source: Option<&str>) -> Result<Metric, ParseError> {
        let mut components = line.split('|');

        let (name, value) = components
            .next()
            .and_then(|pair| pair.split_once(':'))
            .ok_or(ParseError::MissingValue)?;

        if name.is_empty() {
            return Err(ParseError::EmptyName);
        }

        let ty = match components.next() {
            Some("") | None => return Err(ParseError::MissingType),
            Some(ty) => ty
                .parse::<MetricType>()
                .map_err(|_| ParseError::UnknownType(ty.to_owned()))?,
        };

        let value = parse_value(ty, value)?;

        let mut sample_rate = 1.0;
        let mut tags = Tags::with_capacity(self.estimated_tags + self.default_tags.len() + 1);

        for component in components {
            if let Some(rate) = component.strip_prefix('@') {
                sample_rate = rate
                    .parse::<f64>()
                    .ok()
                    .filter(|rate| *rate > 0.0 && *rate <= 1.0)
                    .ok_or_else(|| ParseError::InvalidSampleRate(rate.to_owned()))?;
            } else if let Some(list) = component.strip_prefix('#') {
                tags.extend(parse_tags(list));
            }
        }

        self.finish_tags(&mut tags, source);

        let name = match &self.namespace {
            Some(namespace) => format!("{namespace}.{name}"),
            None => name.to_owned(),
        };

        Ok(Metric {
            name,
            value,
            sample_rate,
            tags,
            source: source.map(str::to_owned),
        })
    }

    fn parse_event(&self, line: &str, source: Option<&str>) -> Result<Event, ParseError> {
        let header = &line[EVENT_PREFIX.len()..];
        let (lengths, rest) = header
            .split_once("}:")
            .ok_or(ParseError::InvalidEvent("missing header terminator"))?;
        let (title_len, text_len) = lengths
            .split_once(',')
            .ok_or(ParseError::InvalidEvent("missing length separator"))?;

        let title_len: usize = title_len
            .parse()
            .map_err(|_| ParseError::InvalidEvent("invalid title length"))?;
        let text_len: usize = text_len
            .parse()
            .map_err(|_| ParseError::InvalidEvent("invalid text length"))?;

        if title_len == 0 {
            return Err(ParseError::InvalidEvent("empty title"));
        }

        let title = rest
            .get(..title_len)
            .ok_or(ParseError::InvalidEvent("title length mismatch"))?;
        let rest = rest
            .get(title_len..)
            .and_then(|rest| rest.strip_prefix('|'))
            .ok_or(ParseError::InvalidEvent("title length mismatch"))?;
        let text = rest
            .get(..text_len)
            .ok_or(ParseError::InvalidEvent("text length mismatch"))?;
        let rest = rest
            .get(text_len..)
            .ok_or(ParseError::InvalidEvent("text length mismatch"))?;

        if !rest.is_empty() && !rest.starts_with('|') {
            return Err(ParseError::InvalidEvent("text length mismatch"));
        }

        let mut event = Event::new(title, text.replace("\\n", "\n"));
        let mut tags = Tags::with_capacity(self.estimated_tags + self.default_tags.len());

        for field in rest.split('|').skip(1) {
            if let Some(list) = field.strip_prefix('#') {
                tags.extend(parse_tags(list));
                continue;
            }

            let Some((key, value)) = field.split_once(':') else {
                continue;
            };

            match key {
                "d" => {
                    let timestamp = value
                        .parse()
                        .map_err(|_| ParseError::InvalidEvent("invalid timestamp"))?;
                    event.timestamp = Some(timestamp);
                }
                "h" => event.hostname = Some(value.to_owned()),
                "p" => {
                    event.priority = value
                        .parse()
                        .map_err(|_| ParseError::InvalidEvent("invalid priority"))?;
                }
                "t" => {
                    event.alert_type = value
                        .parse()
                        .map_err(|_| ParseError::InvalidEvent("invalid alert type"))?;
                }
                "k" => event.aggregation_key = Some(value.to_owned()),
                "s" => event.source_type_name = Some(value.to_owned()),
                _ => (),
            }
        }

        tags.extend(self.default_tags.iter().cloned());
        event.tags = tags;

        if event.hostname.is_none() && !self.ignore_host {
            event.hostname = source.map(str::to_owned);
        }
        event.source = source.map(str::to_owned);

        Ok(event)
    }

    /// Merges default tags and adds the host tag unless one is present.
    fn finish_tags(&self, tags: &mut Tags, source: Option<&str>) {
        tags.extend(self.default_tags.iter().cloned());

        if self.ignore_host {
            return;
        }

        if let Some(source) = source
            && !tags.has_key("host")
        {
            tags.insert(format!("host:{source}"));
        }
    }
}

fn parse_value(ty: MetricType, value: &str) -> Result<MetricValue, ParseError> {
    if ty == MetricType::Set {
        return Ok(MetricValue::Set(value.to_owned()));
    }

    let number = value
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
        .ok_or_else(|| ParseError::InvalidValue(value.to_owned()))?;

    Ok(match ty {
        MetricType::Counter if number < 0.0 => return Err(ParseError::NegativeCounter),
        MetricType::Counter => MetricValue::Counter(number),
        MetricType::Gauge => MetricValue::Gauge(number),
        MetricType::Timer => MetricValue::Timer(number),
        MetricType::Set => MetricValue::Set(value.to_owned()),
    })
}

/// Parses tags in the format `tag1,tag2:value`, skipping empty tags.
fn parse_tags(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
}

/// Iterator over parsed lines returned from [`Parser::parse_all`].
#[derive(Clone, Debug)]
pub struct ParseLines<'a> {
    parser: &'a Parser,
    slice: &'a [u8],
    source: Option<&'a str>,
}

impl Iterator for ParseLines<'_> {
    type Item = Result<Record, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.slice.is_empty() {
                return None;
            }

            let mut split = self.slice.splitn(2, |&b| b == b'\n');
            let current = split.next()?;
            self.slice = split.next().unwrap_or_default();

            let line = match std::str::from_utf8(current) {
                Ok(line) => line.strip_suffix('\r').unwrap_or(line),
                Err(_) => return Some(Err(ParseError::InvalidUtf8)),
            };

            if !line.is_empty() {
                return Some(self.parser.parse_line(line, self.source));
            }
        }
    }
}

impl FusedIterator for ParseLines<'_> {}
