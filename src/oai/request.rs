//! Request parsing: verb dispatch table and argument validation.

use super::error::OaiError;
use crate::types::Timestamp;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use std::collections::BTreeMap;

/// The only metadata format served.
pub const METADATA_PREFIX: &str = "marc21";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Identify,
    ListMetadataFormats,
    ListSets,
    ListRecords,
}

impl Verb {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Identify" => Some(Verb::Identify),
            "ListMetadataFormats" => Some(Verb::ListMetadataFormats),
            "ListSets" => Some(Verb::ListSets),
            "ListRecords" => Some(Verb::ListRecords),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Identify => "Identify",
            Verb::ListMetadataFormats => "ListMetadataFormats",
            Verb::ListSets => "ListSets",
            Verb::ListRecords => "ListRecords",
        }
    }

    /// Arguments accepted besides `verb`.
    pub fn arguments(&self) -> &'static [&'static str] {
        match self {
            Verb::Identify => &[],
            Verb::ListMetadataFormats => &["identifier"],
            Verb::ListSets => &["resumptionToken"],
            Verb::ListRecords => &["from", "until", "set", "resumptionToken", "metadataPrefix"],
        }
    }
}

/// A request with a known verb and only that verb's arguments, each at most
/// once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OaiRequest {
    pub verb: Verb,
    arguments: BTreeMap<String, String>,
}

impl OaiRequest {
    /// Find the verb. A missing, repeated or unknown verb is `badVerb`.
    pub fn verb(params: &[(String, String)]) -> Result<Verb, OaiError> {
        let mut verbs = params.iter().filter(|(name, _)| name == "verb");
        match (verbs.next(), verbs.next()) {
            (Some((_, verb)), None) => Verb::parse(verb).ok_or(OaiError::BadVerb),
            _ => Err(OaiError::BadVerb),
        }
    }

    /// Validate a whole request.
    pub fn parse(params: &[(String, String)]) -> Result<Self, OaiError> {
        let verb = Self::verb(params)?;
        let allowed = verb.arguments();

        let mut arguments = BTreeMap::new();
        for (name, value) in params.iter().filter(|(name, _)| name != "verb") {
            if !allowed.contains(&name.as_str()) {
                return Err(OaiError::BadArgument);
            }
            if arguments.insert(name.clone(), value.clone()).is_some() {
                return Err(OaiError::BadArgument);
            }
        }

        Ok(Self { verb, arguments })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).map(String::as_str)
    }

    /// Number of arguments besides `verb`.
    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }
}

/// Inclusive day-granularity bounds of a ListRecords filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<Timestamp>,
    pub until: Option<Timestamp>,
}

impl DateRange {
    /// Parse `from`/`until`, each `YYYY-MM-DD` or a UTC datetime. `from`
    /// covers its whole day onwards, `until` up to the end of its day.
    ///
    /// Returns `None` for unparseable dates, mixed granularities or
    /// `from > until`.
    pub fn parse(from: Option<&str>, until: Option<&str>) -> Option<Self> {
        let from_parsed = match from {
            Some(value) => Some(parse_day(value)?),
            None => None,
        };
        let until_parsed = match until {
            Some(value) => Some(parse_day(value)?),
            None => None,
        };

        if let (Some((_, from_has_time)), Some((_, until_has_time))) = (from_parsed, until_parsed) {
            if from_has_time != until_has_time {
                return None;
            }
        }

        let range = Self {
            from: from_parsed.map(|(day, _)| start_of_day(day)),
            until: until_parsed.map(|(day, _)| end_of_day(day)),
        };

        match (range.from, range.until) {
            (Some(from), Some(until)) if from > until => None,
            _ => Some(range),
        }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.from.map_or(true, |from| at >= from) && self.until.map_or(true, |until| at <= until)
    }
}

/// The calendar day of a date or datetime, and whether it carried a time.
fn parse_day(value: &str) -> Option<(NaiveDate, bool)> {
    if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some((day, false));
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| (dt.with_timezone(&Utc).date_naive(), true))
}

fn start_of_day(day: NaiveDate) -> Timestamp {
    Timestamp::from_datetime(Utc.from_utc_datetime(&day.and_time(NaiveTime::default())))
}

fn end_of_day(day: NaiveDate) -> Timestamp {
    Timestamp(start_of_day(day).0 + 86_400_000_000 - 1)
}
