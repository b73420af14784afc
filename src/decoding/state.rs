use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::io::{BufRead, BufReader, Read};

use crate::{osm_data::ReplicationState, Error, IoSnafu, Result};

// #Sat Jan 02 00:00:00 UTC 2021
// sequenceNumber=4312
// timestamp=2021-01-02T00\:00\:00Z

/// Read a replication `state.txt` file.
pub fn parse_state(reader: impl Read) -> Result<ReplicationState> {
    let mut sequence_number = None;
    let mut timestamp = None;
    for line in BufReader::new(reader).lines() {
        let line = line.context(IoSnafu {
            context: "reading replication state",
        })?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            log::debug!("Ignoring state line without value: {line}");
            continue;
        };
        let value = unescape(value.trim());
        match key.trim() {
            "sequenceNumber" => {
                sequence_number = Some(value.parse::<i64>().map_err(|e| {
                    Error::decode(format!("invalid sequenceNumber '{value}': {e}"))
                })?)
            }
            "timestamp" => timestamp = Some(parse_timestamp(&value)?),
            _ => (),
        }
    }
    Ok(ReplicationState {
        sequence_number: sequence_number
            .ok_or_else(|| Error::decode("state file has no sequenceNumber"))?,
        timestamp: timestamp.ok_or_else(|| Error::decode("state file has no timestamp"))?,
    })
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::decode(format!("invalid timestamp '{value}': {e}")))
}

/// State files are Java properties, where a backslash escapes the next character.
fn unescape(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => unescaped.extend(chars.next()),
            c => unescaped.push(c),
        }
    }
    unescaped
}
