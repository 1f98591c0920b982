//! Page-level consumers of the managed collections.
//!
//! These are pure functions over listings; they never touch the replica.
//! Team names come from a [`TeamDirectory`] loaded once at startup.

use std::collections::HashMap;

use courtside_engine::{Record, RecordId};
use serde::Serialize;
use serde_json::Value;

/// Read-only map of team id to team name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeamDirectory {
    names: HashMap<String, String>,
}

impl TeamDirectory {
    /// Build a directory from team records carrying a `name` field.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let names = records
            .into_iter()
            .filter_map(|team| {
                let name = team.field("name")?.as_str()?;
                Some((team.id.to_string(), name.to_string()))
            })
            .collect();
        Self { names }
    }

    /// Name of the team a field refers to.
    pub fn name(&self, team_id: Option<&Value>) -> Option<&str> {
        let key = match team_id? {
            Value::String(id) => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => return None,
        };
        self.names.get(&key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One side of a match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Side {
    pub team_id: Value,
    pub team_name: Option<String>,
    pub score: Value,
}

/// A match as the boards show it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCard {
    pub id: RecordId,
    /// Still waiting for the backing store
    pub provisional: bool,
    pub home: Side,
    pub away: Side,
    pub is_finished: bool,
}

impl MatchCard {
    fn from_record(record: &Record, teams: &TeamDirectory) -> Self {
        let side = |team: &str, score: &str| Side {
            team_id: record.field(team).cloned().unwrap_or(Value::Null),
            team_name: teams.name(record.field(team)).map(str::to_string),
            score: record.field(score).cloned().unwrap_or(Value::from(0)),
        };
        Self {
            id: record.id.clone(),
            provisional: record.is_provisional(),
            home: side("team1_id", "team1_score"),
            away: side("team2_id", "team2_score"),
            is_finished: is_finished(record),
        }
    }
}

/// A court and what is shown on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourtSlot {
    pub court: i64,
    pub current: Option<MatchCard>,
}

/// A court and its unfinished matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourtQueue {
    pub court: i64,
    pub matches: Vec<MatchCard>,
}

/// A message in the feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageItem {
    pub id: RecordId,
    pub provisional: bool,
    pub body: String,
    pub created_at: Option<Value>,
}

fn court_of(record: &Record) -> Option<i64> {
    record.field("court").and_then(Value::as_i64)
}

fn is_finished(record: &Record) -> bool {
    record
        .field("is_finished")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// The public board: the latest match of every court.
///
/// `matches` must be ordered newest first.
pub fn court_board(matches: &[Record], courts: &[i64], teams: &TeamDirectory) -> Vec<CourtSlot> {
    courts
        .iter()
        .map(|&court| CourtSlot {
            court,
            current: matches
                .iter()
                .find(|m| court_of(m) == Some(court))
                .map(|m| MatchCard::from_record(m, teams)),
        })
        .collect()
}

/// The operator board: unfinished matches grouped by court, in listing
/// order.
pub fn admin_board(matches: &[Record], courts: &[i64], teams: &TeamDirectory) -> Vec<CourtQueue> {
    courts
        .iter()
        .map(|&court| CourtQueue {
            court,
            matches: matches
                .iter()
                .filter(|m| court_of(m) == Some(court) && !is_finished(m))
                .map(|m| MatchCard::from_record(m, teams))
                .collect(),
        })
        .collect()
}

/// The message feed, in listing order. Records without a body are skipped.
pub fn message_feed(messages: &[Record]) -> Vec<MessageItem> {
    messages
        .iter()
        .filter_map(|message| {
            let body = message.field("message_body")?.as_str()?;
            Some(MessageItem {
                id: message.id.clone(),
                provisional: message.is_provisional(),
                body: body.to_string(),
                created_at: message.field("created_at").cloned(),
            })
        })
        .collect()
}
