//! Query identifiers.
//!
//! Ids read `yyyyMMdd_HHmmss_nnnnn_xxxxx`: the second in which the id
//! was minted, a counter that resets each second, and a 5-character
//! instance tag chosen when the coordinator starts. The textual form
//! sorts in creation order for ids minted by one coordinator.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CoordError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QueryId {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('_').collect();
        let well_formed = parts.len() == 4
            && parts[0].len() == 8
            && parts[1].len() == 6
            && parts[2].len() == 5
            && parts[3].len() == 5
            && parts[..3].iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()))
            && parts[3].bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if !well_formed {
            return Err(CoordError::InvalidRequest(format!(
                "malformed query id: {}",
                s
            )));
        }
        Ok(QueryId(s.to_string()))
    }
}

pub struct QueryIdGenerator {
    instance_tag: String,
    inner: Mutex<GeneratorState>,
}

struct GeneratorState {
    last_second: String,
    counter: u32,
}

impl Default for QueryIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryIdGenerator {
    pub fn new() -> Self {
        const TAG_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::rng();
        let instance_tag = (0..5)
            .map(|_| TAG_CHARS[rng.random_range(0..TAG_CHARS.len())] as char)
            .collect();
        Self {
            instance_tag,
            inner: Mutex::new(GeneratorState {
                last_second: String::new(),
                counter: 0,
            }),
        }
    }

    pub fn instance_tag(&self) -> &str {
        &self.instance_tag
    }

    pub fn next_id(&self) -> QueryId {
        let second = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut state = self.inner.lock();
        if state.last_second == second {
            state.counter += 1;
        } else {
            state.last_second = second.clone();
            state.counter = 0;
        }
        QueryId(format!(
            "{}_{:05}_{}",
            second,
            state.counter % 100_000,
            self.instance_tag
        ))
    }
}
