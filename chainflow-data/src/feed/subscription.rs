use crate::instrument::InstrumentKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Feed data mode requested for a set of instruments.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    Ltpc,
    #[default]
    Full,
    OptionGreeks,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMethod {
    Sub,
    Unsub,
    ChangeMode,
}

/// JSON control message, sent to the feed as a binary frame.
///
/// ```json
/// {"guid":"chainflow-1","method":"sub","data":{"mode":"full","instrumentKeys":["NSE_INDEX|Nifty 50"]}}
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ControlMessage {
    pub guid: String,
    pub method: ControlMethod,
    pub data: ControlData,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ControlData {
    pub mode: FeedMode,
    #[serde(rename = "instrumentKeys")]
    pub instrument_keys: Vec<InstrumentKey>,
}

impl ControlMessage {
    pub fn new(
        guid: impl Into<String>,
        method: ControlMethod,
        mode: FeedMode,
        instrument_keys: Vec<InstrumentKey>,
    ) -> Self {
        Self {
            guid: guid.into(),
            method,
            data: ControlData {
                mode,
                instrument_keys,
            },
        }
    }
}

/// Last-known set of subscribed instrument keys.
///
/// Kept sorted so a resubscription after reconnect is deterministic.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SubscriptionSet(BTreeSet<InstrumentKey>);

impl SubscriptionSet {
    /// Insert keys, returning only those that were not already present.
    pub fn insert_all<'a, Iter>(&mut self, keys: Iter) -> Vec<InstrumentKey>
    where
        Iter: IntoIterator<Item = &'a InstrumentKey>,
    {
        keys.into_iter()
            .filter(|key| self.0.insert((*key).clone()))
            .cloned()
            .collect()
    }

    /// Remove keys, returning only those that were present.
    pub fn remove_all<'a, Iter>(&mut self, keys: Iter) -> Vec<InstrumentKey>
    where
        Iter: IntoIterator<Item = &'a InstrumentKey>,
    {
        keys.into_iter()
            .filter(|key| self.0.remove(key.as_str()))
            .cloned()
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<InstrumentKey> {
        self.0.iter().cloned().collect()
    }
}
