use serde::{Deserialize, Serialize};

/// Client resume state persisted with an attempt.
///
/// Tagged by `version` so fields can be added without breaking rows written by
/// older releases. New fields must carry `#[serde(default)]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum SessionData {
    #[serde(rename = "1")]
    V1(SessionDataV1),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDataV1 {
    /// Seed for the shuffled question order; `None` keeps the assessment order.
    #[serde(default)]
    pub question_seed: Option<u64>,
    /// Question ids in the order delivered at start. Empty for payloads written
    /// before the order was recorded; those fall back to the seed.
    #[serde(default)]
    pub question_order: Vec<i64>,
    /// Opaque state owned by the client (scroll position, drafts, ...).
    #[serde(default)]
    pub client_state: serde_json::Map<String, serde_json::Value>,
}

impl SessionData {
    pub fn new(question_seed: Option<u64>, question_order: Vec<i64>) -> Self {
        SessionData::V1(SessionDataV1 {
            question_seed,
            question_order,
            client_state: serde_json::Map::new(),
        })
    }

    pub fn question_seed(&self) -> Option<u64> {
        match self {
            SessionData::V1(data) => data.question_seed,
        }
    }

    pub fn question_order(&self) -> &[i64] {
        match self {
            SessionData::V1(data) => &data.question_order,
        }
    }

    pub fn client_state(&self) -> &serde_json::Map<String, serde_json::Value> {
        match self {
            SessionData::V1(data) => &data.client_state,
        }
    }

    /// Shallow-merges client keys; a `null` value removes the key. Seed and order are never touched.
    pub fn merge_client_state(&mut self, patch: serde_json::Map<String, serde_json::Value>) {
        match self {
            SessionData::V1(data) => {
                for (key, value) in patch {
                    if value.is_null() {
                        data.client_state.remove(&key);
                    } else {
                        data.client_state.insert(key, value);
                    }
                }
            }
        }
    }
}

impl Default for SessionData {
    fn default() -> Self {
        SessionData::new(None, Vec::new())
    }
}
