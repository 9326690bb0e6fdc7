use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowkit::JsonMap;

/// Bounded per-instance transition history.
pub const MAX_HISTORY: usize = 32;

/// One committed transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub counter: u64,
    pub transition: String,
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
}

/// The full state of a workflow instance. Live instances are held behind a
/// per-instance async lock inside the engine; this type is also the frozen
/// view returned by `query` and the unit of persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub definition: String,
    pub state: String,
    #[serde(default)]
    pub data: JsonMap,
    pub counter: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl InstanceSnapshot {
    pub fn new(
        id: impl Into<String>,
        definition: impl Into<String>,
        state: impl Into<String>,
        data: JsonMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            definition: definition.into(),
            state: state.into(),
            data,
            counter: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub(crate) fn push_history(&mut self, record: TransitionRecord) {
        self.history.push(record);
        if self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let mut inst = InstanceSnapshot::new("i", "d", "a", JsonMap::new());
        for n in 0..(MAX_HISTORY as u64 + 8) {
            inst.push_history(TransitionRecord {
                counter: n,
                transition: "t".into(),
                from: "a".into(),
                to: "a".into(),
                at: Utc::now(),
            });
        }
        assert_eq!(inst.history.len(), MAX_HISTORY);
        // Oldest entries dropped first.
        assert_eq!(inst.history[0].counter, 8);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut data = JsonMap::new();
        data.insert("total".into(), serde_json::json!(12));
        let inst = InstanceSnapshot::new("i-1", "order", "new", data);

        let raw = serde_json::to_string(&inst).unwrap();
        let back: InstanceSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, "i-1");
        assert_eq!(back.state, "new");
        assert_eq!(back.data["total"], 12);
        assert_eq!(back.counter, 0);
    }
}
