use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StateMachineError;

/// A named state within a definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDef {
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "isFinal")]
    pub is_final: bool,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl StateDef {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        self.is_final || self.is_error
    }
}

/// A named edge between two states. `autoTransform` edges fire immediately
/// when their `from` state is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from: String,
    pub to: String,
    #[serde(default, rename = "autoTransform")]
    pub auto_transform: bool,
}

/// A unit of work attached to a transition, invoked after the state swap
/// commits. The payload template is rendered against instance data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDef {
    pub module: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// A contributing hook's result is merged back into instance data.
    #[serde(default)]
    pub contributing: bool,
    /// Fire-and-forget: runs detached, failures only logged.
    #[serde(default, rename = "async")]
    pub detached: bool,
    /// Surface a hook failure to the trigger caller (the transition itself
    /// is never rolled back).
    #[serde(default, rename = "propagateFailure")]
    pub propagate_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineDefinition {
    pub name: String,
    #[serde(rename = "initialState")]
    pub initial_state: String,
    pub states: BTreeMap<String, StateDef>,
    pub transitions: BTreeMap<String, TransitionDef>,
    /// Transition name → ordered hook list.
    #[serde(default)]
    pub hooks: BTreeMap<String, Vec<HookDef>>,
}

impl StateMachineDefinition {
    pub fn validate(&self) -> Result<(), StateMachineError> {
        let invalid = |reason: String| StateMachineError::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("empty definition name".to_string()));
        }
        if !self.states.contains_key(&self.initial_state) {
            return Err(invalid(format!(
                "initial state '{}' is not a declared state",
                self.initial_state
            )));
        }
        for (name, t) in &self.transitions {
            if !self.states.contains_key(&t.from) {
                return Err(invalid(format!(
                    "transition '{name}' references unknown from-state '{}'",
                    t.from
                )));
            }
            if !self.states.contains_key(&t.to) {
                return Err(invalid(format!(
                    "transition '{name}' references unknown to-state '{}'",
                    t.to
                )));
            }
        }
        for transition in self.hooks.keys() {
            if !self.transitions.contains_key(transition) {
                return Err(invalid(format!(
                    "hooks reference unknown transition '{transition}'"
                )));
            }
        }
        Ok(())
    }

    /// First `autoTransform` transition leaving `state`, by transition name
    /// order (deterministic).
    pub fn auto_transition_from(&self, state: &str) -> Option<(&str, &TransitionDef)> {
        self.transitions
            .iter()
            .find(|(_, t)| t.auto_transform && t.from == state)
            .map(|(name, t)| (name.as_str(), t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(json: serde_json::Value) -> StateMachineDefinition {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn parses_camel_case_document() {
        let def = definition(serde_json::json!({
            "name": "order",
            "initialState": "new",
            "states": {
                "new": {},
                "done": { "isFinal": true, "description": "paid and shipped" }
            },
            "transitions": {
                "finish": { "from": "new", "to": "done", "autoTransform": true }
            },
            "hooks": {
                "finish": [ { "module": "notify", "async": true } ]
            }
        }));

        assert_eq!(def.initial_state, "new");
        assert!(def.states["done"].is_final);
        assert!(def.transitions["finish"].auto_transform);
        assert!(def.hooks["finish"][0].detached);
        def.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_initial_state() {
        let def = definition(serde_json::json!({
            "name": "bad",
            "initialState": "missing",
            "states": { "a": {} },
            "transitions": {}
        }));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn rejects_transition_to_unknown_state() {
        let def = definition(serde_json::json!({
            "name": "bad",
            "initialState": "a",
            "states": { "a": {} },
            "transitions": { "go": { "from": "a", "to": "nowhere" } }
        }));
        assert!(def.validate().is_err());
    }

    #[test]
    fn rejects_hook_on_unknown_transition() {
        let def = definition(serde_json::json!({
            "name": "bad",
            "initialState": "a",
            "states": { "a": {} },
            "transitions": {},
            "hooks": { "ghost": [] }
        }));
        assert!(def.validate().is_err());
    }

    #[test]
    fn auto_transition_lookup_is_name_ordered() {
        let def = definition(serde_json::json!({
            "name": "m",
            "initialState": "a",
            "states": { "a": {}, "b": {}, "c": {} },
            "transitions": {
                "zlast": { "from": "a", "to": "c", "autoTransform": true },
                "afirst": { "from": "a", "to": "b", "autoTransform": true }
            }
        }));
        let (name, t) = def.auto_transition_from("a").unwrap();
        assert_eq!(name, "afirst");
        assert_eq!(t.to, "b");
        assert!(def.auto_transition_from("b").is_none());
    }
}
