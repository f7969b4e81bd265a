use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::Agent;
use crate::errors::AgentResult;
use crate::models::conversation::Conversation;

/// A tool invocation requested by the model.
///
/// `id` is the provider's correlation id and is absent for providers that do
/// not assign one. `params` is `None` when the provider sent no arguments or
/// the arguments could not be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Option<String>,
    pub name: String,
    pub params: Option<Value>,
}

impl Action {
    pub fn new<S: Into<String>>(id: Option<String>, name: S, params: Option<Value>) -> Self {
        Self {
            id,
            name: name.into(),
            params,
        }
    }

    /// Arguments as a JSON value, `{}` when none were supplied
    pub fn arguments(&self) -> Value {
        self.params.clone().unwrap_or_else(|| json!({}))
    }

    /// Run the registered handler for this action on a fresh instance of `agent`
    /// and return the conversation it produced.
    pub fn perform_locally(
        &self,
        agent: &Agent,
        params: &serde_json::Map<String, Value>,
    ) -> AgentResult<Conversation> {
        let context = agent.process(&self.name, self.arguments(), params.clone())?;
        Ok(context.into_conversation())
    }

    pub fn to_canonical(&self) -> Value {
        let mut canonical = json!({ "name": self.name });
        if let Some(id) = &self.id {
            canonical["id"] = json!(id);
        }
        if let Some(params) = &self.params {
            canonical["params"] = params.clone();
        }
        canonical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_omits_absent_fields() {
        let action = Action::new(None, "lookup", None);
        assert_eq!(action.to_canonical(), json!({"name": "lookup"}));
        assert_eq!(action.arguments(), json!({}));
    }

    #[test]
    fn test_canonical_with_all_fields() {
        let action = Action::new(Some("call_1".to_string()), "lookup", Some(json!({"q": "cats"})));
        assert_eq!(
            action.to_canonical(),
            json!({"id": "call_1", "name": "lookup", "params": {"q": "cats"}})
        );
    }
}
