use alloy_primitives::B256;
use alloy_sol_types::SolEvent;

/// One event a contract can emit, keyed by its topic0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub name: String,
    pub signature: &'static str,
    pub topic: B256,
}

/// Named set of events a contract can emit.
#[derive(Debug, Clone, Default)]
pub struct ContractAbi {
    name: String,
    events: Vec<EventInfo>,
}

impl ContractAbi {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
        }
    }

    pub fn with_event<E: SolEvent>(mut self) -> Self {
        self.events.push(EventInfo {
            name: event_name::<E>().to_string(),
            signature: E::SIGNATURE,
            topic: E::SIGNATURE_HASH,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event(&self, name: &str) -> Option<&EventInfo> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn events(&self) -> &[EventInfo] {
        &self.events
    }
}

/// Event name as declared in Solidity: the signature up to the opening parenthesis.
pub fn event_name<E: SolEvent>() -> &'static str {
    E::SIGNATURE.split('(').next().unwrap_or(E::SIGNATURE)
}
