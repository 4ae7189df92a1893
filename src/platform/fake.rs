//! In-memory service manager for tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};

use super::{Registration, ServiceBackend, ServiceDefinition, ServiceState};

#[derive(Debug, Default)]
struct FakeState {
    services: BTreeMap<String, (ServiceDefinition, ServiceState)>,
    calls: Vec<String>,
}

/// Records every call; start/stop requests settle immediately unless
/// transitions are held.
#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
    hold_transitions: bool,
    fail_create: bool,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Requests leave the service in its pending state forever.
    pub(crate) fn holding_transitions() -> Self {
        Self {
            hold_transitions: true,
            ..Self::default()
        }
    }

    pub(crate) fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub(crate) fn with_service(self, definition: ServiceDefinition, state: ServiceState) -> Self {
        self.lock()
            .services
            .insert(definition.name.clone(), (definition, state));
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls other than lookups and status polls.
    pub(crate) fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("query") && !c.starts_with("status"))
            .collect()
    }

    pub(crate) fn registered(&self) -> Vec<String> {
        self.lock().services.keys().cloned().collect()
    }

    pub(crate) fn definition(&self, name: &str) -> Option<ServiceDefinition> {
        self.lock().services.get(name).map(|(d, _)| d.clone())
    }

    pub(crate) fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.lock().services.get(name).map(|(_, s)| *s)
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, name: &str, pending: ServiceState, settled: ServiceState) -> Result<()> {
        let hold = self.hold_transitions;
        let mut state = self.lock();
        let Some((_, current)) = state.services.get_mut(name) else {
            bail!("service {name} does not exist");
        };
        *current = if hold { pending } else { settled };
        Ok(())
    }
}

impl ServiceBackend for FakeBackend {
    fn query(&self, name: &str) -> Result<Option<Registration>> {
        let mut state = self.lock();
        state.calls.push(format!("query {name}"));
        Ok(state.services.get(name).map(|(d, _)| Registration {
            name: d.name.clone(),
            display_name: d.display_name.clone(),
        }))
    }

    fn status(&self, name: &str) -> Result<ServiceState> {
        let mut state = self.lock();
        state.calls.push(format!("status {name}"));
        match state.services.get(name) {
            Some((_, s)) => Ok(*s),
            None => bail!("service {name} does not exist"),
        }
    }

    fn create(&self, definition: &ServiceDefinition) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("create {}", definition.name));
        if self.fail_create {
            bail!("access denied");
        }
        if state.services.contains_key(&definition.name) {
            bail!("service {} already exists", definition.name);
        }
        state
            .services
            .insert(definition.name.clone(), (definition.clone(), ServiceState::Stopped));
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("delete {name}"));
        if state.services.remove(name).is_none() {
            bail!("service {name} does not exist");
        }
        Ok(())
    }

    fn request_start(&self, name: &str) -> Result<()> {
        self.lock().calls.push(format!("start {name}"));
        self.transition(name, ServiceState::StartPending, ServiceState::Running)
    }

    fn request_stop(&self, name: &str) -> Result<()> {
        self.lock().calls.push(format!("stop {name}"));
        self.transition(name, ServiceState::StopPending, ServiceState::Stopped)
    }
}
