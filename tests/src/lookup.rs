use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use trellis::LookupService;

/// A [`LookupService`] whose answers are driven by the test.
///
/// Clones share the same state, so a test can keep a handle after moving
/// one into a [`PollingInstancer`](trellis::PollingInstancer).
#[derive(Clone, Default)]
pub struct TestLookup {
    state: Arc<Mutex<LookupState>>,
}

#[derive(Default)]
struct LookupState {
    instances: HashSet<String>,
    outage: Option<String>,
    lookups: usize,
}

impl TestLookup {
    pub fn new<I, S>(instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lookup = Self::default();
        lookup.state.lock().instances = instances.into_iter().map(Into::into).collect();
        lookup
    }

    pub fn add_instance(&self, instance: &str) {
        self.state.lock().instances.insert(instance.to_string());
    }

    pub fn remove_instance(&self, instance: &str) {
        self.state.lock().instances.remove(instance);
    }

    /// Fail every lookup with `reason` until [`TestLookup::recover`] is called.
    pub fn fail(&self, reason: &str) {
        self.state.lock().outage = Some(reason.to_string());
    }

    pub fn recover(&self) {
        self.state.lock().outage = None;
    }

    pub fn lookups(&self) -> usize {
        self.state.lock().lookups
    }
}

#[async_trait::async_trait]
impl LookupService for TestLookup {
    async fn resolve_service_instances(&self) -> Result<HashSet<String>, anyhow::Error> {
        let mut state = self.state.lock();
        state.lookups += 1;
        match &state.outage {
            Some(reason) => Err(anyhow::anyhow!("lookup failed: {}", reason)),
            None => Ok(state.instances.clone()),
        }
    }
}
