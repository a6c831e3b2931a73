use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use trellis::{Closer, Context, Endpoint, Error, Factory};

#[derive(Default)]
struct Ledger {
    made: HashMap<String, usize>,
    calls: HashMap<String, usize>,
    closed: HashMap<String, usize>,
    latest: HashMap<String, Endpoint<String, String>>,
    refused: HashSet<String>,
    // Remaining failures per instance; `usize::MAX` fails forever.
    failures: HashMap<String, usize>,
}

fn count(map: &HashMap<String, usize>, instance: &str) -> usize {
    map.get(instance).copied().unwrap_or_default()
}

/// A [`Factory`] whose endpoints answer with the address of the instance
/// that served the request, and which records everything that happens to them.
///
/// Clones share the same ledger.
#[derive(Clone, Default)]
pub struct TestFactory {
    ledger: Arc<Mutex<Ledger>>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the factory fail for `instance` until [`TestFactory::accept`] is called.
    pub fn refuse(&self, instance: &str) {
        self.ledger.lock().refused.insert(instance.to_string());
    }

    pub fn accept(&self, instance: &str) {
        self.ledger.lock().refused.remove(instance);
    }

    /// Make the next `n` calls to the endpoint of `instance` fail.
    pub fn fail_calls(&self, instance: &str, n: usize) {
        self.ledger.lock().failures.insert(instance.to_string(), n);
    }

    /// Make every call to the endpoint of `instance` fail.
    pub fn fail_always(&self, instance: &str) {
        self.fail_calls(instance, usize::MAX);
    }

    /// Number of endpoints built for `instance`.
    pub fn made(&self, instance: &str) -> usize {
        count(&self.ledger.lock().made, instance)
    }

    /// Number of calls that reached an endpoint of `instance`.
    pub fn calls(&self, instance: &str) -> usize {
        count(&self.ledger.lock().calls, instance)
    }

    pub fn total_calls(&self) -> usize {
        self.ledger.lock().calls.values().sum()
    }

    /// Number of closers of `instance` that ran.
    pub fn closed(&self, instance: &str) -> usize {
        count(&self.ledger.lock().closed, instance)
    }

    /// The endpoint most recently built for `instance`.
    pub fn latest(&self, instance: &str) -> Option<Endpoint<String, String>> {
        self.ledger.lock().latest.get(instance).cloned()
    }

    fn endpoint(&self, instance: &str) -> Endpoint<String, String> {
        let ledger = Arc::clone(&self.ledger);
        let instance = instance.to_string();
        Endpoint::new(move |_ctx: Context, _req: String| {
            let mut ledger = ledger.lock();
            *ledger.calls.entry(instance.clone()).or_default() += 1;
            let fail = match ledger.failures.get_mut(&instance) {
                Some(remaining) if *remaining == usize::MAX => true,
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            let result = if fail {
                Err(Error::Transport(anyhow::anyhow!("{} is unavailable", instance)))
            } else {
                Ok(instance.clone())
            };
            futures::future::ready(result)
        })
    }
}

impl Factory<String, String> for TestFactory {
    fn make(
        &self,
        instance: &str,
    ) -> Result<(Endpoint<String, String>, Option<Closer>), anyhow::Error> {
        if self.ledger.lock().refused.contains(instance) {
            anyhow::bail!("failed to connect to {}", instance);
        }

        let endpoint = self.endpoint(instance);
        {
            let mut ledger = self.ledger.lock();
            *ledger.made.entry(instance.to_string()).or_default() += 1;
            ledger.latest.insert(instance.to_string(), endpoint.clone());
        }

        let closer = {
            let ledger = Arc::clone(&self.ledger);
            let instance = instance.to_string();
            Closer::new(move || {
                *ledger.lock().closed.entry(instance).or_default() += 1;
            })
        };
        Ok((endpoint, Some(closer)))
    }
}
