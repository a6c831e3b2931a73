use proptest::prelude::*;
use std::sync::Arc;
use tests::eventually;
use tests::factory::TestFactory;
use trellis::{Balancer, Broadcaster, Context, Endpointer, Error, Event, Random, RoundRobin};

const POOL: [&str; 4] = ["a:1", "b:1", "c:1", "d:1"];

fn endpointer(
    factory: &TestFactory,
    instances: &[&str],
) -> (Arc<Broadcaster>, Arc<Endpointer<String, String>>) {
    let instancer = Arc::new(Broadcaster::new());
    instancer.update(Event::healthy(instances.iter().copied()));
    let endpointer = Endpointer::builder(Arc::clone(&instancer), factory.clone()).build();
    (instancer, Arc::new(endpointer))
}

#[tokio::test]
async fn random_spreads_load_evenly() {
    // Arrange
    let factory = TestFactory::new();
    let (_instancer, endpointer) = endpointer(&factory, &POOL);
    let endpoint = Random::new(endpointer, 42).into_endpoint();

    // Act
    for _ in 0..20_000 {
        endpoint
            .call(Context::new(), "ping".to_string())
            .await
            .expect("call failed");
    }

    // Assert
    for instance in POOL {
        let calls = factory.calls(instance);
        assert!((4_500..=5_500).contains(&calls), "{} got {} calls", instance, calls);
    }
}

#[tokio::test]
async fn round_robin_follows_membership_changes() {
    // Steps:
    //  1. Balance over two instances.
    //  2. Add two more instances.
    //  3. Remove all of them.
    // What we want to test:
    //  New instances start receiving traffic as soon as they are cached, and
    //  an empty pool fails fast without reaching any endpoint.

    // Arrange
    let factory = TestFactory::new();
    let (instancer, endpointer) = endpointer(&factory, &POOL[..2]);
    let endpoint = RoundRobin::new(Arc::clone(&endpointer)).into_endpoint();

    for _ in 0..4 {
        endpoint.call(Context::new(), "ping".to_string()).await.unwrap();
    }
    assert_eq!(factory.calls("a:1"), 2);
    assert_eq!(factory.calls("b:1"), 2);

    // Act
    instancer.update(Event::healthy(POOL));
    eventually(|| matches!(endpointer.endpoints(), Ok(endpoints) if endpoints.len() == 4)).await;
    for _ in 0..8 {
        endpoint.call(Context::new(), "ping".to_string()).await.unwrap();
    }

    // Assert
    assert_eq!(factory.calls("c:1"), 2);
    assert_eq!(factory.calls("d:1"), 2);
    assert_eq!(factory.total_calls(), 12);

    // Act
    instancer.update(Event::healthy(Vec::<String>::new()));
    eventually(|| matches!(endpointer.endpoints(), Ok(endpoints) if endpoints.is_empty())).await;
    let result = endpoint.call(Context::new(), "ping".to_string()).await;

    // Assert
    assert!(matches!(result, Err(Error::NoEndpointsAvailable)));
    assert_eq!(factory.total_calls(), 12);
}

proptest! {
    #[test]
    fn round_robin_is_fair_over_a_stable_pool(n in 1usize..=POOL.len(), m in 0usize..200) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let factory = TestFactory::new();
            let (_instancer, endpointer) = endpointer(&factory, &POOL[..n]);
            let endpoint = RoundRobin::new(endpointer).into_endpoint();

            for _ in 0..m {
                endpoint.call(Context::new(), "ping".to_string()).await.unwrap();
            }

            for instance in &POOL[..n] {
                let calls = factory.calls(instance);
                prop_assert!(calls >= m / n && calls <= (m + n - 1) / n);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
