use std::sync::Arc;
use std::time::Duration;
use tests::factory::TestFactory;
use trellis::{
    chain, instrument, trip_after_failures, Balancer, BearerTokens, BreakerSettings, Broadcaster,
    CircuitBreaker, CircuitState, Context, Endpoint, Endpointer, Error, Event, Gate, RateLimiter,
    Retry, RoundRobin, Throttler, TokenBucket, AUTHORIZATION,
};

fn pool(factory: &TestFactory, instances: &[&str]) -> Arc<Endpointer<String, String>> {
    let instancer = Arc::new(Broadcaster::new());
    instancer.update(Event::healthy(instances.iter().copied()));
    Arc::new(Endpointer::builder(instancer, factory.clone()).build())
}

#[tokio::test]
async fn retry_moves_to_the_next_instance_after_a_failure() {
    // Steps:
    //  1. Make every instance fail its first call.
    //  2. Send one request through retry over round-robin.
    // What we want to test:
    //  Each failed attempt selects a fresh endpoint, so the failures land on
    //  distinct instances and the request still succeeds.

    // Arrange
    let factory = TestFactory::new();
    for instance in ["a:1", "b:1", "c:1"] {
        factory.fail_calls(instance, 1);
    }
    let endpointer = pool(&factory, &["a:1", "b:1", "c:1"]);
    let endpoint = Retry::new(5, Duration::from_secs(1), RoundRobin::new(endpointer))
        .unwrap()
        .into_endpoint();

    // Act
    let served = endpoint
        .call(Context::new(), "ping".to_string())
        .await
        .expect("retry gave up");

    // Assert
    assert_eq!(served, "a:1");
    assert_eq!(factory.calls("a:1"), 2);
    assert_eq!(factory.calls("b:1"), 1);
    assert_eq!(factory.calls("c:1"), 1);
}

#[tokio::test]
async fn retry_over_a_dead_pool_uses_exactly_its_attempts() {
    for max_attempts in 1..=6 {
        // Arrange
        let factory = TestFactory::new();
        factory.fail_always("a:1");
        factory.fail_always("b:1");
        let endpoint = Retry::new(
            max_attempts,
            Duration::from_secs(1),
            RoundRobin::new(pool(&factory, &["a:1", "b:1"])),
        )
        .unwrap()
        .into_endpoint();

        // Act
        let result = endpoint.call(Context::new(), "ping".to_string()).await;

        // Assert
        match result {
            Err(Error::RetryExhausted(retry)) => {
                assert_eq!(retry.attempts(), max_attempts);
                assert!(matches!(retry.last(), Some(Error::Transport(_))));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(factory.total_calls(), max_attempts);
    }
}

#[tokio::test]
async fn breaker_opens_and_stops_calling_the_pool() {
    // Steps:
    //  1. Make the only instance fail every call.
    //  2. Send twenty requests through a breaker that trips after five failures.
    // What we want to test:
    //  The first five requests see the instance's error, the rest are
    //  rejected by the open breaker without reaching the instance.

    // Arrange
    let factory = TestFactory::new();
    factory.fail_always("a:1");
    let breaker = CircuitBreaker::new(
        BreakerSettings::new("a")
            .interval(Duration::from_secs(1))
            .ready_to_trip(trip_after_failures(5)),
    );
    let endpoint = breaker.wrap(RoundRobin::new(pool(&factory, &["a:1"])).into_endpoint());

    // Act
    let mut results = Vec::new();
    for _ in 0..20 {
        results.push(endpoint.call(Context::new(), "ping".to_string()).await);
    }

    // Assert
    assert!(results[..5]
        .iter()
        .all(|result| matches!(result, Err(Error::Transport(_)))));
    assert!(results[5..]
        .iter()
        .all(|result| matches!(result, Err(Error::CircuitOpen))));
    assert_eq!(factory.calls("a:1"), 5);
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_once_the_pool_does() {
    // Arrange
    let factory = TestFactory::new();
    factory.fail_calls("a:1", 3);
    let breaker = CircuitBreaker::new(
        BreakerSettings::new("a")
            .timeout(Duration::from_secs(5))
            .ready_to_trip(trip_after_failures(3)),
    );
    let endpoint = breaker.wrap(RoundRobin::new(pool(&factory, &["a:1"])).into_endpoint());
    for _ in 0..3 {
        let _ = endpoint.call(Context::new(), "ping".to_string()).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Act
    tokio::time::sleep(Duration::from_secs(5)).await;
    let probe = endpoint.call(Context::new(), "ping".to_string()).await;

    // Assert
    assert_eq!(probe.unwrap(), "a:1");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(factory.calls("a:1"), 4);
}

#[tokio::test(start_paused = true)]
async fn layered_client_limits_breaks_and_retries() {
    // Steps:
    //  1. Build a client: tracing, rate limiter, breaker, then retry over
    //     round-robin on a pool where one instance always fails.
    //  2. Drain the bucket.
    // What we want to test:
    //  Retry hides the broken instance, the breaker never sees a failure,
    //  and requests beyond the bucket's capacity never reach the pool.

    // Arrange
    let factory = TestFactory::new();
    factory.fail_always("b:1");
    let bucket = Arc::new(TokenBucket::new(1.0, 6).unwrap());
    let breaker = CircuitBreaker::new(BreakerSettings::new("orders"));
    let retry = Retry::new(
        3,
        Duration::from_secs(1),
        RoundRobin::new(pool(&factory, &["a:1", "b:1", "c:1"])),
    )
    .unwrap();
    let client = chain(
        instrument("get_order"),
        vec![RateLimiter::new(bucket).middleware(), breaker.middleware()],
    )
    .wrap(retry.into_endpoint());

    // Act
    let mut served = Vec::new();
    let mut limited = 0;
    for _ in 0..8 {
        match client.call(Context::new(), "order-1".to_string()).await {
            Ok(instance) => served.push(instance),
            Err(Error::RateLimited) => limited += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    // Assert
    assert_eq!(served.len(), 6);
    assert!(served.iter().all(|instance| instance != "b:1"));
    assert_eq!(limited, 2);
    assert_eq!(breaker.counts().total_failures, 0);
    assert_eq!(breaker.state(), CircuitState::Closed);
    // Six served requests; every second one hits b:1 first and retries once.
    assert_eq!(factory.calls("b:1"), 3);
    assert_eq!(factory.total_calls(), 9);
}

#[tokio::test(start_paused = true)]
async fn throttled_client_paces_requests() {
    // Arrange
    let factory = TestFactory::new();
    let bucket = Arc::new(TokenBucket::new(10.0, 2).unwrap());
    let client =
        Throttler::new(bucket).wrap(RoundRobin::new(pool(&factory, &["a:1"])).into_endpoint());
    let start = tokio::time::Instant::now();

    // Act
    for _ in 0..12 {
        client
            .call(Context::new(), "ping".to_string())
            .await
            .expect("throttled call failed");
    }

    // Assert
    // Two requests ride the initial burst, the other ten wait 100ms each.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(990), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1010), "{:?}", elapsed);
    assert_eq!(factory.calls("a:1"), 12);
}

#[tokio::test(start_paused = true)]
async fn throttled_requests_respect_the_caller_deadline() {
    // Arrange
    let factory = TestFactory::new();
    let bucket = Arc::new(TokenBucket::new(1.0, 1).unwrap());
    let client = Throttler::new(Arc::clone(&bucket))
        .wrap(RoundRobin::new(pool(&factory, &["a:1"])).into_endpoint());
    client.call(Context::new(), "first".to_string()).await.unwrap();

    // Act
    let result = client
        .call(
            Context::with_timeout(Duration::from_millis(100)),
            "second".to_string(),
        )
        .await;

    // Assert
    assert!(matches!(result, Err(Error::DeadlineExceeded)));
    assert_eq!(factory.calls("a:1"), 1);
}

#[tokio::test]
async fn gated_client_rejects_before_any_other_work() {
    // Arrange
    let factory = TestFactory::new();
    let bucket = Arc::new(TokenBucket::new(0.0, 1).unwrap());
    let client = chain(
        Gate::new(BearerTokens::new(["s3cr3t"])).middleware(),
        vec![RateLimiter::new(Arc::clone(&bucket)).middleware()],
    )
    .wrap(RoundRobin::new(pool(&factory, &["a:1"])).into_endpoint());

    // Act
    let anonymous = client.call(Context::new(), "ping".to_string()).await;
    let forged = client
        .call(
            Context::new().with_metadata(AUTHORIZATION, "Bearer guess"),
            "ping".to_string(),
        )
        .await;
    let authorized = client
        .call(
            Context::new().with_metadata(AUTHORIZATION, "Bearer s3cr3t"),
            "ping".to_string(),
        )
        .await;

    // Assert
    assert!(matches!(anonymous, Err(Error::Unauthorized(_))));
    assert!(matches!(forged, Err(Error::Unauthorized(_))));
    assert_eq!(authorized.unwrap(), "a:1");
    // Only the authorized request spent a token.
    assert!(!bucket.try_take(1));
    assert_eq!(factory.total_calls(), 1);
}

#[tokio::test]
async fn erased_endpoints_carry_pool_responses() {
    // Arrange
    let factory = TestFactory::new();
    let endpoint: Endpoint<String, String> =
        RoundRobin::new(pool(&factory, &["a:1"])).into_endpoint();

    // Act
    let erased = endpoint.erase();
    let typed = erased.clone().downcast::<String, String>();
    let mismatched = erased.downcast::<u64, String>();

    // Assert
    assert_eq!(typed.call(Context::new(), "ping".to_string()).await.unwrap(), "a:1");
    assert!(matches!(
        mismatched.call(Context::new(), 7).await,
        Err(Error::BadCast { .. })
    ));
}
