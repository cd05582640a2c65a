use mirto::{App, Error, LoadBalancedChannel, Peer, Policy, ResolutionStrategy};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tests::{registry::InMemoryRegistry, test_server::TestServer};
use tokio::task::JoinHandle;
use tonic_health::pb::{health_client::HealthClient, HealthCheckRequest};

const SERVICE: &str = "greeter";

/// A health server registered under [`SERVICE`] by its own app.
struct Backend {
    app: App,
    address: String,
    running: JoinHandle<Result<(), Error>>,
}

impl Backend {
    async fn start(registry: &InMemoryRegistry) -> Self {
        let server = TestServer::bind().await;
        let address = server.local_addr().to_string();
        let builder = App::builder()
            .name(SERVICE)
            .registrar(registry.clone())
            .server(server);
        #[cfg(unix)]
        let builder = builder.signals(Vec::new());
        let app = builder.build().expect("invalid app");

        let running = tokio::spawn({
            let app = app.clone();
            async move { app.run().await }
        });

        Self {
            app,
            address,
            running,
        }
    }

    async fn shutdown(self) {
        self.app.stop().await.expect("failed to stop app");
        self.running
            .await
            .expect("app task panicked")
            .expect("app did not exit gracefully");
    }
}

async fn wait_for_instances(registry: &InMemoryRegistry, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.instances(SERVICE).len() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("instances were not registered in time");
}

/// Issue a health check, returning the address of the backend that served it.
async fn check(client: &mut HealthClient<LoadBalancedChannel>) -> Result<String, tonic::Status> {
    let peer = Arc::new(Peer::default());
    let mut request = tonic::Request::new(HealthCheckRequest {
        service: String::new(),
    });
    request.extensions_mut().insert(Arc::clone(&peer));

    client.check(request).await?;

    Ok(peer
        .node()
        .expect("no node was recorded for the call")
        .address()
        .to_string())
}

#[tokio::test]
async fn calls_reach_every_discovered_instance() {
    // Steps:
    //  1. Register 3 backends.
    //  2. Eagerly resolve them, and do 9 gRPC calls.
    //  3. Assert that all 3 backends have been called.
    let registry = InMemoryRegistry::default();
    let mut backends = Vec::new();
    for _ in 0..3 {
        backends.push(Backend::start(&registry).await);
    }
    wait_for_instances(&registry, 3).await;

    let channel = LoadBalancedChannel::builder("discovery:///greeter")
        .discovery(registry.clone())
        .policy(Policy::Wrr)
        .resolution_strategy(ResolutionStrategy::Eager {
            timeout: Duration::from_secs(1),
        })
        .channel()
        .await
        .expect("failed to construct LoadBalancedChannel");
    let mut client = HealthClient::new(channel);

    let mut called = HashSet::new();
    for _ in 0..9 {
        called.insert(check(&mut client).await.expect("failed to call backend"));
    }

    let expected: HashSet<String> = backends
        .iter()
        .map(|backend| backend.address.clone())
        .collect();
    assert_eq!(called, expected);

    for backend in backends {
        backend.shutdown().await;
    }
}

#[tokio::test]
async fn calls_follow_registry_churn() {
    // Steps:
    //  1. Call the only registered backend.
    //  2. Register a second backend, and wait for calls to reach it.
    //  3. Stop the first backend, and wait for every call to reach the second.
    let registry = InMemoryRegistry::default();
    let first = Backend::start(&registry).await;
    wait_for_instances(&registry, 1).await;

    let channel = LoadBalancedChannel::builder("discovery:///greeter")
        .discovery(registry.clone())
        .timeout(Duration::from_secs(1))
        .channel()
        .await
        .expect("failed to construct LoadBalancedChannel");
    let mut client = HealthClient::new(channel);

    assert_eq!(check(&mut client).await.unwrap(), first.address);

    let second = Backend::start(&registry).await;
    wait_for_instances(&registry, 2).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while check(&mut client).await.ok().as_ref() != Some(&second.address) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("calls never reached the new backend");

    first.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut streak = 0;
        while streak < 5 {
            match check(&mut client).await {
                Ok(address) if address == second.address => streak += 1,
                _ => streak = 0,
            }
        }
    })
    .await
    .expect("calls kept reaching the stopped backend");

    second.shutdown().await;
}

#[tokio::test]
async fn calls_wait_for_the_first_instance() {
    let registry = InMemoryRegistry::default();
    let channel = LoadBalancedChannel::builder("discovery:///greeter")
        .discovery(registry.clone())
        .timeout(Duration::from_secs(5))
        .channel()
        .await
        .expect("failed to construct LoadBalancedChannel");
    let mut client = HealthClient::new(channel);

    let call = tokio::spawn(async move { check(&mut client).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let backend = Backend::start(&registry).await;

    assert_eq!(call.await.unwrap().unwrap(), backend.address);

    backend.shutdown().await;
}

#[tokio::test]
async fn calls_fail_when_nothing_is_ready_in_time() {
    let registry = InMemoryRegistry::default();
    let channel = LoadBalancedChannel::builder("discovery:///greeter")
        .discovery(registry)
        .timeout(Duration::from_millis(200))
        .channel()
        .await
        .expect("failed to construct LoadBalancedChannel");
    let mut client = HealthClient::new(channel);

    let status = check(&mut client)
        .await
        .expect_err("a call without any instance should fail");

    assert!(status.message().contains("no ready connection"));
}

#[tokio::test]
async fn direct_target_balances_fixed_addresses() {
    let (first, second) = (TestServer::bind().await, TestServer::bind().await);
    let addresses = [first.local_addr().to_string(), second.local_addr().to_string()];
    let builder = App::builder().name(SERVICE).server(first).server(second);
    #[cfg(unix)]
    let builder = builder.signals(Vec::new());
    let app = builder.build().unwrap();
    let running = tokio::spawn({
        let app = app.clone();
        async move { app.run().await }
    });

    let channel = LoadBalancedChannel::builder(format!("direct:///{}", addresses.join(",")))
        .policy(Policy::Wrr)
        .channel()
        .await
        .expect("failed to construct LoadBalancedChannel");
    let mut client = HealthClient::new(channel);

    let mut calls = HashMap::new();
    for _ in 0..4 {
        let address = check(&mut client).await.expect("failed to call backend");
        *calls.entry(address).or_insert(0) += 1;
    }

    assert_eq!(calls.get(&addresses[0]), Some(&2));
    assert_eq!(calls.get(&addresses[1]), Some(&2));

    app.stop().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn discovery_target_requires_a_discovery() {
    let result = LoadBalancedChannel::builder("discovery:///greeter")
        .channel()
        .await;

    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}
