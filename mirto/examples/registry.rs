use std::time::Duration;

use anyhow::Context;
use mirto::{App, LoadBalancedChannel, ResolutionStrategy};
use tests::{registry::InMemoryRegistry, test_server::TestServer};
use tonic_health::pb::{health_client::HealthClient, HealthCheckRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = InMemoryRegistry::default();

    // Serve the health service, and register it as `greeter` once it is ready.
    let app = App::builder()
        .name("greeter")
        .version("v1")
        .registrar(registry.clone())
        .server(TestServer::bind().await)
        .build()?;
    let running = tokio::spawn({
        let app = app.clone();
        async move { app.run().await }
    });

    while registry.instances("greeter").is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let channel = LoadBalancedChannel::builder("discovery:///greeter")
        .discovery(registry)
        .resolution_strategy(ResolutionStrategy::Eager {
            timeout: Duration::from_secs(1),
        })
        .channel()
        .await
        .context("failed to build LoadBalancedChannel")?;
    let mut client = HealthClient::new(channel);

    let response = client
        .check(tonic::Request::new(HealthCheckRequest {
            service: String::new(),
        }))
        .await?;
    println!("RESPONSE={response:?}");

    app.stop().await?;
    running.await??;

    Ok(())
}
