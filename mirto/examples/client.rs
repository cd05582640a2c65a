use std::time::Duration;

use anyhow::Context;
use mirto::{LoadBalancedChannel, Policy};
use tonic_health::pb::{health_client::HealthClient, HealthCheckRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Balance over two fixed backends, round robin.
    let channel = LoadBalancedChannel::builder("direct:///127.0.0.1:5000,127.0.0.1:5001")
        .policy(Policy::Wrr)
        .timeout(Duration::from_secs(5))
        .channel()
        .await
        .context("failed to build LoadBalancedChannel")?;

    let mut client = HealthClient::new(channel);

    let request = tonic::Request::new(HealthCheckRequest {
        service: String::new(),
    });

    let response = client.check(request).await?;

    println!("RESPONSE={response:?}");

    Ok(())
}
