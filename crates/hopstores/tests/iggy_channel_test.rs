// crates/hopstores/tests/iggy_channel_test.rs
//
// Exercises the Iggy-backed step channel against a real server. Start
// one with: docker run -p 8090:8090 iggyrs/iggy

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hopcore::channel::{MessageChannel, MessageHandler, StepMessage};
use hopstores::{IggyChannelConfig, IggyStepChannel};
use uuid::Uuid;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn iggy_available() -> bool {
    tokio::net::TcpStream::connect("127.0.0.1:8090")
        .await
        .is_ok()
}

/// A throwaway stream per test run so runs never see each other's
/// messages.
fn test_config() -> IggyChannelConfig {
    let suffix = Uuid::new_v4().simple().to_string();
    IggyChannelConfig {
        stream_name: format!("hoptest-{suffix}"),
        consumer_group: format!("hoptest-group-{suffix}"),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore] // Requires running Iggy server
async fn test_connect_creates_stream_and_topic() {
    init_tracing();
    if !iggy_available().await {
        println!("Skipping test: Iggy is not available on 127.0.0.1:8090");
        return;
    }

    let config = test_config();
    println!("Using stream {}", config.stream_name);
    IggyStepChannel::connect(config.clone())
        .await
        .expect("first connect provisions the stream");
    // A second connect finds the stream and topic already there.
    IggyStepChannel::connect(config)
        .await
        .expect("second connect reuses them");
    println!("Stream and topic provisioning OK");
}

#[tokio::test]
#[ignore] // Requires running Iggy server
async fn test_published_activation_reaches_the_subscriber() {
    init_tracing();
    if !iggy_available().await {
        println!("Skipping test: Iggy is not available on 127.0.0.1:8090");
        return;
    }

    let channel = IggyStepChannel::connect(test_config())
        .await
        .expect("connect");

    let received: Arc<Mutex<Vec<StepMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler: MessageHandler = Arc::new(move |message| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().unwrap().push(message);
            Ok(())
        })
    });
    channel.subscribe(handler).await.expect("subscribe");

    // Give the consumer group a moment to join before publishing.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let sent = StepMessage::activation("t-wire", "a->end", 1);
    channel.send(sent.clone()).await.expect("send");
    println!("Published activation {}", sent.message_id);

    let mut delivered = Vec::new();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        delivered = received.lock().unwrap().clone();
        if !delivered.is_empty() {
            break;
        }
    }
    assert_eq!(delivered.len(), 1, "expected exactly one delivery");
    assert_eq!(delivered[0].message_id, sent.message_id);
    assert_eq!(delivered[0].trace_id, "t-wire");
    assert_eq!(delivered[0].step_id.as_deref(), Some("a->end"));
    println!("Roundtrip OK");
}
