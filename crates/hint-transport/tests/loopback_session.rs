/// Loopback session driven through the public session traits only.
use std::sync::Arc;
use std::time::Duration;

use hint_transport::{
    BareJid, FullJid, LoopbackSession, PresenceDirectory, PresenceEvent, Query, SampleBatchesPayload,
    Sender, SessionEvents,
};

fn jid(s: &str) -> FullJid {
    s.parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn clones_share_presence_and_deliveries() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let session = LoopbackSession::new();
    let sender: Arc<dyn Sender> = Arc::new(session.clone());
    let directory: Arc<dyn PresenceDirectory> = Arc::new(session.clone());
    let mut events = session.subscribe();

    session.set_available(jid("collector@hub/a"));
    let bare: BareJid = "collector@hub".parse().unwrap();
    assert_eq!(directory.present_resources(&bare), vec!["a"]);
    assert_eq!(
        events.recv().await.unwrap(),
        PresenceEvent::Available(jid("collector@hub/a"))
    );

    session.set_latency(Some(Duration::from_millis(250)));
    let started = tokio::time::Instant::now();
    let query = Query::SampleBatches(SampleBatchesPayload::new("hub"));
    sender.send_request(&jid("collector@hub/a"), &query).await.unwrap();
    assert_eq!(started.elapsed(), Duration::from_millis(250));

    session.wait_delivered(1).await;
    assert_eq!(session.delivered(), vec![(jid("collector@hub/a"), query)]);
}

#[tokio::test]
async fn offline_identity_refuses_requests() {
    let session = LoopbackSession::new();
    let mut events = session.subscribe();
    session.set_available(jid("collector@hub/a"));
    session.set_available(jid("collector@hub/b"));
    session.set_offline(&"collector@hub".parse().unwrap());

    let query = Query::SampleBatches(SampleBatchesPayload::new("hub"));
    let err = session
        .send_request(&jid("collector@hub/b"), &query)
        .await
        .unwrap_err();
    assert!(err.is_transient());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen.last(),
        Some(&PresenceEvent::IdentityOffline("collector@hub".parse().unwrap()))
    );
}
