//! End-to-end playback behavior over an in-memory recording.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tapedeck::sources::{MemorySource, MergedSource};
use tapedeck::{
    Decoder, DecoderFactory, ParsedValue, PlayerOptions, PlayerPresence, PlayerState,
    StateListener, SubscribePayload, Tapedeck, Time,
};

struct F64Decoder;

impl Decoder for F64Decoder {
    fn decode(&self, data: &[u8]) -> tapedeck::Result<ParsedValue> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| tapedeck::PlaybackError::decode("payload", "expected 8 bytes"))?;
        Ok(ParsedValue::Float(f64::from_le_bytes(bytes)))
    }
}

struct F64Factory;

impl DecoderFactory for F64Factory {
    fn make_decoder(
        &self,
        _schema_name: &str,
        _schema_text: &str,
    ) -> tapedeck::Result<Arc<dyn Decoder>> {
        Ok(Arc::new(F64Decoder))
    }
}

/// A 0..10s recording with one message per second on /a and /b, served with
/// artificial latency so buffering transitions are observable.
fn slow_source() -> Arc<MemorySource> {
    let mut builder = MemorySource::builder()
        .topic("/a", "test.Value")
        .topic("/b", "test.Value")
        .schema("test.Value", 1, "float64 value")
        .range(Time::ZERO, Time::from_secs(10))
        .latency(Duration::from_millis(150));
    for sec in 0..10 {
        builder = builder
            .raw_message("/a", Time::from_secs(sec), (sec as f64).to_le_bytes().to_vec())
            .raw_message("/b", Time::from_secs(sec), (-sec as f64).to_le_bytes().to_vec());
    }
    Arc::new(builder.build())
}

fn collecting_listener() -> (StateListener, Arc<Mutex<Vec<PlayerState>>>) {
    let states: Arc<Mutex<Vec<PlayerState>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let listener: StateListener = Box::new(move |state| {
        sink.lock().push(state);
        Box::pin(async {})
    });
    (listener, states)
}

#[tokio::test(start_paused = true)]
async fn seek_then_play_yields_ordered_messages_after_the_target() {
    let _ = tracing_subscriber::fmt::try_init();
    let player = Tapedeck::open_with(
        slow_source(),
        PlayerOptions { decoder_factory: Some(Arc::new(F64Factory)), ..Default::default() },
    );
    let (listener, states) = collecting_listener();

    player.set_subscriptions("plot", vec![SubscribePayload::full("/a")]);
    player.set_listener(listener);

    let mut rx = player.state_watch();
    rx.wait_for(|s| s.presence == PlayerPresence::Present).await.unwrap();

    // Forget everything before the seek; only post-seek messages matter.
    states.lock().clear();
    player.seek_playback(Time::from_secs(5));
    rx.wait_for(|s| {
        s.presence == PlayerPresence::Present
            && s.active_data.as_ref().is_some_and(|a| a.current_time == Time::from_secs(5))
    })
    .await
    .unwrap();

    player.start_playback();
    rx.wait_for(|s| {
        s.active_data.as_ref().is_some_and(|a| a.current_time >= Time::from_secs(9))
    })
    .await
    .unwrap();
    player.pause_playback();
    rx.wait_for(|s| s.active_data.as_ref().is_some_and(|a| !a.is_playing)).await.unwrap();

    let collected = states.lock();

    // The slow backfill acknowledged the seek with Buffering first.
    let buffering_at = collected
        .iter()
        .position(|s| s.presence == PlayerPresence::Buffering)
        .expect("buffering during seek");
    assert!(
        collected[buffering_at..].iter().any(|s| s.presence == PlayerPresence::Present),
        "present again after the buffering ack"
    );

    let messages: Vec<_> =
        collected.iter().flat_map(|s| s.active_data.iter()).flat_map(|a| &a.messages).collect();
    assert!(!messages.is_empty());
    for msg in &messages {
        assert_eq!(msg.topic, "/a");
        assert!(msg.receive_time >= Time::from_secs(5));
        // The decoder ran; payloads arrive parsed.
        assert!(matches!(msg.parsed_value(), Some(ParsedValue::Float(_))));
    }
    for pair in messages.windows(2) {
        assert!(pair[0].receive_time <= pair[1].receive_time);
    }

    drop(collected);
    player.close();
    player.closed().await;
}

#[tokio::test(start_paused = true)]
async fn close_during_a_seek_shuts_down_cleanly() {
    let _ = tracing_subscriber::fmt::try_init();
    let player = Tapedeck::open(slow_source());
    player.set_subscriptions("panel", vec![SubscribePayload::partial("/a")]);
    player.start();

    let mut rx = player.state_watch();
    rx.wait_for(|s| s.presence == PlayerPresence::Present).await.unwrap();

    player.seek_playback(Time::from_secs(7));
    player.close();

    tokio::time::timeout(Duration::from_secs(5), player.closed())
        .await
        .expect("clean shutdown");
    assert_eq!(rx.borrow().presence, PlayerPresence::NotPresent);
}

#[tokio::test(start_paused = true)]
async fn merged_recordings_play_as_one_timeline() {
    let _ = tracing_subscriber::fmt::try_init();
    let first = MemorySource::builder()
        .topic("/a", "test.Value")
        .raw_message("/a", Time::from_secs(1), vec![0; 8])
        .raw_message("/a", Time::from_secs(3), vec![0; 8])
        .range(Time::ZERO, Time::from_secs(4))
        .build();
    let second = MemorySource::builder()
        .topic("/b", "test.Value")
        .raw_message("/b", Time::from_secs(2), vec![0; 8])
        .range(Time::ZERO, Time::from_secs(4))
        .build();
    let player =
        Tapedeck::open_all(vec![Arc::new(first), Arc::new(second)]);
    let (listener, states) = collecting_listener();

    player.set_subscriptions(
        "panel",
        vec![SubscribePayload::partial("/a"), SubscribePayload::partial("/b")],
    );
    player.set_listener(listener);

    let mut rx = player.state_watch();
    rx.wait_for(|s| s.presence == PlayerPresence::Present).await.unwrap();

    player.start_playback();
    rx.wait_for(|s| {
        s.active_data.as_ref().is_some_and(|a| a.current_time >= Time::from_secs(4))
    })
    .await
    .unwrap();

    let collected = states.lock();
    let times: Vec<(String, i64)> = collected
        .iter()
        .flat_map(|s| s.active_data.iter())
        .flat_map(|a| &a.messages)
        .map(|m| (m.topic.clone(), m.receive_time.sec))
        .collect();
    assert_eq!(
        times,
        vec![
            ("/a".to_string(), 1),
            ("/b".to_string(), 2),
            ("/a".to_string(), 3),
        ]
    );

    drop(collected);
    player.close();
    player.closed().await;
}

#[tokio::test(start_paused = true)]
async fn subscription_change_refetches_current_values() {
    let _ = tracing_subscriber::fmt::try_init();
    let player = Tapedeck::open(slow_source());
    player.set_subscriptions("panel", vec![SubscribePayload::partial("/a")]);
    player.start();

    let mut rx = player.state_watch();
    rx.wait_for(|s| s.presence == PlayerPresence::Present).await.unwrap();
    player.seek_playback(Time::from_secs(6));
    rx.wait_for(|s| {
        s.active_data.as_ref().is_some_and(|a| a.current_time == Time::from_secs(6))
    })
    .await
    .unwrap();

    let (listener, states) = collecting_listener();
    player.set_listener(listener);

    // Adding /b triggers a refetch at the cursor so the new subscriber gets
    // its last-known value without waiting for playback.
    player.set_subscriptions(
        "panel",
        vec![SubscribePayload::partial("/a"), SubscribePayload::partial("/b")],
    );
    // The listener log is lossless, unlike the latest-wins watch channel.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let seen = states.lock().iter().any(|s| {
                s.active_data
                    .as_ref()
                    .is_some_and(|a| a.messages.iter().any(|m| m.topic == "/b"))
            });
            if seen {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("backfilled /b message");

    let collected = states.lock();
    let backfilled: Vec<_> = collected
        .iter()
        .flat_map(|s| s.active_data.iter())
        .flat_map(|a| &a.messages)
        .filter(|m| m.topic == "/b")
        .collect();
    assert!(backfilled.iter().all(|m| m.receive_time <= Time::from_secs(6)));
    assert!(!backfilled.is_empty());

    drop(collected);
    player.close();
    player.closed().await;
}
