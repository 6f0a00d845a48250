//! FunASR backend against a fake engine on a loopback socket

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use beacon_voice::ErrorKind;
use beacon_voice::recognition::{
    FunAsrBackend, FunAsrConfig, RecognitionBackend, RecognitionResult,
};
use beacon_voice::utterance::{AudioChunk, AudioStream};

/// What the fake engine saw from the client
#[derive(Debug, Default)]
struct Received {
    start: Value,
    audio_bytes: usize,
    ended: bool,
}

/// How the fake engine answers once the client stops speaking
enum Reply {
    Messages(Vec<Value>),
    Close,
    Silent,
}

async fn fake_engine(reply: Reply) -> (u16, oneshot::Receiver<Received>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (done, received) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut seen = Received::default();

        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if seen.start.is_null() {
                        seen.start = value;
                    } else if value["is_speaking"] == false {
                        seen.ended = true;
                        break;
                    }
                }
                Message::Binary(bytes) => seen.audio_bytes += bytes.len(),
                _ => {}
            }
        }

        match reply {
            Reply::Messages(messages) => {
                for message in messages {
                    ws.send(Message::Text(message.to_string().into())).await.unwrap();
                }
                let _ = done.send(seen);
                // Hold the socket until the client closes it
                while let Some(Ok(_)) = ws.next().await {}
            }
            Reply::Close => {
                let _ = done.send(seen);
                let _ = ws.close(None).await;
            }
            Reply::Silent => {
                let _ = done.send(seen);
                while let Some(Ok(_)) = ws.next().await {}
            }
        }
    });

    (port, received)
}

fn backend(port: u16) -> FunAsrBackend {
    FunAsrBackend::new(FunAsrConfig {
        port,
        mode: "2pass".to_string(),
        connect_timeout: Duration::from_secs(2),
        ..FunAsrConfig::default()
    })
}

/// A closed utterance of `chunks` 100ms chunks
fn audio(chunks: u32) -> AudioStream {
    let (tx, rx) = mpsc::channel(chunks.max(1) as usize);
    for index in 0..chunks {
        tx.try_send(AudioChunk {
            utterance_id: 7,
            index,
            sample_rate: 16_000,
            channels: 1,
            samples: vec![0.25; 1_600],
        })
        .unwrap();
    }
    AudioStream::new(7, 16_000, 1, rx)
}

#[tokio::test]
async fn two_pass_results_stream_back() {
    let (port, received) = fake_engine(Reply::Messages(vec![
        json!({"mode": "2pass-online", "text": "turn on", "is_final": false}),
        json!({"mode": "2pass-online", "text": " the lite", "is_final": false}),
        json!({"mode": "2pass-offline", "text": "turn on the light.", "is_final": true}),
    ]))
    .await;

    let results: Vec<RecognitionResult> = backend(port)
        .recognize(audio(3), CancellationToken::new())
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;

    assert_eq!(
        results,
        vec![
            RecognitionResult::partial("turn on"),
            RecognitionResult::partial("turn on the lite"),
            RecognitionResult::final_text("turn on the light."),
        ]
    );

    let seen = received.await.unwrap();
    assert_eq!(seen.start["mode"], "2pass");
    assert_eq!(seen.start["wav_format"], "pcm");
    assert_eq!(seen.start["audio_fs"], 16_000);
    assert_eq!(seen.start["is_speaking"], true);
    assert_eq!(seen.start["wav_name"], "utterance-7");
    assert_eq!(seen.audio_bytes, 3 * 1_600 * 2);
    assert!(seen.ended);
}

#[tokio::test]
async fn engine_closing_early_is_a_transport_error() {
    let (port, received) = fake_engine(Reply::Close).await;

    let results: Vec<_> = backend(port)
        .recognize(audio(2), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert!(received.await.unwrap().ended);
    let last = results.last().expect("stream should report the failure");
    assert_eq!(last.as_ref().unwrap_err().kind(), ErrorKind::Transport);
    assert!(results.iter().all(|r| r.as_ref().map_or(true, |r| !r.is_final)));
}

#[tokio::test]
async fn unreachable_engine_fails_to_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    match backend(port)
        .recognize(audio(1), CancellationToken::new())
        .await
    {
        Err(e) => assert_eq!(e.kind(), ErrorKind::Transport),
        Ok(_) => panic!("connect should fail"),
    }
}

#[tokio::test]
async fn cancel_ends_the_result_stream() {
    let (port, received) = fake_engine(Reply::Silent).await;
    let cancel = CancellationToken::new();

    let mut results = backend(port)
        .recognize(audio(1), cancel.clone())
        .await
        .unwrap();
    received.await.unwrap();
    cancel.cancel();

    let next = tokio::time::timeout(Duration::from_secs(2), results.next())
        .await
        .expect("stream should end after cancel");
    assert!(next.is_none());
}

#[tokio::test]
async fn offline_pass_ends_the_utterance_without_final_flag() {
    let (port, received) = fake_engine(Reply::Messages(vec![
        json!({"mode": "2pass-online", "text": "turn of", "is_final": false}),
        json!({"mode": "2pass-offline", "text": "turn off the light.", "is_final": false}),
    ]))
    .await;

    let results = tokio::time::timeout(
        Duration::from_secs(2),
        backend(port)
            .recognize(audio(2), CancellationToken::new())
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect::<Vec<_>>(),
    )
    .await
    .expect("offline pass should finish the stream");

    assert_eq!(
        results,
        vec![
            RecognitionResult::partial("turn of"),
            RecognitionResult::final_text("turn off the light."),
        ]
    );
    assert!(received.await.unwrap().ended);
}

#[tokio::test]
async fn cancel_while_engine_stops_reading() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (accepted, handshake) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        let _ = accepted.send(());
        // Never read, so the client's writes back up
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(ws);
    });

    // Far more audio than loopback socket buffers hold
    let chunks = 64;
    let (tx, rx) = mpsc::channel(chunks);
    for index in 0..chunks as u32 {
        tx.try_send(AudioChunk {
            utterance_id: 9,
            index,
            sample_rate: 16_000,
            channels: 1,
            samples: vec![0.25; 160_000],
        })
        .unwrap();
    }
    drop(tx);

    let cancel = CancellationToken::new();
    let mut results = backend(port)
        .recognize(AudioStream::new(9, 16_000, 1, rx), cancel.clone())
        .await
        .unwrap();
    handshake.await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let next = tokio::time::timeout(Duration::from_secs(2), results.next())
        .await
        .expect("cancel should close the socket despite a stalled send");
    assert!(next.is_none());
}
