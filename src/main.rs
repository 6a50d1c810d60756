// Демо: звонок самому себе через общее хранилище в памяти.
// Запуск: chatcall [voice|video]

use bytes::Bytes;
use chatcall_lib::logger::{self, log};
use chatcall_lib::peer::{LocalTrack, RtcPeerFactory, SyntheticDevices};
use chatcall_lib::{
    create_room, join_room, CallConfig, CallContext, CallKind, MemoryStore, NegotiationState,
    Session,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use webrtc::media::Sample;

/// Opus-кадр тишины на 20 мс
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

fn audio_tracks(session: &Session) -> Vec<Arc<LocalTrack>> {
    session
        .local()
        .stream()
        .map(|s| s.audio_tracks().cloned().collect())
        .unwrap_or_default()
}

/// Пишет тишину в треки, пока не придёт сигнал остановки
fn pump_silence(tracks: Vec<Arc<LocalTrack>>, mut stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = Sample {
                        data: Bytes::from_static(&OPUS_SILENCE),
                        duration: Duration::from_millis(20),
                        ..Default::default()
                    };
                    for track in &tracks {
                        if let Err(e) = track.write_sample(&sample).await {
                            logger::warn(&format!("Failed to write sample: {e}"));
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }
    });
}

async fn wait_connected(caller: &Session, callee: &Session) -> bool {
    let both = async {
        loop {
            if caller.state() == NegotiationState::Connected
                && callee.state() == NegotiationState::Connected
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(CONNECT_TIMEOUT, both).await.is_ok()
}

#[tokio::main]
async fn main() -> chatcall_lib::Result<()> {
    logger::init();

    let kind = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => CallKind::Voice,
    };

    let store = MemoryStore::new();
    let ctx = CallContext::new(
        Arc::new(store),
        Arc::new(RtcPeerFactory),
        Some(Arc::new(SyntheticDevices::new())),
        CallConfig::host_only(),
    );

    let caller = create_room(&ctx, kind).await?;
    log(&format!("Room created: {}", caller.room_id()));
    let callee = match join_room(&ctx, caller.room_id(), kind).await {
        Ok(session) => session,
        Err(e) => {
            caller.hangup().await;
            return Err(e);
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    pump_silence(audio_tracks(&caller), stop_rx.clone());
    pump_silence(audio_tracks(&callee), stop_rx);

    let connected = wait_connected(&caller, &callee).await;
    if connected {
        // даём медиа немного пройти
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!(
        "room={} kind={} connected={} caller_remote_tracks={} callee_remote_tracks={} \
         candidates_applied={}/{}",
        caller.room_id(),
        kind.as_str(),
        connected,
        caller.remote().tracks().len(),
        callee.remote().tracks().len(),
        caller.remote_candidates_applied().await,
        callee.remote_candidates_applied().await,
    );

    let _ = stop_tx.send(true);
    callee.hangup().await;
    caller.hangup().await;
    Ok(())
}
