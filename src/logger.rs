use crate::peer::types::CandidateRecord;
use std::io::Write;
use std::sync::Once;
use webrtc::peer_connection::RTCPeerConnection;

static INIT: Once = Once::new();

/// Подключает env_logger с форматом "RUST: [время] сообщение".
/// Повторные вызовы ничего не делают.
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(::log::LevelFilter::Info)
            .parse_default_env()
            .format(|buf, record| {
                let now = chrono::Local::now();
                writeln!(
                    buf,
                    "RUST: [{}] {}",
                    now.format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.args()
                )
            })
            .try_init();
    });
}

fn enabled() -> bool {
    // В режиме разработки дополнительно проверяем dev::ENABLE_LOGGING
    crate::config::LOGGING_ENABLED && crate::config::dev::ENABLE_LOGGING
}

/// Логирование с временными метками
pub fn log(msg: &str) {
    if enabled() {
        ::log::info!("{msg}");
    }
}

/// Сбои, которые поглощаются и не прерывают звонок
pub fn warn(msg: &str) {
    if enabled() {
        ::log::warn!("{msg}");
    }
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &CandidateRecord) {
    log(&format!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_m_line_index, cand.username_fragment
    ));
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                log(&format!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                ));
            }
        }
    }
}
