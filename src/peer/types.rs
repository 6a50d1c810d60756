use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Тип звонка
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }
}

impl std::str::FromStr for CallKind {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "voice" => Ok(CallKind::Voice),
            "video" => Ok(CallKind::Video),
            other => Err(CallError::InvalidConfig(format!("unknown call kind: {other}"))),
        }
    }
}

/// Сторона звонка
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Создаёт комнату и offer
    Initiator,
    /// Подключается к комнате и пишет answer
    Responder,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP в том виде, в котором он лежит в документе комнаты: `{type, sdp}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        let desc = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone())?,
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone())?,
        };
        Ok(desc)
    }

    pub fn from_rtc(desc: &RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => {
                return Err(CallError::Peer(format!(
                    "unsupported session description type: {other}"
                )))
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }
}

/// ICE кандидат в формате `RTCIceCandidate.toJSON()` браузера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for CandidateRecord {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidateRecord> for RTCIceCandidateInit {
    fn from(record: CandidateRecord) -> Self {
        RTCIceCandidateInit {
            candidate: record.candidate,
            sdp_mid: record.sdp_mid,
            sdp_mline_index: record.sdp_m_line_index,
            username_fragment: record.username_fragment,
        }
    }
}

/// Документ комнаты в хранилище.
///
/// `offer` пишет только инициатор, `answer` только ответчик, `ended`
/// ставит инициатор при завершении. Второй ответчик перезапишет `answer`
/// без обнаружения конфликта.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Room {
    pub kind: CallKind,
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<i64>,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}
