pub mod connection;
pub mod ice;
pub mod media;
pub mod negotiation;
pub mod state;
pub mod types;

pub use connection::{PeerConnection, PeerFactory, PeerState, RtcPeer, RtcPeerFactory};
pub use media::{
    acquire_local_media, LocalMedia, LocalStream, LocalTrack, MediaDevices, RemoteStream,
    SyntheticDevices, TrackKind,
};
pub use negotiation::{create_room, join_room, CallContext};
pub use state::NegotiationState;
pub use types::{CallKind, CandidateRecord, Role, Room, SdpKind, ServerConfig, SessionDescription};
