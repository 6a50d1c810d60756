//! Установка peer-to-peer звонка (голос/видео) через общее хранилище
//! документов как канал сигналинга.
//!
//! Инициатор создаёт комнату ([`create_room`]), собеседник подключается к ней
//! по id ([`join_room`]). Обе стороны получают [`Session`] с единственным
//! идемпотентным завершением.

pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod presence;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use commands::{CallController, CallState};
pub use config::CallConfig;
pub use error::{CallError, CaptureError, Result, StoreError};
pub use peer::{
    acquire_local_media, create_room, join_room, CallContext, CallKind, LocalMedia,
    NegotiationState, Role,
};
pub use session::Session;
pub use signaling::{DocumentStore, MemoryStore};
