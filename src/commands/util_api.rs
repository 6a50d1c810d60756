use crate::logger::log;
use crate::peer::ice;
use crate::peer::types::ServerConfig;
use std::time::Duration;

/// Сколько ждём srflx/relay кандидата от проверяемого сервера
pub const ICE_CHECK_WAIT: Duration = Duration::from_secs(10);

/// проверка доступности ICE сервера
pub async fn check_ice_server_availability(config: ServerConfig) -> bool {
    let available = ice::check_ice_server_availability(&config, ICE_CHECK_WAIT).await;
    log(&format!(
        "ICE server {} ({}) available: {available}",
        config.url, config.r#type
    ));
    available
}
