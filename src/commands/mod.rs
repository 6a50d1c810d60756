//! Поверхность для приложения: управление звонком и служебные проверки

pub mod call_api;
pub mod util_api;

pub use call_api::{CallController, CallState};
pub use util_api::check_ice_server_availability;
