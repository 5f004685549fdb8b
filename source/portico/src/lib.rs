pub mod app_context;
pub mod logging;
pub mod proxy;
