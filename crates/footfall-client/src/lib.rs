//! Protocol drivers for footfall.
//!
//! Each driver implements [`footfall_core::Driver`]: execute one task,
//! honour the cancellation token, enforce the task's own timeout, and
//! report the outcome as a status code or a [`footfall_core::DriverError`].

mod browser;
mod dns;
mod http;
mod websocket;

pub use browser::BrowserDriver;
pub use dns::DnsDriver;
pub use http::HttpDriver;
pub use websocket::WebsocketDriver;

use std::collections::HashMap;
use std::sync::Arc;

use footfall_core::{AppError, Driver, TaskKind};

/// Builds the full driver set the engine dispatches through.
pub fn default_drivers() -> Result<HashMap<TaskKind, Arc<dyn Driver>>, AppError> {
    let mut drivers: HashMap<TaskKind, Arc<dyn Driver>> = HashMap::new();
    drivers.insert(TaskKind::Http, Arc::new(HttpDriver::new()?));
    drivers.insert(TaskKind::Browser, Arc::new(BrowserDriver::new()));
    drivers.insert(TaskKind::Dns, Arc::new(DnsDriver::new()));
    drivers.insert(TaskKind::Websocket, Arc::new(WebsocketDriver::new()));
    Ok(drivers)
}
