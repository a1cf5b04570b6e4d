// Library module organization

pub mod cli;
pub mod config;
pub mod errors;
pub mod middleware;
pub mod printers;
pub mod renderer;
pub mod routes;
pub mod server;
pub mod service;

// Re-export commonly used types for convenience
pub use config::{ConfigStore, ServerConfig};
pub use errors::{ApiError, PrintError, ServerError};
pub use printers::{platform_backend, Printer, PrinterBackend};
pub use renderer::{ChromeRenderer, PageRenderer, PrintLayout};
pub use server::{ServerManager, ServerState, ServerStatus};
pub use service::PrintService;
