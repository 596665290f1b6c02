pub mod address;
pub mod assistant;
pub mod changes;
pub mod cli;
pub mod config;
pub mod errors;
pub mod export;
pub mod formula;
pub mod grid;
pub mod model;
pub mod parser;
pub mod runtime;
pub mod security;
pub mod server;
pub mod session;
pub mod state;

pub use config::{CliArgs, ServerConfig};
pub use server::{router, run_server};
pub use session::WorkbookSession;
pub use state::AppState;
