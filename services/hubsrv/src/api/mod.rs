//! Client-facing APIs: the binary TCP command protocol and the admin HTTP routes

pub mod admin;
pub mod commands;
pub mod handlers;
pub mod server;

pub use admin::{create_routes, AdminState};
pub use commands::{ApiCommand, CommandError, ModePolicy};
pub use handlers::ApiHandler;
pub use server::{ApiServer, Reply};
