pub mod context;
mod errors;
mod handle_dispatch;
mod handle_status;
pub mod server;
