mod client;
mod protocol;
mod server;
mod spawn;

pub use client::SudoClient;
pub use protocol::{validate_request_paths, SudoRequest, SudoResponse};
pub use server::SudoServer;
pub use spawn::{serve, spawn_helper};

#[cfg(test)]
mod tests;
