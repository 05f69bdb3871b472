#![deny(clippy::all)]

pub mod packet;
pub mod server;
pub mod session;

pub use server::{Config, Server, Stopper};
