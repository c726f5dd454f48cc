#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod connection;
pub mod decode;
pub mod error;

pub use config::{Config, ProtocolOptions, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use decode::{JsonDecoder, MessageDecoder, Payload};
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
