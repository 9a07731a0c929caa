//! Stratum v1 server side.
//!
//! [`server::StratumServer`] accepts miners on a coin's port and runs one
//! [`session::Session`] per connection over a line-framed
//! [`connection::Connection`].

pub mod connection;
pub mod error;
pub mod messages;
pub mod server;
pub mod session;

pub use connection::{Connection, Transport};
pub use error::{StratumError, StratumResult};
pub use messages::{ClientRequest, JsonRpcMessage};
pub use server::StratumServer;
pub use session::Session;
