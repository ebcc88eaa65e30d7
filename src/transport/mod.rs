//! Transport roles and the shared result queue.
//!
//! Clients dial out through the Tor SOCKS proxy and report one outcome each.
//! Servers accept connections, validate one frame per connection and report
//! what they accepted. Everything the rest of the application learns from
//! this layer arrives as a [`ResultEvent`] on a [`ResultQueue`].

mod client;
mod event;
mod server;
mod socks;

pub use client::{ClientKind, ClientRole, ClientWidget};
pub use event::{result_queue, ResultEvent, ResultQueue, ResultReceiver};
pub use server::{
    serve_connection, Accepted, ContactRequestServer, ContactResponseServer, Listener,
    MessageServer, ServerRole, ServerWidget,
};
pub use socks::{Dialer, SocksError};
