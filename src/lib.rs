//! Relay-assisted p2p TCP connectivity.
//!
//! Two peers that agree out-of-band on a shared token and a common rendezvous
//! server establish a single TCP byte stream between themselves: directly
//! when hole punching succeeds, or through the server acting as a relay when
//! it doesn't. Both bearers speak the same byte-level protocol, so the
//! application never needs to care which one it got.
//!
//! The pieces:
//!
//! - [`Client`] runs one connection attempt per [`Client::dial`] or
//!   [`Client::accept`] call: it binds a port-reusable [`Socket`], performs
//!   the HTTP upgrade with the server, races every candidate address against
//!   the relay bearer, and returns the winning [`Conn`].
//! - [`Server`] is the rendezvous side: it parks upgraded conns in a lobby,
//!   pairs them up by token (one dialer, one acceptor), and hands matched
//!   pairs to a [`Relayer`].
//! - [`AddrSpace`] classifies and masks candidate addresses, so deployments
//!   can restrict peering to, say, public or loopback addresses only.
//!
//! The established stream is neither authenticated nor encrypted; layer TLS
//! or an equivalent on top.

mod addr;
mod client;
mod conn;
mod error;
mod http;
mod ifaces;
mod relay;
mod server;
mod socket;

pub use addr::{acceptable, good_observed, good_self, space_of, AddrSpace};
pub use client::{relay_penalty, ChooseFuture, Chooser, Client, ClientConfig, SelfAddrFn};
pub use conn::{Conn, Meta};
pub use error::{AddrError, Error};
pub use http::{Response, UpgradeRequest};
pub use ifaces::{default_self_addrs, query, Interface};
pub use relay::{Relayer, Tap};
pub use server::{default_observed_addr, ObservedAddrFn, ServeFn, ServeFuture, Server, ServerConfig};
pub use socket::Socket;
