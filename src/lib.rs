//! DICOM upper layer protocol engine.
//!
//! [pdu] encodes and decodes the seven PDU types, [association] is the state machine of one
//! association, [command] and [message] model DIMSE messages. [Client] and
//! [handle_association] drive associations over a transport for either role.

pub mod association;
mod association_error;
mod client;
pub mod command;
mod config;
mod connection;
pub mod dataset;
pub mod error;
mod example_scp;
mod listener_tcp_loop;
pub mod message;
pub mod negotiation;
pub mod pdu;
mod run_from_env;
mod scp;
mod settings;
pub mod statistics;
pub mod transport;
pub mod uids;

pub use association_error::AssociationError;
pub use client::{Client, ClientEvent, ClientHooks, ClientOptions, DefaultClientHooks, RequestHandle};
pub use command::{Command, CommandField, Priority, Status, StatusKind};
pub use connection::Connection;
pub use example_scp::ExampleScp;
pub use listener_tcp_loop::dicom_listener_tcp_loop;
pub use message::Message;
pub use negotiation::{AcceptorPolicy, UserIdentityVerifier, UsernamePasscode};
pub use run_from_env::run_server_from_env;
pub use scp::{Scp, ScpContext, ServerOptions, handle_association, respond};
pub use settings::{AeTitle, OxidimseEnvOptions, ScpSettings};
pub use statistics::{OtelStatistics, Statistics, StatisticsSink};
