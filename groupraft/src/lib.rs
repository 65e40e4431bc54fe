#![cfg_attr(feature = "docinclude", feature(external_doc))]
#![cfg_attr(feature = "docinclude", doc(include = "../README.md"))]

pub mod config;
mod core;
pub mod error;
pub mod fsm;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod network;
pub mod pgrep;
pub mod progress;
pub mod raft;
pub mod storage;

pub use async_trait;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::State;
pub use crate::error::ConfigError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::fsm::StateMachine;
pub use crate::membership::Configuration;
pub use crate::membership::Group;
pub use crate::membership::Phase;
pub use crate::membership::Role;
pub use crate::membership::Server;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::pgrep::NoopPgrep;
pub use crate::pgrep::PgrepHook;
pub use crate::raft::Raft;
pub use crate::storage::RaftStorage;

/// A Raft server's ID.
///
/// Zero is reserved and means "no server"; all real cluster members carry a
/// nonzero ID which must be stable across restarts.
pub type ServerId = u64;

/// A Raft election term.
pub type Term = u64;

/// A 1-based position in the replicated log.
pub type LogIndex = u64;
