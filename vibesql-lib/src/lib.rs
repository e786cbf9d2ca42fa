//! Zero-configuration local PostgreSQL.
//!
//! VibeSQL embeds a PostgreSQL server, supervises its lifecycle, and exposes
//! a restricted HTTP/JSON query surface on localhost. One command gives a
//! developer a full engine — JSONB included — with no install, no daemon, no
//! auth configuration, and disk-persistent state.
//!
//! The crate is organised around three subsystems:
//!
//! - [`supervisor`] extracts the bundled engine, initialises a data
//!   directory on first run, launches and monitors the server process, and
//!   guarantees orderly teardown. [`assets`] holds the per-platform set of
//!   embedded files it materialises.
//! - [`query`] validates statements against explicit size and safety rules
//!   and executes them under a hard deadline and row cap.
//! - [`gateway`] terminates HTTP on `POST /v1/query` and maps every outcome
//!   into a fixed JSON envelope.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod assets;
pub mod connection;
pub mod gateway;
pub mod query;
pub mod supervisor;

pub(crate) mod util;
