//! pgweir: connection-pooling proxy for PostgreSQL.
//!
//! Clients speak the PostgreSQL v3 wire protocol to the proxy, which
//! multiplexes them over a bounded set of long-lived backend connections
//! routed by (user, database). Runs either as a single process, or as a
//! dispatcher handing accepted sockets to worker processes over SCM_RIGHTS
//! fd-passing, one worker per backend group.

pub mod core;
pub mod dispatcher;
pub mod errors;
pub mod fd_passing;
pub mod listener;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod session;
pub mod telemetry;

#[cfg(test)]
mod test_support;
