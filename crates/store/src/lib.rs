//! Job store contract and implementations.
//!
//! The dispatcher depends only on the [`JobStore`] trait. Two
//! implementations are provided:
//!
//! - [`PostgresJobStore`]: the production store. Skip-locked claims,
//!   LISTEN/NOTIFY wake-ups, advisory-lock leadership.
//! - [`InMemoryJobStore`]: the same dispatch policy in process memory, for
//!   tests and development without a database.

pub mod contract;
pub mod memory;
pub mod postgres;

pub use contract::{JobNotice, JobStore, JobSubscription, RequeuedJob};
pub use memory::{InMemoryJobStore, JobRecord};
pub use postgres::PostgresJobStore;
