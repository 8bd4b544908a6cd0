#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]

//! Component G: live, zero-downtime migration of an open event stream into
//! a successor stream, built on top of [`eventually_object_store`]'s
//! stream store and registry. A satellite crate over the root runtime, the
//! same relationship `eventually-postgres` has to `eventually`.

pub mod context;
pub mod engine;
pub mod error;
pub mod result;

pub use context::{CatchUpProgress, EventProgress, FailureStrategy, LiveMigrationContext, Options, TransformError, Transformer};
pub use engine::MigrationEngine;
pub use error::MigrationError;
pub use result::LiveMigrationResult;
