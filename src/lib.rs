#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]

//! An event-sourcing storage runtime built directly on a commodity object
//! store (S3, Azure Blob, GCS, local disk, or in-memory, via the
//! [`object_store`] crate) rather than a purpose-built database.
//!
//! The runtime is organized as the components the design notes describe:
//!
//! - [`object_store_adapter`] (A): typed GET/PUT/HEAD/LIST/DELETE over one
//!   backend, with conditional-write preconditions and MD5 transport
//!   integrity.
//! - [`codec`] (B): the wire shape of a [`codec::StreamDocument`] and its
//!   canonical-hash bookkeeping.
//! - [`registry`] (C): the object-document registry binding a logical object
//!   to its currently-active stream.
//! - [`stream_store`] (D): append, read, and failed-commit compensation over
//!   a stream document.
//! - [`snapshot`] (E): point-in-time folded-state snapshots.
//! - [`tags`] (F): the stream-by-tag index.
//!
//! Component G, live stream migration, lives in the sibling
//! `eventually-migration` crate, which depends on this one the way
//! `eventually-postgres` depends on `eventually`.

pub mod codec;
pub mod error;
pub mod hash;
pub mod key;
pub mod object_store_adapter;
pub mod registry;
pub mod snapshot;
pub mod stream_store;
pub mod tags;
pub mod version;
