//! LSP server for the Cap'n Proto schema language.
//!
//! The editor talks JSON-RPC over stdio; the server recompiles `.capnp`
//! files with the external `capnp` compiler on open/save, ingests the
//! compiler's `CodeGeneratorRequest` output into symbol indices, answers
//! go-to-definition from those indices, and publishes compile errors as
//! diagnostics.

pub mod codec;
pub mod compiler;
pub mod diagnostics;
pub mod handler;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod subprocess;
pub mod types;
