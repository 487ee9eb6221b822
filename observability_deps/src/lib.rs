//! Observability ecosystem dependencies for the duplication mill, to ensure
//! consistent versions and unified updates.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
