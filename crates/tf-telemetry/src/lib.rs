//! Logging setup shared by the taskforge binaries: human-readable or JSON
//! output through `tracing-subscriber`, filtered by `RUST_LOG` or the
//! configured level.

pub mod logging;
