//! taskforge daemon: bootstraps the declared agents and runs the
//! controller, worker and generic loops until shutdown.

pub mod daemon;
