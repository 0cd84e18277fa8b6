pub mod artifacts;
pub mod assignment;
pub mod context;
pub mod controller;
pub mod generic;
pub mod phases;
pub mod prompts;
pub mod registry;
pub mod worker;
