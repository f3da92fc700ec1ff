//! Small shared helpers with no dependency on the execution engine.

pub mod id_generator;

pub use id_generator::IdGenerator;
