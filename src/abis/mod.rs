pub mod registry;

pub use registry::{IDomainRegistry, Transfer};
