/// Project collaborators
///
/// Project lookup for routed requests and secret resolution for running programs.

pub mod catalog;
pub mod secrets;
pub mod types;

pub use catalog::{InMemoryProjectCatalog, ProjectCatalog};
pub use secrets::{EnvSecretResolver, SecretResolver, StaticSecretResolver};
pub use types::Project;
