pub mod events;
pub mod manager;
pub mod registry;
pub mod types;

pub use events::EventBus;
pub use manager::{http_admin_factory, AdminFactory, MeshManager};
pub use registry::{RegistrySnapshot, RegistryStore};
pub use types::{EventKind, MeshEvent, Service};
