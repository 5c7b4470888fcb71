//! Tool catalog: data model, immutable snapshots, live registry and loader.

pub mod loader;
pub mod model;
pub mod registry;
pub mod snapshot;

pub use loader::{CatalogLoader, DefinitionSource, LoadReport};
pub use model::{
    Capability, Embedding, ExecutionMethod, ParamSpec, ParamType, Pattern, PatternPolicy, Tool,
    ToolMetadata,
};
pub use registry::CatalogRegistry;
pub use snapshot::{CatalogSnapshot, PatternEntry};
