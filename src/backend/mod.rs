//! Backend module - adapter contract, protocol adapters and registry

pub mod comfyui;
pub mod http;
pub mod openai;
pub mod registry;
pub mod stability;
pub mod traits;

pub use registry::{BackendRegistry, ProviderStatus, RegistrySnapshot};
pub use traits::{
    Feature, GenerationConfig, GenerationKind, GenerationResult, Payload, ProgressEvent,
    ProgressSender, ProviderAdapter, ProviderKind, SourceImage, Usage,
};
