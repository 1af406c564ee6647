pub mod hub;
pub mod pipeline;

pub use hub::HubRepository;
pub use pipeline::PipelineExporter;
