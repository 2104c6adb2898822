pub mod fuse;
pub mod projector;

pub use fuse::fuse_embeddings;
pub use projector::VisionProjector;
