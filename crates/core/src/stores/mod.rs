pub mod memory;
pub mod opensearch;
pub mod qdrant;

pub use memory::{MemoryTermIndex, MemoryVectorStore};
pub use opensearch::OpenSearchTermIndex;
pub use qdrant::QdrantVectorStore;
