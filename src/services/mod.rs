pub mod blob;
pub mod hasher;
pub mod upload;

pub use blob::BlobStore;
pub use upload::FileService;
