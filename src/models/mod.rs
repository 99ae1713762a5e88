pub mod blob;
pub mod file;

pub use blob::*;
pub use file::*;
