//! # Storage driver contract
//!
//! The interface between the image registry and a storage backend: a
//! path-addressed [`Driver`] with streaming reads and writes, and a small
//! error taxonomy which separates missing objects from failed transfers.

mod driver;
mod error;
mod path;

pub use driver::ByteRange;
pub use driver::ByteStream;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::PathStream;
pub use driver::Reader;
pub use driver::Source;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
pub use path::{directory_prefix, normalize, rooted, unrooted};
