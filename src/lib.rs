pub mod archive;
pub mod backing;
pub mod checksum;
pub mod container;
pub mod crypto;
pub mod error;
pub mod extent;
pub mod header;
pub mod id;
pub mod index;
pub mod names;
pub mod nested;
pub mod recovery;

pub use backing::Backing;
pub use checksum::Integrity;
pub use container::{resolve_name, Container, ConversionWarning, EntryInfo, Mode, OpenOptions};
pub use error::{Error, Result};
pub use header::{Generation, Protection};
pub use id::KeyScheme;
pub use nested::{EntryHost, EntryStream};
