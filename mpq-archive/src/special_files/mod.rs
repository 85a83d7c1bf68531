//! Special in-archive files: `(listfile)` and `(attributes)`

mod attributes;
mod listfile;

pub use attributes::{AttributeFlags, Attributes, FileAttributes};
pub use listfile::{generate_listfile, parse_listfile};

/// Name of the listfile entry
pub const LISTFILE_NAME: &str = "(listfile)";
/// Name of the attributes entry
pub const ATTRIBUTES_NAME: &str = "(attributes)";
/// Name of the weak signature entry
pub const SIGNATURE_NAME: &str = "(signature)";
