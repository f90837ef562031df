//! Image documents: manifests, indexes, platforms and digests
//!
//! Nothing here talks to the network. The registry client fetches bytes and the
//! copy engine decides what to push; this module parses, filters and
//! re-serializes the documents in between.

pub mod digest;
pub mod index;
pub mod manifest;
pub mod media_types;
pub mod platform;

pub use digest::DigestUtils;
pub use index::{resolve_child, FilteredIndex, Index, RemoteIndex};
pub use manifest::{Descriptor, ImageConfig, ImageIndex, ImageManifest};
pub use media_types::ManifestKind;
pub use platform::Platform;
