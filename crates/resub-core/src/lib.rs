pub mod compression;
pub mod events;
pub mod id;
pub mod pattern;
pub mod projection;

pub use compression::{CompressionAlgorithm, CompressionOutcome, decompress, maybe_compress};
pub use events::{ChangeBroadcaster, ChangeType, ResourceChange};
pub use id::generate_id;
pub use pattern::{PatternError, UriPattern, matches};
pub use projection::{FieldSelectionError, Fragments, project, resolve_fields};
