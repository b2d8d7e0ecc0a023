//! Re-attaching live sources to tasks found at startup.

use std::sync::Arc;

use reelup_transfer::{ChunkSource, FileRef, FileSource};
use tracing::warn;

/// Finds the bytes behind a persisted [`FileRef`].
///
/// The store never holds file contents, so recovery needs a way back to
/// them. Returning `None` leaves the task persisted but idle.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, file: &FileRef) -> Option<Arc<dyn ChunkSource>>;
}

impl<F> SourceResolver for F
where
    F: Fn(&FileRef) -> Option<Arc<dyn ChunkSource>> + Send + Sync,
{
    fn resolve(&self, file: &FileRef) -> Option<Arc<dyn ChunkSource>> {
        self(file)
    }
}

/// Reopens `FileRef::path` from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathResolver;

impl SourceResolver for PathResolver {
    fn resolve(&self, file: &FileRef) -> Option<Arc<dyn ChunkSource>> {
        let path = file.path.as_ref()?;
        match FileSource::open(path) {
            Ok(source) if source.len() == file.size => Some(Arc::new(source)),
            Ok(source) => {
                warn!(
                    path = %path.display(),
                    expected = file.size,
                    actual = source.len(),
                    "source file changed size"
                );
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot reopen source file");
                None
            }
        }
    }
}
