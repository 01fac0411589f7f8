use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

/// Descriptors opened on behalf of the client, keyed by the handle returned
/// in the open-context. Handles start at 1; 0 is the unresolved sentinel.
pub struct FileTable {
    files: HashMap<u64, Arc<File>>,
    next_fh: u64,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            next_fh: 1,
        }
    }

    /// Register an open file and allocate its handle.
    pub fn insert(&mut self, file: File) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.files.insert(fh, Arc::new(file));
        fh
    }

    /// Shared reference to an open file. The table lock need not be held
    /// while the file is used.
    pub fn get(&self, fh: u64) -> Option<Arc<File>> {
        self.files.get(&fh).cloned()
    }

    /// Forget a handle. The descriptor closes once the last in-flight user
    /// drops its reference.
    pub fn release(&mut self, fh: u64) -> Option<Arc<File>> {
        self.files.remove(&fh)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
