use std::collections::HashMap;

use crate::proto::OpenContext;

/// One kernel-visible open file.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub path: String,
    pub ctx: OpenContext,
}

/// Open files keyed by the handle given to the kernel, which is the server's
/// handle for the same open.
pub struct HandleTable {
    handles: HashMap<u64, OpenFile>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    pub fn insert(&mut self, path: String, ctx: OpenContext) {
        self.handles.insert(ctx.fh, OpenFile { path, ctx });
    }

    pub fn get(&self, fh: u64) -> Option<OpenFile> {
        self.handles.get(&fh).cloned()
    }

    /// Store the context returned by the latest call on `fh`.
    pub fn update(&mut self, fh: u64, ctx: OpenContext) {
        if let Some(open) = self.handles.get_mut(&fh) {
            open.ctx = ctx;
        }
    }

    pub fn release(&mut self, fh: u64) -> Option<OpenFile> {
        self.handles.remove(&fh)
    }

    /// Handles currently open on `path`.
    pub fn handles_for(&self, path: &str) -> Vec<u64> {
        self.handles
            .iter()
            .filter(|(_, open)| open.path == path)
            .map(|(&fh, _)| fh)
            .collect()
    }

    pub fn open_handles(&self) -> Vec<u64> {
        self.handles.keys().copied().collect()
    }

    /// Follow a rename of `old_path` (and anything below it) to `new_path`.
    pub fn rename(&mut self, old_path: &str, new_path: &str) {
        let old_prefix = format!("{}/", old_path.trim_end_matches('/'));
        for open in self.handles.values_mut() {
            if open.path == old_path {
                open.path = new_path.to_string();
            } else if let Some(rest) = open.path.strip_prefix(&old_prefix) {
                open.path = super::inode::join(new_path, rest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
