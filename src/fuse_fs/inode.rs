use std::collections::HashMap;

pub const ROOT_INO: u64 = 1;

/// Bidirectional inode <-> path map for the mount. Paths are server-relative
/// and start with `/`; the root is always inode 1.
///
/// Inode numbers are local to this mount and stable for a path until it is
/// removed or renamed away.
pub struct InodeMap {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    next_ino: u64,
}

impl InodeMap {
    pub fn new() -> Self {
        let mut map = Self {
            path_to_ino: HashMap::new(),
            ino_to_path: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        map.path_to_ino.insert("/".to_string(), ROOT_INO);
        map.ino_to_path.insert(ROOT_INO, "/".to_string());
        map
    }

    pub fn get_or_insert(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_ino.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(path.to_string(), ino);
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }

    pub fn get_ino(&self, path: &str) -> Option<u64> {
        self.path_to_ino.get(path).copied()
    }

    pub fn get_path(&self, ino: u64) -> Option<&str> {
        self.ino_to_path.get(&ino).map(|s| s.as_str())
    }

    /// Path of `name` inside the directory `parent`. `None` if the parent is
    /// unknown.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.get_path(parent).map(|dir| join(dir, name))
    }

    /// Inode of the directory containing `path`. The root is its own parent.
    pub fn parent_ino(&self, path: &str) -> u64 {
        self.get_ino(parent_of(path)).unwrap_or(ROOT_INO)
    }

    pub fn remove_path(&mut self, path: &str) {
        if path == "/" {
            return;
        }
        if let Some(ino) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
        }
    }

    /// Move `old_path` and everything below it to `new_path`, keeping inode
    /// numbers. Whatever was mapped at the destination is dropped.
    pub fn rename(&mut self, old_path: &str, new_path: &str) {
        self.remove_subtree(new_path);

        let old_prefix = format!("{}/", old_path.trim_end_matches('/'));
        let moved: Vec<(String, u64)> = self
            .path_to_ino
            .iter()
            .filter(|(p, _)| *p == old_path || p.starts_with(&old_prefix))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();

        for (path, ino) in moved {
            self.path_to_ino.remove(&path);
            let renamed = if path == old_path {
                new_path.to_string()
            } else {
                join(new_path, &path[old_prefix.len()..])
            };
            self.path_to_ino.insert(renamed.clone(), ino);
            self.ino_to_path.insert(ino, renamed);
        }
    }

    fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .path_to_ino
            .keys()
            .filter(|p| *p == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in doomed {
            self.remove_path(&p);
        }
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}
