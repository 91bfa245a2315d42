use std::cmp::Ordering;

/// A single listing entry: either an object or a folder derived from a
/// common prefix / directory marker.
#[derive(Clone, Debug)]
pub struct FileStatus {
    pub key: String,
    pub size: u64,
    pub is_directory: bool,
}

impl FileStatus {
    pub fn file(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            is_directory: false,
        }
    }

    pub fn directory(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            is_directory: true,
        }
    }
}

impl PartialEq for FileStatus {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.is_directory == other.is_directory
    }
}

impl Eq for FileStatus {}

// Directories sort before files; within a class, keys order the entries.
impl Ord for FileStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .is_directory
            .cmp(&self.is_directory)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for FileStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_sort_before_files() {
        let mut entries = vec![
            FileStatus::file("b.txt", 1),
            FileStatus::directory("z/"),
            FileStatus::file("a.txt", 1),
            FileStatus::directory("a/"),
        ];
        entries.sort();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a/", "z/", "a.txt", "b.txt"]);
    }

    #[test]
    fn equality_ignores_size() {
        assert_eq!(FileStatus::file("k", 1), FileStatus::file("k", 2));
        assert_ne!(FileStatus::file("k", 0), FileStatus::directory("k"));
    }
}
