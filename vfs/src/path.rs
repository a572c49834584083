//! Path splitting for the resolver. Paths are `/`-delimited; repeated and
//! trailing separators are tolerated.

use crate::error::{Result, VfsError};

const MAX_PATH_LENGTH: usize = 4096;

/// One path component, with enough position information to reconstruct the
/// unresolved tail of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component<'a> {
    pub name: &'a str,
    /// True when no further component follows.
    pub is_last: bool,
    /// Byte offset of this component within the original path.
    pub offset: usize,
}

pub fn validate(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(VfsError::InvalidArgument);
    }

    if path.len() > MAX_PATH_LENGTH {
        return Err(VfsError::InvalidArgument);
    }

    Ok(())
}

pub fn components(path: &str) -> Components<'_> {
    Components { path, pos: 0 }
}

pub struct Components<'a> {
    path: &'a str,
    pos: usize,
}

impl<'a> Iterator for Components<'a> {
    type Item = Component<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.path.as_bytes();

        let mut start = self.pos;
        while start < bytes.len() && bytes[start] == b'/' {
            start += 1;
        }

        if start >= bytes.len() {
            self.pos = start;
            return None;
        }

        let mut end = start;
        while end < bytes.len() && bytes[end] != b'/' {
            end += 1;
        }

        self.pos = end;

        // peek past any separator run so a trailing "/" does not hide that
        // this component is the last one
        let mut probe = end;
        while probe < bytes.len() && bytes[probe] == b'/' {
            probe += 1;
        }

        Some(Component {
            name: &self.path[start..end],
            is_last: probe >= bytes.len(),
            offset: start,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn names(path: &str) -> Vec<&str> {
        components(path).map(|c| c.name).collect()
    }

    #[test]
    fn splits_on_separators() {
        assert_eq!(names("/a/b/c"), ["a", "b", "c"]);
        assert_eq!(names("a/b"), ["a", "b"]);
        assert_eq!(names("/"), [""; 0]);
    }

    #[test]
    fn collapses_separator_runs() {
        assert_eq!(names("//a///b/"), ["a", "b"]);
    }

    #[test]
    fn marks_the_last_component() {
        let comps: Vec<_> = components("/a/b/").collect();
        assert!(!comps[0].is_last);
        assert!(comps[1].is_last);
    }

    #[test]
    fn offsets_recover_the_tail() {
        let path = "/a/b/c";
        let comps: Vec<_> = components(path).collect();
        assert_eq!(&path[comps[1].offset..], "b/c");
    }

    #[test]
    fn rejects_empty_and_oversized_paths() {
        assert_eq!(validate(""), Err(VfsError::InvalidArgument));
        let long = alloc::string::String::from_utf8(alloc::vec![b'a'; 5000]).unwrap();
        assert_eq!(validate(&long), Err(VfsError::InvalidArgument));
        assert_eq!(validate("/ok"), Ok(()));
    }
}
