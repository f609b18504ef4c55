use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
struct Node {
    children: BTreeMap<usize, Node>,
}

/// Prefix tree of the width-index paths drawn so far.
#[derive(Debug, Default, Clone)]
pub struct PathsHistory {
    root: Node,
    len: usize,
}
impl PathsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `path` and returns whether it had already been inserted.
    pub fn check_and_insert(&mut self, path: &[usize]) -> bool {
        let mut node = &mut self.root;
        let mut exists = true;
        for &idx in path {
            node = node.children.entry(idx).or_insert_with(|| {
                exists = false;
                Node::default()
            });
        }
        if !exists {
            self.len += 1;
        }
        exists
    }

    pub fn contains(&self, path: &[usize]) -> bool {
        let mut node = &self.root;
        for idx in path {
            match node.children.get(idx) {
                Some(child) => node = child,
                None => return false,
            }
        }
        true
    }

    /// Number of distinct paths inserted.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_and_insert_works() {
        let mut history = PathsHistory::new();
        assert!(!history.check_and_insert(&[0, 1, 2]));
        assert!(history.check_and_insert(&[0, 1, 2]));
        assert!(!history.check_and_insert(&[0, 1, 0]));
        assert!(!history.check_and_insert(&[1, 1, 2]));
        assert_eq!(history.len(), 3);

        assert!(history.contains(&[0, 1, 0]));
        assert!(!history.contains(&[2, 1, 0]));
    }
}
