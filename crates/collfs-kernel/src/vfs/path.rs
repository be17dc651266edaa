//! Path parsing shared by the collection and site layers.
//!
//! Paths are `/`-separated strings. A leading separator is optional, empty
//! components and `.` are dropped, and `..` pops one component (never above
//! the root). The trailing separator is remembered because splice gives it
//! meaning.

/// A normalized path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VPath {
    components: Vec<String>,
    trailing_separator: bool,
}

impl VPath {
    pub fn parse(path: &str) -> Self {
        let mut components: Vec<String> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    components.pop();
                }
                name => components.push(name.to_string()),
            }
        }
        Self {
            components,
            trailing_separator: path.ends_with('/'),
        }
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_components(components: Vec<String>) -> Self {
        Self {
            components,
            trailing_separator: false,
        }
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// True when the original text ended with `/`.
    pub fn has_trailing_separator(&self) -> bool {
        self.trailing_separator
    }

    /// Parent components and final name. `None` at the root.
    pub fn split_last(&self) -> Option<(&[String], &str)> {
        self.components
            .split_last()
            .map(|(name, parent)| (parent, name.as_str()))
    }

    /// True if `self` is `other` or lies beneath it.
    pub fn starts_with(&self, other: &VPath) -> bool {
        self.components.starts_with(&other.components)
    }
}

impl std::fmt::Display for VPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for c in &self.components {
            write!(f, "/{}", c)?;
        }
        Ok(())
    }
}

/// Join components as an absolute display path.
pub fn display(components: &[String]) -> String {
    VPath::from_components(components.to_vec()).to_string()
}
