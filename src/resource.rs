use std::fmt;

/// Hierarchical name of a lockable resource, e.g. database/table1/page3.
/// Always has at least one segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName {
    segments: Vec<String>,
}

impl ResourceName {
    pub fn root(segment: impl Into<String>) -> Self {
        ResourceName {
            segments: vec![segment.into()],
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        ResourceName { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn first(&self) -> &str {
        &self.segments[0]
    }

    pub fn last(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// True iff `other` is a strict prefix of this name.
    pub fn is_descendant_of(&self, other: &ResourceName) -> bool {
        self.segments.len() > other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}
