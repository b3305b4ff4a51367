use std::fmt::Display;

/// Joins the operation identity with its argument values.
const KEY_DELIMITER: &str = "-";

/// Joins group segments; coarser groups are prefixes of finer ones.
const GROUP_SEPARATOR: &str = ".";

#[derive(Clone, PartialEq, Eq, Debug)]
/// Derives the deduplication key for one throttleable operation instance
/// from the operation identity and an ordered list of logical arguments.
///
/// Two invocations producing equal keys are the same debounced unit of work.
pub struct KeyBuilder {
    parts: Vec<String>,
}

impl KeyBuilder {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            parts: vec![operation.into()],
        }
    }

    /// Appends the string form of one logical argument value, in order.
    pub fn arg(mut self, value: impl Display) -> Self {
        self.parts.push(value.to_string());
        self
    }

    pub fn build(self) -> String {
        self.parts.join(KEY_DELIMITER)
    }
}

#[derive(Clone, Default, PartialEq, Eq, Debug)]
/// Derives the hierarchical cancellation group, independent of argument
/// values. Used only for ceiling/clear-group reasoning, never deduplication.
pub struct GroupBuilder {
    segments: Vec<String>,
}

impl GroupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment(mut self, segment: impl Display) -> Self {
        self.segments.push(segment.to_string());
        self
    }

    pub fn build(self) -> String {
        self.segments.join(GROUP_SEPARATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_operation_and_arguments() {
        let key = KeyBuilder::new("analyzeVocabulary")
            .arg("https://example.org/vocabulary/1")
            .arg(42)
            .build();
        assert_eq!(key, "analyzeVocabulary-https://example.org/vocabulary/1-42");
    }

    #[test]
    fn equal_arguments_produce_equal_keys() {
        let a = KeyBuilder::new("op").arg("x").build();
        let b = KeyBuilder::new("op").arg("x").build();
        assert_eq!(a, b);
    }

    #[test]
    fn group_joins_segments_hierarchically() {
        let group = GroupBuilder::new()
            .segment("vocabularies")
            .segment("v1")
            .build();
        assert_eq!(group, "vocabularies.v1");
    }

    #[test]
    fn coarser_group_is_a_prefix_of_the_finer_one() {
        let coarse = GroupBuilder::new().segment("vocabularies").build();
        let fine = GroupBuilder::new()
            .segment("vocabularies")
            .segment("v1")
            .build();
        assert!(fine.starts_with(&coarse));
    }
}
