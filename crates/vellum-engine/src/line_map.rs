use std::collections::BTreeMap;

/// A location inside a compiled unit, as reported by the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodePosition {
    pub line: u32,
    pub column: u32,
}

/// A location in the script's source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourcePosition {
    pub line: u32,
    pub column: u32,
}

/// Maps compiled-unit locations back to source positions for fault reports
///
/// Lookups resolve to the closest mapped position at or before the queried
/// one, so a map only needs an entry where a new source region begins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineMap {
    entries: BTreeMap<CodePosition, SourcePosition>,
}

impl LineMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: CodePosition, source: SourcePosition) {
        self.entries.insert(code, source);
    }

    pub fn resolve(&self, code: CodePosition) -> Option<SourcePosition> {
        self.entries
            .range(..=code)
            .next_back()
            .map(|(_, source)| *source)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(CodePosition, SourcePosition)> for LineMap {
    fn from_iter<I: IntoIterator<Item = (CodePosition, SourcePosition)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
