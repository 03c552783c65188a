use std::fmt;
use std::sync::Arc;

use hashbrown::HashSet;
use regex::Regex;

type Predicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Selects tensors by name.
///
/// A name is selected when any criterion matches: an exact name, a regular expression or a
/// predicate. An empty filter selects nothing; [`KeyFilter::all`] selects everything.
///
/// # Example
///
/// ```rust
/// use pybridge_store::KeyFilter;
///
/// let filter = KeyFilter::new()
///     .with_regex(r"^encoder\.")?
///     .with_key("head.weight");
///
/// assert!(filter.matches("encoder.layer.0.bias"));
/// assert!(filter.matches("head.weight"));
/// assert!(!filter.matches("head.bias"));
/// # Ok::<(), regex::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct KeyFilter {
    keys: HashSet<String>,
    regexes: Vec<Regex>,
    predicates: Vec<Predicate>,
    match_all: bool,
}

impl KeyFilter {
    /// Create a filter that selects nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter that selects every name.
    pub fn all() -> Self {
        Self {
            match_all: true,
            ..Self::default()
        }
    }

    /// Select one exact name.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.insert(key.into());
        self
    }

    /// Select several exact names.
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Select names matching a regular expression.
    pub fn with_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.regexes.push(Regex::new(pattern)?);
        Ok(self)
    }

    /// Select names accepted by a predicate.
    pub fn with_predicate(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Whether the name is selected.
    pub fn matches(&self, name: &str) -> bool {
        self.match_all
            || self.keys.contains(name)
            || self.regexes.iter().any(|regex| regex.is_match(name))
            || self.predicates.iter().any(|predicate| predicate(name))
    }

    /// Whether the filter has no criteria.
    pub fn is_empty(&self) -> bool {
        !self.match_all
            && self.keys.is_empty()
            && self.regexes.is_empty()
            && self.predicates.is_empty()
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFilter")
            .field("keys", &self.keys)
            .field("regexes", &self.regexes)
            .field("predicates", &self.predicates.len())
            .field("match_all", &self.match_all)
            .finish()
    }
}
