//! Cache keys, size variants and key matchers
//!
//! Keys render as `image:<id>`, `url:<id>[:<size>]` or
//! `placeholder:<kind>:<id>`. The same identifier fans out into several keys,
//! all of which must go together when the identifier is invalidated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Size/variant suffix for URL keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeVariant {
    Small,
    Medium,
    Large,
}

impl SizeVariant {
    pub const ALL: [SizeVariant; 3] = [SizeVariant::Small, SizeVariant::Medium, SizeVariant::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeVariant::Small => "small",
            SizeVariant::Medium => "medium",
            SizeVariant::Large => "large",
        }
    }
}

impl fmt::Display for SizeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizeVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(SizeVariant::Small),
            "medium" => Ok(SizeVariant::Medium),
            "large" => Ok(SizeVariant::Large),
            other => Err(format!("unknown size variant: {}", other)),
        }
    }
}

/// Placeholder flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderKind {
    /// Tiny blurred preview
    Tiny,
    /// Dominant-colour swatch
    Color,
}

impl PlaceholderKind {
    pub const ALL: [PlaceholderKind; 2] = [PlaceholderKind::Tiny, PlaceholderKind::Color];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceholderKind::Tiny => "tiny",
            PlaceholderKind::Color => "color",
        }
    }
}

impl FromStr for PlaceholderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiny" => Ok(PlaceholderKind::Tiny),
            "color" => Ok(PlaceholderKind::Color),
            other => Err(format!("unknown placeholder kind: {}", other)),
        }
    }
}

/// Key namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Structured image record
    Image,
    /// Derived access URL
    Url,
    /// Placeholder URL
    Placeholder(PlaceholderKind),
}

impl Namespace {
    /// Whether items in this namespace are plain URL strings
    pub fn holds_url(&self) -> bool {
        !matches!(self, Namespace::Image)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Image => f.write_str("image"),
            Namespace::Url => f.write_str("url"),
            Namespace::Placeholder(kind) => write!(f, "placeholder:{}", kind.as_str()),
        }
    }
}

/// A structured cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: Namespace,
    pub id: String,
    pub variant: Option<SizeVariant>,
}

impl CacheKey {
    /// `image:<id>`
    pub fn image(id: impl Into<String>) -> Self {
        Self {
            namespace: Namespace::Image,
            id: id.into(),
            variant: None,
        }
    }

    /// `url:<id>[:<size>]`
    pub fn url(id: impl Into<String>, variant: Option<SizeVariant>) -> Self {
        Self {
            namespace: Namespace::Url,
            id: id.into(),
            variant,
        }
    }

    /// `placeholder:<kind>:<id>`
    pub fn placeholder(kind: PlaceholderKind, id: impl Into<String>) -> Self {
        Self {
            namespace: Namespace::Placeholder(kind),
            id: id.into(),
            variant: None,
        }
    }

    /// Parse a rendered key. Returns `None` for foreign keys.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(id) = raw.strip_prefix("image:") {
            return (!id.is_empty()).then(|| CacheKey::image(id));
        }

        if let Some(rest) = raw.strip_prefix("url:") {
            if let Some((id, suffix)) = rest.rsplit_once(':') {
                if let Ok(size) = suffix.parse::<SizeVariant>() {
                    return (!id.is_empty()).then(|| CacheKey::url(id, Some(size)));
                }
            }
            return (!rest.is_empty()).then(|| CacheKey::url(rest, None));
        }

        if let Some(rest) = raw.strip_prefix("placeholder:") {
            let (kind, id) = rest.split_once(':')?;
            let kind = kind.parse::<PlaceholderKind>().ok()?;
            return (!id.is_empty()).then(|| CacheKey::placeholder(kind, id));
        }

        None
    }

    /// Every key derived from a logical identifier
    pub fn variants_of(id: &str) -> Vec<CacheKey> {
        let mut keys = vec![CacheKey::image(id), CacheKey::url(id, None)];
        keys.extend(SizeVariant::ALL.iter().map(|s| CacheKey::url(id, Some(*s))));
        keys.extend(
            PlaceholderKind::ALL
                .iter()
                .map(|k| CacheKey::placeholder(*k, id)),
        );
        keys
    }

    /// Category is the identifier's first `:`-separated segment, if any
    pub fn category(&self) -> Option<&str> {
        self.id.split_once(':').map(|(category, _)| category)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)?;
        if let Some(size) = self.variant {
            write!(f, ":{}", size)?;
        }
        Ok(())
    }
}

impl FromStr for CacheKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheKey::parse(s).ok_or_else(|| format!("not a cache key: {}", s))
    }
}

/// Builder for cache keys
pub struct CacheKeyBuilder {
    namespace: Namespace,
    identifier: String,
    variant: Option<SizeVariant>,
}

impl CacheKeyBuilder {
    /// Create a new cache key builder
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            identifier: String::new(),
            variant: None,
        }
    }

    /// Set the primary identifier
    pub fn identifier(mut self, id: impl Into<String>) -> Self {
        self.identifier = id.into();
        self
    }

    /// Nest the identifier under a category (`<category>:<identifier>`)
    pub fn category(mut self, category: impl AsRef<str>) -> Self {
        self.identifier = format!("{}:{}", category.as_ref(), self.identifier);
        self
    }

    /// Set the size variant (URL keys only)
    pub fn variant(mut self, size: SizeVariant) -> Self {
        self.variant = Some(size);
        self
    }

    /// Build the cache key
    pub fn build(self) -> CacheKey {
        let variant = match self.namespace {
            Namespace::Url => self.variant,
            _ => None,
        };
        CacheKey {
            namespace: self.namespace,
            id: self.identifier,
            variant,
        }
    }
}

/// Predicate over rendered keys, used for pattern invalidation
#[derive(Clone)]
pub enum KeyMatcher {
    /// Keys in category `c`: identifier is `c:<rest>` or the key contains `:c:`.
    ///
    /// A bare identifier equal to `c` is not a member, so `image:c` and `url:c`
    /// survive while the sized `url:c:<size>` keys match on the `:c:` text.
    Category(String),

    /// Keys whose identifier starts with the prefix
    Prefix(String),

    /// Every key derived from one identifier
    Identifier(String),

    /// Caller-supplied predicate
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl KeyMatcher {
    pub fn custom(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        KeyMatcher::Custom(Arc::new(f))
    }

    pub fn matches(&self, raw: &str) -> bool {
        match self {
            KeyMatcher::Category(category) => {
                let parsed_match = CacheKey::parse(raw)
                    .map(|k| k.category() == Some(category.as_str()))
                    .unwrap_or(false);
                parsed_match || raw.contains(&format!(":{}:", category))
            }
            KeyMatcher::Prefix(prefix) => match CacheKey::parse(raw) {
                Some(key) => key.id.starts_with(prefix.as_str()),
                None => raw.starts_with(prefix.as_str()),
            },
            KeyMatcher::Identifier(id) => CacheKey::parse(raw)
                .map(|k| &k.id == id)
                .unwrap_or(false),
            KeyMatcher::Custom(f) => f(raw),
        }
    }
}

impl fmt::Debug for KeyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMatcher::Category(c) => write!(f, "Category({:?})", c),
            KeyMatcher::Prefix(p) => write!(f, "Prefix({:?})", p),
            KeyMatcher::Identifier(id) => write!(f, "Identifier({:?})", id),
            KeyMatcher::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
