use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The kind of entity game statistics are aggregated for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A school subject.
    Subject,
    /// A category inside a subject.
    Category,
}

impl EntityKind {
    /// The stable name of this kind, as used inside [`CacheKey`]s.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Subject => "subject",
            EntityKind::Category => "category",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The namespace a cached aggregate belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnerScope {
    /// Stats that are not tied to any owner.
    Global,
    /// Stats scoped to a specific owner, for example a single child.
    Owner(Arc<str>),
}

impl OwnerScope {
    /// Creates the scope for an optional owner id.
    ///
    /// An empty owner id is a real (if odd) owner and is kept distinct from [`OwnerScope::Global`].
    pub fn from_owner(owner: Option<&str>) -> Self {
        match owner {
            Some(owner) => OwnerScope::Owner(owner.into()),
            None => OwnerScope::Global,
        }
    }

    /// Returns the owner id, if this scope has one.
    pub fn owner(&self) -> Option<&str> {
        match self {
            OwnerScope::Global => None,
            OwnerScope::Owner(owner) => Some(owner),
        }
    }
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerScope::Global => f.write_str("global"),
            OwnerScope::Owner(owner) => write!(f, "owner:{}", escape_segment(owner)),
        }
    }
}

/// Identifies one cached aggregate: an entity of some [`EntityKind`] within an [`OwnerScope`].
///
/// The key renders to a stable string of the form `<scope>/<kind>/<id>`, for example
/// `global/subject/S1` or `owner:child-42/category/C7`. Ids are opaque and are escaped so that the
/// `/` separator never appears inside a segment, which keeps distinct triples from ever rendering
/// to the same string.
#[derive(Clone, Debug, Eq)]
pub struct CacheKey {
    scope: OwnerScope,
    kind: EntityKind,
    entity_id: Arc<str>,
    rendered: Arc<str>,
}

impl CacheKey {
    /// Builds the key for `entity_id` of the given `kind`, optionally scoped to `owner`.
    pub fn build(kind: EntityKind, entity_id: &str, owner: Option<&str>) -> Self {
        let scope = OwnerScope::from_owner(owner);
        let rendered = format!("{scope}/{kind}/{}", escape_segment(entity_id));
        Self {
            scope,
            kind,
            entity_id: entity_id.into(),
            rendered: rendered.into(),
        }
    }

    /// Returns the stable string form of this key.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    pub fn scope(&self) -> &OwnerScope {
        &self.scope
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Whether this key is scoped to the given owner.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.scope.owner() == Some(owner)
    }

    /// Whether this key refers to the given entity, regardless of its scope.
    pub fn refers_to(&self, kind: EntityKind, entity_id: &str) -> bool {
        self.kind == kind && &*self.entity_id == entity_id
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.rendered == other.rendered
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rendered.hash(state);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rendered.cmp(&other.rendered)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Escapes the characters with a meaning inside a rendered [`CacheKey`].
fn escape_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains(['%', '/']) {
        return Cow::Borrowed(segment);
    }
    Cow::Owned(segment.replace('%', "%25").replace('/', "%2F"))
}
