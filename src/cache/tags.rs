//! Invalidation tag derivation.
//!
//! Every stored page carries `global` plus tags describing what it shows:
//! `front`, `home`, `search`, `404`, `post_<id>`, `type_<name>`, `term_<id>`
//! and `author_<id>`. Triggers compute the same tags for a changed entity so a
//! purge reaches every page that displayed it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub type TagSet = BTreeSet<String>;

pub const GLOBAL_TAG: &str = "global";

pub type EntityTagHook = Arc<dyn Fn(&ContentEntity, &mut TagSet) + Send + Sync>;
pub type QueryTagHook = Arc<dyn Fn(&QueryContext, &mut TagSet) + Send + Sync>;

/// A piece of content that pages can display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentEntity {
    pub id: u64,
    /// Content type name, e.g. `post` or `page`.
    pub kind: String,
    pub term_ids: Vec<u64>,
    pub author_id: Option<u64>,
}

impl ContentEntity {
    pub fn new(id: u64, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            term_ids: Vec::new(),
            author_id: None,
        }
    }

    pub fn with_terms(mut self, term_ids: impl IntoIterator<Item = u64>) -> Self {
        self.term_ids.extend(term_ids);
        self
    }

    pub fn with_author(mut self, author_id: u64) -> Self {
        self.author_id = Some(author_id);
        self
    }
}

/// What the rendered view turned out to be.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryContext {
    pub front_page: bool,
    /// Blog index.
    pub home: bool,
    pub search: bool,
    pub not_found: bool,
    pub feed: bool,
    pub singular: Option<ContentEntity>,
    /// Archive of a content type.
    pub type_archive: Option<String>,
    pub author_archive: Option<u64>,
    /// Taxonomy term or generic archive with a resolvable term.
    pub term_archive: Option<u64>,
}

impl QueryContext {
    pub fn front_page() -> Self {
        Self {
            front_page: true,
            ..Self::default()
        }
    }

    pub fn singular(entity: ContentEntity) -> Self {
        Self {
            singular: Some(entity),
            ..Self::default()
        }
    }
}

#[derive(Clone, Default)]
pub struct TagDeriver {
    entity_hooks: Vec<EntityTagHook>,
    query_hooks: Vec<QueryTagHook>,
}

impl fmt::Debug for TagDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagDeriver")
            .field("entity_hooks", &self.entity_hooks.len())
            .field("query_hooks", &self.query_hooks.len())
            .finish()
    }
}

impl TagDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append extra tags for entities without touching the base rules.
    pub fn with_entity_hook(
        mut self,
        hook: impl Fn(&ContentEntity, &mut TagSet) + Send + Sync + 'static,
    ) -> Self {
        self.entity_hooks.push(Arc::new(hook));
        self
    }

    pub fn with_query_hook(
        mut self,
        hook: impl Fn(&QueryContext, &mut TagSet) + Send + Sync + 'static,
    ) -> Self {
        self.query_hooks.push(Arc::new(hook));
        self
    }

    pub fn current_tags(&self, query: &QueryContext) -> TagSet {
        let mut tags = TagSet::from([GLOBAL_TAG.to_string()]);

        if query.front_page {
            tags.insert("front".to_string());
        }
        if query.home {
            tags.insert("home".to_string());
        }
        if query.search {
            tags.insert("search".to_string());
        }
        if query.not_found {
            tags.insert("404".to_string());
        }
        if let Some(entity) = &query.singular {
            tags.extend(self.tags_for_entity(entity));
        }
        if let Some(kind) = &query.type_archive {
            tags.insert(format!("type_{kind}"));
        }
        if let Some(author) = query.author_archive {
            tags.insert(format!("author_{author}"));
        }
        if let Some(term) = query.term_archive {
            tags.insert(format!("term_{term}"));
        }

        for hook in &self.query_hooks {
            hook(query, &mut tags);
        }
        tags
    }

    pub fn tags_for_entity(&self, entity: &ContentEntity) -> TagSet {
        let mut tags = TagSet::new();
        tags.insert(format!("post_{}", entity.id));
        if !entity.kind.is_empty() {
            tags.insert(format!("type_{}", entity.kind));
        }
        tags.extend(entity.term_ids.iter().map(|term| format!("term_{term}")));
        if let Some(author) = entity.author_id {
            tags.insert(format!("author_{author}"));
        }

        for hook in &self.entity_hooks {
            hook(entity, &mut tags);
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> TagSet {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn entity_tags_cover_id_type_terms_and_author() {
        let entity = ContentEntity::new(42, "post")
            .with_terms([7, 9, 7])
            .with_author(3);
        assert_eq!(
            TagDeriver::new().tags_for_entity(&entity),
            set(&["post_42", "type_post", "term_7", "term_9", "author_3"])
        );
    }

    #[test]
    fn every_view_carries_global() {
        assert_eq!(
            TagDeriver::new().current_tags(&QueryContext::default()),
            set(&["global"])
        );
    }

    #[test]
    fn markers_are_additive() {
        let query = QueryContext {
            front_page: true,
            home: true,
            ..Default::default()
        };
        assert_eq!(
            TagDeriver::new().current_tags(&query),
            set(&["global", "front", "home"])
        );
    }

    #[test]
    fn singular_view_merges_entity_tags() {
        let query = QueryContext::singular(ContentEntity::new(5, "page"));
        assert_eq!(
            TagDeriver::new().current_tags(&query),
            set(&["global", "post_5", "type_page"])
        );
    }

    #[test]
    fn archives_map_to_type_author_and_term() {
        let query = QueryContext {
            type_archive: Some("product".into()),
            author_archive: Some(8),
            term_archive: Some(11),
            not_found: false,
            search: true,
            ..Default::default()
        };
        assert_eq!(
            TagDeriver::new().current_tags(&query),
            set(&["global", "search", "type_product", "author_8", "term_11"])
        );
    }

    #[test]
    fn hooks_append_without_changing_base_rules() {
        let deriver = TagDeriver::new()
            .with_entity_hook(|entity, tags| {
                tags.insert(format!("shop_{}", entity.id));
            })
            .with_query_hook(|_, tags| {
                tags.insert("locale_de".into());
            });
        let tags = deriver.current_tags(&QueryContext::singular(ContentEntity::new(1, "post")));
        assert!(tags.contains("post_1"));
        assert!(tags.contains("shop_1"));
        assert!(tags.contains("locale_de"));
    }

    #[test]
    fn not_found_view_is_tagged() {
        let query = QueryContext {
            not_found: true,
            ..Default::default()
        };
        assert!(TagDeriver::new().current_tags(&query).contains("404"));
    }
}
