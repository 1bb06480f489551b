//! Invalidation triggers.
//!
//! Translates content mutations reported by the host application into
//! purges. Content and comment changes purge the tags of the affected entity;
//! navigation and theme changes flush everything.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use super::config::CachePolicy;
use super::facade::CacheFacade;
use super::tags::{ContentEntity, TagDeriver, TagSet};

pub type CdnPurgeHook = Arc<dyn Fn(&TagSet, &ContentEntity) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentStatus {
    Draft,
    Pending,
    Private,
    Published,
    Trashed,
}

impl ContentStatus {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published)
    }
}

/// A mutation reported by the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEvent {
    StatusChanged {
        from: ContentStatus,
        to: ContentStatus,
        entity: ContentEntity,
    },
    /// The host dropped its own caches for a content item.
    ContentCleaned { id: u64 },
    /// Carries the entity because it can no longer be resolved.
    ContentDeleted { entity: ContentEntity },
    CommentPosted { comment_id: u64 },
    CommentEdited { comment_id: u64 },
    CommentStatusChanged { comment_id: u64 },
    NavigationChanged,
    ThemeChanged,
}

impl ContentEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::ContentCleaned { .. } => "content_cleaned",
            Self::ContentDeleted { .. } => "content_deleted",
            Self::CommentPosted { .. } => "comment_posted",
            Self::CommentEdited { .. } => "comment_edited",
            Self::CommentStatusChanged { .. } => "comment_status_changed",
            Self::NavigationChanged => "navigation_changed",
            Self::ThemeChanged => "theme_changed",
        }
    }
}

/// Looks up content the host application owns.
pub trait ContentResolver: Send + Sync {
    fn entity(&self, id: u64) -> Option<ContentEntity>;

    /// Id of the content a comment belongs to.
    fn comment_parent(&self, comment_id: u64) -> Option<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Skipped(&'static str),
    PurgedTags(TagSet),
    PurgedAll,
}

/// Which invalidation triggers are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerToggles {
    pub purge_on_update: bool,
    pub purge_on_comment: bool,
    pub purge_cdn: bool,
}

impl From<&CachePolicy> for TriggerToggles {
    fn from(policy: &CachePolicy) -> Self {
        Self {
            purge_on_update: policy.purge_on_update,
            purge_on_comment: policy.purge_on_comment,
            purge_cdn: policy.purge_cdn,
        }
    }
}

pub struct InvalidationTriggers {
    toggles: TriggerToggles,
    facade: Arc<CacheFacade>,
    tagger: TagDeriver,
    resolver: Arc<dyn ContentResolver>,
    cdn_hooks: Vec<CdnPurgeHook>,
}

impl fmt::Debug for InvalidationTriggers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationTriggers")
            .field("toggles", &self.toggles)
            .field("cdn_hooks", &self.cdn_hooks.len())
            .finish_non_exhaustive()
    }
}

impl InvalidationTriggers {
    pub fn new(
        toggles: TriggerToggles,
        facade: Arc<CacheFacade>,
        resolver: Arc<dyn ContentResolver>,
    ) -> Self {
        Self {
            toggles,
            facade,
            tagger: TagDeriver::default(),
            resolver,
            cdn_hooks: Vec::new(),
        }
    }

    pub fn with_tagger(mut self, tagger: TagDeriver) -> Self {
        self.tagger = tagger;
        self
    }

    /// Register a collaborator notified with the tag set after each
    /// entity purge, when CDN purging is enabled.
    pub fn on_cdn_purge(
        mut self,
        hook: impl Fn(&TagSet, &ContentEntity) + Send + Sync + 'static,
    ) -> Self {
        self.cdn_hooks.push(Arc::new(hook));
        self
    }

    pub fn handle(&self, event: ContentEvent) -> TriggerOutcome {
        let kind = event.kind();
        let outcome = match event {
            ContentEvent::StatusChanged { from, to, entity } => {
                if !self.toggles.purge_on_update {
                    TriggerOutcome::Skipped("purge_on_update disabled")
                } else if !from.is_published() && !to.is_published() {
                    TriggerOutcome::Skipped("not a publish transition")
                } else {
                    self.purge_entity(&entity)
                }
            }
            ContentEvent::ContentCleaned { id } => {
                if !self.toggles.purge_on_update {
                    TriggerOutcome::Skipped("purge_on_update disabled")
                } else {
                    match self.resolver.entity(id) {
                        Some(entity) => self.purge_entity(&entity),
                        None => TriggerOutcome::Skipped("unknown content"),
                    }
                }
            }
            ContentEvent::ContentDeleted { entity } => {
                if self.toggles.purge_on_update {
                    self.purge_entity(&entity)
                } else {
                    TriggerOutcome::Skipped("purge_on_update disabled")
                }
            }
            ContentEvent::CommentPosted { comment_id }
            | ContentEvent::CommentEdited { comment_id }
            | ContentEvent::CommentStatusChanged { comment_id } => {
                if !self.toggles.purge_on_comment {
                    TriggerOutcome::Skipped("purge_on_comment disabled")
                } else {
                    match self
                        .resolver
                        .comment_parent(comment_id)
                        .and_then(|parent| self.resolver.entity(parent))
                    {
                        Some(entity) => self.purge_entity(&entity),
                        None => TriggerOutcome::Skipped("comment has no parent content"),
                    }
                }
            }
            ContentEvent::NavigationChanged | ContentEvent::ThemeChanged => {
                self.facade.purge_all();
                TriggerOutcome::PurgedAll
            }
        };

        match &outcome {
            TriggerOutcome::Skipped(reason) => debug!(event = kind, reason, "Trigger skipped"),
            TriggerOutcome::PurgedTags(tags) => {
                info!(event = kind, tags = ?tags, "Purged tags for content change");
            }
            TriggerOutcome::PurgedAll => info!(event = kind, "Global purge triggered"),
        }
        outcome
    }

    fn purge_entity(&self, entity: &ContentEntity) -> TriggerOutcome {
        let tags = self.tagger.tags_for_entity(entity);
        self.facade.purge_tags(&tags);
        if self.toggles.purge_cdn {
            for hook in &self.cdn_hooks {
                hook(&tags, entity);
            }
        }
        TriggerOutcome::PurgedTags(tags)
    }

    pub fn content_status_changed(
        &self,
        from: ContentStatus,
        to: ContentStatus,
        entity: ContentEntity,
    ) -> TriggerOutcome {
        self.handle(ContentEvent::StatusChanged { from, to, entity })
    }

    pub fn content_deleted(&self, entity: ContentEntity) -> TriggerOutcome {
        self.handle(ContentEvent::ContentDeleted { entity })
    }

    pub fn comment_posted(&self, comment_id: u64) -> TriggerOutcome {
        self.handle(ContentEvent::CommentPosted { comment_id })
    }

    pub fn navigation_changed(&self) -> TriggerOutcome {
        self.handle(ContentEvent::NavigationChanged)
    }

    pub fn theme_changed(&self) -> TriggerOutcome {
        self.handle(ContentEvent::ThemeChanged)
    }
}
