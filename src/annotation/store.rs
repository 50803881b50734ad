use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::types::{AnnotationId, AnnotationKind, AnnotationObject, WireObject};

/// Result of an upsert into a [`SlideSnapshot`]
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Inserted(AnnotationId),
    Updated(AnnotationId),
    /// Same payload already present
    Unchanged(AnnotationId),
    /// Incoming id belonged to an object of another kind; stored under
    /// `assigned` instead
    Reminted {
        original: AnnotationId,
        assigned: AnnotationId,
    },
}

impl Upsert {
    pub fn id(&self) -> &AnnotationId {
        match self {
            Upsert::Inserted(id) | Upsert::Updated(id) | Upsert::Unchanged(id) => id,
            Upsert::Reminted { assigned, .. } => assigned,
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, Upsert::Unchanged(_))
    }
}

/// The annotation objects of one slide, keyed by id.
///
/// Used both for the live canvas and for the per-slide copies captured on
/// navigation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlideSnapshot {
    objects: BTreeMap<AnnotationId, AnnotationObject>,
    /// Wire ids that were re-minted on collision, per kind, so later
    /// updates for the same remote object land on the same local one
    aliases: HashMap<(AnnotationId, AnnotationKind), AnnotationId>,
}

impl SlideSnapshot {
    /// Rebuild from wire objects, minting ids for any that lack one.
    pub fn from_wire(slide_index: usize, objects: Vec<WireObject>) -> Self {
        let mut snapshot = Self::default();
        for object in objects {
            snapshot.upsert(AnnotationObject::from_wire(object, slide_index));
        }
        snapshot
    }

    pub fn to_wire(&self) -> Vec<WireObject> {
        self.objects.values().map(AnnotationObject::to_wire).collect()
    }

    /// Insert or overwrite by id; last write wins.
    ///
    /// An existing object of the same kind keeps its id and kind and takes
    /// the incoming shape and version. An existing object of a different
    /// kind is a collision: the incoming object gets a fresh id.
    pub fn upsert(&mut self, mut incoming: AnnotationObject) -> Upsert {
        let alias_key = (incoming.id.clone(), incoming.kind());
        if let Some(local) = self.aliases.get(&alias_key) {
            incoming.id = local.clone();
        }

        let existing_kind = self.objects.get(&incoming.id).map(AnnotationObject::kind);
        match existing_kind {
            None => {
                let id = incoming.id.clone();
                self.objects.insert(id.clone(), incoming);
                Upsert::Inserted(id)
            }
            Some(kind) if kind == incoming.kind() => {
                let id = incoming.id.clone();
                let Some(existing) = self.objects.get_mut(&id) else {
                    return Upsert::Unchanged(id);
                };
                if existing.shape == incoming.shape {
                    return Upsert::Unchanged(id);
                }
                existing.shape = incoming.shape;
                existing.version = incoming.version;
                Upsert::Updated(id)
            }
            Some(_) => {
                let original = incoming.id.clone();
                let assigned = AnnotationId::generate_unique(|id| self.objects.contains_key(id));
                debug!("Annotation id {} collides, re-minted as {}", original, assigned);
                incoming.id = assigned.clone();
                self.aliases.insert(alias_key, assigned.clone());
                self.objects.insert(assigned.clone(), incoming);
                Upsert::Reminted { original, assigned }
            }
        }
    }

    /// Remove the `kind` object known by `id`, following a collision alias
    /// first. An object of another kind under the same id is left alone.
    /// Absent ids are a no-op.
    pub fn remove(&mut self, id: &AnnotationId, kind: AnnotationKind) -> Option<AnnotationObject> {
        if let Some(local) = self.aliases.remove(&(id.clone(), kind)) {
            return self.objects.remove(&local);
        }
        if self.objects.get(id).map(AnnotationObject::kind) != Some(kind) {
            return None;
        }
        self.aliases.retain(|_, local| local != id);
        self.objects.remove(id)
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.aliases.clear();
    }

    pub fn get(&self, id: &AnnotationId) -> Option<&AnnotationObject> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &AnnotationId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnnotationObject> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
