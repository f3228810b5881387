//! Change notifications and their classification.
//!
//! Every inbound stream (operator configuration, southbound discovery,
//! dataplane ports) delivers a [`Change`] carrying the previous and the
//! current version of an entity. Listeners classify it exactly once with
//! [`Change::kind`] and never re-inspect the raw pair afterwards.

use serde::{Deserialize, Serialize};

use crate::task::{TaskError, TaskResult};

/// Classification of a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Entity appeared (no previous version).
    Added,
    /// Entity replaced by a newer version.
    Modified,
    /// Entity disappeared (no current version).
    Removed,
}

impl ChangeKind {
    /// Returns the label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `{old?, new?}` change notification for an entity of type `T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    /// Version before the change, absent for additions.
    pub old: Option<T>,
    /// Version after the change, absent for removals.
    pub new: Option<T>,
}

impl<T> Change<T> {
    /// Creates an addition.
    pub fn added(new: T) -> Self {
        Self {
            old: None,
            new: Some(new),
        }
    }

    /// Creates a modification.
    pub fn modified(old: T, new: T) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    /// Creates a removal.
    pub fn removed(old: T) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }

    /// Classifies the change.
    ///
    /// A notification with neither side set can only come from a broken
    /// producer and is reported as an internal error for this change only.
    pub fn kind(&self) -> TaskResult<ChangeKind> {
        match (&self.old, &self.new) {
            (None, Some(_)) => Ok(ChangeKind::Added),
            (Some(_), Some(_)) => Ok(ChangeKind::Modified),
            (Some(_), None) => Ok(ChangeKind::Removed),
            (None, None) => Err(TaskError::internal(
                "change notification carries neither old nor new value",
            )),
        }
    }

    /// Returns the most recent version available (new, else old).
    pub fn latest(&self) -> Option<&T> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Maps both sides of the change.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Change<U> {
        Change {
            old: self.old.map(&mut f),
            new: self.new.map(f),
        }
    }
}

/// A field-value pair, as carried by southbound external ids.
pub type FieldValue = (String, String);

/// Free-form key/value attributes attached to a discovered entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attributes(Vec<FieldValue>);

impl Attributes {
    /// Creates an empty attribute list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns the value for a field, if present.
    pub fn get_field(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if the attribute list has the given field.
    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|(f, _)| f == field)
    }

    /// Sets a field, overwriting any previous value.
    pub fn set_field(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let field = field.into();
        let value = value.into();
        if let Some(existing) = self.0.iter_mut().find(|(f, _)| *f == field) {
            existing.1 = value;
        } else {
            self.0.push((field, value));
        }
    }

    /// Builder form of [`Attributes::set_field`].
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_field(field, value);
        self
    }

    /// Iterates over the field-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = &FieldValue> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<FieldValue> for Attributes {
    fn from_iter<I: IntoIterator<Item = FieldValue>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (field, value) in iter {
            attrs.set_field(field, value);
        }
        attrs
    }
}
