use std::iter::FusedIterator;

use crate::{MigrationError, SchemaVersion, Step};

/// Ordered collection of migration steps.
///
/// Steps are kept sorted by version at registration; steps sharing a version
/// keep their registration order.
pub struct Registry<S: ?Sized> {
    steps: Vec<Box<dyn Step<S>>>,
}

impl<S: ?Sized> Default for Registry<S> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<S: ?Sized> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Fails if a step with the same name exists.
    pub fn register(&mut self, step: impl Step<S> + 'static) -> Result<(), MigrationError> {
        self.register_boxed(Box::new(step))
    }

    pub fn register_boxed(&mut self, step: Box<dyn Step<S>>) -> Result<(), MigrationError> {
        if self.get(step.name()).is_some() {
            return Err(MigrationError::DuplicateVersion {
                name: step.name().to_string(),
            });
        }

        // After every step with an equal or lower version keeps ties stable.
        let at = self
            .steps
            .partition_point(|existing| existing.version() <= step.version());
        self.steps.insert(at, step);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, step: impl Step<S> + 'static) -> Result<Self, MigrationError> {
        self.register(step)?;
        Ok(self)
    }

    /// Steps with a version strictly greater than `current`, ascending.
    /// The iterator is lazy and can be cloned to restart.
    pub fn pending(&self, current: &SchemaVersion) -> Pending<'_, S> {
        let start = self
            .steps
            .partition_point(|existing| existing.version() <= current);
        Pending {
            inner: self.steps[start..].iter(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Step<S>> {
        self.steps
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    /// All steps in run order.
    pub fn steps(&self) -> Pending<'_, S> {
        Pending {
            inner: self.steps.iter(),
        }
    }

    pub fn latest_version(&self) -> Option<SchemaVersion> {
        self.steps.last().map(|s| *s.version())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Iterator over registered steps in run order.
pub struct Pending<'a, S: ?Sized> {
    inner: std::slice::Iter<'a, Box<dyn Step<S>>>,
}

impl<S: ?Sized> Clone for Pending<'_, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<'a, S: ?Sized> Iterator for Pending<'a, S> {
    type Item = &'a dyn Step<S>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|s| s.as_ref())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S: ?Sized> ExactSizeIterator for Pending<'_, S> {}

impl<S: ?Sized> FusedIterator for Pending<'_, S> {}
