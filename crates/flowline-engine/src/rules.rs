//! Record and collection rules applied by the processor pipeline
//!
//! Entity rules judge one record and route it to the valid or invalid
//! bucket. Collection rules judge the whole valid set of a page; a failing
//! collection rule stops the run.

use std::collections::HashSet;
use std::hash::Hash;

/// Pass/fail check over a single record
pub trait EntityRule<T>: Send + Sync {
    fn name(&self) -> &str;

    /// `Err` carries the message attached to the invalid record
    fn check(&self, record: &T) -> Result<(), String>;
}

/// Pass/fail check over every valid record of a page
pub trait CollectionRule<T>: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, records: &[T]) -> Result<(), String>;
}

/// Rule backed by a closure
pub struct FnRule<F> {
    name: String,
    check: F,
}

/// Build an [`EntityRule`] or [`CollectionRule`] from a closure
pub fn rule<F>(name: impl Into<String>, check: F) -> FnRule<F> {
    FnRule {
        name: name.into(),
        check,
    }
}

impl<T, F> EntityRule<T> for FnRule<F>
where
    F: Fn(&T) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, record: &T) -> Result<(), String> {
        (self.check)(record)
    }
}

impl<T, F> CollectionRule<T> for FnRule<F>
where
    F: Fn(&[T]) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, records: &[T]) -> Result<(), String> {
        (self.check)(records)
    }
}

/// No two records may share a key
pub struct UniqueKeyRule<F> {
    name: String,
    key: F,
}

impl<F> UniqueKeyRule<F> {
    pub fn new(name: impl Into<String>, key: F) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }
}

impl<T, K, F> CollectionRule<T> for UniqueKeyRule<F>
where
    K: Eq + Hash + std::fmt::Display,
    F: Fn(&T) -> K + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, records: &[T]) -> Result<(), String> {
        let mut seen = HashSet::with_capacity(records.len());
        let mut duplicates: Vec<String> = Vec::new();

        for record in records {
            let key = (self.key)(record);
            let label = key.to_string();
            if !seen.insert(key) && !duplicates.contains(&label) {
                duplicates.push(label);
            }
        }

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(format!("duplicate keys: {}", duplicates.join(", ")))
        }
    }
}
