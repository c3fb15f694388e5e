//! Process-wide progress and result bookkeeping for long-running operations.
//!
//! Each table pairs a progress map and a result map under one lock, so a
//! reader never sees a completed progress entry without its result.

use std::{
	collections::HashMap,
	hash::Hash,
	sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
	#[default]
	Idle,
	Running,
	Complete,
	/// Stopped early on request. Only compliance runs can be cancelled.
	Cancelled,
	Error,
}

/// A progress record stored in a [`ProgressTable`].
pub trait Progress: Clone {
	fn status(&self) -> RunStatus;
}

#[derive(Debug)]
struct Tables<K, P, R> {
	progress: HashMap<K, P>,
	results: HashMap<K, R>,
}

#[derive(Debug)]
pub(crate) struct ProgressTable<K, P, R> {
	inner: Mutex<Tables<K, P, R>>,
}

impl<K: Eq + Hash, P: Progress, R: Clone> ProgressTable<K, P, R> {
	pub(crate) fn new() -> Self {
		Self {
			inner: Mutex::new(Tables {
				progress: HashMap::new(),
				results: HashMap::new(),
			}),
		}
	}

	/// A panicking worker must not wedge the table for everyone else.
	fn lock(&self) -> MutexGuard<'_, Tables<K, P, R>> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Atomically checks that no operation is running for `key` and marks it
	/// running. When `clear_result` is set, a stale result is dropped in the
	/// same critical section.
	pub(crate) fn claim(&self, key: K, running: P, clear_result: bool, what: &str) -> Result<()> {
		let mut tables = self.lock();
		if tables
			.progress
			.get(&key)
			.is_some_and(|p| p.status() == RunStatus::Running)
		{
			return Err(Error::conflict(format!("{what} is already running")));
		}
		if clear_result {
			tables.results.remove(&key);
		}
		tables.progress.insert(key, running);
		Ok(())
	}

	pub(crate) fn update(&self, key: K, progress: P) {
		self.lock().progress.insert(key, progress);
	}

	/// Applies `f` to the stored progress, if any.
	pub(crate) fn modify(&self, key: &K, f: impl FnOnce(&mut P)) {
		if let Some(progress) = self.lock().progress.get_mut(key) {
			f(progress);
		}
	}

	pub(crate) fn complete(&self, key: K, progress: P, result: R)
	where
		K: Clone,
	{
		let mut tables = self.lock();
		tables.results.insert(key.clone(), result);
		tables.progress.insert(key, progress);
	}

	pub(crate) fn progress(&self, key: &K) -> Option<P> {
		self.lock().progress.get(key).cloned()
	}

	pub(crate) fn result(&self, key: &K) -> Option<R> {
		self.lock().results.get(key).cloned()
	}
}
