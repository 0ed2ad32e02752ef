//! Ordered, resumable execution of data-migration jobs

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::notify::{ChangeFeed, ChangeNotification};
use crate::types::{EntityKey, NewEvent};

use super::context::MigrationContext;
use super::DataMigration;

/// Entity type the job markers are stored under
pub const MARKER_ENTITY_TYPE: &str = "DataMigration";
pub const STARTED_EVENT: &str = "DataMigrationStarted";
pub const FINISHED_EVENT: &str = "DataMigrationFinished";

/// Outcome of one runner pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// Jobs run to completion in this pass, in execution order
    pub completed: Vec<String>,
    /// Jobs finished by an earlier pass
    pub skipped: Vec<String>,
}

/// Runs jobs by ascending priority, skipping those already finished
pub struct DataMigrationRunner {
    context: MigrationContext,
    jobs: Vec<Arc<dyn DataMigration>>,
    feed: Option<Arc<ChangeFeed>>,
}

impl DataMigrationRunner {
    pub fn new(context: MigrationContext) -> Self {
        Self {
            context,
            jobs: Vec::new(),
            feed: None,
        }
    }

    /// Add a job; names must be unique
    pub fn register(&mut self, job: Arc<dyn DataMigration>) -> Result<()> {
        if self.jobs.iter().any(|j| j.name() == job.name()) {
            return Err(Error::InvalidRegistry(format!(
                "data migration {} registered twice",
                job.name()
            )));
        }
        self.jobs.push(job);
        Ok(())
    }

    /// Publish a notification for every finished job
    pub fn with_feed(mut self, feed: Arc<ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Whether a job's last marker is a finished marker
    pub fn is_finished(&self, name: &str) -> Result<bool> {
        let key = marker_key(name);
        let markers = self.context.log().events_after(&key, None)?;
        Ok(markers
            .last()
            .map_or(false, |event| event.type_name == FINISHED_EVENT))
    }

    /// Run every pending job, lowest priority value first
    ///
    /// A failing job stops the pass; it has a started marker but no finished
    /// one, so the next pass runs it again from the start.
    pub fn run(&self) -> Result<MigrationReport> {
        let mut order: Vec<&Arc<dyn DataMigration>> = self.jobs.iter().collect();
        // Stable: equal priorities keep registration order
        order.sort_by_key(|job| job.priority());

        let mut report = MigrationReport::default();
        let mut seen = HashSet::new();

        for job in order {
            let name = job.name().to_string();
            if !seen.insert(name.clone()) {
                continue;
            }
            if self.is_finished(&name)? {
                report.skipped.push(name);
                continue;
            }

            info!(job = %name, priority = job.priority(), "Data migration started");
            self.mark(&name, STARTED_EVENT, job.priority())?;

            if let Err(e) = job.run(&self.context) {
                warn!(job = %name, error = %e, "Data migration failed");
                return Err(e);
            }

            self.mark(&name, FINISHED_EVENT, job.priority())?;
            info!(job = %name, "Data migration finished");

            if let Some(feed) = &self.feed {
                feed.publish(ChangeNotification::DataMigrationFinished { name: name.clone() });
            }
            report.completed.push(name);
        }

        Ok(report)
    }

    /// Run on the blocking pool of the current tokio runtime
    ///
    /// Must be called from within a runtime.
    pub fn spawn(self) -> JoinHandle<Result<MigrationReport>> {
        tokio::task::spawn_blocking(move || self.run())
    }

    fn mark(&self, name: &str, event_type: &str, priority: i32) -> Result<()> {
        let event = NewEvent::new(event_type, json!({ "name": name, "priority": priority }));
        self.context.log().append(&marker_key(name), vec![event], None)?;
        Ok(())
    }
}

fn marker_key(name: &str) -> EntityKey {
    EntityKey::new(MARKER_ENTITY_TYPE, name)
}
