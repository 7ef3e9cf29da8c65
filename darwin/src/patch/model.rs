use crate::common::PATH_SEPARATOR;
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::resource::{classify_name, split_resource_path, ClassifiedResource, ResourceRole};
use crate::version::VersionDescriptor;
use chrono::{DateTime, Utc};
use std::fmt::{Display, Formatter};

/// One migration script applied (or to be applied) to a component.
///
/// A patch is *virtual* until the store assigns it an id; virtual patches are
/// never recorded as finished.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    id: Option<i64>,
    name: String,
    component: String,
    platform: String,
    role: Option<ResourceRole>,
    version: Option<VersionDescriptor>,
    detected_on: DateTime<Utc>,
    process_time: i64,
    finished_on: Option<DateTime<Utc>>,
}

impl Patch {
    /// Creates a virtual patch, deriving role and version from `name`.
    pub fn new(name: &str, component: &str, platform: &str) -> DarwinResult<Patch> {
        Self::validate(name, component, platform)?;
        let (role, version) = match classify_name(name)? {
            Some((role, version)) => (Some(role), version),
            None => (None, None),
        };

        Ok(Patch {
            id: None,
            name: name.to_string(),
            component: component.to_string(),
            platform: platform.to_string(),
            role,
            version,
            detected_on: Utc::now(),
            process_time: 0,
            finished_on: None,
        })
    }

    /// Creates a virtual patch for a `<platform>/<name>` resource path.
    pub fn for_path(path: &str, component: &str) -> DarwinResult<Patch> {
        let (platform, name) = split_resource_path(path)?;
        Self::new(name, component, platform)
    }

    pub fn from_resource(resource: &ClassifiedResource, component: &str) -> DarwinResult<Patch> {
        Self::validate(resource.name(), component, resource.platform())?;
        Ok(Patch {
            id: None,
            name: resource.name().to_string(),
            component: component.to_string(),
            platform: resource.platform().to_string(),
            role: Some(resource.role()),
            version: resource.version().cloned(),
            detected_on: Utc::now(),
            process_time: 0,
            finished_on: None,
        })
    }

    /// Rebuilds a persisted patch from its bookkeeping row.
    pub(crate) fn restore(
        id: i64,
        name: &str,
        component: &str,
        platform: &str,
        detected_on: DateTime<Utc>,
        process_time: i64,
        finished_on: Option<DateTime<Utc>>,
    ) -> DarwinResult<Patch> {
        let mut patch = Self::new(name, component, platform)?;
        patch.id = Some(id);
        patch.detected_on = detected_on;
        patch.process_time = process_time;
        patch.finished_on = finished_on;
        Ok(patch)
    }

    fn validate(name: &str, component: &str, platform: &str) -> DarwinResult<()> {
        let missing = if name.trim().is_empty() {
            Some("resource name")
        } else if component.trim().is_empty() {
            Some("component")
        } else if platform.trim().is_empty() {
            Some("platform")
        } else {
            None
        };

        match missing {
            Some(field) => {
                log::error!("Patch {} cannot be empty", field);
                Err(DarwinError::new(
                    &format!("Patch {} cannot be empty", field),
                    ErrorKind::PatchFormat,
                ))
            }
            None => Ok(()),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn role(&self) -> Option<ResourceRole> {
        self.role
    }

    pub fn version(&self) -> Option<&VersionDescriptor> {
        self.version.as_ref()
    }

    pub fn detected_on(&self) -> DateTime<Utc> {
        self.detected_on
    }

    /// Elapsed processing time in milliseconds.
    pub fn process_time(&self) -> i64 {
        self.process_time
    }

    pub fn finished_on(&self) -> Option<DateTime<Utc>> {
        self.finished_on
    }

    pub fn is_finished(&self) -> bool {
        self.finished_on.is_some()
    }

    pub fn resource_path(&self) -> String {
        format!("{}{}{}", self.platform, PATH_SEPARATOR, self.name)
    }

    pub(crate) fn with_id(mut self, id: i64) -> Patch {
        self.id = Some(id);
        self
    }

    pub(crate) fn finish(&mut self, process_time: i64, finished_on: DateTime<Utc>) {
        self.process_time = process_time;
        self.finished_on = Some(finished_on);
    }
}

impl Display for Patch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.component, self.resource_path())
    }
}

/// Outcome of looking up a statement of a patch in the bookkeeping tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementStatus {
    Finished,
    Failed,
    NeverRun,
}

/// Bookkeeping row of a single statement of a persisted patch.
///
/// The same statement text may appear several times in one patch; the
/// occurrence index tells the copies apart.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementRecord {
    patch_id: i64,
    statement: String,
    hash: String,
    occurrence: u32,
    process_time: i64,
    finished_on: Option<DateTime<Utc>>,
    failure: Option<String>,
}

impl StatementRecord {
    pub fn new(patch_id: i64, statement: &str, hash: &str, occurrence: u32) -> StatementRecord {
        StatementRecord {
            patch_id,
            statement: statement.to_string(),
            hash: hash.to_string(),
            occurrence,
            process_time: 0,
            finished_on: None,
            failure: None,
        }
    }

    pub fn patch_id(&self) -> i64 {
        self.patch_id
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn occurrence(&self) -> u32 {
        self.occurrence
    }

    pub fn process_time(&self) -> i64 {
        self.process_time
    }

    pub fn finished_on(&self) -> Option<DateTime<Utc>> {
        self.finished_on
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_on.is_some()
    }

    pub fn set_process_time(&mut self, process_time: i64) {
        self.process_time = process_time;
    }

    pub fn set_finished_on(&mut self, finished_on: Option<DateTime<Utc>>) {
        self.finished_on = finished_on;
    }

    pub fn set_failure(&mut self, failure: Option<String>) {
        self.failure = failure;
    }
}
