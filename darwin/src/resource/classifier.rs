use crate::common::{CREATE_RESOURCE, GUESS_PREFIX, PATCH_PREFIX, PATH_SEPARATOR, SQL_SUFFIX};
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::version::VersionDescriptor;
use itertools::Itertools;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

// alphanumeric runs joined by single separators
const EMBEDDED_VERSION: &str = r"([a-z0-9]+(?:[._-][a-z0-9]+)*)";

static EVOLVE_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| role_pattern(PATCH_PREFIX));
static GUESS_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| role_pattern(GUESS_PREFIX));

fn role_pattern(prefix: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        "(?i)^{}{}{}$",
        regex::escape(prefix),
        EMBEDDED_VERSION,
        regex::escape(SQL_SUFFIX)
    ))
}

/// The role a migration resource plays, recognized from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    /// `create.sql`, builds the schema from nothing
    Create,
    /// `patch_<version>.sql`, moves the schema forward to `<version>`
    Evolve,
    /// `guess_<version>.sql`, read-only probe telling whether the schema is at `<version>`
    Guess,
}

impl Display for ResourceRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceRole::Create => write!(f, "create"),
            ResourceRole::Evolve => write!(f, "evolve"),
            ResourceRole::Guess => write!(f, "guess"),
        }
    }
}

/// A resource whose role and embedded version have been recognized.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedResource {
    path: String,
    platform: String,
    name: String,
    role: ResourceRole,
    version: Option<VersionDescriptor>,
}

impl ClassifiedResource {
    /// Full resource path, `<platform>/<name>`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// File name of the resource, used as the patch name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ResourceRole {
        self.role
    }

    /// Embedded version; `None` for the create script.
    pub fn version(&self) -> Option<&VersionDescriptor> {
        self.version.as_ref()
    }
}

/// Splits `<platform>/<filename>` into its two parts.
///
/// Only the last directory segment counts as the platform, so
/// `db/sqlite/create.sql` belongs to platform `sqlite`.
pub fn split_resource_path(path: &str) -> DarwinResult<(&str, &str)> {
    let (directory, file_name) = path.rsplit_once(PATH_SEPARATOR).ok_or_else(|| {
        DarwinError::new(
            &format!("Resource path '{}' has no platform directory", path),
            ErrorKind::PatchFormat,
        )
    })?;
    let platform = directory
        .rsplit(PATH_SEPARATOR)
        .next()
        .unwrap_or(directory);

    if platform.is_empty() || file_name.is_empty() {
        return Err(DarwinError::new(
            &format!("Resource path '{}' must look like <platform>/<file name>", path),
            ErrorKind::PatchFormat,
        ));
    }
    Ok((platform, file_name))
}

/// Recognizes the role and version of a bare file name.
///
/// Returns `None` when the name follows none of the conventions, or when the
/// embedded version is not a valid version.
pub fn classify_name(file_name: &str) -> DarwinResult<Option<(ResourceRole, Option<VersionDescriptor>)>> {
    if file_name.eq_ignore_ascii_case(CREATE_RESOURCE) {
        return Ok(Some((ResourceRole::Create, None)));
    }

    for (role, pattern) in [
        (ResourceRole::Evolve, &EVOLVE_PATTERN),
        (ResourceRole::Guess, &GUESS_PATTERN),
    ] {
        let regex = compiled(pattern)?;
        if let Some(captures) = regex.captures(file_name) {
            let embedded = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            return match VersionDescriptor::parse(embedded) {
                Ok(version) => Ok(Some((role, Some(version)))),
                Err(_) => {
                    log::debug!("Ignoring {} resource {} with unparsable version", role, file_name);
                    Ok(None)
                }
            };
        }
    }
    Ok(None)
}

/// Classifies a `<platform>/<filename>` resource path.
pub fn classify(path: &str) -> DarwinResult<Option<ClassifiedResource>> {
    let (platform, name) = split_resource_path(path)?;
    Ok(classify_name(name)?.map(|(role, version)| ClassifiedResource {
        path: path.to_string(),
        platform: platform.to_string(),
        name: name.to_string(),
        role,
        version,
    }))
}

/// Classifies every path, dropping the ones that play no role, and orders the
/// result by embedded version, then by name.
pub fn classify_all<S: AsRef<str>>(paths: &[S]) -> DarwinResult<Vec<ClassifiedResource>> {
    let mut resources = Vec::with_capacity(paths.len());
    for path in paths {
        match classify(path.as_ref())? {
            Some(resource) => resources.push(resource),
            None => log::debug!("Resource {} is not a migration resource", path.as_ref()),
        }
    }
    Ok(sort_resources(resources))
}

/// Orders resources by embedded version (the versionless create script first),
/// then by name.
pub fn sort_resources(resources: Vec<ClassifiedResource>) -> Vec<ClassifiedResource> {
    resources
        .into_iter()
        .sorted_by(|a, b| {
            compare_versions(a.version(), b.version())
                .then_with(|| a.name().to_lowercase().cmp(&b.name().to_lowercase()))
        })
        .collect()
}

/// Orders resource paths the way [`sort_resources`] orders resources; paths
/// without a recognizable role go last, by name.
pub fn sort_resource_paths(paths: Vec<String>) -> Vec<String> {
    paths
        .into_iter()
        .map(|path| {
            let version = split_resource_path(&path)
                .ok()
                .and_then(|(_, name)| classify_name(name).ok().flatten())
                .map(|(_, version)| version);
            (path, version)
        })
        .sorted_by(|(path_a, a), (path_b, b)| {
            let by_version = match (a, b) {
                (Some(a), Some(b)) => compare_versions(a.as_ref(), b.as_ref()),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_version.then_with(|| path_a.to_lowercase().cmp(&path_b.to_lowercase()))
        })
        .map(|(path, _)| path)
        .collect()
}

fn compare_versions(a: Option<&VersionDescriptor>, b: Option<&VersionDescriptor>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.compare(b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compiled(pattern: &'static LazyLock<Result<Regex, regex::Error>>) -> DarwinResult<&'static Regex> {
    pattern.as_ref().map_err(|e| {
        DarwinError::new(
            &format!("Invalid resource name pattern: {}", e),
            ErrorKind::InternalError,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role_of(name: &str) -> Option<ResourceRole> {
        classify_name(name).unwrap().map(|(role, _)| role)
    }

    #[test]
    fn test_create_resource() {
        assert_eq!(role_of("create.sql"), Some(ResourceRole::Create));
        assert_eq!(role_of("CREATE.SQL"), Some(ResourceRole::Create));
        assert_eq!(role_of("create_1.sql"), None);
        assert_eq!(role_of("xcreate.sql"), None);
    }

    #[test]
    fn test_evolve_resources() {
        assert_eq!(role_of("patch_1.2.sql"), Some(ResourceRole::Evolve));
        assert_eq!(role_of("PATCH_1_2-rc.SQL"), Some(ResourceRole::Evolve));
        assert_eq!(role_of("patch_1.0.0.a.b1278.sql"), Some(ResourceRole::Evolve));
    }

    #[test]
    fn test_guess_resources() {
        assert_eq!(role_of("guess_1.1.sql"), Some(ResourceRole::Guess));
        assert_eq!(role_of("Guess_2.sql"), Some(ResourceRole::Guess));
    }

    #[test]
    fn test_role_patterns_follow_naming_constants() {
        let patch = format!("{}3.1{}", PATCH_PREFIX, SQL_SUFFIX);
        let guess = format!("{}3.1{}", GUESS_PREFIX, SQL_SUFFIX.to_uppercase());
        assert_eq!(role_of(&patch), Some(ResourceRole::Evolve));
        assert_eq!(role_of(&guess), Some(ResourceRole::Guess));
        // the suffix dot is literal
        assert_eq!(role_of(&format!("{}3.1xsql", PATCH_PREFIX)), None);
    }

    #[test]
    fn test_rejected_names() {
        for name in [
            "patch_.sql",
            "patch_1..2.sql",
            "patch_1.2..sql",
            "patch_1.2.sql.bak",
            "patch-1.2.sql",
            "patch_1 2.sql",
            "guess_.sql",
            "readme.md",
            "patch_SNAPSHOT.sql",
        ] {
            assert_eq!(role_of(name), None, "{}", name);
        }
    }

    #[test]
    fn test_embedded_version() {
        let (_, version) = classify_name("patch_1.2.0.sql").unwrap().unwrap();
        assert_eq!(version.unwrap(), VersionDescriptor::parse("1.2").unwrap());

        let (_, version) = classify_name("create.sql").unwrap().unwrap();
        assert!(version.is_none());
    }

    #[test]
    fn test_classify_path() {
        let resource = classify("sqlite/patch_2.0.sql").unwrap().unwrap();
        assert_eq!(resource.platform(), "sqlite");
        assert_eq!(resource.name(), "patch_2.0.sql");
        assert_eq!(resource.path(), "sqlite/patch_2.0.sql");
        assert_eq!(resource.role(), ResourceRole::Evolve);

        let nested = classify("db/scripts/mysql/create.sql").unwrap().unwrap();
        assert_eq!(nested.platform(), "mysql");
    }

    #[test]
    fn test_classify_path_without_platform() {
        let err = classify("patch_1.sql").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::PatchFormat);

        let err = classify("sqlite/").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::PatchFormat);
    }

    #[test]
    fn test_classify_all_orders_by_version_then_name() {
        let paths = vec![
            "sqlite/patch_1.10.sql",
            "sqlite/guess_1.2.sql",
            "sqlite/patch_1.2.sql",
            "sqlite/notes.txt",
            "sqlite/create.sql",
            "sqlite/patch_1.9.sql",
        ];
        let names: Vec<String> = classify_all(&paths)
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["create.sql", "guess_1.2.sql", "patch_1.2.sql", "patch_1.9.sql", "patch_1.10.sql"]
        );
    }

    #[test]
    fn test_sort_resource_paths() {
        let sorted = sort_resource_paths(vec![
            "sqlite/zzz.sql".to_string(),
            "sqlite/patch_2.sql".to_string(),
            "sqlite/patch_1.1.sql".to_string(),
            "sqlite/create.sql".to_string(),
        ]);
        assert_eq!(
            sorted,
            vec!["sqlite/create.sql", "sqlite/patch_1.1.sql", "sqlite/patch_2.sql", "sqlite/zzz.sql"]
        );
    }
}
