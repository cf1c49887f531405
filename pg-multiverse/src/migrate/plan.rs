//! Migration planning.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::migration::Migration;
use super::Error;

/// Migrations still to run for one (schema, cluster), ascending by
/// version.
pub(crate) fn pending<'a>(
    migrations: &'a BTreeMap<String, Migration>,
    schema: &str,
    cluster: &str,
    applied: &HashSet<String>,
    target_version: Option<&str>,
) -> Vec<&'a Migration> {
    migrations
        .values()
        .filter(|migration| {
            migration.targets_schema(schema)
                && migration.targets_cluster(cluster)
                && !applied.contains(&migration.version)
                && target_version
                    .map(|target| migration.version.as_str() <= target)
                    .unwrap_or(true)
        })
        .collect()
}

/// Every dependency must either run earlier in this plan or already be
/// applied in each of the dependent migration's target schemas.
pub(crate) fn check_dependencies(
    planned: &BTreeMap<String, &Migration>,
    applied_by_schema: &HashMap<String, HashSet<String>>,
) -> Result<(), Error> {
    for migration in planned.values() {
        for dependency in &migration.dependencies {
            let runs_earlier =
                planned.contains_key(dependency) && dependency.as_str() < migration.version.as_str();
            if runs_earlier {
                continue;
            }

            let applied_everywhere = migration.target_schemas.iter().all(|schema| {
                applied_by_schema
                    .get(schema)
                    .map(|versions| versions.contains(dependency))
                    .unwrap_or(false)
            });

            if !applied_everywhere {
                return Err(Error::DependencyMissing(
                    migration.version.clone(),
                    dependency.clone(),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::migrate::migration::MigrationStep;
    use chrono::Utc;

    fn migration(version: &str, schemas: &[&str], dependencies: &[&str]) -> Migration {
        Migration {
            version: version.to_string(),
            name: format!("m{}", version),
            description: None,
            target_schemas: schemas.iter().map(|s| s.to_string()).collect(),
            target_clusters: None,
            up: MigrationStep::sql("SELECT 1"),
            down: MigrationStep::sql("SELECT 1"),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            tags: vec![],
            created_at: Utc::now(),
        }
    }

    fn registry(migrations: Vec<Migration>) -> BTreeMap<String, Migration> {
        migrations
            .into_iter()
            .map(|m| (m.version.clone(), m))
            .collect()
    }

    #[test]
    fn test_pending_filters_and_sorts() {
        let registry = registry(vec![
            migration("20240103000000", &["users"], &[]),
            migration("20240101000000", &["users"], &[]),
            migration("20240102000000", &["orders"], &[]),
        ]);

        let applied: HashSet<String> = ["20240101000000".to_string()].into_iter().collect();
        let pending = pending(&registry, "users", "a", &applied, None);

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, "20240103000000");
    }

    #[test]
    fn test_pending_honors_target_version() {
        let registry = registry(vec![
            migration("20240101000000", &["users"], &[]),
            migration("20240102000000", &["users"], &[]),
            migration("20240103000000", &["users"], &[]),
        ]);

        let pending = pending(
            &registry,
            "users",
            "a",
            &HashSet::new(),
            Some("20240102000000"),
        );

        let versions: Vec<&str> = pending.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["20240101000000", "20240102000000"]);
    }

    #[test]
    fn test_dependency_in_plan() {
        let base = migration("20240101000000", &["users"], &[]);
        let next = migration("20240102000000", &["users"], &["20240101000000"]);

        let planned: BTreeMap<String, &Migration> = [&base, &next]
            .iter()
            .map(|m| (m.version.clone(), *m))
            .collect();

        assert!(check_dependencies(&planned, &HashMap::new()).is_ok());
    }

    #[test]
    fn test_dependency_applied() {
        let next = migration("20240102000000", &["users"], &["20240101000000"]);
        let planned: BTreeMap<String, &Migration> =
            [(next.version.clone(), &next)].into_iter().collect();

        let mut applied = HashMap::new();
        applied.insert(
            "users".to_string(),
            ["20240101000000".to_string()].into_iter().collect(),
        );

        assert!(check_dependencies(&planned, &applied).is_ok());

        // The same plan without the applied row fails.
        let err = check_dependencies(&planned, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::DependencyMissing(_, _)));
    }

    #[test]
    fn test_dependency_must_sort_earlier() {
        // A dependency on a later version is never satisfiable by the
        // plan itself.
        let early = migration("20240101000000", &["users"], &["20240102000000"]);
        let late = migration("20240102000000", &["users"], &[]);

        let planned: BTreeMap<String, &Migration> = [&early, &late]
            .iter()
            .map(|m| (m.version.clone(), *m))
            .collect();

        let err = check_dependencies(&planned, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::DependencyMissing(_, _)));
    }
}
