//! Migration files on disk.
//!
//! `<YYYYMMDDHHMMSS>_<name>.sql` with a directive header and two
//! sections:
//!
//! ```sql
//! -- pgm:schemas users
//! -- pgm:depends 20240101120000
//! -- pgm:up
//! CREATE TABLE users.accounts (id BIGSERIAL PRIMARY KEY);
//! -- pgm:down
//! DROP TABLE users.accounts;
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use super::migration::{Migration, MigrationStep};
use super::Error;

const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// A fresh version string for newly created migrations.
pub fn version_now() -> String {
    Utc::now().format(VERSION_FORMAT).to_string()
}

/// Load every parseable migration in the directory, sorted by version.
/// Unparseable files are skipped with a warning.
pub fn load_dir(dir: &Path) -> Result<Vec<Migration>, Error> {
    let mut migrations = vec![];

    if !dir.exists() {
        return Ok(migrations);
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "sql").unwrap_or(false))
        .collect();
    paths.sort();

    for path in paths {
        match parse_file(&path) {
            Ok(migration) => migrations.push(migration),
            Err(err) => warn!("skipping migration file: {}", err),
        }
    }

    Ok(migrations)
}

pub fn parse_file(path: &Path) -> Result<Migration, Error> {
    let file = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_string();
    let content = fs::read_to_string(path)?;

    parse(&file, &content)
}

/// Parse a migration out of its file stem and content.
pub fn parse(file_stem: &str, content: &str) -> Result<Migration, Error> {
    let (version, name) = file_stem
        .split_once('_')
        .ok_or_else(|| Error::Parse(file_stem.into(), "expected <version>_<name>".into()))?;

    if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Parse(
            file_stem.into(),
            "version prefix must be numeric".into(),
        ));
    }

    let mut description = None;
    let mut schemas = vec![];
    let mut clusters = None;
    let mut dependencies = vec![];
    let mut tags = vec![];
    let mut up = String::new();
    let mut down = String::new();

    #[derive(PartialEq)]
    enum Section {
        Header,
        Up,
        Down,
    }
    let mut section = Section::Header;

    for line in content.lines() {
        let directive = line.trim().strip_prefix("-- pgm:");

        match directive {
            Some("up") => {
                section = Section::Up;
                continue;
            }
            Some("down") => {
                section = Section::Down;
                continue;
            }
            Some(directive) if section == Section::Header => {
                if let Some(value) = directive.strip_prefix("description ") {
                    description = Some(value.trim().to_string());
                } else if let Some(value) = directive.strip_prefix("schemas ") {
                    schemas = split_list(value);
                } else if let Some(value) = directive.strip_prefix("clusters ") {
                    clusters = Some(split_list(value));
                } else if let Some(value) = directive.strip_prefix("depends ") {
                    dependencies = split_list(value);
                } else if let Some(value) = directive.strip_prefix("tags ") {
                    tags = split_list(value);
                }
                continue;
            }
            _ => (),
        }

        match section {
            Section::Up => {
                up.push_str(line);
                up.push('\n');
            }
            Section::Down => {
                down.push_str(line);
                down.push('\n');
            }
            Section::Header => (),
        }
    }

    let migration = Migration {
        version: version.to_string(),
        name: name.to_string(),
        description,
        target_schemas: schemas,
        target_clusters: clusters,
        up: MigrationStep::sql(up.trim()),
        down: MigrationStep::sql(down.trim()),
        dependencies,
        tags,
        created_at: parse_version_time(version),
    };
    migration.validate()?;

    Ok(migration)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_version_time(version: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(version, VERSION_FORMAT)
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

/// Template written by `create_migration`.
pub fn template(schemas: &[String], clusters: Option<&[String]>, description: Option<&str>) -> String {
    let mut out = String::new();

    if let Some(description) = description {
        out.push_str(&format!("-- pgm:description {}\n", description));
    }
    out.push_str(&format!("-- pgm:schemas {}\n", schemas.join(",")));
    if let Some(clusters) = clusters {
        out.push_str(&format!("-- pgm:clusters {}\n", clusters.join(",")));
    }
    out.push_str("-- pgm:up\n\n-- TODO: forward migration\n\n-- pgm:down\n\n-- TODO: undo it\n");

    out
}
