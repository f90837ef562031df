//! Turn a plan's explicit entries and free-text image list into tasks
//!
//! Explicit entries always win. An explicit entry without tags claims its whole
//! repository; one with tags claims those `(repository, tag)` pairs. Image list
//! lines that touch a claimed repository or pair are dropped, as are repeats of
//! an earlier line.

use crate::config::reference::ImageReference;
use crate::config::ImageEntry;
use crate::error::{RegistryError, Result};
use std::collections::HashSet;

const ARCH_DIRECTIVE: &str = "#arch=";

/// One repository to migrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTask {
    pub registry: String,
    pub repository: String,
    pub target_repository: String,
    /// Empty means every tag the source lists
    pub tags: Vec<String>,
    /// Empty means no filtering
    pub architectures: Vec<String>,
}

impl MigrationTask {
    fn repo_key(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}/{}:{}", self.registry, self.repository, tag)
    }
}

/// Resolve explicit entries and image list lines into ordered tasks.
///
/// Explicit entries come first in their given order, then surviving list
/// lines in line order.
pub fn resolve(
    explicit: &[ImageEntry],
    image_list: &str,
    default_architectures: &[String],
    default_registry: &str,
) -> Result<Vec<MigrationTask>> {
    let explicit = explicit
        .iter()
        .map(|entry| explicit_task(entry, default_registry))
        .collect::<Result<Vec<_>>>()?;
    let listed = parse_image_list(image_list, default_architectures, default_registry)?;
    Ok(merge(explicit, listed))
}

fn explicit_task(entry: &ImageEntry, default_registry: &str) -> Result<MigrationTask> {
    let registry = entry.registry.as_deref().map(str::trim).filter(|r| !r.is_empty());
    // any tag or digest in the name is ignored; `tags` is authoritative
    let parsed = match registry {
        Some(registry) => ImageReference::parse_in(&entry.name, registry),
        None => ImageReference::parse(&entry.name, default_registry),
    };
    let reference = parsed.map_err(|e| {
        RegistryError::Config(format!("Invalid image name '{}': {}", entry.name, e))
    })?;
    let target_repository = entry
        .target_name
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map_or_else(|| reference.repository.clone(), str::to_string);

    Ok(MigrationTask {
        registry: reference.registry,
        repository: reference.repository,
        target_repository,
        tags: entry.tags.clone(),
        architectures: entry.architectures.clone(),
    })
}

/// Parse the free-text list: one reference per line, blank lines and `#`
/// comments skipped, an optional `#arch=a,b` directive after the reference.
pub fn parse_image_list(
    image_list: &str,
    default_architectures: &[String],
    default_registry: &str,
) -> Result<Vec<MigrationTask>> {
    let mut tasks = Vec::new();

    for (index, line) in image_list.lines().enumerate() {
        let mut line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut architectures = Vec::new();
        if let Some(position) = line.find(ARCH_DIRECTIVE) {
            let directive = line[position + ARCH_DIRECTIVE.len()..].trim();
            let value = directive.split_whitespace().next().unwrap_or_default();
            architectures.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|arch| !arch.is_empty())
                    .map(str::to_string),
            );
            line = line[..position].trim();
        }
        if line.is_empty() {
            continue;
        }

        let reference = ImageReference::parse(line, default_registry).map_err(|e| {
            RegistryError::Config(format!("image_list line {}: {}", index + 1, e))
        })?;
        if architectures.is_empty() {
            architectures = default_architectures.to_vec();
        }

        tasks.push(MigrationTask {
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            target_repository: reference.repository.clone(),
            tags: vec![reference.identifier_or_default()],
            architectures,
        });
    }
    Ok(tasks)
}

fn merge(explicit: Vec<MigrationTask>, listed: Vec<MigrationTask>) -> Vec<MigrationTask> {
    let mut claimed_repos = HashSet::new();
    let mut claimed_tags = HashSet::new();
    for task in &explicit {
        if task.tags.is_empty() {
            claimed_repos.insert(task.repo_key());
        } else {
            claimed_tags.extend(task.tags.iter().map(|tag| task.tag_key(tag)));
        }
    }

    let mut merged = explicit;
    for task in listed {
        if claimed_repos.contains(&task.repo_key()) {
            continue;
        }
        if task.tags.iter().any(|tag| claimed_tags.contains(&task.tag_key(tag))) {
            continue;
        }
        claimed_tags.extend(task.tags.iter().map(|tag| task.tag_key(tag)));
        merged.push(task);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::platform::default_architectures;

    fn entry(name: &str, tags: &[&str], archs: &[&str]) -> ImageEntry {
        ImageEntry {
            name: name.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            architectures: archs.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    fn run(explicit: &[ImageEntry], list: &str) -> Result<Vec<MigrationTask>> {
        resolve(explicit, list, &default_architectures(), "docker.io")
    }

    #[test]
    fn explicit_tag_beats_list_line() {
        let explicit = [entry("library/golang", &["1.25-alpine"], &["amd64"])];
        let tasks = run(&explicit, "golang:1.25-alpine #arch=arm64").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].architectures, vec!["amd64"]);
        assert_eq!(tasks[0].repository, "library/golang");
    }

    #[test]
    fn explicit_latest_absorbs_bare_list_line() {
        let explicit = [entry("library/repo", &["latest"], &[])];
        let tasks = run(&explicit, "repo").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].tags, vec!["latest"]);
        assert!(tasks[0].architectures.is_empty());
    }

    #[test]
    fn explicit_registry_skips_host_detection() {
        let mut explicit = entry("team.io/app", &["1.0"], &[]);
        explicit.registry = Some("harbor.local".to_string());
        let tasks = run(&[explicit], "").unwrap();
        assert_eq!(tasks[0].registry, "harbor.local");
        assert_eq!(tasks[0].repository, "team.io/app");
        assert_eq!(tasks[0].target_repository, "team.io/app");
    }

    #[test]
    fn tagless_explicit_entry_claims_repository() {
        let explicit = [entry("library/redis", &[], &[])];
        let tasks = run(&explicit, "redis:7\nredis:6\nnginx").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].repository, "library/nginx");
        assert_eq!(tasks[1].tags, vec!["latest"]);
    }

    #[test]
    fn arch_directive_and_defaults() {
        let list = "\n# mirror these\nnginx:1.27 #arch=amd64, arm64 trailing words\nalpine:3.20\n";
        let tasks = run(&[], list).unwrap();
        assert_eq!(tasks.len(), 2);
        // only the first whitespace token after the directive counts
        assert_eq!(tasks[0].architectures, vec!["amd64"]);
        assert_eq!(tasks[1].architectures, vec!["amd64", "arm64"]);
    }

    #[test]
    fn directive_without_values_uses_defaults() {
        let tasks = run(&[], "nginx:1.27 #arch=").unwrap();
        assert_eq!(tasks[0].architectures, vec!["amd64", "arm64"]);
    }

    #[test]
    fn repeated_list_lines_collapse() {
        let tasks = run(&[], "nginx:1.27\ndocker.io/library/nginx:1.27\nnginx:1.26").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].tags, vec!["1.26"]);
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = run(&[], "nginx\n\nBad_Name:1").unwrap_err();
        assert!(err.to_string().contains("line 3"), "{}", err);
    }

    #[test]
    fn explicit_entries_keep_target_and_order() {
        let mut first = entry("quay.io/prometheus/node-exporter", &["v1.8.0"], &[]);
        first.target_name = Some("monitoring/node-exporter".to_string());
        let second = entry("bitnami/redis", &[], &[]);
        let tasks = run(&[first, second], "busybox").unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].registry, "quay.io");
        assert_eq!(tasks[0].target_repository, "monitoring/node-exporter");
        assert!(tasks[0].architectures.is_empty());
        assert_eq!(tasks[1].repository, "bitnami/redis");
        assert_eq!(tasks[2].repository, "library/busybox");
    }
}
