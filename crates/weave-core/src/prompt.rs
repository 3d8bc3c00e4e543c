//! Naming helpers shared by the runner and workflow engine: spec-derived
//! execution names and branch-name sanitization (Section 3, `NameSource::SpecSlug`).

use std::path::Path;

/// Generate a slug from a spec path for naming purposes.
pub fn spec_slug(spec_path: &Path) -> String {
    spec_path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| {
            s.chars()
                .map(|c| if c.is_alphanumeric() { c } else { '-' })
                .collect::<String>()
                .to_lowercase()
        })
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Sanitize a branch name for filesystem use (replace slashes with dashes).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_slug_extracts_name() {
        assert_eq!(spec_slug(Path::new("specs/my-feature.md")), "my-feature");
        assert_eq!(
            spec_slug(Path::new("/path/to/orchestrator-daemon.md")),
            "orchestrator-daemon"
        );
        assert_eq!(spec_slug(Path::new("no_extension")), "no-extension");
    }

    #[test]
    fn sanitize_branch_name_replaces_slashes() {
        assert_eq!(sanitize_branch_name("run/my-feature"), "run-my-feature");
        assert_eq!(sanitize_branch_name("feature/sub/deep"), "feature-sub-deep");
        assert_eq!(sanitize_branch_name("no-slashes"), "no-slashes");
    }
}
