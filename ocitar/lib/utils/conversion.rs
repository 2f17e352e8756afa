//! Utility functions for converting names between their wire and on-disk
//! forms.

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Converts a repository name into a directory-name-safe form.
pub fn sanitize_repo_name(repository: &str) -> String {
    repository.replace('/', "_")
}

/// Converts a tag or digest selector into a directory-name-safe form.
pub fn sanitize_selector(selector: &str) -> String {
    selector.replace(':', "_").replace('@', "_")
}

/// Strips a literal `https://` or `http://` prefix from a registry host.
pub fn strip_scheme(host: &str) -> &str {
    host.strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host)
}

/// Returns the image architecture name of the host, using the names the
/// registry ecosystem uses (GOARCH) rather than the kernel ones.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
