use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let dirty = matches!(option_env!("VERGEN_GIT_DIRTY"), Some("true"));
    format!(
        "{}-{}{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        if dirty { "-dirty" } else { "" }
    )
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_starts_with_package_version() {
        assert!(VERSION.starts_with(env!("CARGO_PKG_VERSION")));
    }
}
