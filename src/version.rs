//! Version calculation utilities.

shadow_rs::shadow!(build_info);

/// Get long version of the tool.
///
/// This includes:
/// - package version
/// - git info
/// - platform info
#[allow(clippy::const_is_empty)]
pub fn get_long_version() -> String {
    format!(
        "{} ({})\nplatform: {}",
        build_info::PKG_VERSION,
        if build_info::GIT_CLEAN {
            format!(
                "{} {}",
                if build_info::TAG.is_empty() {
                    build_info::SHORT_COMMIT
                } else {
                    build_info::TAG
                },
                // Strip commit time and leave only date
                build_info::COMMIT_DATE
                    .split(' ')
                    .next()
                    .unwrap_or_default(),
            )
        } else {
            format!("{}-dirty", build_info::SHORT_COMMIT)
        },
        build_info::BUILD_TARGET,
    )
}
