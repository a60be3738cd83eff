// build information reported at startup and by --version

/// Version of the running tools.
///
/// The semantic version always comes from Cargo.toml. The git describe string is present when
/// the build happened inside a git checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVersion {
    pub semantic: String,
    pub git_describe: Option<String>,
}

impl BuildVersion {
    pub fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("RECOVERY_GIT_DESCRIBE").map(String::from),
        }
    }

    /// Semantic version, followed by the git describe output when known.
    ///
    /// ```
    /// use common::version::BuildVersion;
    ///
    /// let v = BuildVersion {
    ///     semantic: "0.4.0".to_string(),
    ///     git_describe: Some("v0.3.0-7-g644da27".to_string()),
    /// };
    ///
    /// assert_eq!(v.display(), "0.4.0 (v0.3.0-7-g644da27)");
    /// ```
    pub fn display(&self) -> String {
        match &self.git_describe {
            Some(describe) => format!("{} ({})", self.semantic, describe),
            None => self.semantic.clone(),
        }
    }
}

impl std::fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}
