//! Client configuration.
//!
//! Configuration is assembled from, in order of increasing precedence:
//! 1. Built-in defaults
//! 2. A TOML file (see [`Config::from_file`])
//! 3. The `API_BASE_URL`, `HTTP_TIMEOUT` (milliseconds) and `HTTP_RETRY`
//!    environment variables (see [`Config::apply_overrides`])
//!
//! # Example file
//!
//! ```toml
//! base_url = "https://api.example.com/prod"
//! timeout_ms = 20000
//! retry_count = 1
//! ```

use std::{fs, io, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{
    error::{Error, Result},
    signer::Exclusions,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Config {
    /// API root, without trailing slash. May carry a path prefix.
    pub base_url: Url,

    pub app_name: String,
    pub app_version: String,
    pub app_lang: String,
    pub user_agent: String,

    /// Per-request transport timeout.
    pub timeout: Duration,

    /// Extra attempts after a transport failure.
    pub retry_count: u32,
    pub retry_min_delay: Duration,
    pub retry_max_delay: Duration,

    pub rate_limit_calls: u32,
    pub rate_limit_interval: Duration,

    pub signing_exclusions: Exclusions,
}

/// Shape of the TOML configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    base_url: Option<String>,
    app_version: Option<String>,
    app_lang: Option<String>,
    timeout_ms: Option<u64>,
    retry_count: Option<u32>,
    retry_min_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    rate_limit_calls: Option<u32>,
    rate_limit_interval_ms: Option<u64>,
    signing_exclusions: Option<Vec<String>>,
}

impl Config {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
    pub const DEFAULT_RETRY_COUNT: u32 = 1;

    /// Creates a configuration with defaults for everything but the API
    /// root.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * `base_url` is not an absolute `http` or `https` URL
    /// * no valid `User-Agent` can be created for this platform
    pub fn new(base_url: &str) -> Result<Self> {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let app_lang = "en".to_owned();

        let mut config = Self {
            base_url: Self::resolve_base_url(base_url)?,
            user_agent: String::new(),
            app_name,
            app_version,
            app_lang,
            timeout: Self::DEFAULT_TIMEOUT,
            retry_count: Self::DEFAULT_RETRY_COUNT,
            retry_min_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
            rate_limit_calls: 50,
            rate_limit_interval: Duration::from_secs(5),
            signing_exclusions: Exclusions::default(),
        };
        config.user_agent = config.build_user_agent()?;

        Ok(config)
    }

    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is not valid TOML, has no
    /// `base_url`, or has invalid values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: configuration file should be small.
        let attributes = fs::metadata(path)?;
        if attributes.len() > 64 * 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is too large", path.display()),
            )
            .into());
        }

        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parses the configuration from TOML.
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is invalid, has no `base_url`, or has
    /// invalid values.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)?;

        let base_url = file
            .base_url
            .ok_or_else(|| Error::invalid_argument("configuration has no base_url"))?;
        let mut config = Self::new(&base_url)?;

        if let Some(app_version) = file.app_version {
            config.app_version = app_version;
        }
        if let Some(app_lang) = file.app_lang {
            config.app_lang = app_lang;
        }
        if let Some(timeout) = file.timeout_ms {
            config.timeout = Duration::from_millis(timeout);
        }
        if let Some(retry_count) = file.retry_count {
            config.retry_count = retry_count;
        }
        if let Some(delay) = file.retry_min_delay_ms {
            config.retry_min_delay = Duration::from_millis(delay);
        }
        if let Some(delay) = file.retry_max_delay_ms {
            config.retry_max_delay = Duration::from_millis(delay);
        }
        if let Some(calls) = file.rate_limit_calls {
            config.rate_limit_calls = calls;
        }
        if let Some(interval) = file.rate_limit_interval_ms {
            config.rate_limit_interval = Duration::from_millis(interval);
        }
        if let Some(exclusions) = file.signing_exclusions {
            config.signing_exclusions = Exclusions::new(exclusions);
        }

        config.user_agent = config.build_user_agent()?;
        Ok(config)
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// Pass `|key| std::env::var(key).ok()` to read the process environment.
    ///
    /// # Errors
    ///
    /// Returns error if an override is set but invalid.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup("API_BASE_URL").filter(|s| !s.trim().is_empty()) {
            self.base_url = Self::resolve_base_url(&base_url)?;
        }
        if let Some(timeout) = lookup("HTTP_TIMEOUT") {
            self.timeout = Duration::from_millis(timeout.trim().parse()?);
        }
        if let Some(retry_count) = lookup("HTTP_RETRY") {
            self.retry_count = retry_count.trim().parse()?;
        }

        Ok(())
    }

    /// Resolves an endpoint path against the API root.
    ///
    /// Paths are appended to the root, so a root path prefix is kept.
    /// Absolute `http(s)` URLs are used as they are.
    ///
    /// # Errors
    ///
    /// Returns error if the result is not a valid URL.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        if is_absolute(path) {
            return Url::parse(path).map_err(Into::into);
        }

        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(Into::into)
    }

    fn resolve_base_url(base_url: &str) -> Result<Url> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if !is_absolute(trimmed) {
            return Err(Error::invalid_argument(format!(
                "base url must be an absolute http(s) url: \"{trimmed}\""
            )));
        }

        Url::parse(trimmed).map_err(Into::into)
    }

    fn build_user_agent(&self) -> Result<String> {
        let app_name = &self.app_name;
        let app_version = &self.app_version;
        let app_lang = &self.app_lang;

        // The version is sent as `X-App-Version` too.
        semver::Version::parse(app_version)?;

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.contains(illegal_chars)
            || app_lang.chars().count() != 2
            || app_lang.contains(illegal_chars)
        {
            return Err(Error::invalid_argument(format!(
                "application name, version and/or language invalid (\"{app_name}\"; \"{app_version}\"; \"{app_lang}\")"
            )));
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        let os_version = os_version.replace(illegal_chars, "_");

        let user_agent =
            format!("{app_name}/{app_version} (Rust; {os_name}/{os_version}; Desktop; {app_lang})");
        trace!("user agent: {user_agent}");

        Ok(user_agent)
    }
}

fn is_absolute(url: &str) -> bool {
    let lower = url.get(..8).unwrap_or(url).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn base_url_is_trimmed_and_must_be_absolute() {
        let config = Config::new("https://api.example.com/prod///").unwrap();
        assert_eq!(config.base_url.as_str(), "https://api.example.com/prod");

        assert!(Config::new("/prod").is_err());
        assert!(Config::new("").is_err());
    }

    #[test]
    fn endpoints_keep_the_base_path() {
        let config = Config::new("https://api.example.com/prod").unwrap();
        assert_eq!(
            config.endpoint("/api/v1/login").unwrap().as_str(),
            "https://api.example.com/prod/api/v1/login"
        );
        assert_eq!(
            config.endpoint("api/v1/login").unwrap().as_str(),
            "https://api.example.com/prod/api/v1/login"
        );
        assert_eq!(
            config.endpoint("https://cdn.example.com/x").unwrap().as_str(),
            "https://cdn.example.com/x"
        );
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = Config::from_toml(
            r#"
            base_url = "http://localhost:8080"
            timeout_ms = 1500
            retry_count = 3
            signing_exclusions = ["/open/"]
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.retry_count, 3);
        assert!(config.signing_exclusions.is_excluded("/open/thing"));
        assert!(!config.signing_exclusions.is_excluded("/api/v1/login"));
        assert!(config.user_agent.starts_with("joyful/"));
    }

    #[test]
    fn toml_requires_base_url_and_semver() {
        assert!(Config::from_toml("retry_count = 1").is_err());
        assert!(Config::from_toml(
            r#"
            base_url = "http://localhost"
            app_version = "latest"
            "#
        )
        .is_err());
        assert!(Config::from_toml("base_url = \"http://localhost\"\nbogus = 1").is_err());
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("API_BASE_URL", "https://staging.example.com/"),
            ("HTTP_TIMEOUT", "500"),
            ("HTTP_RETRY", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::new("http://localhost").unwrap();
        config
            .apply_overrides(|key| env.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.base_url.as_str(), "https://staging.example.com/");
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.retry_count, 0);

        assert!(config
            .apply_overrides(|key| (key == "HTTP_RETRY").then(|| "many".to_owned()))
            .is_err());
    }
}
