use reqwest::Url;

pub const API_URL_ENV: &str = "MATHBOARD_API_URL";

// 识别服务默认监听 8900
pub const DEFAULT_API_URL: &str = "http://localhost:8900";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid recognition service url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("recognition service url `{0}` cannot be used as a base")]
    NotABase(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub api_base_url: String, // 已校验，不带结尾的 /
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_owned(),
        }
    }
}

impl Config {
    /// Runtime env var (native only), then the value baked in at build time, then
    /// [`DEFAULT_API_URL`].
    pub fn from_env() -> Result<Self, ConfigError> {
        #[cfg(not(target_arch = "wasm32"))]
        let runtime = std::env::var(API_URL_ENV).ok();
        #[cfg(target_arch = "wasm32")]
        let runtime: Option<String> = None;

        Self::resolve(runtime.as_deref(), option_env!("MATHBOARD_API_URL"))
    }

    fn resolve(runtime: Option<&str>, baked: Option<&str>) -> Result<Self, ConfigError> {
        // 空值视为未设置
        fn set(value: Option<&str>) -> Option<&str> {
            value.filter(|url| !url.trim().is_empty())
        }

        match set(runtime).or(set(baked)) {
            Some(url) => Self::from_base_url(url),
            None => Ok(Self::default()),
        }
    }

    pub fn from_base_url(url: &str) -> Result<Self, ConfigError> {
        let trimmed = url.trim().trim_end_matches('/');
        let parsed = Url::parse(trimmed).map_err(|e| ConfigError::InvalidUrl {
            url: url.to_owned(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(ConfigError::NotABase(url.to_owned()));
        }
        Ok(Self {
            api_base_url: parsed.as_str().trim_end_matches('/').to_owned(),
        })
    }

    pub fn calculate_endpoint(&self) -> String {
        format!("{}/calculate/", self.api_base_url)
    }
}
