use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::GatewayConfig;

const DEFAULT_ENV_PREFIX: &str = "GATE";

/// 配置加载器
///
/// 优先级：默认值 < TOML 文件 < 环境变量（`GATE__SECTION__KEY`）
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// 创建配置加载器；`config_path` 为 `None` 时只使用默认值与环境变量
    pub fn new<P: AsRef<Path>>(config_path: Option<P>) -> Self {
        Self {
            config_path: config_path.map(|p| p.as_ref().to_path_buf()),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = prefix.to_string();
        self
    }

    /// 加载网关配置并校验
    pub fn load(&self) -> Result<GatewayConfig> {
        let mut builder = Config::builder();

        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(anyhow!("Config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::new(
                path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let gateway: GatewayConfig = config.try_deserialize()?;
        gateway.validate()?;
        Ok(gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults_without_file() {
        let loader = ConfigLoader::new(None::<&Path>).with_env_prefix("GATETEST_NOFILE");
        let config = loader.load().unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.ratelimit.authenticated_capacity, 1000);
        assert!(config.redis.url.is_none());
    }

    #[test]
    fn test_load_config_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_content = r#"
[server]
host = "0.0.0.0"
port = 9000

[redis]
url = "redis://127.0.0.1:6379"
key_prefix = "edge"

[ratelimit]
anonymous_capacity = 10
window_secs = 1

[[upstreams]]
prefix = "/api/orders"
url = "http://orders:8080"
strip_prefix = true
"#;
        let path = temp_dir.path().join("gateway.toml");
        fs::write(&path, config_content).unwrap();

        let config = ConfigLoader::new(Some(&path))
            .with_env_prefix("GATETEST_FILE")
            .load()
            .unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.redis.url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.redis.key_prefix, "edge");
        assert_eq!(config.ratelimit.anonymous_capacity, 10);
        // 未出现的键保留默认值
        assert_eq!(config.ratelimit.premium_capacity, 10_000);
        assert_eq!(config.upstreams.len(), 1);
        assert!(config.upstreams[0].strip_prefix);
    }

    #[test]
    fn test_env_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("gateway.toml");
        fs::write(&path, "[server]\nport = 9000\n").unwrap();

        std::env::set_var("GATETEST_ENV__SERVER__PORT", "9443");
        let config = ConfigLoader::new(Some(&path))
            .with_env_prefix("GATETEST_ENV")
            .load()
            .unwrap();
        std::env::remove_var("GATETEST_ENV__SERVER__PORT");

        assert_eq!(config.server.port, 9443);
    }

    #[test]
    fn test_serialized_defaults_load_back() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("gateway.toml");
        fs::write(&path, toml::to_string(&GatewayConfig::default()).unwrap()).unwrap();

        let config = ConfigLoader::new(Some(&path))
            .with_env_prefix("GATETEST_ROUNDTRIP")
            .load()
            .unwrap();
        assert_eq!(config.listen_addr(), GatewayConfig::default().listen_addr());
        assert_eq!(config.session.ttl_secs, 86_400);
        assert_eq!(config.identity.scopes, vec!["openid", "profile"]);
    }

    #[test]
    fn test_missing_file_is_error() {
        let temp_dir = tempdir().unwrap();
        let loader = ConfigLoader::new(Some(temp_dir.path().join("absent.toml")));
        assert!(loader.load().is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("gateway.toml");
        fs::write(&path, "[ratelimit]\nwindow_secs = 0\n").unwrap();

        let loader = ConfigLoader::new(Some(&path)).with_env_prefix("GATETEST_INVALID");
        assert!(loader.load().is_err());
    }
}
