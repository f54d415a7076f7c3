use std::path::PathBuf;

use serde::Deserialize;

/// Configuration loaded from `config.toml`, with secrets overridable from
/// the environment.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Overridden by `BOT_TOKEN` when set, so it never needs to live in a
    /// checked-in file.
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// Base URL used to build absolute links in rendered pages and sitemap
    /// `<loc>` entries, e.g. `https://forum.example.com`.
    pub public_base_url: String,
    #[serde(default = "default_sitemap_dir")]
    pub sitemap_dir: PathBuf,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_sitemap_dir() -> PathBuf {
    PathBuf::from("sitemap")
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

impl Config {
    /// Reads `config.toml` from the current directory, then overlays
    /// `BOT_TOKEN`/`DATABASE_URL`/`SERVER_HOST`/`SERVER_PORT` environment
    /// variables when present, so secrets never need to live in a
    /// checked-in file while the TOML file stays the primary source of
    /// truth for everything else.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {path}: {e}"))?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parsing {path}: {e}"))?;

        if let Ok(token) = std::env::var("BOT_TOKEN") {
            config.bot_token = token;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.server_host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            config.server_port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("SERVER_PORT must be a number"))?;
        }

        if config.bot_token.is_empty() {
            anyhow::bail!("bot_token must be set via config.toml or BOT_TOKEN");
        }
        if config.database_url.is_empty() {
            anyhow::bail!("database_url must be set via config.toml or DATABASE_URL");
        }

        Ok(config)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_addr_combines_host_and_port() {
        let config = Config {
            bot_token: "x".into(),
            database_url: "postgres://x".into(),
            server_host: "127.0.0.1".into(),
            server_port: 9000,
            public_base_url: "https://example.com".into(),
            sitemap_dir: PathBuf::from("sitemap"),
            static_dir: PathBuf::from("static"),
        };
        assert_eq!(config.server_addr(), "127.0.0.1:9000");
    }
}
