// ⚙️ Configuration - directories, store path, source URLs
//
// Everything comes from the environment with working defaults; the CLI can
// override individual fields afterwards.

use crate::statement::StatementFilter;
use serde::Serialize;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_RAW_DIR: &str = "data/raw";
pub const DEFAULT_FINAL_DIR: &str = "data/final";
pub const DEFAULT_DB_PATH: &str = "data/ans.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_QUARTERS: usize = 3;
pub const REGISTRY_PREFIX: &str = "Relatorio_cadop";

pub const DEFAULT_STATEMENTS_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/demonstracoes_contabeis";
pub const DEFAULT_REGISTRY_ACTIVE_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/operadoras_de_plano_de_saude_ativas/";
pub const DEFAULT_REGISTRY_CANCELLED_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/operadoras_de_plano_de_saude_canceladas/";

pub fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| match v.trim() {
            "1" | "true" | "TRUE" | "True" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "False" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub raw_dir: PathBuf,
    pub final_dir: PathBuf,
    pub db_path: PathBuf,
    pub statements_url: String,
    pub registry_active_url: String,
    pub registry_cancelled_url: String,
    /// Number of most recent quarters to fetch.
    pub quarters: usize,
    pub registry_prefix: String,
    pub user_agent: String,
    pub filter: StatementFilter,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            raw_dir: PathBuf::from(DEFAULT_RAW_DIR),
            final_dir: PathBuf::from(DEFAULT_FINAL_DIR),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            statements_url: DEFAULT_STATEMENTS_URL.to_string(),
            registry_active_url: DEFAULT_REGISTRY_ACTIVE_URL.to_string(),
            registry_cancelled_url: DEFAULT_REGISTRY_CANCELLED_URL.to_string(),
            quarters: DEFAULT_QUARTERS,
            registry_prefix: REGISTRY_PREFIX.to_string(),
            user_agent: format!("ans-consolidation/{}", crate::VERSION),
            filter: StatementFilter::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = PipelineConfig::default();
        let mut filter = defaults.filter.clone();
        if let Ok(description) = env::var("ANS_EXPENSE_DESCRIPTION") {
            filter.description_contains = description;
        }
        filter.account_prefix = env::var("ANS_ACCOUNT_PREFIX").ok().filter(|p| !p.is_empty());

        PipelineConfig {
            raw_dir: env::var("ANS_RAW_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.raw_dir),
            final_dir: env::var("ANS_FINAL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.final_dir),
            db_path: env::var("ANS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            statements_url: env_or("ANS_STATEMENTS_URL", DEFAULT_STATEMENTS_URL),
            registry_active_url: env_or("ANS_REGISTRY_ACTIVE_URL", DEFAULT_REGISTRY_ACTIVE_URL),
            registry_cancelled_url: env_or(
                "ANS_REGISTRY_CANCELLED_URL",
                DEFAULT_REGISTRY_CANCELLED_URL,
            ),
            quarters: env::var("ANS_QUARTERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|q| *q > 0)
                .unwrap_or(DEFAULT_QUARTERS),
            registry_prefix: defaults.registry_prefix,
            user_agent: env::var("ANS_USER_AGENT").unwrap_or(defaults.user_agent),
            filter,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        ServerConfig {
            bind_addr: env_or("ANS_BIND_ADDR", DEFAULT_BIND_ADDR),
            db_path: env::var("ANS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.raw_dir, PathBuf::from("data/raw"));
        assert_eq!(config.final_dir, PathBuf::from("data/final"));
        assert_eq!(config.quarters, 3);
        assert!(config.statements_url.ends_with("demonstracoes_contabeis"));
        assert!(config.filter.account_prefix.is_none());
    }

    #[test]
    fn test_env_bool_falls_back_to_default() {
        assert!(env_bool("ANS_TEST_UNSET_FLAG_7F3A", true));
        assert!(!env_bool("ANS_TEST_UNSET_FLAG_7F3A", false));
    }
}
