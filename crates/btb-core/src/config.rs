use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for both bots and the broadcast engine.
#[derive(Clone, Debug)]
pub struct Config {
    // Bots
    pub admin_bot_token: String,
    /// Token of the public bot; it is also the transport for broadcasts.
    pub user_bot_token: Option<String>,
    pub admin_ids: Vec<i64>,
    /// Chat that receives "new user" notifications from the public bot.
    pub admin_chat_id: Option<i64>,
    pub web_app_url: String,

    // Storage
    pub database_file: PathBuf,
    /// Photos downloaded from operators; campaigns and templates reference them.
    pub media_dir: PathBuf,

    // Broadcast engine
    pub send_delay: Duration,
    pub progress_every: usize,
    pub scheduler_poll_interval: Duration,

    // Telegram flood control
    pub global_min_interval: Duration,
    pub per_chat_min_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        load_dotenv_if_present(Path::new("bots/.env"));

        let admin_bot_token = env_str("ADMIN_BOT_TOKEN").and_then(non_empty);
        let user_bot_token = env_str("USER_BOT_TOKEN").and_then(non_empty);
        let admin_ids = parse_csv_i64(env_str("ADMIN_IDS"));

        let Some(admin_bot_token) = admin_bot_token else {
            return Err(Error::Config(
                "ADMIN_BOT_TOKEN environment variable is required".to_string(),
            ));
        };
        if admin_ids.is_empty() {
            return Err(Error::Config(
                "ADMIN_IDS environment variable is required".to_string(),
            ));
        }

        let admin_chat_id = env_str("ADMIN_BOT_CHAT_ID").and_then(|s| s.trim().parse().ok());
        let web_app_url = env_str("WEB_APP_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "https://example.com".to_string());

        let database_file = PathBuf::from(
            env_str("DATABASE_FILE")
                .and_then(non_empty)
                .unwrap_or_else(|| "bots/database.db".to_string()),
        );
        if let Some(parent) = database_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let media_dir = PathBuf::from(
            env_str("BROADCAST_MEDIA_DIR")
                .and_then(non_empty)
                .unwrap_or_else(|| "bots/media".to_string()),
        );
        fs::create_dir_all(&media_dir)?;

        let send_delay = Duration::from_millis(env_u64("BROADCAST_SEND_DELAY_MS").unwrap_or(50));
        let progress_every = env_usize("BROADCAST_PROGRESS_EVERY").unwrap_or(5).max(1);
        let scheduler_poll_interval =
            Duration::from_secs(env_u64("SCHEDULER_POLL_INTERVAL_SECS").unwrap_or(60).max(1));

        let global_min_interval =
            Duration::from_millis(env_u64("TELEGRAM_GLOBAL_MIN_INTERVAL_MS").unwrap_or(40));
        let per_chat_min_interval =
            Duration::from_millis(env_u64("TELEGRAM_PER_CHAT_MIN_INTERVAL_MS").unwrap_or(1050));

        Ok(Self {
            admin_bot_token,
            user_bot_token,
            admin_ids,
            admin_chat_id,
            web_app_url,
            database_file,
            media_dir,
            send_delay,
            progress_every,
            scheduler_poll_interval,
            global_min_interval,
            per_chat_min_interval,
        })
    }

    pub fn broadcasting_enabled(&self) -> bool {
        self.user_bot_token.is_some()
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
