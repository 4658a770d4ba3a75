use crate::error::{Error, Result as CrateResult};
use crate::retry::DeadLetterPolicy;
use anyhow::{Context, Result};
use chunkq_common::{DEFAULT_CHUNK_SIZE, DEFAULT_QUEUE_NAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub workers: WorkerConfig,
    pub dead_letter: DeadLetterPolicy,
    pub logging: LoggingConfig,
}

/// 队列声明
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// 是否持久化（broker 重启后保留未确认消息）
    pub durable: bool,
    /// 最大重投次数，达到后进入死信
    pub redelivery_limit: u32,
    /// 投递后未确认的可见性超时
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            durable: true,
            redelivery_limit: 5,
            visibility_timeout_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub chunk_size: u64,
    pub publish_max_attempts: u32,
    pub publish_backoff_ms: u64,
    pub publish_backoff_max_ms: u64,
    pub publish_concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            publish_max_attempts: 3,
            publish_backoff_ms: 100,
            publish_backoff_max_ms: 2000,
            publish_concurrency: 4,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { count: 4 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 为空时输出到 stderr
    pub file: Option<PathBuf>,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> CrateResult<()> {
        if self.dispatch.chunk_size == 0 {
            return Err(Error::Config("chunk_size 不能为 0".to_string()));
        }
        if self.dispatch.publish_max_attempts == 0 {
            return Err(Error::Config("publish_max_attempts 至少为 1".to_string()));
        }
        if self.dispatch.publish_concurrency == 0 {
            return Err(Error::Config("publish_concurrency 至少为 1".to_string()));
        }
        if self.workers.count == 0 {
            return Err(Error::Config("workers.count 至少为 1".to_string()));
        }
        if self.queue.visibility_timeout_secs == 0 {
            return Err(Error::Config("visibility_timeout_secs 不能为 0".to_string()));
        }
        if self.queue.name.trim().is_empty() {
            return Err(Error::Config("队列名称不能为空".to_string()));
        }
        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("无法确定配置目录")?;

    let chunkq_dir = base.join("chunkq");
    fs::create_dir_all(&chunkq_dir).context("创建配置目录失败")?;
    Ok(chunkq_dir.join("config.toml"))
}

/// 加载配置文件，不存在时写入默认配置并返回 None
pub fn load_or_create_config(path: &Path) -> Result<Option<Config>> {
    if path.exists() {
        let content = fs::read_to_string(path).context("读取配置文件失败")?;
        let cfg: Config = toml::from_str(&content).context("解析配置文件失败")?;
        cfg.validate()?;
        return Ok(Some(cfg));
    }
    write_default_config(path)?;
    Ok(None)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    let default = Config::default();

    let config_content = format!(
        r#"# ================ 队列配置 ================

[queue]
# 队列名称
name = "{}"

# 是否持久化
durable = {}

# 最大重投次数，超过后进入死信
redelivery_limit = {}

# 可见性超时（秒），超时未确认的消息会被重新投递
visibility_timeout_secs = {}

# ================ 派发配置 ================

[dispatch]
# 分块大小（字节）
chunk_size = {}

# 单个分块的最大发布尝试次数
publish_max_attempts = {}

# 发布重试的初始退避与最大退避（毫秒）
publish_backoff_ms = {}
publish_backoff_max_ms = {}

# 并发发布数
publish_concurrency = {}

# ================ Worker 配置 ================

[workers]
count = {}

# ================ 死信策略 ================

[dead_letter]
# hold: 死信分块直接判定失败，等待外部重新提交
# redispatch: 自动重新派发，最多 max_rounds 轮
policy = "hold"
# policy = "redispatch"
# max_rounds = 1

# ================ 日志配置 ================

[logging]
level = "{}"
# 日志文件路径，不设置则输出到 stderr
# file = "chunkq.log"
"#,
        default.queue.name,
        default.queue.durable,
        default.queue.redelivery_limit,
        default.queue.visibility_timeout_secs,
        default.dispatch.chunk_size,
        default.dispatch.publish_max_attempts,
        default.dispatch.publish_backoff_ms,
        default.dispatch.publish_backoff_max_ms,
        default.dispatch.publish_concurrency,
        default.workers.count,
        default.logging.level,
    );

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("创建配置目录失败")?;
    }
    fs::write(path, config_content).context("写入默认配置失败")?;
    Ok(())
}
