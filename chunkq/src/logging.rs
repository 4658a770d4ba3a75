use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// 初始化日志。配置了日志文件时非阻塞写入文件，否则写 stderr。
/// `RUST_LOG` 优先于配置中的日志级别。
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    // stdout 留给完成通知，日志不能写到 stdout
    let (non_blocking_writer, guard) = match &config.file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking_writer)
        .with_ansi(config.file.is_none())
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // 返回 guard，将其生命周期交给调用者管理
    Ok(guard)
}
