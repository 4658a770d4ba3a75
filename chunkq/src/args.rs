use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// 解析支持单位 (kb, mb, gb) 的字符串为字节数 (u64)
pub fn parse_chunk_size(s: &str) -> Result<u64> {
    let s_lower = s.trim().to_lowercase();

    let (num_str, multiplier): (&str, u64) = if let Some(stripped) = s_lower.strip_suffix("gb") {
        (stripped, 1024 * 1024 * 1024)
    } else if let Some(stripped) = s_lower.strip_suffix("mb") {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = s_lower.strip_suffix("kb") {
        (stripped, 1024)
    } else {
        (s_lower.as_str(), 1)
    };

    let num = num_str
        .trim()
        .parse::<u64>()
        .map_err(|_| anyhow!("无效的数字部分: '{}'", num_str.trim()))?;

    let bytes = num
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("计算出的数值太大，导致溢出 (超过 u64::MAX)"))?;

    if bytes == 0 {
        return Err(anyhow!("分块大小必须大于 0"));
    }
    Ok(bytes)
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// 配置文件路径，默认位于用户配置目录
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "重置配置文件")]
    Config,
    #[command(about = "拆分文件并通过队列逐块处理")]
    Run(RunArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    pub path: String,

    /// 分块大小，覆盖配置文件
    #[arg(long, short = 'c', value_name = "SIZE", value_parser = parse_chunk_size)]
    pub chunk_size: Option<u64>,

    /// worker 数量，覆盖配置文件
    #[arg(long, short = 'w')]
    pub workers: Option<usize>,

    /// 分块数据暂存目录，不设置则保存在内存中
    #[arg(long, value_name = "DIR")]
    pub store_dir: Option<String>,

    /// 让指定序号的分块处理失败，可重复
    #[arg(long, value_name = "INDEX")]
    pub fail_chunk: Vec<u64>,
}

pub fn get_cli_args() -> Cli {
    Cli::parse()
}
