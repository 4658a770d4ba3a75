mod args;

use anyhow::{Context, Result, bail};
use args::{Cli, Command, RunArgs, get_cli_args};
use chunkq::config::{Config, config_path, load_or_create_config, write_default_config};
use chunkq::logging::init_logging;
use chunkq::{
    CompletionStatus, DigestProcessor, FsStore, MemoryChannel, MemoryStore, Message,
    PayloadStore, Scheduler,
};
use chunkq_common::format_size;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(PathBuf::from(
            shellexpand::tilde(&path.to_string_lossy()).into_owned(),
        )),
        None => config_path(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = get_cli_args();
    let path = resolve_config_path(&cli)?;

    match cli.command {
        Command::Config => {
            write_default_config(&path)?;
            eprintln!("配置文件已重置: {}", path.display());
            Ok(())
        }
        Command::Run(args) => {
            let config = match load_or_create_config(&path)? {
                Some(config) => config,
                None => {
                    eprintln!("已生成默认配置文件: {}", path.display());
                    Config::default()
                }
            };
            run(config, args).await
        }
    }
}

async fn run(mut config: Config, args: RunArgs) -> Result<()> {
    if let Some(chunk_size) = args.chunk_size {
        config.dispatch.chunk_size = chunk_size;
    }
    if let Some(workers) = args.workers {
        config.workers.count = workers;
    }
    config.validate()?;

    let _guard = init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("无法初始化日志系统: {e}"))?;

    let channel = Arc::new(MemoryChannel::declare(&config.queue));
    let store: Arc<dyn PayloadStore> = match &args.store_dir {
        Some(dir) => Arc::new(FsStore::new(shellexpand::tilde(dir).into_owned())),
        None => Arc::new(MemoryStore::new()),
    };
    let processor = Arc::new(DigestProcessor::with_failing_chunks(args.fail_chunk.clone()));

    let (scheduler, mut completions) = Scheduler::start(config, channel, store, processor)?;

    let file_path = PathBuf::from(shellexpand::tilde(&args.path).into_owned());
    let submission = match scheduler.submit_file(&file_path).await {
        Ok(submission) => submission,
        Err(e) => {
            error!(error = %e, "提交文件失败");
            scheduler.shutdown().await;
            return Err(e).with_context(|| format!("无法处理文件 {}", file_path.display()));
        }
    };
    let file_id = submission.job.file_id;
    info!(
        %file_id,
        total_chunks = submission.report.total_chunks,
        size = %format_size(submission.report.bytes),
        "所有分块已派发，等待处理完成"
    );

    let completion = loop {
        tokio::select! {
            received = completions.recv() => match received {
                Some(completion) if completion.file_id == file_id => break Some(completion),
                Some(other) => warn!(file_id = %other.file_id, "收到未知文件的完成通知"),
                None => break None,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，取消文件");
                scheduler.cancel(file_id).await?;
            }
        }
    };

    let Some(completion) = completion else {
        scheduler.shutdown().await;
        bail!("完成跟踪器提前退出");
    };

    // stdout 只输出完成通知
    println!("{}", Message::Completion(completion.clone()).to_json()?);

    for dead_letter in scheduler.take_dead_letters(file_id) {
        warn!(
            chunk_index = dead_letter.task.chunk_index,
            reason = %dead_letter.reason,
            "分块进入死信"
        );
    }
    scheduler.acknowledge(file_id).await?;
    scheduler.shutdown().await;

    match completion.status {
        CompletionStatus::Completed => Ok(()),
        status => bail!(
            "文件处理未全部成功 ({status:?})，失败分块: {:?}",
            completion.failed_chunk_indices
        ),
    }
}
