use anyhow::Result;
use clap::{Parser, Subcommand};
use datafreeze_lib::logging::{init_logging, log_dir};
use datafreeze_lib::{AppConfig, Context, FreezeError};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "datafreeze", version, about = "Freeze, thaw and sync datasets")]
struct Cli {
    /// 配置目录（默认 ~/.config/datafreeze）
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 冻结当前工作区为新 tag
    Freeze { dtype: String, name: String, tag: String },
    /// 把工作区还原为某个 tag
    Thaw {
        dtype: String,
        name: String,
        tag: String,
        #[arg(long)]
        force: bool,
    },
    /// 列出数据集的 tag
    Tags { dtype: String, name: String },
    /// 显示未冻结的修改
    Changes { dtype: String, name: String },
    /// 列出本地数据集
    Datasets {
        #[arg(default_value = "*")]
        dtype: String,
        #[arg(default_value = "*")]
        name: String,
    },
    /// 删除本地数据集
    Delete { dtype: String, name: String },
    /// 推送 tag 到远端
    Push { dtype: String, name: String, tag: String },
    /// 从远端拉取 tag
    Pull { dtype: String, name: String, tag: String },
    /// 列出远端数据集
    List {
        dtype: Option<String>,
        name: Option<String>,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ctrl-C 时停止排队新的传输
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("收到中断信号，等待进行中的传输结束...");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = cli
        .config_dir
        .or_else(|| datafreeze_lib::dirs::config_dir().map(|p| p.join("datafreeze")))
        .unwrap_or_else(|| PathBuf::from(".datafreeze"));
    let config = AppConfig::load(&config_dir);
    init_logging(&config.log, &log_dir(&config.root_dir));

    let ctx = Context::new(config)?;

    match cli.command {
        Command::Freeze { dtype, name, tag } => {
            let tag = ctx.dataset(&dtype, &name)?.freeze(&tag)?;
            println!("{} ({} files)", tag.total, tag.files.len());
        }
        Command::Thaw {
            dtype,
            name,
            tag,
            force,
        } => match ctx.dataset(&dtype, &name)?.thaw(&tag, force) {
            Err(FreezeError::UnsavedChangesInThawed(changes)) => {
                print_json(&changes)?;
                anyhow::bail!("unsaved changes in thawed dataset; freeze them or use --force");
            }
            other => other?,
        },
        Command::Tags { dtype, name } => {
            for tag in ctx.dataset(&dtype, &name)?.tag_data()? {
                println!("{}\t{}\t{}", tag.tag, tag.timestamp, tag.total);
            }
        }
        Command::Changes { dtype, name } => {
            print_json(&ctx.dataset(&dtype, &name)?.file_changes()?)?;
        }
        Command::Datasets { dtype, name } => {
            for slug in ctx.datasets(&dtype, &name)? {
                println!("{}", slug);
            }
        }
        Command::Delete { dtype, name } => {
            println!("deleted {} dataset(s)", ctx.delete(&dtype, &name)?);
        }
        Command::Push { dtype, name, tag } => {
            let dataset = ctx.dataset(&dtype, &name)?;
            let client = ctx.sync_client()?;
            match client.push_with_cancel(&dataset, &tag, &cancel_on_ctrl_c()).await {
                Err(FreezeError::TagExists(_)) => println!("{} is already in the cloud", tag),
                other => print_json(&other?)?,
            }
        }
        Command::Pull { dtype, name, tag } => {
            let dataset = ctx.dataset(&dtype, &name)?;
            let client = ctx.sync_client()?;
            let report = client
                .pull_with_cancel(&dataset, &tag, &cancel_on_ctrl_c())
                .await?;
            print_json(&report)?;
        }
        Command::List { dtype, name } => {
            let client = ctx.sync_client()?;
            print_json(&client.list(dtype.as_deref(), name.as_deref()).await?)?;
        }
    }

    Ok(())
}
