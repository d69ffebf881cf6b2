//! Mempager 交互入口
//!
//! 初始化日志、加载配置、组装 Agent，在终端读取用户输入跑函数链循环。
//! 以 `/` 开头的输入为命令：/help /status /memory /reset /evict /ingest /quit。

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use mempager::config::load_config;
use mempager::react::{ReactEvent, TurnStatus};
use mempager::{observability, Agent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const HELP: &str = "Commands:
  /help    show this help
  /status  window usage, pressure state, core memory sizes, LLM tokens
  /memory  dump core memory, summary and window entries
  /reset   clear window and core memory (archive and index are kept)
  /evict   force one eviction now
  /ingest <file.json>
           import old messages [{role, content, timestamp}] into archive and index
  /quit    save the snapshot (if configured) and exit";

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_event(ev: &ReactEvent) {
    match ev {
        ReactEvent::ThinkingContent { text } => println!("  (thinking) {}", text),
        ReactEvent::ToolCall { tool, args } => println!("  -> {} {}", tool, args),
        ReactEvent::Observation { tool, ok, preview } => {
            let mark = if *ok { "ok" } else { "error" };
            println!("  <- {} [{}] {}", tool, mark, preview.lines().next().unwrap_or(""));
        }
        ReactEvent::MemoryPressure {
            usage_tokens,
            max_tokens,
        } => println!("  ! memory pressure {}/{} tokens", usage_tokens, max_tokens),
        ReactEvent::Eviction {
            evicted,
            tokens_before,
            tokens_after,
            range_id,
        } => println!(
            "  ! evicted {} entries ({}) {} -> {} tokens",
            evicted, range_id, tokens_before, tokens_after
        ),
        ReactEvent::Error { text } => println!("  ! {}", text),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    cfg.validate().context("Invalid config")?;

    let agent = Agent::from_config(&cfg)
        .await
        .context("Failed to create agent")?;
    println!(
        "{} session {} (type /help for commands)",
        cfg.app.name.as_deref().unwrap_or("mempager"),
        agent.session_id().await
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            prompt();
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/help" => println!("{}", HELP),
            "/status" => {
                let status = agent.status().await;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            "/memory" => {
                let dump = agent.memory_dump().await;
                for (name, content) in &dump.core_memory {
                    println!("[{}]\n{}\n", name, content);
                }
                println!("[summary]\n{}\n", dump.summary);
                for entry in &dump.window {
                    println!("{} {}", entry.id(), entry.transcript_line());
                }
            }
            "/reset" => {
                print!("Clear the window and core memory? Type yes to confirm: ");
                let _ = std::io::stdout().flush();
                let answer = lines.next_line().await?.unwrap_or_default();
                if answer.trim().eq_ignore_ascii_case("yes") {
                    agent.reset().await;
                    println!("Session reset.");
                } else {
                    println!("Cancelled.");
                }
            }
            "/evict" => match agent.evict().await {
                Ok(Some(report)) => println!(
                    "Evicted {} entries ({}): {} -> {} tokens{}",
                    report.evicted,
                    report.range_id,
                    report.tokens_before,
                    report.tokens_after,
                    if report.summary_degraded {
                        " (summary kept from before)"
                    } else {
                        ""
                    }
                ),
                Ok(None) => println!("Nothing to evict."),
                Err(e) => println!("Eviction failed: {}", e),
            },
            cmd if cmd.starts_with("/ingest") => {
                let path = cmd.trim_start_matches("/ingest").trim();
                if path.is_empty() {
                    println!("Usage: /ingest <file.json>");
                } else {
                    match agent.ingest(path).await {
                        Ok(report) => println!(
                            "Ingested {} messages ({} skipped); archive now holds {} for this session.",
                            report.archived, report.skipped, report.archive_total
                        ),
                        Err(e) => println!("Ingest failed: {:#}", e),
                    }
                }
            }
            cmd if cmd.starts_with('/') => println!("Unknown command {}. Type /help.", cmd),
            text => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let printer = tokio::spawn(async move {
                    while let Some(ev) = rx.recv().await {
                        print_event(&ev);
                    }
                });
                let result = agent.chat_stream(text, &tx).await;
                drop(tx);
                let _ = printer.await;
                match result {
                    Ok(turn) => {
                        println!("{}", turn.response);
                        if turn.status == TurnStatus::IterationCapExceeded {
                            tracing::warn!(iterations = turn.iterations, "turn hit iteration cap");
                        }
                    }
                    Err(e) => println!("Error: {}", e),
                }
            }
        }
        prompt();
    }

    agent.save_snapshot().await?;
    Ok(())
}
